use serde::{Deserialize, Serialize};

pub const DEFAULT_DATABASE_ID: &str = "(default)";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseId {
    project_id: String,
    database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    pub fn default(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn is_default_database(&self) -> bool {
        self.database == DEFAULT_DATABASE_ID
    }

    /// `projects/{project}/databases/{database}`
    pub fn resource_name(&self) -> String {
        format!("projects/{}/databases/{}", self.project_id, self.database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_resource_name() {
        let id = DatabaseId::default("demo");
        assert!(id.is_default_database());
        assert_eq!(id.resource_name(), "projects/demo/databases/(default)");
    }
}
