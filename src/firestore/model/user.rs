use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// The principal whose mutation queue and overlays are active.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Storage key; the empty string for the unauthenticated user.
    pub fn to_key(&self) -> String {
        self.uid.clone().unwrap_or_default()
    }
}

impl Display for User {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "{uid}"),
            None => write!(f, "<anonymous>"),
        }
    }
}
