use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};

/// Fallback runtime for tasks spawned outside of any tokio context, such as a
/// client built from synchronous code.
static BACKGROUND_RUNTIME: LazyLock<Option<Runtime>> = LazyLock::new(|| {
    match Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("firestore-offline-sync")
        .enable_all()
        .build()
    {
        Ok(runtime) => Some(runtime),
        Err(err) => {
            log::error!("failed to build background runtime: {err}");
            None
        }
    }
});

/// Spawns `future` on the ambient tokio runtime, or on a shared background
/// runtime when called outside of one.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    } else if let Some(runtime) = BACKGROUND_RUNTIME.as_ref() {
        runtime.spawn(future);
    } else {
        log::error!("no runtime available; dropping background task");
    }
}

pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawned_tasks_run_on_current_runtime() {
        let (tx, rx) = futures::channel::oneshot::channel();
        spawn_detached(async move {
            sleep(Duration::from_millis(1)).await;
            let _ = tx.send(7);
        });
        assert_eq!(rx.await.unwrap(), 7);
    }

    #[test]
    fn spawning_outside_a_runtime_uses_background_runtime() {
        let (tx, rx) = std::sync::mpsc::channel();
        spawn_detached(async move {
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}
