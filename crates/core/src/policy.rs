//! External policy seam
//!
//! The planning loop that decides what actions to take lives outside
//! this system; it is consumed only through this trait.

use async_trait::async_trait;
use browsercast_common::Result;
use tracing::info;

/// Contract for the external task-driving component
#[async_trait]
pub trait TaskPolicy: Send + Sync {
    /// Drive `task` against a live session; returns a result summary.
    async fn run(&self, session_id: &str, task: &str) -> Result<String>;
}

/// Default policy: accepts tasks and does nothing with them
pub struct NoopPolicy;

#[async_trait]
impl TaskPolicy for NoopPolicy {
    async fn run(&self, session_id: &str, task: &str) -> Result<String> {
        info!(
            "no policy configured; task for session {} ignored: {}",
            session_id, task
        );
        Ok(String::new())
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;

    /// Records every task handed to it
    #[derive(Default)]
    pub struct FakePolicy {
        pub calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl TaskPolicy for FakePolicy {
        async fn run(&self, session_id: &str, task: &str) -> Result<String> {
            self.calls
                .lock()
                .push((session_id.to_string(), task.to_string()));
            Ok(format!("done: {task}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakePolicy;
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn noop_policy_accepts_any_task() {
        let result = NoopPolicy.run("s1", "find the docs").await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn policies_are_object_safe() {
        let policy: Arc<dyn TaskPolicy> = Arc::new(FakePolicy::default());
        let result = policy.run("s1", "open example.test").await.unwrap();
        assert_eq!(result, "done: open example.test");
    }
}
