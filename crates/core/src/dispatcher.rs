//! Command dispatch
//!
//! Gates actions on session readiness and serializes execution per
//! session: the handle sits behind a fair async mutex, so at most one
//! action runs at a time for a given session and waiters complete in
//! submission order. Sessions are independent of each other.

use browsercast_common::{ActionRequest, ActionResult, Error, PageContent, Result, SessionStatus};
use tracing::debug;

use crate::registry::Session;

fn ensure_ready(session: &Session) -> Result<()> {
    let status = session.status();
    if status != SessionStatus::Ready {
        return Err(Error::NotReady {
            id: session.id.clone(),
            status: status.to_string(),
        });
    }
    Ok(())
}

/// Run one action to completion. Page-level failures come back as data
/// in the result; only lifecycle problems (unknown/not-ready session)
/// surface as errors.
pub async fn execute(session: &Session, request: ActionRequest) -> Result<ActionResult> {
    ensure_ready(session)?;

    let guard = session.handle.lock().await;
    let handle = guard.as_ref().ok_or_else(|| Error::NotReady {
        id: session.id.clone(),
        status: session.status().to_string(),
    })?;

    debug!("session {}: executing {}", session.id, request.kind);
    Ok(handle.execute(&request).await)
}

/// Extract the session page's content and interactive elements
pub async fn introspect(session: &Session) -> Result<PageContent> {
    ensure_ready(session)?;

    let guard = session.handle.lock().await;
    let handle = guard.as_ref().ok_or_else(|| Error::NotReady {
        id: session.id.clone(),
        status: session.status().to_string(),
    })?;

    handle.introspect().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::registry::SessionRegistry;
    use browsercast_common::ActionKind;
    use std::sync::Arc;
    use std::time::Duration;

    fn stub(status: SessionStatus) -> Arc<crate::registry::Session> {
        let registry = SessionRegistry::new(DaemonConfig::default());
        registry.insert_stub("s1", status, chrono::Utc::now().timestamp())
    }

    fn screenshot() -> ActionRequest {
        ActionRequest {
            kind: ActionKind::Screenshot,
            selector: None,
            value: None,
            coordinates: None,
        }
    }

    #[tokio::test]
    async fn rejects_non_ready_states() {
        for status in [
            SessionStatus::Initializing,
            SessionStatus::Error,
            SessionStatus::Stopped,
        ] {
            let session = stub(status);
            let err = execute(&session, screenshot()).await.unwrap_err();
            assert!(matches!(err, Error::NotReady { .. }), "status {status}");
        }
    }

    #[tokio::test]
    async fn ready_without_handle_is_not_ready() {
        // Covers the teardown window where the handle is already gone.
        let session = stub(SessionStatus::Ready);
        let err = introspect(&session).await.unwrap_err();
        assert!(matches!(err, Error::NotReady { .. }));
    }

    #[tokio::test]
    async fn action_lock_grants_in_submission_order() {
        let session = stub(SessionStatus::Ready);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let first = session.handle.lock().await;

        let mut waiters = Vec::new();
        for n in 0..3 {
            let session = session.clone();
            let order = order.clone();
            waiters.push(tokio::spawn(async move {
                let _guard = session.handle.lock().await;
                order.lock().push(n);
            }));
            // Queue each waiter before spawning the next.
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        drop(first);
        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
