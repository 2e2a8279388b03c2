//! Long-running operation poller
//!
//! Drives one [`Operation`] to a terminal state. Each iteration issues a
//! single status request (itself retried by the [`RetryPolicy`] on transport
//! failures, without resetting the operation) and, while the operation is
//! still running, waits for the backoff delay or the server's retry hint,
//! whichever is larger.
//!
//! The poller never cancels the remote operation. On timeout or
//! cancellation the remote side is left to converge on its own.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{LifecycleError, Result};
use crate::executor::{Request, RequestExecutor, Response};
use crate::operation::{Operation, OperationStatus};
use crate::retry::RetryPolicy;

pub struct Poller {
    executor: Arc<dyn RequestExecutor>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl Poller {
    pub fn new(
        executor: Arc<dyn RequestExecutor>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            executor,
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Wait for `operation` to finish.
    ///
    /// Returns the `result` payload on success (`null` when the remote sent
    /// none). Failed and canceled remote operations become
    /// [`LifecycleError::OperationFailed`]. A timeout too large to represent
    /// means no deadline.
    pub async fn wait(
        &self,
        operation: &mut Operation,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let started = self.clock.now();
        let deadline = started.checked_add(timeout);
        let mut backoff = Duration::ZERO;
        let mut polls: u32 = 0;

        debug!(
            operation = %operation.id,
            target = %operation.target,
            "Waiting for operation (timeout {:?})",
            timeout
        );

        loop {
            if cancel.is_cancelled() {
                return Err(self.canceled(operation));
            }
            if deadline.is_some_and(|deadline| self.clock.now() >= deadline) {
                return Err(self.timed_out(operation, started));
            }

            polls += 1;
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.canceled(operation)),
                response = self.fetch_status(&operation.locator, deadline) => response,
            };
            let response = match fetched {
                Ok(response) => response,
                Err(e) if deadline.is_some_and(|deadline| self.clock.now() >= deadline) => {
                    debug!(operation = %operation.id, "Status request gave up at deadline: {}", e);
                    return Err(self.timed_out(operation, started));
                }
                Err(e) => return Err(e),
            };

            let hint = response.retry_after();
            let body = response.body.ok_or_else(|| {
                LifecycleError::MalformedResponse("empty operation status body".to_string())
            })?;
            let status = operation.record_poll(body, self.clock.utc_now())?;
            debug!(operation = %operation.id, poll = polls, "Operation state: {}", status);

            match status {
                OperationStatus::Succeeded => {
                    info!(operation = %operation.id, "Operation succeeded after {} poll(s)", polls);
                    return Ok(operation.result.clone().unwrap_or(Value::Null));
                }
                OperationStatus::Failed | OperationStatus::Canceled => {
                    warn!(operation = %operation.id, "Operation ended as {}", status);
                    return Err(LifecycleError::OperationFailed {
                        detail: operation.failure.clone().unwrap_or(Value::Null),
                    });
                }
                OperationStatus::Running => {}
            }

            backoff = backoff.max(self.policy.delay_for_attempt(polls));
            let delay = hint.map_or(backoff, |hint| hint.max(backoff));
            let delay = match deadline {
                Some(deadline) => delay.min(deadline.saturating_duration_since(self.clock.now())),
                None => delay,
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.canceled(operation)),
                _ = self.clock.sleep(delay) => {}
            }
        }
    }

    async fn fetch_status(&self, locator: &str, deadline: Option<Instant>) -> Result<Response> {
        self.policy
            .run_until(self.clock.as_ref(), "operation status request", deadline, || {
                let executor = Arc::clone(&self.executor);
                let request = Request::get(locator);
                async move { executor.execute(request).await?.error_for_status() }
            })
            .await
    }

    fn timed_out(&self, operation: &Operation, started: Instant) -> LifecycleError {
        warn!(
            operation = %operation.id,
            "Operation still {} at deadline, leaving it running",
            operation.status
        );
        LifecycleError::Timeout {
            locator: operation.locator.clone(),
            elapsed: self.clock.now() - started,
        }
    }

    fn canceled(&self, operation: &Operation) -> LifecycleError {
        info!(operation = %operation.id, "Stopped waiting for operation (canceled)");
        LifecycleError::Canceled {
            locator: operation.locator.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses and counts requests
    struct Script {
        responses: Mutex<VecDeque<Result<Response>>>,
        requests: Mutex<Vec<Request>>,
    }

    impl Script {
        fn new(responses: Vec<Result<Response>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RequestExecutor for Script {
        async fn execute(&self, request: Request) -> Result<Response> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Response::new(200).with_body(json!({"status": "Running"}))))
        }
    }

    fn status(s: &str) -> Result<Response> {
        Ok(Response::new(200).with_body(json!({ "status": s })))
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 400,
            backoff_multiplier: 2.0,
            jitter: 0.2,
            ..RetryPolicy::default()
        }
    }

    fn operation() -> Operation {
        Operation::new("environment", "https://api.example.com/ops/1", Utc::now())
    }

    #[tokio::test]
    async fn test_polls_until_succeeded() {
        let script = Script::new(vec![
            status("Running"),
            status("Running"),
            status("Running"),
            Ok(Response::new(200).with_body(json!({"status": "Succeeded", "result": {"id": "env-1"}}))),
        ]);
        let clock = Arc::new(ManualClock::new());
        let poller = Poller::new(script.clone(), policy(), clock.clone());
        let mut op = operation();

        let result = poller
            .wait(&mut op, Duration::from_secs(60), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result, json!({"id": "env-1"}));
        assert_eq!(script.count(), 4);
        assert_eq!(op.status, OperationStatus::Succeeded);

        let sleeps = clock.sleeps();
        assert_eq!(sleeps.len(), 3);
        assert!(sleeps.windows(2).all(|w| w[0] <= w[1]), "{sleeps:?}");
        assert!(sleeps.iter().all(|d| *d <= Duration::from_millis(400)));
    }

    #[tokio::test]
    async fn test_failed_operation_surfaces_detail() {
        let script = Script::new(vec![
            status("Running"),
            Ok(Response::new(200).with_body(json!({"status": "Failed", "error": {"message": "quota"}}))),
        ]);
        let poller = Poller::new(script, policy(), Arc::new(ManualClock::new()));
        let mut op = operation();

        let err = poller
            .wait(&mut op, Duration::from_secs(60), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            LifecycleError::OperationFailed { detail } => {
                assert_eq!(detail, json!({"message": "quota"}))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_status_server_error_is_retried_without_reset() {
        let script = Script::new(vec![
            status("Running"),
            Ok(Response::new(500)),
            status("Succeeded"),
        ]);
        let poller = Poller::new(script.clone(), policy(), Arc::new(ManualClock::new()));
        let mut op = operation();

        poller
            .wait(&mut op, Duration::from_secs(60), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(script.count(), 3);
        assert_eq!(op.status, OperationStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_throttle_hint_respected() {
        let script = Script::new(vec![
            Ok(Response::new(429).with_header("Retry-After", "2")),
            status("Succeeded"),
        ]);
        let clock = Arc::new(ManualClock::new());
        let poller = Poller::new(script.clone(), policy(), clock.clone());
        let mut op = operation();

        poller
            .wait(&mut op, Duration::from_secs(60), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(script.count(), 2);
        assert!(clock.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_running_hint_larger_than_backoff_wins() {
        let script = Script::new(vec![
            Ok(Response::new(200)
                .with_header("Retry-After", "5")
                .with_body(json!({"status": "Running"}))),
            status("Succeeded"),
        ]);
        let clock = Arc::new(ManualClock::new());
        let poller = Poller::new(script, policy(), clock.clone());

        poller
            .wait(&mut operation(), Duration::from_secs(60), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(clock.sleeps(), vec![Duration::from_secs(5)]);
    }

    #[tokio::test]
    async fn test_timeout_leaves_operation_running() {
        let script = Script::new(Vec::new());
        let clock = Arc::new(ManualClock::new());
        let poller = Poller::new(script.clone(), policy(), clock.clone());
        let mut op = operation();

        let err = poller
            .wait(&mut op, Duration::from_secs(2), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::Timeout { .. }));
        assert_eq!(op.status, OperationStatus::Running);
        assert!(script.requests.lock().unwrap().iter().all(|r| r.method == crate::Method::Get));
        assert_eq!(clock.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_throttle_hint_past_deadline_times_out() {
        let script = Script::new(vec![Ok(
            Response::new(429).with_header("Retry-After", "3600")
        )]);
        let clock = Arc::new(ManualClock::new());
        let poller = Poller::new(script.clone(), policy(), clock.clone());
        let mut op = operation();

        let err = poller
            .wait(&mut op, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::Timeout { .. }), "{err:?}");
        assert_eq!(clock.elapsed(), Duration::from_secs(5));
        assert_eq!(script.count(), 1);
    }

    #[tokio::test]
    async fn test_unrepresentable_timeout_means_no_deadline() {
        let script = Script::new(vec![status("Running"), status("Succeeded")]);
        let poller = Poller::new(script.clone(), policy(), Arc::new(ManualClock::new()));
        let mut op = operation();

        poller
            .wait(&mut op, Duration::from_secs(u64::MAX), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(op.status, OperationStatus::Succeeded);
        assert_eq!(script.count(), 2);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let script = Script::new(Vec::new());
        let poller = Poller::new(script.clone(), policy(), Arc::new(ManualClock::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = poller
            .wait(&mut operation(), Duration::from_secs(60), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::Canceled { .. }));
        assert_eq!(script.count(), 0);
    }
}
