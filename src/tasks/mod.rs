// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Asynchronous task polling.
//!
//! Most mutating calls hand back a task href instead of a result. The poller
//! queries it on a capped exponential schedule until the task reaches a
//! terminal state or the caller's timeout would be exceeded.
//!
//! Network failures on a status query get their own small retry budget so a
//! dropped connection does not eat into, or reset, the polling schedule.

use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::api::{CreateResponse, Task, TaskApi, TaskHref, TaskState};
use crate::errors::{PulpError, PulpResult};

/// Default attempts for a single status query.
pub const DEFAULT_QUERY_ATTEMPTS: u32 = 3;

/// Delay between status-query retries (doubles per attempt).
const QUERY_RETRY_BASE_MS: u64 = 500;

/// Poll schedule: `initial * factor^n`, never above `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            factor: 1.5,
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before poll number `n + 1` (0-based). Non-decreasing in `n`.
    pub fn delay(&self, n: usize) -> Duration {
        let factor = self.factor.max(1.0);
        let exponent = i32::try_from(n).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// A task that reached `completed`, with the polling history.
#[derive(Debug, Clone)]
pub struct TerminalTask {
    pub task: Task,
    /// Status queries issued (successful ones).
    pub polls: u32,
    /// Sleeps between polls, in order.
    pub delays: Vec<Duration>,
}

impl TerminalTask {
    pub fn created_resources(&self) -> &[String] {
        self.task.created_resources()
    }
}

/// Polls tasks through a [`TaskApi`]. Holds no per-task state.
pub struct TaskPoller<'a, A: TaskApi + ?Sized> {
    api: &'a A,
    policy: BackoffPolicy,
    query_attempts: u32,
}

impl<'a, A: TaskApi + ?Sized> TaskPoller<'a, A> {
    pub fn new(api: &'a A) -> Self {
        Self {
            api,
            policy: BackoffPolicy::default(),
            query_attempts: DEFAULT_QUERY_ATTEMPTS,
        }
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_query_attempts(mut self, attempts: u32) -> Self {
        self.query_attempts = attempts.max(1);
        self
    }

    /// Wait until `href` completes.
    ///
    /// Returns `TaskFailed` for failed or canceled tasks, `TaskTimeout` when the
    /// next sleep would pass `timeout`, and `TransientRequest` when a status
    /// query keeps failing at the network level.
    pub async fn await_completion(&self, href: &TaskHref, timeout: Duration) -> PulpResult<TerminalTask> {
        let started = Instant::now();
        let mut polls = 0u32;
        let mut delays = Vec::new();

        loop {
            let task = self.query(href).await?;
            polls += 1;
            tracing::debug!("Task {} is {} (poll {})", href, task.state.as_str(), polls);

            match &task.state {
                TaskState::Completed { .. } => {
                    tracing::info!("Task {} completed after {} poll(s)", href, polls);
                    return Ok(TerminalTask { task, polls, delays });
                }
                TaskState::Failed { detail } => {
                    return Err(PulpError::TaskFailed {
                        task: href.to_string(),
                        state: "failed".to_string(),
                        detail: detail.clone(),
                    });
                }
                TaskState::Canceled { detail } => {
                    return Err(PulpError::TaskFailed {
                        task: href.to_string(),
                        state: "canceled".to_string(),
                        detail: detail.clone().unwrap_or_else(|| "canceled by server".to_string()),
                    });
                }
                TaskState::Waiting | TaskState::Running => {}
            }

            let delay = self.policy.delay(delays.len());
            let waited = started.elapsed();
            if waited + delay > timeout {
                tracing::error!(
                    "Timed out waiting for task {} after {}s ({} polls)",
                    href,
                    waited.as_secs(),
                    polls
                );
                return Err(PulpError::TaskTimeout {
                    task: href.to_string(),
                    waited,
                    polls,
                });
            }

            sleep(delay).await;
            delays.push(delay);
        }
    }

    /// Hrefs created by a creation call, waiting on the task if there is one.
    pub async fn created_hrefs(&self, response: CreateResponse, timeout: Duration) -> PulpResult<Vec<String>> {
        match response {
            CreateResponse::Resource { href, .. } => Ok(vec![href]),
            CreateResponse::Task(task) => {
                let terminal = self.await_completion(&task, timeout).await?;
                Ok(terminal.created_resources().to_vec())
            }
        }
    }

    /// One status query with its own transient retry budget.
    async fn query(&self, href: &TaskHref) -> PulpResult<Task> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.api.get_task(href).await {
                Ok(task) => return Ok(task),
                Err(err) if err.is_transient() => {
                    if attempt >= self.query_attempts {
                        return Err(PulpError::TransientRequest {
                            operation: format!("get task {}", href),
                            message: err.to_string(),
                            attempts: attempt,
                        });
                    }
                    let delay = QUERY_RETRY_BASE_MS * (1 << (attempt - 1).min(6));
                    tracing::warn!("Status query for {} failed ({}), retrying in {}ms", href, err, delay);
                    sleep(Duration::from_millis(delay)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted responses; the last one repeats forever.
    struct ScriptedTasks {
        script: Mutex<VecDeque<PulpResult<&'static str>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedTasks {
        fn new(script: Vec<PulpResult<&'static str>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    fn transient() -> PulpError {
        PulpError::TransientRequest {
            operation: "get task".into(),
            message: "connection reset".into(),
            attempts: 1,
        }
    }

    fn task_json(state: &str) -> Task {
        serde_json::from_value(serde_json::json!({
            "pulp_href": "/tasks/1/",
            "state": state,
            "created_resources": ["/content/1/"],
            "error": {"description": "boom"}
        }))
        .unwrap()
    }

    #[async_trait]
    impl TaskApi for ScriptedTasks {
        async fn get_task(&self, _href: &TaskHref) -> PulpResult<Task> {
            *self.calls.lock().unwrap() += 1;
            let mut script = self.script.lock().unwrap();
            let next = if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                match script.front().unwrap() {
                    Ok(s) => Ok(*s),
                    Err(_) => Err(transient()),
                }
            };
            next.map(task_json)
        }
    }

    fn href() -> TaskHref {
        TaskHref::new("/tasks/1/")
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(2));
        assert_eq!(policy.delay(1), Duration::from_secs(3));
        assert_eq!(policy.delay(2), Duration::from_millis(4500));

        let mut previous = Duration::ZERO;
        for n in 0..40 {
            let d = policy.delay(n);
            assert!(d >= previous, "delay decreased at step {}", n);
            assert!(d <= policy.max);
            previous = d;
        }
        assert_eq!(policy.delay(1000), policy.max);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_until_completed() {
        let api = ScriptedTasks::new(vec![Ok("waiting"), Ok("running"), Ok("completed")]);
        let poller = TaskPoller::new(&api);

        let done = poller.await_completion(&href(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(done.polls, 3);
        assert_eq!(done.delays, vec![Duration::from_secs(2), Duration::from_secs(3)]);
        assert_eq!(done.created_resources(), ["/content/1/".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_stops_polling() {
        let api = ScriptedTasks::new(vec![Ok("waiting")]);
        let poller = TaskPoller::new(&api);

        // Sleeps of 2s and 3s fit in 5s; the next (4.5s) would not.
        let err = poller.await_completion(&href(), Duration::from_secs(5)).await.unwrap_err();
        match err {
            PulpError::TaskTimeout { polls, .. } => assert_eq!(polls, 3),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(api.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_policy_sets_schedule() {
        let api = ScriptedTasks::new(vec![Ok("waiting"), Ok("running"), Ok("running"), Ok("completed")]);
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_millis(250),
        };

        let done = TaskPoller::new(&api)
            .with_policy(policy)
            .await_completion(&href(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(done.polls, 4);
        assert_eq!(
            done.delays,
            vec![Duration::from_millis(100), Duration::from_millis(200), Duration::from_millis(250)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_task_carries_detail() {
        let api = ScriptedTasks::new(vec![Ok("running"), Ok("failed")]);
        let err = TaskPoller::new(&api)
            .await_completion(&href(), Duration::from_secs(60))
            .await
            .unwrap_err();
        match err {
            PulpError::TaskFailed { state, detail, .. } => {
                assert_eq!(state, "failed");
                assert_eq!(detail, "boom");
            }
            other => panic!("expected task failure, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_canceled_task_is_failure() {
        let api = ScriptedTasks::new(vec![Ok("canceled")]);
        let err = TaskPoller::new(&api)
            .await_completion(&href(), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, PulpError::TaskFailed { ref state, .. } if state == "canceled"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried_separately() {
        let api = ScriptedTasks::new(vec![Err(transient()), Ok("waiting"), Err(transient()), Ok("completed")]);
        let done = TaskPoller::new(&api)
            .await_completion(&href(), Duration::from_secs(60))
            .await
            .unwrap();
        // Only successful queries count as polls; the schedule is unchanged.
        assert_eq!(done.polls, 2);
        assert_eq!(done.delays, vec![Duration::from_secs(2)]);
        assert_eq!(api.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_budget_exhausted() {
        let api = ScriptedTasks::new(vec![Err(transient())]);
        let err = TaskPoller::new(&api)
            .with_query_attempts(2)
            .await_completion(&href(), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, PulpError::TransientRequest { attempts: 2, .. }));
        assert_eq!(api.calls(), 2);
    }

    #[tokio::test]
    async fn test_created_hrefs_for_sync_resource() {
        let api = ScriptedTasks::new(vec![Ok("completed")]);
        let hrefs = TaskPoller::new(&api)
            .created_hrefs(
                CreateResponse::Resource {
                    href: "/repo/1/".into(),
                    body: serde_json::Value::Null,
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(hrefs, vec!["/repo/1/".to_string()]);
        assert_eq!(api.calls(), 0);
    }
}
