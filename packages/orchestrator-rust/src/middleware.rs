//! Ready-made interceptors for task lifecycle chains.
//!
//! ```ignore
//! qb.pre(event::PUSH)?.fire_and_forget(set_timestamp("timestamp", Arc::new(SystemClock)));
//! qb.on(event::FAIL)?.continuation(retry(&qb, ["email"], 3));
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use quarterback_core::{ClockSource, Continuation, Flow, InterceptError, TaskEvent};
use serde_json::Value;
use tracing::{error, info};

use crate::error::OrchestratorError;
use crate::orchestrator::Orchestrator;

/// Task field counting retries performed so far.
pub const RETRY_FIELD: &str = "retry";

/// Writes the current epoch milliseconds into `field`.
pub fn set_timestamp(
    field: impl Into<String>,
    clock: Arc<dyn ClockSource>,
) -> impl Fn(&mut TaskEvent) + Send + Sync + 'static {
    let field = field.into();
    move |ev: &mut TaskEvent| {
        ev.task.insert(field.clone(), Value::from(clock.now()));
    }
}

/// Removes `_`-prefixed fields from the task.
pub fn delete_hidden_fields() -> impl Fn(&mut TaskEvent) + Send + Sync + 'static {
    |ev: &mut TaskEvent| ev.task.strip_hidden_fields()
}

/// `fail` interceptor re-pushing failed tasks of the listed types until they
/// have been attempted `times` times in total.
///
/// While a retry is pending the fail chain halts, so the original push stays
/// unsettled and later fail interceptors do not run. Once attempts are
/// exhausted the chain proceeds and the failure settles normally. A retry the
/// orchestrator refuses to push settles the task with its last failure and is
/// reported as an error notification.
pub fn retry<I, S>(orchestrator: &Arc<Orchestrator>, types: I, times: u32) -> Retry
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Retry {
        orchestrator: Arc::downgrade(orchestrator),
        types: types.into_iter().map(Into::into).collect(),
        times: u64::from(times),
    }
}

pub struct Retry {
    orchestrator: Weak<Orchestrator>,
    types: HashSet<String>,
    times: u64,
}

#[async_trait]
impl Continuation<TaskEvent> for Retry {
    async fn call(&self, ev: &mut TaskEvent) -> Result<Flow, InterceptError> {
        if !self.types.contains(&ev.task_type) {
            return Ok(Flow::Proceed);
        }
        let attempts = ev.task.get(RETRY_FIELD).and_then(Value::as_u64).unwrap_or(0);
        ev.task.insert(RETRY_FIELD.to_string(), Value::from(attempts + 1));

        if attempts + 1 >= self.times {
            error!(
                task_type = %ev.task_type,
                attempts = attempts + 1,
                "task failed after exhausting retries"
            );
            return Ok(Flow::Proceed);
        }
        let Some(orchestrator) = self.orchestrator.upgrade() else {
            return Ok(Flow::Proceed);
        };

        info!(task_type = %ev.task_type, retry = attempts + 1, "retrying task");
        let task_type = ev.task_type.clone();
        let task = ev.task.clone();
        let last_error = ev
            .error
            .clone()
            .unwrap_or_else(|| InterceptError::msg(format!("task of type {task_type} failed")));
        tokio::spawn(async move {
            match orchestrator.push(&task_type, task.clone()).await {
                // Settled under the same id, or released by `end()`.
                Ok(_)
                | Err(OrchestratorError::TaskFailed { .. } | OrchestratorError::Abandoned { .. }) => {}
                Err(refusal) => {
                    orchestrator.settle_refused_retry(&task_type, &task, last_error, &refusal);
                }
            }
        });
        Ok(Flow::Halt)
    }
}

#[cfg(test)]
mod tests {
    use quarterback_core::{ManualClock, Task};
    use serde_json::json;

    use super::*;

    fn event(value: Value) -> TaskEvent {
        TaskEvent::new("t", Task::from_value(value).unwrap())
    }

    #[test]
    fn set_timestamp_uses_clock() {
        let stamp = set_timestamp("at", Arc::new(ManualClock::new(42)));
        let mut ev = event(json!({}));
        stamp(&mut ev);
        assert_eq!(ev.task["at"], json!(42));
    }

    #[test]
    fn delete_hidden_fields_strips_underscore_keys() {
        let strip = delete_hidden_fields();
        let mut ev = event(json!({"_tmp": 1, "keep": 2}));
        strip(&mut ev);
        assert_eq!(ev.task.into_value(), json!({"keep": 2}));
    }

    #[tokio::test]
    async fn retry_ignores_unlisted_types_and_stops_at_limit() {
        let qb = Orchestrator::new(crate::config::OrchestratorConfig::default());
        let interceptor = retry(&qb, ["other"], 3);
        let mut ev = event(json!({}));
        assert_eq!(interceptor.call(&mut ev).await, Ok(Flow::Proceed));
        assert!(ev.task.get(RETRY_FIELD).is_none());

        let interceptor = retry(&qb, ["t"], 3);
        let mut exhausted = event(json!({"retry": 2}));
        assert_eq!(interceptor.call(&mut exhausted).await, Ok(Flow::Proceed));
        assert_eq!(exhausted.task[RETRY_FIELD], json!(3));
    }
}
