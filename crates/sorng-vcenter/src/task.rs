//! Task-completion polling.

use crate::error::{VcenterError, VcenterResult};
use crate::types::{MoRef, TaskState};
use crate::vim::VimApi;

use serde_json::Value;

/// Block until `task` leaves the queued/running states.
///
/// State changes are server-driven, so the loop only yields between polls.
/// A task that ends in `error` is reported with the remote message.
pub async fn wait_for_task(api: &dyn VimApi, task: &MoRef) -> VcenterResult<Option<Value>> {
    loop {
        let info = api.task_info(task).await?;
        match info.state {
            TaskState::Success => return Ok(info.result),
            TaskState::Error => {
                return Err(VcenterError::task(
                    info.error.unwrap_or_else(|| format!("Task {task} failed")),
                ))
            }
            TaskState::Queued | TaskState::Running => tokio::task::yield_now().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeVim;
    use crate::types::TaskInfo;

    #[tokio::test]
    async fn polls_until_success() {
        let fake = FakeVim::new();
        let task = MoRef::new("Task", "task-1");
        fake.script_task(
            &task,
            vec![TaskState::Queued, TaskState::Running, TaskState::Running, TaskState::Success],
        );
        let result = wait_for_task(&fake, &task).await.unwrap();
        assert!(result.is_none());
        assert_eq!(fake.count("task_info"), 4);
    }

    #[tokio::test]
    async fn error_state_carries_remote_message() {
        let fake = FakeVim::new();
        let task = MoRef::new("Task", "task-2");
        fake.set_task_info(
            &task,
            TaskInfo {
                state: TaskState::Error,
                error: Some("Insufficient disk space on datastore 'ds1'.".into()),
                result: None,
            },
        );
        let err = wait_for_task(&fake, &task).await.unwrap_err();
        assert_eq!(err.kind, crate::error::VcenterErrorKind::TaskError);
        assert_eq!(err.message, "Insufficient disk space on datastore 'ds1'.");
    }
}
