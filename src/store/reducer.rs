//! Task status reducer
//!
//! Maps progress events onto task status. Used when an event is appended
//! and again when the log is read or rewritten, so a status lost to a crash
//! between the two writes heals on the next read. The latest event that
//! proposes a status decides it; a failure rewritten to success re-derives
//! the status the success implies.

use crate::task::{StepStatus, StepType, TaskKind};

use super::models::{TaskEvent, TaskStatus};

/// Status a single event moves a task of `kind` to, if any
pub fn transition(kind: TaskKind, step: StepType, status: StepStatus) -> Option<TaskStatus> {
    if status == StepStatus::Failure {
        return Some(TaskStatus::Complete);
    }
    if status != StepStatus::Success {
        return None;
    }
    match (kind, step) {
        (TaskKind::CreateKubernetes, StepType::CreateCluster)
        | (TaskKind::CreateKubernetes, StepType::InstallKubernetes) => Some(TaskStatus::Complete),
        (TaskKind::InitPlatform, StepType::InitWutongRegion) => Some(TaskStatus::Inited),
        (TaskKind::UpdateKubernetes, StepType::UpdateKubernetes) => Some(TaskStatus::Complete),
        _ => None,
    }
}

/// Combine the current status with a proposed one; a proposal replaces it
pub fn apply(current: TaskStatus, next: Option<TaskStatus>) -> TaskStatus {
    next.unwrap_or(current)
}

/// Fold a list of events into a status, starting from `current`
pub fn reduce<'a>(
    kind: TaskKind,
    current: TaskStatus,
    events: impl IntoIterator<Item = &'a TaskEvent>,
) -> TaskStatus {
    events.into_iter().fold(current, |status, event| {
        apply(status, transition(kind, event.step_type, event.status))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rstest::rstest;

    fn event(step: StepType, status: StepStatus) -> TaskEvent {
        TaskEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            task_id: "t-1".to_string(),
            step_type: step,
            status,
            message: String::new(),
            reason: String::new(),
            created_at: Utc::now(),
        }
    }

    #[rstest]
    #[case(TaskKind::CreateKubernetes, StepType::CreateCluster, StepStatus::Success, Some(TaskStatus::Complete))]
    #[case(TaskKind::CreateKubernetes, StepType::InstallKubernetes, StepStatus::Success, Some(TaskStatus::Complete))]
    #[case(TaskKind::CreateKubernetes, StepType::InstallKubernetes, StepStatus::Start, None)]
    #[case(TaskKind::InitPlatform, StepType::InitWutongRegion, StepStatus::Success, Some(TaskStatus::Inited))]
    #[case(TaskKind::InitPlatform, StepType::CheckCluster, StepStatus::Success, None)]
    #[case(TaskKind::InitPlatform, StepType::CreateCluster, StepStatus::Success, None)]
    #[case(TaskKind::UpdateKubernetes, StepType::UpdateKubernetes, StepStatus::Success, Some(TaskStatus::Complete))]
    #[case(TaskKind::InitPlatform, StepType::CheckCluster, StepStatus::Failure, Some(TaskStatus::Complete))]
    #[case(TaskKind::UpdateKubernetes, StepType::Init, StepStatus::Failure, Some(TaskStatus::Complete))]
    fn test_transition_table(
        #[case] kind: TaskKind,
        #[case] step: StepType,
        #[case] status: StepStatus,
        #[case] expected: Option<TaskStatus>,
    ) {
        assert_eq!(transition(kind, step, status), expected);
    }

    /// Story: a failure closes the task, and a later success of the final
    /// step moves it on to `inited`.
    #[test]
    fn story_latest_proposal_decides() {
        let mut events = vec![
            event(StepType::InitWutongRegion, StepStatus::Success),
            event(StepType::InitWutongRegion, StepStatus::Failure),
        ];
        assert_eq!(
            reduce(TaskKind::InitPlatform, TaskStatus::Start, &events),
            TaskStatus::Complete
        );

        events.push(event(StepType::InitWutongRegion, StepStatus::Success));
        assert_eq!(
            reduce(TaskKind::InitPlatform, TaskStatus::Complete, &events),
            TaskStatus::Inited
        );
    }

    /// Story: events that propose nothing leave a closed task closed
    #[test]
    fn story_neutral_events_keep_complete() {
        let events = vec![
            event(StepType::InitWutongRegionPackage, StepStatus::Success),
            event(StepType::Close, StepStatus::Success),
        ];
        assert_eq!(
            reduce(TaskKind::InitPlatform, TaskStatus::Complete, &events),
            TaskStatus::Complete
        );
    }

    /// Story: replaying the same log twice gives the same answer
    #[test]
    fn story_reduce_is_idempotent() {
        let events = vec![
            event(StepType::Init, StepStatus::Start),
            event(StepType::Init, StepStatus::Success),
            event(StepType::InitWutongRegion, StepStatus::Success),
        ];
        let once = reduce(TaskKind::InitPlatform, TaskStatus::Start, &events);
        let twice = reduce(TaskKind::InitPlatform, once, &events);
        assert_eq!(once, TaskStatus::Inited);
        assert_eq!(twice, once);
    }

    #[test]
    fn test_empty_log_keeps_status() {
        assert_eq!(
            reduce(TaskKind::CreateKubernetes, TaskStatus::Start, &[]),
            TaskStatus::Start
        );
    }
}
