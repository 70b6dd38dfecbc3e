use std::sync::Arc;

use chatwire_api::{ChatBackend, ConversationId, RemoteMessage, TaskHandle};
use snafu::{OptionExt, ResultExt};

use crate::error::{EmptyHistorySnafu, HistorySnafu, ResolveResult, TaskStatusSnafu};

/// Single-shot reply resolution for non-streamed tasks.
///
/// One call is one status check; the retry cadence belongs to the caller.
#[derive(Clone)]
pub struct PollResolver {
    backend: Arc<dyn ChatBackend>,
}

impl PollResolver {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self { backend }
    }

    /// Returns the reply once the task is terminal, `None` while it is still running.
    ///
    /// A non-terminal check has no side effects, so calling this repeatedly is safe.
    pub async fn resolve(
        &self,
        conversation_id: ConversationId,
        handle: &TaskHandle,
    ) -> ResolveResult<Option<RemoteMessage>> {
        let state = self
            .backend
            .task_status(&handle.task_id)
            .await
            .context(TaskStatusSnafu {
                stage: "check-task-status",
                task_id: handle.task_id.clone(),
            })?;

        if !state.is_terminal() {
            tracing::trace!(task_id = %handle.task_id, state = ?state, "task still running");
            return Ok(None);
        }

        let record = self
            .backend
            .conversation(conversation_id)
            .await
            .context(HistorySnafu {
                stage: "fetch-resolved-history",
                conversation_id,
            })?;

        let reply = record.history.into_iter().last().context(EmptyHistorySnafu {
            stage: "pick-resolved-message",
            conversation_id,
        })?;

        tracing::debug!(
            task_id = %handle.task_id,
            conversation_id = %conversation_id,
            state = ?state,
            message_id = ?reply.id,
            "task resolved"
        );
        Ok(Some(reply))
    }
}

#[cfg(test)]
mod tests {
    use chatwire_api::{Role, TaskState};

    use super::*;
    use crate::error::ResolveError;
    use crate::testing::{FakeBackend, TaskStep};

    const CONVERSATION: ConversationId = ConversationId::new(11);

    #[tokio::test]
    async fn pending_checks_never_touch_history() {
        let backend = FakeBackend::new();
        backend.script_task([
            TaskStep::State(TaskState::Pending),
            TaskStep::State(TaskState::Pending),
        ]);
        let resolver = PollResolver::new(backend.clone());
        let handle = TaskHandle::new("t-1", false);

        assert_eq!(resolver.resolve(CONVERSATION, &handle).await.unwrap(), None);
        assert_eq!(resolver.resolve(CONVERSATION, &handle).await.unwrap(), None);
        assert_eq!(backend.status_calls(), 2);
        assert_eq!(backend.history_calls(), 0);
    }

    #[tokio::test]
    async fn success_returns_the_last_history_entry() {
        let backend = FakeBackend::new();
        backend.script_task([TaskStep::State(TaskState::Success)]);
        backend.set_history(vec![
            RemoteMessage::new(Some(1), Role::Human, "question"),
            RemoteMessage::new(Some(2), Role::Ai, "answer"),
        ]);
        let resolver = PollResolver::new(backend.clone());

        let reply = resolver
            .resolve(CONVERSATION, &TaskHandle::new("t-1", false))
            .await
            .unwrap()
            .expect("terminal task resolves");
        assert_eq!(reply.id, Some(2));
        assert_eq!(reply.text, "answer");
        assert_eq!(backend.history_calls(), 1);
    }

    #[tokio::test]
    async fn failure_is_terminal_and_still_reads_history() {
        let backend = FakeBackend::new();
        backend.script_task([TaskStep::State(TaskState::Failure)]);
        backend.set_history(vec![RemoteMessage::new(
            Some(9),
            Role::Ai,
            "the agent could not answer",
        )]);
        let resolver = PollResolver::new(backend);

        let reply = resolver
            .resolve(CONVERSATION, &TaskHandle::new("t-1", false))
            .await
            .unwrap();
        assert_eq!(reply.map(|message| message.id), Some(Some(9)));
    }

    #[tokio::test]
    async fn empty_history_after_completion_is_an_error() {
        let backend = FakeBackend::new();
        backend.script_task([TaskStep::State(TaskState::Success)]);
        let resolver = PollResolver::new(backend);

        let error = resolver
            .resolve(CONVERSATION, &TaskHandle::new("t-1", false))
            .await
            .unwrap_err();
        assert!(matches!(error, ResolveError::EmptyHistory { .. }));
    }

    #[tokio::test]
    async fn status_errors_are_returned_not_swallowed() {
        let backend = FakeBackend::new();
        backend.script_task([TaskStep::Fail]);
        let resolver = PollResolver::new(backend);

        let error = resolver
            .resolve(CONVERSATION, &TaskHandle::new("t-1", false))
            .await
            .unwrap_err();
        assert!(matches!(error, ResolveError::TaskStatus { .. }));
    }
}
