use chatwire_api::{ApiError, ConversationId, TaskId};
use snafu::Snafu;

use crate::chat::DeliveryPhase;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("nothing to send: message text is empty and no files are attached"))]
    EmptySubmission { stage: &'static str },
    #[snafu(display("another submission is still {phase}"))]
    Busy {
        stage: &'static str,
        phase: DeliveryPhase,
    },
    #[snafu(display("{pending} attachment(s) are still uploading"))]
    AttachmentsPending { stage: &'static str, pending: usize },
    #[snafu(display("attachments failed to upload: {}", failed.join(", ")))]
    AttachmentsFailed {
        stage: &'static str,
        failed: Vec<String>,
    },
    #[snafu(display("failed to create conversation on `{stage}`: {source}"))]
    CreateConversation {
        stage: &'static str,
        source: ApiError,
    },
    #[snafu(display("session has no conversation yet"))]
    NoConversation { stage: &'static str },
    #[snafu(display("failed to dispatch message to conversation {conversation_id}: {source}"))]
    Dispatch {
        stage: &'static str,
        conversation_id: ConversationId,
        source: ApiError,
    },
    #[snafu(display("failed to load history of conversation {conversation_id}: {source}"))]
    LoadHistory {
        stage: &'static str,
        conversation_id: ConversationId,
        source: ApiError,
    },
    #[snafu(display("polling task {task_id} failed: {source}"))]
    Poll {
        stage: &'static str,
        task_id: TaskId,
        source: ResolveError,
    },
    #[snafu(display("task {task_id} did not finish after {attempts} status checks"))]
    PollExhausted {
        stage: &'static str,
        task_id: TaskId,
        attempts: u32,
    },
    #[snafu(display("session was shut down on `{stage}`"))]
    Cancelled { stage: &'static str },
}

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ResolveError {
    #[snafu(display("status check for task {task_id} failed: {source}"))]
    TaskStatus {
        stage: &'static str,
        task_id: TaskId,
        source: ApiError,
    },
    #[snafu(display("history fetch for conversation {conversation_id} failed: {source}"))]
    History {
        stage: &'static str,
        conversation_id: ConversationId,
        source: ApiError,
    },
    #[snafu(display("conversation {conversation_id} has no history after task completion"))]
    EmptyHistory {
        stage: &'static str,
        conversation_id: ConversationId,
    },
}

pub type ResolveResult<T> = Result<T, ResolveError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum UploadError {
    #[snafu(display("failed to upload '{name}': {source}"))]
    Upload {
        stage: &'static str,
        name: String,
        source: ApiError,
    },
    #[snafu(display("upload status check for task {task_id} failed: {source}"))]
    StatusCheck {
        stage: &'static str,
        task_id: TaskId,
        source: ApiError,
    },
    #[snafu(display("server rejected upload task {task_id}: {reason}"))]
    UploadRejected {
        stage: &'static str,
        task_id: TaskId,
        reason: String,
    },
    #[snafu(display("upload task {task_id} succeeded without a file id"))]
    MissingFileId { stage: &'static str, task_id: TaskId },
    #[snafu(display("upload task {task_id} timed out after {attempts} status checks"))]
    UploadTimedOut {
        stage: &'static str,
        task_id: TaskId,
        attempts: u32,
    },
    #[snafu(display("upload was abandoned on `{stage}`"))]
    UploadCancelled { stage: &'static str },
}

impl UploadError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::UploadTimedOut { .. })
    }
}

pub type UploadResult<T> = Result<T, UploadError>;
