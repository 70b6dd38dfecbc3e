use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{ApiResult, ReadFileSnafu};

/// Server-assigned conversation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub u64);

impl ConversationId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Identifier of one unit of background work on the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Reply to a message submission: which task produces the answer and how it is delivered.
///
/// `streaming` is advisory. It reflects server capability, not a promise that the duplex
/// channel will connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task_id: TaskId,
    #[serde(default)]
    pub streaming: bool,
}

impl TaskHandle {
    pub fn new(task_id: impl Into<String>, streaming: bool) -> Self {
        Self {
            task_id: TaskId::new(task_id),
            streaming,
        }
    }
}

/// Background task state as reported by the status endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Success,
    Failure,
}

impl TaskState {
    /// Maps the wire state. Anything that is not a known terminal state counts as pending,
    /// which covers broker states such as `STARTED` or `RETRY`.
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" => Self::Success,
            "FAILURE" => Self::Failure,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(alias = "user")]
    Human,
    #[serde(alias = "assistant", alias = "bot")]
    Ai,
    System,
}

/// File attached to a message once its upload has succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFile {
    pub id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub mime: String,
}

impl MessageFile {
    pub fn new(id: u64, name: impl Into<String>, mime: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            mime: mime.into(),
        }
    }
}

/// One entry of a conversation history as persisted by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(alias = "sender")]
    pub role: Role,
    #[serde(default, alias = "message")]
    pub text: String,
    #[serde(default)]
    pub files: Vec<MessageFile>,
}

impl RemoteMessage {
    pub fn new(id: Option<u64>, role: Role, text: impl Into<String>) -> Self {
        Self {
            id,
            role,
            text: text.into(),
            files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    #[serde(default)]
    pub history: Vec<RemoteMessage>,
}

/// Body of a message submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitRequest {
    pub conversation_id: ConversationId,
    pub question_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_set_id: Option<u64>,
    pub streaming: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub file_ids: Vec<u64>,
}

impl SubmitRequest {
    pub fn new(conversation_id: ConversationId, question_message: impl Into<String>) -> Self {
        Self {
            conversation_id,
            question_message: question_message.into(),
            data_set_id: None,
            streaming: false,
            file_ids: Vec::new(),
        }
    }

    pub fn with_data_set(mut self, data_set_id: Option<u64>) -> Self {
        self.data_set_id = data_set_id;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_file_ids(mut self, file_ids: Vec<u64>) -> Self {
        self.file_ids = file_ids;
        self
    }

    /// True when there is nothing to send: blank text and no attachments.
    pub fn is_empty(&self) -> bool {
        self.question_message.trim().is_empty() && self.file_ids.is_empty()
    }
}

/// Result of one upload status check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadStatus {
    pub state: TaskState,
    pub file_id: Option<u64>,
    pub error: Option<String>,
}

impl UploadStatus {
    pub fn pending() -> Self {
        Self {
            state: TaskState::Pending,
            file_id: None,
            error: None,
        }
    }

    pub fn succeeded(file_id: u64) -> Self {
        Self {
            state: TaskState::Success,
            file_id: Some(file_id),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            state: TaskState::Failure,
            file_id: None,
            error: Some(error.into()),
        }
    }
}

/// A file selected for upload, read fully into memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            bytes,
        }
    }

    pub async fn from_path(path: &Path) -> ApiResult<Self> {
        let bytes = tokio::fs::read(path).await.context(ReadFileSnafu {
            stage: "read-upload-source",
            path: path.display().to_string(),
        })?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let mime = mime_for(path);

        Ok(Self { name, mime, bytes })
    }
}

fn mime_for(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreatedConversationPayload {
    pub id: ConversationId,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TaskStatusPayload {
    #[serde(alias = "status")]
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UploadTaskPayload {
    pub task_id: TaskId,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct UploadResultPayload {
    #[serde(default)]
    pub file_id: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UploadStatusPayload {
    #[serde(alias = "state")]
    pub status: String,
    #[serde(default)]
    pub result: Option<UploadResultPayload>,
}

impl From<UploadStatusPayload> for UploadStatus {
    fn from(payload: UploadStatusPayload) -> Self {
        let result = payload.result.unwrap_or_default();
        Self {
            state: TaskState::from_wire(&payload.status),
            file_id: result.file_id,
            error: result.error,
        }
    }
}
