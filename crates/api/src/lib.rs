mod backend;
mod channel;
mod error;
mod events;
mod types;

pub use backend::{BackendConfig, BoxFuture, ChatBackend, DEFAULT_REQUEST_TIMEOUT, HttpBackend};
pub use channel::{ChannelConnector, ChannelFrame, ChannelStream, WsConnector};
pub use error::{ApiError, ApiResult};
pub use events::{
    ChannelEvent, EVENT_ACTION, EVENT_ERROR, EVENT_MESSAGE_ID, EVENT_PARSER_START,
    EVENT_PARSER_STREAM, EnvelopeError,
};
pub use types::{
    ConversationId, ConversationRecord, MessageFile, RemoteMessage, Role, SubmitRequest,
    TaskHandle, TaskId, TaskState, UploadFile, UploadStatus,
};
