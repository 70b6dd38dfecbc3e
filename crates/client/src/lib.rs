#![deny(unsafe_code)]

/// Stream channel ownership and degradation.
pub mod channel;
/// Message log, delivery state machine and the observer feed.
pub mod chat;
pub mod error;
/// Fixed-interval polling shared by reply and upload resolution.
pub mod poll;
pub mod resolver;
/// Session controller tying dispatch, streaming and polling together.
pub mod session;
/// Settings persistence.
pub mod settings;
pub mod upload;

#[cfg(test)]
mod testing;

pub use channel::{ChannelManager, ChannelSignal, ChannelState, OpenOutcome};
pub use chat::{
    ClientMessageId, ConversationLog, DeliveryPath, DeliveryPhase, DeliveryState, Message,
    SessionUpdate, SessionUpdates,
};
pub use error::{
    ResolveError, ResolveResult, SessionError, SessionResult, UploadError, UploadResult,
};
pub use poll::{PollPolicy, PollStop, poll_until};
pub use resolver::PollResolver;
pub use session::{ChatSession, SessionConfig};
pub use settings::{ClientSettings, SettingsError, SettingsStore};
pub use upload::{
    Attachment, AttachmentGate, AttachmentId, AttachmentSet, AttachmentState, UploadPipeline,
};
