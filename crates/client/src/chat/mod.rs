/// Per-submission delivery state machine.
pub mod delivery;
/// Update feed published to observers.
pub mod events;
/// Message model and the ordered conversation log.
pub mod message;

pub use delivery::{
    DeliveryPhase, DeliveryRejection, DeliveryState, DeliveryTransition, DeliveryTransitionResult,
};
pub use events::{DeliveryPath, SessionUpdate, SessionUpdates};
pub use message::{ClientMessageId, ConversationLog, FragmentOutcome, Message};
