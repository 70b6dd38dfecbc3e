use std::fmt;

use chatwire_api::TaskId;

/// Per-submission delivery lifecycle.
///
/// Only one submission may be in flight per session; every non-idle state blocks new input.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeliveryState {
    #[default]
    Idle,
    Sending,
    StreamingActive(TaskId),
    PollingActive(TaskId),
}

/// Coarse view of [`DeliveryState`] without the task id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryPhase {
    Idle,
    Sending,
    Streaming,
    Polling,
}

impl fmt::Display for DeliveryPhase {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Sending => "sending",
            Self::Streaming => "streaming-active",
            Self::Polling => "polling-active",
        };
        formatter.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryTransition {
    /// A new submission is being dispatched.
    Dispatch,
    /// The reply for `TaskId` arrives over the streaming channel.
    Stream(TaskId),
    /// The reply for `TaskId` is resolved by polling. Also used to fall back from streaming.
    Poll(TaskId),
    /// The submission finished, failed, or was abandoned.
    Settle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryRejection {
    Busy { phase: DeliveryPhase },
    NotSending { phase: DeliveryPhase },
    TaskMismatch { active: TaskId, attempted: TaskId },
    NoActiveDelivery,
}

pub type DeliveryTransitionResult = Result<DeliveryState, DeliveryRejection>;

impl DeliveryState {
    pub fn phase(&self) -> DeliveryPhase {
        match self {
            Self::Idle => DeliveryPhase::Idle,
            Self::Sending => DeliveryPhase::Sending,
            Self::StreamingActive(_) => DeliveryPhase::Streaming,
            Self::PollingActive(_) => DeliveryPhase::Polling,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn active_task(&self) -> Option<&TaskId> {
        match self {
            Self::StreamingActive(task_id) | Self::PollingActive(task_id) => Some(task_id),
            Self::Idle | Self::Sending => None,
        }
    }

    /// Applies one transition deterministically.
    pub fn apply(&self, transition: DeliveryTransition) -> DeliveryTransitionResult {
        match transition {
            DeliveryTransition::Dispatch => match self {
                Self::Idle => Ok(Self::Sending),
                _ => Err(DeliveryRejection::Busy {
                    phase: self.phase(),
                }),
            },
            DeliveryTransition::Stream(task_id) => match self {
                Self::Sending => Ok(Self::StreamingActive(task_id)),
                _ => Err(DeliveryRejection::NotSending {
                    phase: self.phase(),
                }),
            },
            DeliveryTransition::Poll(task_id) => self.apply_poll(task_id),
            DeliveryTransition::Settle => match self {
                Self::Idle => Err(DeliveryRejection::NoActiveDelivery),
                _ => Ok(Self::Idle),
            },
        }
    }

    fn apply_poll(&self, task_id: TaskId) -> DeliveryTransitionResult {
        match self {
            Self::Sending => Ok(Self::PollingActive(task_id)),
            Self::StreamingActive(active) | Self::PollingActive(active) if *active == task_id => {
                Ok(Self::PollingActive(task_id))
            }
            Self::StreamingActive(active) | Self::PollingActive(active) => {
                Err(DeliveryRejection::TaskMismatch {
                    active: active.clone(),
                    attempted: task_id,
                })
            }
            Self::Idle => Err(DeliveryRejection::NotSending {
                phase: DeliveryPhase::Idle,
            }),
        }
    }
}
