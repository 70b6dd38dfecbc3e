use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chatwire_api::{ChannelConnector, ChannelEvent, ChannelFrame, ChannelStream, ConversationId};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Connection state of one conversation's streaming channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Closed,
    Connecting,
    Open,
    /// Failed once; never retried for the lifetime of this manager.
    Degraded,
}

/// What the manager reports to its owner, in connection order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSignal {
    Event(ChannelEvent),
    /// Transport error or unclean closure. The manager is now degraded.
    Lost { reason: String },
    /// The server closed the channel normally.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Ready,
    /// This attempt failed and moved the channel to `Degraded`.
    Degraded { reason: String },
    /// The channel cannot be used and no attempt was made.
    Unavailable { reason: String },
}

struct ChannelUpdate {
    generation: u64,
    signal: ChannelSignal,
}

/// Owns the duplex channel for a single conversation.
///
/// A reader task forwards frames in order; every state change happens on the owner's side when
/// it receives them, so the state is only ever mutated here.
pub struct ChannelManager {
    connector: Arc<dyn ChannelConnector>,
    connect_timeout: Duration,
    bound_to: Option<ConversationId>,
    state: ChannelState,
    generation: u64,
    reader: Option<JoinHandle<()>>,
    update_tx: mpsc::UnboundedSender<ChannelUpdate>,
    update_rx: mpsc::UnboundedReceiver<ChannelUpdate>,
    dropped_events: Arc<AtomicU64>,
    shut_down: bool,
}

impl ChannelManager {
    pub fn new(connector: Arc<dyn ChannelConnector>, connect_timeout: Duration) -> Self {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        Self {
            connector,
            connect_timeout,
            bound_to: None,
            state: ChannelState::Closed,
            generation: 0,
            reader: None,
            update_tx,
            update_rx,
            dropped_events: Arc::new(AtomicU64::new(0)),
            shut_down: false,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_degraded(&self) -> bool {
        self.state == ChannelState::Degraded
    }

    /// Frames that were malformed or carried an unknown event kind.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Opens the channel if needed, reusing an open one.
    pub async fn ensure_open(&mut self, conversation_id: ConversationId) -> OpenOutcome {
        if self.shut_down {
            return OpenOutcome::Unavailable {
                reason: "channel was closed by its owner".to_string(),
            };
        }

        if let Some(bound_to) = self.bound_to
            && bound_to != conversation_id
        {
            tracing::warn!(
                bound_to = %bound_to,
                requested = %conversation_id,
                "refusing to reuse a stream channel across conversations"
            );
            return OpenOutcome::Unavailable {
                reason: format!("channel belongs to conversation {bound_to}"),
            };
        }

        match self.state {
            ChannelState::Open => return OpenOutcome::Ready,
            ChannelState::Degraded => {
                return OpenOutcome::Unavailable {
                    reason: "channel degraded earlier in this session".to_string(),
                };
            }
            ChannelState::Closed | ChannelState::Connecting => {}
        }

        self.bound_to = Some(conversation_id);
        self.state = ChannelState::Connecting;
        tracing::debug!(conversation_id = %conversation_id, "opening stream channel");

        let attempt =
            tokio::time::timeout(self.connect_timeout, self.connector.connect(conversation_id))
                .await;

        match attempt {
            Ok(Ok(frames)) => {
                self.start_reader(conversation_id, frames);
                self.state = ChannelState::Open;
                tracing::info!(conversation_id = %conversation_id, "stream channel open");
                OpenOutcome::Ready
            }
            Ok(Err(error)) => self.degrade(conversation_id, format!("connect failed: {error}")),
            Err(_) => self.degrade(
                conversation_id,
                format!(
                    "connect timed out after {} ms",
                    self.connect_timeout.as_millis()
                ),
            ),
        }
    }

    /// Waits for the next signal from the current connection.
    ///
    /// Pends forever while no connection is active; callers race it against their own timers.
    pub async fn recv(&mut self) -> ChannelSignal {
        loop {
            let Some(update) = self.update_rx.recv().await else {
                return std::future::pending().await;
            };
            if update.generation != self.generation {
                continue;
            }
            return self.observe(update.signal);
        }
    }

    /// Returns an already queued signal without waiting.
    pub fn try_recv(&mut self) -> Option<ChannelSignal> {
        while let Ok(update) = self.update_rx.try_recv() {
            if update.generation == self.generation {
                return Some(self.observe(update.signal));
            }
        }
        None
    }

    /// Tears the channel down. Safe to call more than once; later opens are refused.
    pub fn close(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.generation = self.generation.wrapping_add(1);

        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if self.state != ChannelState::Degraded {
            self.state = ChannelState::Closed;
        }

        tracing::debug!(
            conversation_id = ?self.bound_to,
            dropped_events = self.dropped_events(),
            "stream channel closed by owner"
        );
    }

    /// Drops the current connection after its stream went quiet and degrades the channel.
    ///
    /// Frames already queued from that connection are discarded, so a late tail of an
    /// abandoned reply can never reach a later submission.
    pub fn abandon_stream(&mut self, reason: &str) {
        if self.state != ChannelState::Open {
            return;
        }
        self.generation = self.generation.wrapping_add(1);
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        tracing::warn!(
            conversation_id = ?self.bound_to,
            reason = %reason,
            "stream channel abandoned; replies will be polled"
        );
        self.state = ChannelState::Degraded;
    }

    fn degrade(&mut self, conversation_id: ConversationId, reason: String) -> OpenOutcome {
        tracing::warn!(
            conversation_id = %conversation_id,
            reason = %reason,
            "stream channel degraded; replies will be polled"
        );
        self.state = ChannelState::Degraded;
        OpenOutcome::Degraded { reason }
    }

    fn observe(&mut self, signal: ChannelSignal) -> ChannelSignal {
        match &signal {
            ChannelSignal::Event(_) => {}
            ChannelSignal::Lost { reason } => {
                tracing::warn!(
                    conversation_id = ?self.bound_to,
                    reason = %reason,
                    "stream channel lost; replies will be polled"
                );
                self.reader = None;
                self.state = ChannelState::Degraded;
            }
            ChannelSignal::Closed => {
                tracing::info!(conversation_id = ?self.bound_to, "stream channel closed by server");
                self.reader = None;
                if self.state == ChannelState::Open {
                    self.state = ChannelState::Closed;
                }
            }
        }
        signal
    }

    fn start_reader(&mut self, conversation_id: ConversationId, frames: ChannelStream) {
        if let Some(previous) = self.reader.take() {
            previous.abort();
        }
        self.generation = self.generation.wrapping_add(1);

        self.reader = Some(tokio::spawn(read_frames(
            conversation_id,
            self.generation,
            frames,
            self.update_tx.clone(),
            self.dropped_events.clone(),
        )));
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_frames(
    conversation_id: ConversationId,
    generation: u64,
    mut frames: ChannelStream,
    update_tx: mpsc::UnboundedSender<ChannelUpdate>,
    dropped_events: Arc<AtomicU64>,
) {
    let send = |signal: ChannelSignal| {
        update_tx
            .send(ChannelUpdate { generation, signal })
            .is_ok()
    };

    while let Some(frame) = frames.next().await {
        let signal = match frame {
            ChannelFrame::Text(text) => match ChannelEvent::parse(&text) {
                Ok(ChannelEvent::Unknown { kind }) => {
                    dropped_events.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(conversation_id = %conversation_id, kind = %kind, "ignoring unknown channel event");
                    continue;
                }
                Ok(event) => ChannelSignal::Event(event),
                Err(error) => {
                    dropped_events.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(conversation_id = %conversation_id, error = %error, "dropping malformed channel frame");
                    continue;
                }
            },
            ChannelFrame::Closed { clean: true, .. } => {
                send(ChannelSignal::Closed);
                return;
            }
            ChannelFrame::Closed {
                clean: false,
                code,
                reason,
            } => {
                send(ChannelSignal::Lost {
                    reason: format!("unclean close (code {code:?}): {reason}"),
                });
                return;
            }
            ChannelFrame::TransportError(error) => {
                send(ChannelSignal::Lost {
                    reason: format!("transport error: {error}"),
                });
                return;
            }
        };

        if !send(signal) {
            return;
        }
    }

    send(ChannelSignal::Lost {
        reason: "frame stream ended without a close frame".to_string(),
    });
}
