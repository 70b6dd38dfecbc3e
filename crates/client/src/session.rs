use std::sync::Arc;
use std::time::Duration;

use chatwire_api::{
    ChannelConnector, ChannelEvent, ChatBackend, ConversationId, RemoteMessage, SubmitRequest,
    TaskHandle, UploadFile,
};
use snafu::{IntoError, OptionExt, ResultExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelManager, ChannelSignal, ChannelState, OpenOutcome};
use crate::chat::{
    ConversationLog, DeliveryPath, DeliveryPhase, DeliveryState, DeliveryTransition,
    FragmentOutcome, Message, SessionUpdate, SessionUpdates, events::make_update_stream,
};
use crate::error::{
    AttachmentsFailedSnafu, AttachmentsPendingSnafu, BusySnafu, CancelledSnafu,
    CreateConversationSnafu, DispatchSnafu, EmptySubmissionSnafu, LoadHistorySnafu,
    NoConversationSnafu, PollExhaustedSnafu, PollSnafu, SessionResult,
};
use crate::poll::{PollPolicy, PollStop, poll_until};
use crate::resolver::PollResolver;
use crate::upload::{
    Attachment, AttachmentGate, AttachmentId, AttachmentSet, AttachmentState, UploadPipeline,
};

/// Timing and routing knobs for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Ask the server to stream replies when the channel is usable.
    pub prefer_streaming: bool,
    pub data_set_id: Option<u64>,
    pub connect_timeout: Duration,
    /// Longest silence tolerated on an active stream before switching to polling.
    pub stream_stall_timeout: Duration,
    pub message_poll: PollPolicy,
    pub upload_poll: PollPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prefer_streaming: true,
            data_set_id: None,
            connect_timeout: Duration::from_secs(5),
            stream_stall_timeout: Duration::from_secs(60),
            message_poll: PollPolicy::new(Duration::from_secs(2))
                .with_max_attempts(Some(450))
                .with_failure_limit(3),
            upload_poll: PollPolicy::new(Duration::from_secs(1))
                .with_max_attempts(Some(30))
                .with_failure_limit(3),
        }
    }
}

enum EventEffect {
    Continue,
    ReplyFinished,
}

/// Orchestrates one conversation: dispatch, reply routing, the message log and attachments.
///
/// All state lives behind `&mut self`; the only background work is the channel reader, which
/// never touches the log.
pub struct ChatSession {
    backend: Arc<dyn ChatBackend>,
    resolver: PollResolver,
    uploads: UploadPipeline,
    channel: ChannelManager,
    config: SessionConfig,
    conversation_id: Option<ConversationId>,
    log: ConversationLog,
    delivery: DeliveryState,
    attachments: AttachmentSet,
    loading: bool,
    composing: bool,
    last_action: Option<String>,
    liveness: CancellationToken,
    update_tx: mpsc::UnboundedSender<SessionUpdate>,
    shut_down: bool,
}

impl ChatSession {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        connector: Arc<dyn ChannelConnector>,
        config: SessionConfig,
        conversation_id: Option<ConversationId>,
    ) -> (Self, SessionUpdates) {
        let (update_tx, updates) = make_update_stream();
        let session = Self {
            resolver: PollResolver::new(backend.clone()),
            uploads: UploadPipeline::new(backend.clone(), config.upload_poll),
            channel: ChannelManager::new(connector, config.connect_timeout),
            backend,
            config,
            conversation_id,
            log: ConversationLog::new(),
            delivery: DeliveryState::Idle,
            attachments: AttachmentSet::new(),
            loading: false,
            composing: false,
            last_action: None,
            liveness: CancellationToken::new(),
            update_tx,
            shut_down: false,
        };
        (session, updates)
    }

    pub fn messages(&self) -> &[Message] {
        self.log.messages()
    }

    pub fn log(&self) -> &ConversationLog {
        &self.log
    }

    pub fn delivery(&self) -> &DeliveryState {
        &self.delivery
    }

    /// Coarse view of the active submission.
    pub fn phase(&self) -> DeliveryPhase {
        self.delivery.phase()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn is_composing(&self) -> bool {
        self.composing
    }

    pub fn last_action(&self) -> Option<&str> {
        self.last_action.as_deref()
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn dropped_channel_events(&self) -> u64 {
        self.channel.dropped_events()
    }

    pub fn attachments(&self) -> &AttachmentSet {
        &self.attachments
    }

    /// Token that stops every wait of this session when cancelled.
    pub fn liveness(&self) -> CancellationToken {
        self.liveness.clone()
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.conversation_id
    }

    /// Creates the server-side conversation on first use.
    pub async fn ensure_conversation(&mut self) -> SessionResult<ConversationId> {
        if let Some(conversation_id) = self.conversation_id {
            return Ok(conversation_id);
        }

        let conversation_id = self
            .backend
            .create_conversation()
            .await
            .context(CreateConversationSnafu {
                stage: "create-conversation",
            })?;
        tracing::info!(conversation_id = %conversation_id, "conversation created");
        self.conversation_id = Some(conversation_id);
        Ok(conversation_id)
    }

    /// Replaces the log with the server history of the bound conversation.
    pub async fn load_history(&mut self) -> SessionResult<usize> {
        self.ensure_usable()?;
        snafu::ensure!(
            self.delivery.is_idle(),
            BusySnafu {
                stage: "load-history",
                phase: self.delivery.phase(),
            }
        );
        let conversation_id = self.conversation_id.context(NoConversationSnafu {
            stage: "load-history",
        })?;

        let record = self
            .backend
            .conversation(conversation_id)
            .await
            .context(LoadHistorySnafu {
                stage: "load-history",
                conversation_id,
            })?;

        self.log.reset_from_history(record.history);
        tracing::info!(conversation_id = %conversation_id, messages = self.log.len(), "history loaded");
        self.emit(SessionUpdate::HistoryLoaded(self.log.messages().to_vec()));
        Ok(self.log.len())
    }

    /// Uploads files concurrently and records each outcome on its own attachment.
    pub async fn attach_files(&mut self, files: Vec<UploadFile>) -> SessionResult<Vec<AttachmentId>> {
        self.ensure_usable()?;
        let conversation_id = self.ensure_conversation().await?;

        let mut ids = Vec::with_capacity(files.len());
        for file in &files {
            let attachment = self.attachments.add(file.clone());
            ids.push(attachment.id);
            self.emit(SessionUpdate::AttachmentChanged(attachment));
        }

        let results = self
            .uploads
            .upload_all(conversation_id, files, &self.liveness)
            .await;

        for (id, result) in ids.iter().copied().zip(results) {
            let state = match result {
                Ok(file) => AttachmentState::Uploaded(file),
                Err(error) => {
                    tracing::warn!(attachment = %id, error = %error, "attachment upload failed");
                    AttachmentState::from(&error)
                }
            };
            self.record_attachment_state(id, state);
        }

        Ok(ids)
    }

    /// Uploads a failed attachment again. Returns `None` for an unknown id.
    pub async fn retry_attachment(&mut self, id: AttachmentId) -> SessionResult<Option<Attachment>> {
        self.ensure_usable()?;
        let Some(source) = self.attachments.source(id).cloned() else {
            return Ok(None);
        };
        let conversation_id = self.ensure_conversation().await?;
        self.record_attachment_state(id, AttachmentState::Uploading);

        let state = match self
            .uploads
            .upload_and_resolve(conversation_id, source, &self.liveness)
            .await
        {
            Ok(file) => AttachmentState::Uploaded(file),
            Err(error) => {
                tracing::warn!(attachment = %id, error = %error, "attachment retry failed");
                AttachmentState::from(&error)
            }
        };
        Ok(self.record_attachment_state(id, state))
    }

    pub fn remove_attachment(&mut self, id: AttachmentId) -> Option<Attachment> {
        let removed = self.attachments.remove(id)?;
        self.emit(SessionUpdate::AttachmentRemoved(id));
        Some(removed)
    }

    /// Sends one user message and waits until its reply is in the log.
    ///
    /// The human message is echoed before dispatch and stays even when delivery fails.
    pub async fn submit(&mut self, text: &str) -> SessionResult<()> {
        self.ensure_usable()?;
        snafu::ensure!(
            self.delivery.is_idle(),
            BusySnafu {
                stage: "submit",
                phase: self.delivery.phase(),
            }
        );

        let files = match self.attachments.ready_files() {
            Ok(files) => files,
            Err(AttachmentGate::Failed { failed }) => {
                return AttachmentsFailedSnafu {
                    stage: "submit",
                    failed,
                }
                .fail();
            }
            Err(AttachmentGate::Pending { pending }) => {
                return AttachmentsPendingSnafu {
                    stage: "submit",
                    pending,
                }
                .fail();
            }
        };
        snafu::ensure!(
            !text.trim().is_empty() || !files.is_empty(),
            EmptySubmissionSnafu { stage: "submit" }
        );

        self.pump_channel();
        self.transition(DeliveryTransition::Dispatch);
        let conversation_id = match self.ensure_conversation().await {
            Ok(conversation_id) => conversation_id,
            Err(error) => {
                self.finish_submission(Some(&error.to_string()));
                return Err(error);
            }
        };

        let file_ids = files.iter().map(|file| file.id).collect::<Vec<_>>();
        let echo = Message::human(text, files);
        self.log.push(echo.clone());
        self.emit(SessionUpdate::MessageAppended(echo));
        self.clear_attachments();
        self.set_loading(true);

        let want_streaming = self.config.prefer_streaming && !self.channel.is_degraded();
        let request = SubmitRequest::new(conversation_id, text)
            .with_data_set(self.config.data_set_id)
            .with_streaming(want_streaming)
            .with_file_ids(file_ids);

        let handle = match self.backend.submit_message(request).await {
            Ok(handle) => handle,
            Err(source) => {
                tracing::error!(conversation_id = %conversation_id, error = %source, "message dispatch failed");
                let error = DispatchSnafu {
                    stage: "submit-message",
                    conversation_id,
                }
                .into_error(source);
                self.finish_submission(Some(&error.to_string()));
                return Err(error);
            }
        };

        tracing::debug!(
            conversation_id = %conversation_id,
            task_id = %handle.task_id,
            streaming = handle.streaming,
            "message dispatched"
        );

        let outcome = self.deliver(conversation_id, &handle).await;
        self.finish_submission(outcome.as_ref().err().map(ToString::to_string).as_deref());
        outcome
    }

    /// Drains channel events that arrived while no reply was being streamed.
    ///
    /// Only status actions are applied. Fragments, ids and errors belong to a reply nobody is
    /// waiting for and are discarded, so the log is only written by an active submission.
    pub fn pump_channel(&mut self) -> usize {
        let mut applied = 0;
        while let Some(signal) = self.channel.try_recv() {
            match signal {
                ChannelSignal::Event(ChannelEvent::Action(action)) => {
                    self.record_action(action);
                    applied += 1;
                }
                ChannelSignal::Event(event) => {
                    tracing::debug!(event = ?event, "discarding channel event outside a streamed reply");
                }
                ChannelSignal::Lost { reason } => {
                    self.emit(SessionUpdate::ChannelDegraded { reason });
                }
                ChannelSignal::Closed => {}
            }
        }
        applied
    }

    /// Gives up on a submission whose future was dropped before it finished.
    ///
    /// Work already running on the server is not cancelled. Returns `false` when idle.
    pub fn abandon_submission(&mut self) -> bool {
        if self.delivery.is_idle() {
            return false;
        }
        tracing::warn!(phase = %self.delivery.phase(), "abandoning in-flight submission");
        self.log.seal_open_message();
        self.finish_submission(None);
        true
    }

    /// Stops all waits and closes the channel. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.liveness.cancel();
        self.channel.close();
        tracing::info!(conversation_id = ?self.conversation_id, "chat session shut down");
    }

    fn ensure_usable(&self) -> SessionResult<()> {
        snafu::ensure!(
            !self.shut_down && !self.liveness.is_cancelled(),
            CancelledSnafu { stage: "ensure-usable" }
        );
        Ok(())
    }

    async fn deliver(
        &mut self,
        conversation_id: ConversationId,
        handle: &TaskHandle,
    ) -> SessionResult<()> {
        if handle.streaming && !self.channel.is_degraded() {
            match self.channel.ensure_open(conversation_id).await {
                OpenOutcome::Ready => {
                    self.transition(DeliveryTransition::Stream(handle.task_id.clone()));
                    self.emit(SessionUpdate::DeliveryPath(DeliveryPath::Streaming));
                    return self.await_streamed_reply(conversation_id, handle).await;
                }
                OpenOutcome::Degraded { reason } => {
                    self.emit(SessionUpdate::ChannelDegraded { reason });
                }
                OpenOutcome::Unavailable { reason } => {
                    tracing::debug!(task_id = %handle.task_id, reason = %reason, "stream channel unavailable");
                }
            }
        }

        self.transition(DeliveryTransition::Poll(handle.task_id.clone()));
        self.emit(SessionUpdate::DeliveryPath(DeliveryPath::Polling));
        self.await_polled_reply(conversation_id, handle).await
    }

    async fn await_streamed_reply(
        &mut self,
        conversation_id: ConversationId,
        handle: &TaskHandle,
    ) -> SessionResult<()> {
        let liveness = self.liveness.clone();
        let stall_timeout = self.config.stream_stall_timeout;

        loop {
            let signal = tokio::select! {
                _ = liveness.cancelled() => {
                    return CancelledSnafu { stage: "await-stream" }.fail();
                }
                signal = tokio::time::timeout(stall_timeout, self.channel.recv()) => signal,
            };

            match signal {
                Ok(ChannelSignal::Event(event)) => {
                    if let EventEffect::ReplyFinished = self.apply_channel_event(event) {
                        return Ok(());
                    }
                }
                Ok(ChannelSignal::Lost { reason }) => {
                    self.emit(SessionUpdate::ChannelDegraded {
                        reason: reason.clone(),
                    });
                    return self
                        .fall_back_to_polling(conversation_id, handle, &reason)
                        .await;
                }
                Ok(ChannelSignal::Closed) => {
                    return self
                        .fall_back_to_polling(
                            conversation_id,
                            handle,
                            "channel closed before the reply finished",
                        )
                        .await;
                }
                Err(_) => {
                    let reason = format!(
                        "no channel event within {} ms",
                        stall_timeout.as_millis()
                    );
                    self.channel.abandon_stream(&reason);
                    self.emit(SessionUpdate::ChannelDegraded {
                        reason: reason.clone(),
                    });
                    return self
                        .fall_back_to_polling(conversation_id, handle, &reason)
                        .await;
                }
            }
        }
    }

    async fn fall_back_to_polling(
        &mut self,
        conversation_id: ConversationId,
        handle: &TaskHandle,
        reason: &str,
    ) -> SessionResult<()> {
        tracing::warn!(
            conversation_id = %conversation_id,
            task_id = %handle.task_id,
            reason = %reason,
            "stream interrupted; polling for the reply"
        );
        self.set_composing(false);
        self.transition(DeliveryTransition::Poll(handle.task_id.clone()));
        self.emit(SessionUpdate::DeliveryPath(DeliveryPath::Polling));
        self.await_polled_reply(conversation_id, handle).await
    }

    async fn await_polled_reply(
        &mut self,
        conversation_id: ConversationId,
        handle: &TaskHandle,
    ) -> SessionResult<()> {
        let resolver = &self.resolver;
        let update_tx = &self.update_tx;
        let outcome = poll_until(
            self.config.message_poll,
            &self.liveness,
            move |_| resolver.resolve(conversation_id, handle),
            |error, consecutive_failures| {
                tracing::warn!(
                    task_id = %handle.task_id,
                    error = %error,
                    consecutive_failures,
                    "reply poll failed"
                );
                let _ = update_tx.send(SessionUpdate::PollFailed {
                    error: error.to_string(),
                    consecutive_failures,
                });
            },
        )
        .await;

        match outcome {
            Ok(reply) => {
                self.accept_resolved(reply);
                Ok(())
            }
            Err(PollStop::Exhausted { attempts }) => PollExhaustedSnafu {
                stage: "poll-reply",
                task_id: handle.task_id.clone(),
                attempts,
            }
            .fail(),
            Err(PollStop::Failed { source, .. }) => Err(source).context(PollSnafu {
                stage: "poll-reply",
                task_id: handle.task_id.clone(),
            }),
            Err(PollStop::Cancelled) => CancelledSnafu { stage: "poll-reply" }.fail(),
        }
    }

    /// Stores a polled reply. A partially streamed message for the same task is replaced so the
    /// log holds exactly one AI message for the submission.
    fn accept_resolved(&mut self, reply: RemoteMessage) {
        let message = Message::from_remote(reply);
        let previous = self.log.discard_open_message();
        self.log.push(message.clone());

        match previous {
            Some(previous) => self.emit(SessionUpdate::MessageReplaced {
                previous: previous.client_id,
                message,
            }),
            None => self.emit(SessionUpdate::MessageAppended(message)),
        }
    }

    fn apply_channel_event(&mut self, event: ChannelEvent) -> EventEffect {
        match event {
            ChannelEvent::ParserStart => {
                self.set_composing(true);
                EventEffect::Continue
            }
            ChannelEvent::ParserStream(fragment) => {
                let outcome = self.log.append_fragment(&fragment);
                if let Some(message) = self.log.get(outcome.message_id()).cloned() {
                    self.emit(match outcome {
                        FragmentOutcome::Opened(_) => SessionUpdate::MessageAppended(message),
                        FragmentOutcome::Appended(_) => SessionUpdate::MessageUpdated(message),
                    });
                }
                EventEffect::Continue
            }
            ChannelEvent::MessageId(server_id) => {
                let Some(client_id) = self.log.close_open_message(server_id) else {
                    tracing::warn!(server_id, "message id arrived without an open message");
                    return EventEffect::Continue;
                };
                if let Some(message) = self.log.get(client_id).cloned() {
                    self.emit(SessionUpdate::MessageUpdated(message));
                }
                self.set_composing(false);
                EventEffect::ReplyFinished
            }
            ChannelEvent::Action(action) => {
                self.record_action(action);
                EventEffect::Continue
            }
            ChannelEvent::Error(error) => {
                tracing::warn!(conversation_id = ?self.conversation_id, error = %error, "agent reported an error");
                self.log.seal_open_message();
                let notice = Message::system(error);
                self.log.push(notice.clone());
                self.emit(SessionUpdate::MessageAppended(notice));
                self.set_composing(false);
                EventEffect::ReplyFinished
            }
            ChannelEvent::Unknown { kind } => {
                tracing::debug!(kind = %kind, "ignoring unknown channel event");
                EventEffect::Continue
            }
        }
    }

    fn record_action(&mut self, action: String) {
        self.last_action = Some(action.clone());
        self.emit(SessionUpdate::Action(action));
    }

    fn finish_submission(&mut self, error: Option<&str>) {
        if let Some(error) = error {
            self.emit(SessionUpdate::SubmissionFailed {
                error: error.to_string(),
            });
        }
        self.set_composing(false);
        self.set_loading(false);
        if !self.delivery.is_idle() {
            self.transition(DeliveryTransition::Settle);
        }
    }

    fn transition(&mut self, transition: DeliveryTransition) {
        match self.delivery.apply(transition) {
            Ok(next) => self.delivery = next,
            Err(rejection) => {
                tracing::error!(rejection = ?rejection, "illegal delivery transition ignored");
            }
        }
    }

    fn record_attachment_state(
        &mut self,
        id: AttachmentId,
        state: AttachmentState,
    ) -> Option<Attachment> {
        let attachment = self.attachments.set_state(id, state)?;
        self.emit(SessionUpdate::AttachmentChanged(attachment.clone()));
        Some(attachment)
    }

    fn clear_attachments(&mut self) {
        let ids = self.attachments.iter().map(|attachment| attachment.id).collect::<Vec<_>>();
        self.attachments.clear();
        for id in ids {
            self.emit(SessionUpdate::AttachmentRemoved(id));
        }
    }

    fn set_loading(&mut self, loading: bool) {
        if self.loading != loading {
            self.loading = loading;
            self.emit(SessionUpdate::Loading(loading));
        }
    }

    fn set_composing(&mut self, composing: bool) {
        if self.composing != composing {
            self.composing = composing;
            self.emit(SessionUpdate::Composing(composing));
        }
    }

    fn emit(&self, update: SessionUpdate) {
        let _ = self.update_tx.send(update);
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
