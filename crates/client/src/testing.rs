//! Scripted in-memory backend and channel connector shared by the unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chatwire_api::{
    ApiError, ApiResult, BoxFuture, ChannelConnector, ChannelFrame, ChannelStream, ChatBackend,
    ConversationId, ConversationRecord, RemoteMessage, SubmitRequest, TaskHandle, TaskId,
    TaskState, UploadFile, UploadStatus,
};
use tokio::sync::mpsc;

pub(crate) fn unavailable(stage: &'static str) -> ApiError {
    ApiError::Status {
        stage,
        url: "http://backend.test/".to_string(),
        status: 503,
        body: "service unavailable".to_string(),
    }
}

#[derive(Debug, Clone)]
pub(crate) enum TaskStep {
    State(TaskState),
    Fail,
}

#[derive(Default)]
struct BackendState {
    next_conversation_id: u64,
    created_conversations: u32,
    submissions: Vec<SubmitRequest>,
    submit_replies: VecDeque<Option<TaskHandle>>,
    task_steps: VecDeque<TaskStep>,
    status_calls: u32,
    history: Vec<RemoteMessage>,
    history_calls: u32,
    rejected_uploads: HashSet<String>,
    upload_scripts: HashMap<String, VecDeque<UploadStatus>>,
    upload_status_calls: HashMap<String, u32>,
}

/// `ChatBackend` driven by queued replies.
///
/// Task status defaults to pending once the queue is empty, and upload scripts repeat their
/// last status forever.
#[derive(Default)]
pub(crate) struct FakeBackend {
    state: Mutex<BackendState>,
}

impl FakeBackend {
    pub(crate) fn new() -> Arc<Self> {
        let backend = Self::default();
        backend.lock().next_conversation_id = 100;
        Arc::new(backend)
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().expect("fake backend lock poisoned")
    }

    pub(crate) fn reply_with(&self, handle: TaskHandle) {
        self.lock().submit_replies.push_back(Some(handle));
    }

    pub(crate) fn fail_next_submit(&self) {
        self.lock().submit_replies.push_back(None);
    }

    pub(crate) fn script_task(&self, steps: impl IntoIterator<Item = TaskStep>) {
        self.lock().task_steps.extend(steps);
    }

    pub(crate) fn set_history(&self, history: Vec<RemoteMessage>) {
        self.lock().history = history;
    }

    pub(crate) fn reject_upload(&self, name: &str) {
        self.lock().rejected_uploads.insert(name.to_string());
    }

    pub(crate) fn script_upload(&self, name: &str, statuses: impl IntoIterator<Item = UploadStatus>) {
        self.lock()
            .upload_scripts
            .insert(name.to_string(), statuses.into_iter().collect());
    }

    pub(crate) fn submissions(&self) -> Vec<SubmitRequest> {
        self.lock().submissions.clone()
    }

    pub(crate) fn created_conversations(&self) -> u32 {
        self.lock().created_conversations
    }

    pub(crate) fn status_calls(&self) -> u32 {
        self.lock().status_calls
    }

    pub(crate) fn history_calls(&self) -> u32 {
        self.lock().history_calls
    }

    pub(crate) fn upload_status_calls(&self, name: &str) -> u32 {
        self.lock()
            .upload_status_calls
            .get(&upload_task_id(name))
            .copied()
            .unwrap_or(0)
    }
}

fn upload_task_id(name: &str) -> String {
    format!("upload-{name}")
}

impl ChatBackend for FakeBackend {
    fn create_conversation<'a>(&'a self) -> BoxFuture<'a, ApiResult<ConversationId>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.created_conversations += 1;
            state.next_conversation_id += 1;
            Ok(ConversationId::new(state.next_conversation_id))
        })
    }

    fn submit_message<'a>(
        &'a self,
        request: SubmitRequest,
    ) -> BoxFuture<'a, ApiResult<TaskHandle>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.submissions.push(request);
            let fallback = TaskHandle::new(format!("task-{}", state.submissions.len()), false);
            match state.submit_replies.pop_front() {
                Some(Some(handle)) => Ok(handle),
                Some(None) => Err(unavailable("submit-message")),
                None => Ok(fallback),
            }
        })
    }

    fn task_status<'a>(&'a self, _task_id: &'a TaskId) -> BoxFuture<'a, ApiResult<TaskState>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.status_calls += 1;
            match state.task_steps.pop_front() {
                Some(TaskStep::State(task_state)) => Ok(task_state),
                Some(TaskStep::Fail) => Err(unavailable("task-status")),
                None => Ok(TaskState::Pending),
            }
        })
    }

    fn conversation<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, ApiResult<ConversationRecord>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.history_calls += 1;
            Ok(ConversationRecord {
                id: conversation_id,
                history: state.history.clone(),
            })
        })
    }

    fn upload_file<'a>(
        &'a self,
        _conversation_id: ConversationId,
        file: UploadFile,
    ) -> BoxFuture<'a, ApiResult<TaskId>> {
        Box::pin(async move {
            if self.lock().rejected_uploads.contains(&file.name) {
                return Err(unavailable("upload-file"));
            }
            Ok(TaskId::new(upload_task_id(&file.name)))
        })
    }

    fn upload_status<'a>(&'a self, task_id: &'a TaskId) -> BoxFuture<'a, ApiResult<UploadStatus>> {
        Box::pin(async move {
            let mut state = self.lock();
            *state
                .upload_status_calls
                .entry(task_id.as_str().to_string())
                .or_default() += 1;

            let name = task_id.as_str().trim_start_matches("upload-").to_string();
            let Some(script) = state.upload_scripts.get_mut(&name) else {
                return Ok(UploadStatus::pending());
            };
            let status = if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            };
            Ok(status.unwrap_or_else(UploadStatus::pending))
        })
    }
}

pub(crate) enum ConnectScript {
    Hang,
    Refuse,
    Open(mpsc::UnboundedReceiver<ChannelFrame>),
}

/// Connector whose outcomes are queued per attempt. Unscripted attempts hang.
#[derive(Default)]
pub(crate) struct FakeConnector {
    scripts: Mutex<VecDeque<ConnectScript>>,
    attempts: Mutex<u32>,
}

impl FakeConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn hang(&self) {
        self.push(ConnectScript::Hang);
    }

    pub(crate) fn refuse(&self) {
        self.push(ConnectScript::Refuse);
    }

    /// Queues a successful connection and returns the feed that drives it.
    pub(crate) fn open(&self) -> FrameFeed {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        self.push(ConnectScript::Open(frame_rx));
        FrameFeed { frame_tx }
    }

    pub(crate) fn attempts(&self) -> u32 {
        *self.attempts.lock().expect("attempt counter lock poisoned")
    }

    fn push(&self, script: ConnectScript) {
        self.scripts
            .lock()
            .expect("connector script lock poisoned")
            .push_back(script);
    }
}

impl ChannelConnector for FakeConnector {
    fn connect<'a>(
        &'a self,
        _conversation_id: ConversationId,
    ) -> BoxFuture<'a, ApiResult<ChannelStream>> {
        Box::pin(async move {
            *self.attempts.lock().expect("attempt counter lock poisoned") += 1;
            let script = self
                .scripts
                .lock()
                .expect("connector script lock poisoned")
                .pop_front()
                .unwrap_or(ConnectScript::Hang);

            match script {
                ConnectScript::Hang => futures::future::pending().await,
                ConnectScript::Refuse => Err(unavailable("open-channel")),
                ConnectScript::Open(frame_rx) => {
                    let frames = futures::stream::unfold(frame_rx, |mut frame_rx| async move {
                        frame_rx.recv().await.map(|frame| (frame, frame_rx))
                    });
                    Ok(Box::pin(frames) as ChannelStream)
                }
            }
        })
    }
}

/// Test-side handle that pushes frames into an open fake channel.
pub(crate) struct FrameFeed {
    frame_tx: mpsc::UnboundedSender<ChannelFrame>,
}

impl FrameFeed {
    pub(crate) fn event(&self, kind: &str, data: serde_json::Value) {
        self.raw(&serde_json::json!({ "event": kind, "data": data }).to_string());
    }

    pub(crate) fn raw(&self, text: &str) {
        let _ = self.frame_tx.send(ChannelFrame::Text(text.to_string()));
    }

    pub(crate) fn close(&self, clean: bool) {
        let frame = if clean {
            ChannelFrame::normal_close()
        } else {
            ChannelFrame::abnormal_close("server went away")
        };
        let _ = self.frame_tx.send(frame);
    }

    pub(crate) fn transport_error(&self, message: &str) {
        let _ = self
            .frame_tx
            .send(ChannelFrame::TransportError(message.to_string()));
    }
}
