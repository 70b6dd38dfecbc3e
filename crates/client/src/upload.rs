use std::fmt;
use std::sync::Arc;

use chatwire_api::{
    ApiError, ChatBackend, ConversationId, MessageFile, TaskId, TaskState, UploadFile,
};
use futures::future::join_all;
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;

use crate::error::{
    MissingFileIdSnafu, StatusCheckSnafu, UploadCancelledSnafu, UploadError, UploadRejectedSnafu,
    UploadResult, UploadSnafu, UploadTimedOutSnafu,
};
use crate::poll::{PollPolicy, PollStop, poll_until};

/// Local handle for an attachment in the composer, assigned before any network call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttachmentId(pub u64);

impl fmt::Display for AttachmentId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentState {
    Uploading,
    Uploaded(MessageFile),
    /// The upload failed. `timed_out` is set when the server never finished processing the
    /// file, as opposed to refusing or rejecting it.
    UploadError { reason: String, timed_out: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub id: AttachmentId,
    pub name: String,
    pub mime: String,
    pub state: AttachmentState,
}

/// Why the composer may not submit yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentGate {
    Pending { pending: usize },
    Failed { failed: Vec<String> },
}

struct Entry {
    attachment: Attachment,
    source: UploadFile,
}

/// Attachments of the message being composed, in selection order.
#[derive(Default)]
pub struct AttachmentSet {
    entries: Vec<Entry>,
    next_id: u64,
}

impl AttachmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a file in the `Uploading` state.
    pub fn add(&mut self, source: UploadFile) -> Attachment {
        self.next_id += 1;
        let attachment = Attachment {
            id: AttachmentId(self.next_id),
            name: source.name.clone(),
            mime: source.mime.clone(),
            state: AttachmentState::Uploading,
        };
        self.entries.push(Entry {
            attachment: attachment.clone(),
            source,
        });
        attachment
    }

    pub fn set_state(&mut self, id: AttachmentId, state: AttachmentState) -> Option<Attachment> {
        let entry = self.entries.iter_mut().find(|entry| entry.attachment.id == id)?;
        entry.attachment.state = state;
        Some(entry.attachment.clone())
    }

    pub fn remove(&mut self, id: AttachmentId) -> Option<Attachment> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.attachment.id == id)?;
        Some(self.entries.remove(index).attachment)
    }

    /// File contents kept for retries.
    pub fn source(&self, id: AttachmentId) -> Option<&UploadFile> {
        self.entries
            .iter()
            .find(|entry| entry.attachment.id == id)
            .map(|entry| &entry.source)
    }

    pub fn get(&self, id: AttachmentId) -> Option<&Attachment> {
        self.iter().find(|attachment| attachment.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attachment> {
        self.entries.iter().map(|entry| &entry.attachment)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Uploaded files for the next submission.
    ///
    /// Failed uploads block before pending ones: the user has to act on them either way.
    pub fn ready_files(&self) -> Result<Vec<MessageFile>, AttachmentGate> {
        let failed = self
            .iter()
            .filter(|attachment| matches!(attachment.state, AttachmentState::UploadError { .. }))
            .map(|attachment| attachment.name.clone())
            .collect::<Vec<_>>();
        if !failed.is_empty() {
            return Err(AttachmentGate::Failed { failed });
        }

        let pending = self
            .iter()
            .filter(|attachment| attachment.state == AttachmentState::Uploading)
            .count();
        if pending > 0 {
            return Err(AttachmentGate::Pending { pending });
        }

        Ok(self
            .iter()
            .filter_map(|attachment| match &attachment.state {
                AttachmentState::Uploaded(file) => Some(file.clone()),
                _ => None,
            })
            .collect())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Uploads files and waits for the server to accept them.
#[derive(Clone)]
pub struct UploadPipeline {
    backend: Arc<dyn ChatBackend>,
    policy: PollPolicy,
}

impl UploadPipeline {
    pub fn new(backend: Arc<dyn ChatBackend>, policy: PollPolicy) -> Self {
        Self { backend, policy }
    }

    /// Sends the file and returns the server task that processes it.
    pub async fn upload(
        &self,
        conversation_id: ConversationId,
        file: UploadFile,
    ) -> UploadResult<TaskId> {
        let name = file.name.clone();
        self.backend
            .upload_file(conversation_id, file)
            .await
            .context(UploadSnafu {
                stage: "upload-file",
                name,
            })
    }

    /// Polls the upload task until the server assigns a file id.
    pub async fn poll_upload_status(
        &self,
        task_id: &TaskId,
        liveness: &CancellationToken,
    ) -> UploadResult<u64> {
        let outcome = poll_until(
            self.policy,
            liveness,
            move |_| async move {
                let status = self.backend.upload_status(task_id).await?;
                Ok::<_, ApiError>(match status.state {
                    TaskState::Pending => None,
                    TaskState::Success => Some(status.file_id.ok_or_else(|| {
                        MissingFileIdSnafu {
                            stage: "read-upload-result",
                            task_id: task_id.clone(),
                        }
                        .build()
                    })),
                    TaskState::Failure => Some(Err(UploadRejectedSnafu {
                        stage: "read-upload-result",
                        task_id: task_id.clone(),
                        reason: status
                            .error
                            .unwrap_or_else(|| "upload failed".to_string()),
                    }
                    .build())),
                })
            },
            |error, consecutive_failures| {
                tracing::warn!(
                    task_id = %task_id,
                    error = %error,
                    consecutive_failures,
                    "upload status check failed"
                );
            },
        )
        .await;

        match outcome {
            Ok(resolved) => resolved,
            Err(PollStop::Exhausted { attempts }) => UploadTimedOutSnafu {
                stage: "poll-upload-status",
                task_id: task_id.clone(),
                attempts,
            }
            .fail(),
            Err(PollStop::Failed { source, .. }) => Err(source).context(StatusCheckSnafu {
                stage: "poll-upload-status",
                task_id: task_id.clone(),
            }),
            Err(PollStop::Cancelled) => UploadCancelledSnafu {
                stage: "poll-upload-status",
            }
            .fail(),
        }
    }

    /// Uploads one file and waits until it can be referenced by a message.
    pub async fn upload_and_resolve(
        &self,
        conversation_id: ConversationId,
        file: UploadFile,
        liveness: &CancellationToken,
    ) -> UploadResult<MessageFile> {
        let name = file.name.clone();
        let mime = file.mime.clone();
        let task_id = self.upload(conversation_id, file).await?;
        tracing::debug!(conversation_id = %conversation_id, task_id = %task_id, name = %name, "file uploaded; awaiting processing");

        let file_id = self.poll_upload_status(&task_id, liveness).await?;
        tracing::info!(conversation_id = %conversation_id, file_id, name = %name, "attachment ready");
        Ok(MessageFile::new(file_id, name, mime))
    }

    /// Uploads every file concurrently. Results come back in input order and one failure never
    /// affects another file.
    pub async fn upload_all(
        &self,
        conversation_id: ConversationId,
        files: Vec<UploadFile>,
        liveness: &CancellationToken,
    ) -> Vec<UploadResult<MessageFile>> {
        join_all(
            files
                .into_iter()
                .map(|file| self.upload_and_resolve(conversation_id, file, liveness)),
        )
        .await
    }
}

impl From<&UploadError> for AttachmentState {
    fn from(error: &UploadError) -> Self {
        AttachmentState::UploadError {
            reason: error.to_string(),
            timed_out: error.is_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chatwire_api::UploadStatus;
    use tokio::time::Instant;

    use super::*;
    use crate::testing::FakeBackend;

    const CONVERSATION: ConversationId = ConversationId::new(3);

    fn policy() -> PollPolicy {
        PollPolicy::new(Duration::from_secs(1))
            .with_max_attempts(Some(30))
            .with_failure_limit(3)
    }

    fn file(name: &str) -> UploadFile {
        UploadFile::new(name, "application/pdf", b"%PDF".to_vec())
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_upload_times_out_without_affecting_siblings() {
        let backend = FakeBackend::new();
        backend.script_upload(
            "report.pdf",
            [
                UploadStatus::pending(),
                UploadStatus::pending(),
                UploadStatus::succeeded(555),
            ],
        );
        backend.script_upload("stuck.pdf", [UploadStatus::pending()]);
        let pipeline = UploadPipeline::new(backend.clone(), policy());
        let liveness = CancellationToken::new();
        let started = Instant::now();

        let results = pipeline
            .upload_all(
                CONVERSATION,
                vec![file("report.pdf"), file("stuck.pdf")],
                &liveness,
            )
            .await;

        let report = results[0].as_ref().expect("first file uploads");
        assert_eq!(report, &MessageFile::new(555, "report.pdf", "application/pdf"));
        let stuck = results[1].as_ref().unwrap_err();
        assert!(stuck.is_timeout());
        assert!(matches!(stuck, UploadError::UploadTimedOut { attempts: 30, .. }));
        assert!(matches!(
            AttachmentState::from(stuck),
            AttachmentState::UploadError { timed_out: true, .. }
        ));

        assert_eq!(backend.upload_status_calls("report.pdf"), 3);
        assert_eq!(backend.upload_status_calls("stuck.pdf"), 30);
        assert_eq!(started.elapsed(), Duration::from_secs(29));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_status_is_a_rejection_not_a_timeout() {
        let backend = FakeBackend::new();
        backend.script_upload("bad.exe", [UploadStatus::failed("unsupported file type")]);
        let pipeline = UploadPipeline::new(backend.clone(), policy());

        let error = pipeline
            .upload_and_resolve(CONVERSATION, file("bad.exe"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            AttachmentState::from(&error),
            AttachmentState::UploadError { timed_out: false, .. }
        ));
        match error {
            UploadError::UploadRejected { reason, .. } => {
                assert_eq!(reason, "unsupported file type")
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(backend.upload_status_calls("bad.exe"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_upload_never_polls() {
        let backend = FakeBackend::new();
        backend.reject_upload("huge.bin");
        let pipeline = UploadPipeline::new(backend.clone(), policy());

        let error = pipeline
            .upload_and_resolve(CONVERSATION, file("huge.bin"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, UploadError::Upload { .. }));
        assert_eq!(backend.upload_status_calls("huge.bin"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_without_file_id_is_reported() {
        let backend = FakeBackend::new();
        backend.script_upload(
            "odd.txt",
            [UploadStatus {
                state: TaskState::Success,
                file_id: None,
                error: None,
            }],
        );
        let pipeline = UploadPipeline::new(backend, policy());

        let error = pipeline
            .upload_and_resolve(CONVERSATION, file("odd.txt"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, UploadError::MissingFileId { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_liveness_abandons_the_poll() {
        let backend = FakeBackend::new();
        let pipeline = UploadPipeline::new(backend, policy());
        let liveness = CancellationToken::new();
        liveness.cancel();

        let error = pipeline
            .upload_and_resolve(CONVERSATION, file("a.pdf"), &liveness)
            .await
            .unwrap_err();
        assert!(matches!(error, UploadError::UploadCancelled { .. }));
    }

    #[test]
    fn gate_blocks_on_failures_before_pending_uploads() {
        let mut set = AttachmentSet::new();
        let done = set.add(file("done.pdf")).id;
        let failed = set.add(file("failed.pdf")).id;
        let pending = set.add(file("pending.pdf")).id;

        set.set_state(
            done,
            AttachmentState::Uploaded(MessageFile::new(1, "done.pdf", "application/pdf")),
        );
        set.set_state(
            failed,
            AttachmentState::UploadError {
                reason: "timed out".to_string(),
                timed_out: true,
            },
        );

        assert_eq!(
            set.ready_files(),
            Err(AttachmentGate::Failed {
                failed: vec!["failed.pdf".to_string()]
            })
        );

        set.remove(failed);
        assert_eq!(set.ready_files(), Err(AttachmentGate::Pending { pending: 1 }));

        set.set_state(
            pending,
            AttachmentState::Uploaded(MessageFile::new(2, "pending.pdf", "application/pdf")),
        );
        let files = set.ready_files().expect("all uploads finished");
        assert_eq!(files.iter().map(|file| file.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn sources_are_kept_for_retries() {
        let mut set = AttachmentSet::new();
        let id = set.add(file("retry.pdf")).id;
        assert_eq!(set.source(id).map(|source| source.name.as_str()), Some("retry.pdf"));
        assert_eq!(set.get(id).map(|attachment| &attachment.state), Some(&AttachmentState::Uploading));

        set.clear();
        assert!(set.is_empty());
        assert!(set.source(id).is_none());
    }
}
