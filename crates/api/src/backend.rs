use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use snafu::ResultExt;
use url::Url;

use crate::error::{ApiResult, DecodeSnafu, InvalidUrlSnafu, RequestSnafu, StatusSnafu};
use crate::types::{
    ConversationId, ConversationRecord, CreatedConversationPayload, SubmitRequest, TaskHandle,
    TaskId, TaskState, TaskStatusPayload, UploadFile, UploadStatus, UploadStatusPayload,
    UploadTaskPayload,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// REST surface of the chat backend.
///
/// Every call is a single request/response; none of them retries.
pub trait ChatBackend: Send + Sync {
    /// Creates an empty conversation and returns its id.
    fn create_conversation<'a>(&'a self) -> BoxFuture<'a, ApiResult<ConversationId>>;
    /// Dispatches a user message and returns the handle of the task that answers it.
    fn submit_message<'a>(&'a self, request: SubmitRequest)
    -> BoxFuture<'a, ApiResult<TaskHandle>>;
    /// Reports the state of a message task without waiting for it.
    fn task_status<'a>(&'a self, task_id: &'a TaskId) -> BoxFuture<'a, ApiResult<TaskState>>;
    /// Fetches a conversation with its full message history, oldest first.
    fn conversation<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, ApiResult<ConversationRecord>>;
    /// Sends one file as multipart form data. The returned task tracks its processing.
    fn upload_file<'a>(
        &'a self,
        conversation_id: ConversationId,
        file: UploadFile,
    ) -> BoxFuture<'a, ApiResult<TaskId>>;
    /// Reports the processing state of an upload task, with the file id once it succeeded.
    fn upload_status<'a>(&'a self, task_id: &'a TaskId) -> BoxFuture<'a, ApiResult<UploadStatus>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub request_timeout: Duration,
}

impl BackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim().to_string(),
            api_token: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_api_token(mut self, api_token: Option<String>) -> Self {
        self.api_token = api_token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

/// `ChatBackend` over HTTP/JSON.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: Url,
    api_token: Option<String>,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> ApiResult<Self> {
        let base_url = parse_base_url(&config.base_url)?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context(RequestSnafu {
                stage: "build-http-client",
                url: base_url.as_str(),
            })?;

        Ok(Self {
            client,
            base_url,
            api_token: config.api_token,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> ApiResult<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .context(InvalidUrlSnafu {
                stage: "join-endpoint",
                raw: path,
            })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send_json<T>(
        &self,
        stage: &'static str,
        url: &Url,
        builder: reqwest::RequestBuilder,
    ) -> ApiResult<T>
    where
        T: DeserializeOwned,
    {
        let response = self
            .authorized(builder)
            .send()
            .await
            .context(RequestSnafu {
                stage,
                url: url.as_str(),
            })?;
        let status = response.status();
        let body = response.text().await.context(RequestSnafu {
            stage,
            url: url.as_str(),
        })?;

        if !status.is_success() {
            tracing::debug!(url = %url, status = status.as_u16(), "backend rejected request");
            return StatusSnafu {
                stage,
                url: url.as_str(),
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        serde_json::from_str(&body).context(DecodeSnafu {
            stage,
            url: url.as_str(),
        })
    }

    async fn create_conversation_inner(&self) -> ApiResult<ConversationId> {
        let url = self.endpoint("conversations")?;
        let created: CreatedConversationPayload = self
            .send_json(
                "create-conversation",
                &url,
                self.client.post(url.clone()).json(&serde_json::json!({})),
            )
            .await?;
        Ok(created.id)
    }

    async fn submit_message_inner(&self, request: SubmitRequest) -> ApiResult<TaskHandle> {
        let url = self.endpoint(&format!("conversations/{}", request.conversation_id))?;
        self.send_json(
            "submit-message",
            &url,
            self.client.post(url.clone()).json(&request),
        )
        .await
    }

    async fn task_status_inner(&self, task_id: &TaskId) -> ApiResult<TaskState> {
        let url = self.endpoint(&format!("task_status/{task_id}"))?;
        let payload: TaskStatusPayload = self
            .send_json("task-status", &url, self.client.get(url.clone()))
            .await?;
        Ok(TaskState::from_wire(&payload.state))
    }

    async fn conversation_inner(
        &self,
        conversation_id: ConversationId,
    ) -> ApiResult<ConversationRecord> {
        let url = self.endpoint(&format!("conversations/{conversation_id}"))?;
        self.send_json("load-conversation", &url, self.client.get(url.clone()))
            .await
    }

    async fn upload_file_inner(
        &self,
        conversation_id: ConversationId,
        file: UploadFile,
    ) -> ApiResult<TaskId> {
        let url = self.endpoint(&format!("conversations/{conversation_id}/files"))?;
        let part = Part::bytes(file.bytes)
            .file_name(file.name)
            .mime_str(&file.mime)
            .context(RequestSnafu {
                stage: "build-upload-part",
                url: url.as_str(),
            })?;
        let form = Form::new().part("file", part);

        let payload: UploadTaskPayload = self
            .send_json(
                "upload-file",
                &url,
                self.client.post(url.clone()).multipart(form),
            )
            .await?;
        Ok(payload.task_id)
    }

    async fn upload_status_inner(&self, task_id: &TaskId) -> ApiResult<UploadStatus> {
        let url = self.endpoint(&format!("file_upload_status/{task_id}"))?;
        let payload: UploadStatusPayload = self
            .send_json("upload-status", &url, self.client.get(url.clone()))
            .await?;
        Ok(payload.into())
    }
}

impl ChatBackend for HttpBackend {
    fn create_conversation<'a>(&'a self) -> BoxFuture<'a, ApiResult<ConversationId>> {
        Box::pin(self.create_conversation_inner())
    }

    fn submit_message<'a>(
        &'a self,
        request: SubmitRequest,
    ) -> BoxFuture<'a, ApiResult<TaskHandle>> {
        Box::pin(self.submit_message_inner(request))
    }

    fn task_status<'a>(&'a self, task_id: &'a TaskId) -> BoxFuture<'a, ApiResult<TaskState>> {
        Box::pin(self.task_status_inner(task_id))
    }

    fn conversation<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, ApiResult<ConversationRecord>> {
        Box::pin(self.conversation_inner(conversation_id))
    }

    fn upload_file<'a>(
        &'a self,
        conversation_id: ConversationId,
        file: UploadFile,
    ) -> BoxFuture<'a, ApiResult<TaskId>> {
        Box::pin(self.upload_file_inner(conversation_id, file))
    }

    fn upload_status<'a>(&'a self, task_id: &'a TaskId) -> BoxFuture<'a, ApiResult<UploadStatus>> {
        Box::pin(self.upload_status_inner(task_id))
    }
}

/// Parses a base URL and guarantees a trailing slash so relative joins keep its path.
pub(crate) fn parse_base_url(raw: &str) -> ApiResult<Url> {
    let trimmed = raw.trim();
    let normalized = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };

    Url::parse(&normalized).context(InvalidUrlSnafu {
        stage: "parse-base-url",
        raw: trimmed,
    })
}
