use std::pin::Pin;

use futures::{Stream, StreamExt};
use snafu::ResultExt;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::backend::{BoxFuture, parse_base_url};
use crate::error::{ApiResult, ConnectSnafu, InvalidUrlSnafu};
use crate::types::ConversationId;

/// What the transport observed on an open channel, in connection order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    Text(String),
    /// The connection ended. `clean` is false for anything but a normal closure.
    Closed {
        clean: bool,
        code: Option<u16>,
        reason: String,
    },
    TransportError(String),
}

impl ChannelFrame {
    /// Close frame with code 1000.
    pub fn normal_close() -> Self {
        Self::Closed {
            clean: true,
            code: Some(1000),
            reason: String::new(),
        }
    }

    /// Closure without a usable close code.
    pub fn abnormal_close(reason: impl Into<String>) -> Self {
        Self::Closed {
            clean: false,
            code: None,
            reason: reason.into(),
        }
    }
}

/// Receive-only stream of frames. It ends after a `Closed` or `TransportError` frame.
pub type ChannelStream = Pin<Box<dyn Stream<Item = ChannelFrame> + Send>>;

/// Opens the per-conversation duplex channel.
///
/// Resolves once the connection is established; callers bound the wait themselves.
pub trait ChannelConnector: Send + Sync {
    fn connect<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, ApiResult<ChannelStream>>;
}

/// `ChannelConnector` over WebSocket.
pub struct WsConnector {
    stream_base: Url,
    api_token: Option<String>,
}

impl WsConnector {
    pub fn new(stream_base_url: &str, api_token: Option<String>) -> ApiResult<Self> {
        Ok(Self {
            stream_base: parse_base_url(stream_base_url)?,
            api_token,
        })
    }

    /// Derives the stream base from the REST base by switching `http(s)` to `ws(s)`.
    pub fn from_http_base(base_url: &str, api_token: Option<String>) -> ApiResult<Self> {
        let trimmed = base_url.trim();
        let stream_base = if let Some(rest) = trimmed.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = trimmed.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            trimmed.to_string()
        };
        Self::new(&stream_base, api_token)
    }

    pub fn channel_url(&self, conversation_id: ConversationId) -> ApiResult<Url> {
        let path = format!("conversations/{conversation_id}/stream");
        self.stream_base.join(&path).context(InvalidUrlSnafu {
            stage: "join-channel-url",
            raw: path,
        })
    }

    async fn connect_inner(&self, conversation_id: ConversationId) -> ApiResult<ChannelStream> {
        let url = self.channel_url(conversation_id)?;
        let mut request = url.as_str().into_client_request().context(ConnectSnafu {
            stage: "build-channel-request",
            url: url.as_str(),
        })?;

        if let Some(token) = &self.api_token {
            match HeaderValue::from_str(&format!("Bearer {token}")) {
                Ok(value) => {
                    request.headers_mut().insert(AUTHORIZATION, value);
                }
                Err(error) => {
                    tracing::warn!(error = %error, "api token is not a valid header value; connecting without it");
                }
            }
        }

        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .context(ConnectSnafu {
                stage: "open-channel",
                url: url.as_str(),
            })?;
        tracing::debug!(conversation_id = %conversation_id, url = %url, "stream channel connected");

        let frames = futures::stream::unfold(Some(socket), |state| async move {
            let Some(mut socket) = state else {
                return None;
            };
            loop {
                match socket.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return Some((ChannelFrame::Text(text), Some(socket)));
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => return Some((ChannelFrame::Text(text), Some(socket))),
                        Err(_) => {
                            tracing::debug!("skipping non-utf8 binary frame");
                        }
                    },
                    Some(Ok(Message::Close(frame))) => return Some((close_frame(frame), None)),
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        return Some((ChannelFrame::TransportError(error.to_string()), None));
                    }
                    None => {
                        return Some((
                            ChannelFrame::abnormal_close("connection dropped without close frame"),
                            None,
                        ));
                    }
                }
            }
        });

        Ok(Box::pin(frames))
    }
}

impl ChannelConnector for WsConnector {
    fn connect<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, ApiResult<ChannelStream>> {
        Box::pin(self.connect_inner(conversation_id))
    }
}

// A close without a status frame still completed the closing handshake.
fn close_frame(frame: Option<CloseFrame<'static>>) -> ChannelFrame {
    match frame {
        None => ChannelFrame::Closed {
            clean: true,
            code: None,
            reason: String::new(),
        },
        Some(frame) => ChannelFrame::Closed {
            clean: frame.code == CloseCode::Normal,
            code: Some(u16::from(frame.code)),
            reason: frame.reason.into_owned(),
        },
    }
}
