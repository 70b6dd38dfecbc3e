use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ApiError {
    #[snafu(display("invalid endpoint URL '{raw}' on `{stage}`: {source}"))]
    InvalidUrl {
        stage: &'static str,
        raw: String,
        source: url::ParseError,
    },
    #[snafu(display("request to {url} failed on `{stage}`: {source}"))]
    Request {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },
    #[snafu(display("{url} returned status {status} on `{stage}`: {body}"))]
    Status {
        stage: &'static str,
        url: String,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to decode response from {url} on `{stage}`: {source}"))]
    Decode {
        stage: &'static str,
        url: String,
        source: serde_json::Error,
    },
    #[snafu(display("failed to open stream channel at {url} on `{stage}`: {source}"))]
    Connect {
        stage: &'static str,
        url: String,
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[snafu(display("failed to read upload source {path} on `{stage}`: {source}"))]
    ReadFile {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
}

impl ApiError {
    /// Returns the pipeline stage that produced this error.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::InvalidUrl { stage, .. }
            | Self::Request { stage, .. }
            | Self::Status { stage, .. }
            | Self::Decode { stage, .. }
            | Self::Connect { stage, .. }
            | Self::ReadFile { stage, .. } => stage,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
