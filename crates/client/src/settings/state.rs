use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chatwire_api::{ApiResult, BackendConfig, WsConnector};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::poll::PollPolicy;
use crate::session::SessionConfig;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000/api";
pub const SETTINGS_DIRECTORY_NAME: &str = "chatwire";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "CHATWIRE_";

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_STREAM_STALL_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_MESSAGE_POLL_INTERVAL_MS: u64 = 2_000;
const DEFAULT_MESSAGE_POLL_MAX_ATTEMPTS: u32 = 450;
const DEFAULT_UPLOAD_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_UPLOAD_POLL_MAX_ATTEMPTS: u32 = 30;
const DEFAULT_POLL_FAILURE_LIMIT: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub base_url: String,
    /// WebSocket base; derived from `base_url` when absent.
    pub stream_url: Option<String>,
    pub api_token: Option<String>,
    pub data_set_id: Option<u64>,
    pub prefer_streaming: bool,
    pub connect_timeout_ms: u64,
    pub stream_stall_timeout_ms: u64,
    pub message_poll_interval_ms: u64,
    /// `None` keeps polling until the session shuts down.
    pub message_poll_max_attempts: Option<u32>,
    pub upload_poll_interval_ms: u64,
    pub upload_poll_max_attempts: u32,
    pub poll_failure_limit: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            stream_url: None,
            api_token: None,
            data_set_id: None,
            prefer_streaming: true,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            stream_stall_timeout_ms: DEFAULT_STREAM_STALL_TIMEOUT_MS,
            message_poll_interval_ms: DEFAULT_MESSAGE_POLL_INTERVAL_MS,
            message_poll_max_attempts: Some(DEFAULT_MESSAGE_POLL_MAX_ATTEMPTS),
            upload_poll_interval_ms: DEFAULT_UPLOAD_POLL_INTERVAL_MS,
            upload_poll_max_attempts: DEFAULT_UPLOAD_POLL_MAX_ATTEMPTS,
            poll_failure_limit: DEFAULT_POLL_FAILURE_LIMIT,
        }
    }
}

impl ClientSettings {
    pub fn normalized(mut self) -> Self {
        self.base_url = match self.base_url.trim() {
            "" => DEFAULT_BASE_URL.to_string(),
            trimmed => trimmed.to_string(),
        };
        self.stream_url = non_blank(self.stream_url);
        self.api_token = non_blank(self.api_token);

        self.connect_timeout_ms = or_default(self.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS);
        self.stream_stall_timeout_ms =
            or_default(self.stream_stall_timeout_ms, DEFAULT_STREAM_STALL_TIMEOUT_MS);
        self.message_poll_interval_ms =
            or_default(self.message_poll_interval_ms, DEFAULT_MESSAGE_POLL_INTERVAL_MS);
        self.upload_poll_interval_ms =
            or_default(self.upload_poll_interval_ms, DEFAULT_UPLOAD_POLL_INTERVAL_MS);
        if self.message_poll_max_attempts == Some(0) {
            self.message_poll_max_attempts = Some(DEFAULT_MESSAGE_POLL_MAX_ATTEMPTS);
        }
        if self.upload_poll_max_attempts == 0 {
            self.upload_poll_max_attempts = DEFAULT_UPLOAD_POLL_MAX_ATTEMPTS;
        }
        if self.poll_failure_limit == 0 {
            self.poll_failure_limit = DEFAULT_POLL_FAILURE_LIMIT;
        }

        self
    }

    /// Names accepted by [`ClientSettings::set_field`].
    pub const FIELDS: &'static [&'static str] = &[
        "base_url",
        "stream_url",
        "api_token",
        "data_set_id",
        "prefer_streaming",
        "connect_timeout_ms",
        "stream_stall_timeout_ms",
        "message_poll_interval_ms",
        "message_poll_max_attempts",
        "upload_poll_interval_ms",
        "upload_poll_max_attempts",
        "poll_failure_limit",
    ];

    /// Sets one field from its textual form. `none` or an empty value clears optional fields.
    pub fn set_field(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        let value = value.trim();
        let cleared = value.is_empty() || value.eq_ignore_ascii_case("none");
        match key {
            "base_url" => self.base_url = value.to_string(),
            "stream_url" => self.stream_url = (!cleared).then(|| value.to_string()),
            "api_token" => self.api_token = (!cleared).then(|| value.to_string()),
            "data_set_id" => {
                self.data_set_id = if cleared { None } else { Some(parse_field(key, value)?) }
            }
            "prefer_streaming" => self.prefer_streaming = parse_field(key, value)?,
            "connect_timeout_ms" => self.connect_timeout_ms = parse_field(key, value)?,
            "stream_stall_timeout_ms" => self.stream_stall_timeout_ms = parse_field(key, value)?,
            "message_poll_interval_ms" => self.message_poll_interval_ms = parse_field(key, value)?,
            "message_poll_max_attempts" => {
                self.message_poll_max_attempts =
                    if cleared { None } else { Some(parse_field(key, value)?) }
            }
            "upload_poll_interval_ms" => self.upload_poll_interval_ms = parse_field(key, value)?,
            "upload_poll_max_attempts" => self.upload_poll_max_attempts = parse_field(key, value)?,
            "poll_failure_limit" => self.poll_failure_limit = parse_field(key, value)?,
            _ => {
                return UnknownFieldSnafu {
                    stage: "set-settings-field",
                    key,
                }
                .fail();
            }
        }
        Ok(())
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig::new(self.base_url.clone()).with_api_token(self.api_token.clone())
    }

    pub fn stream_connector(&self) -> ApiResult<WsConnector> {
        match &self.stream_url {
            Some(stream_url) => WsConnector::new(stream_url, self.api_token.clone()),
            None => WsConnector::from_http_base(&self.base_url, self.api_token.clone()),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            prefer_streaming: self.prefer_streaming,
            data_set_id: self.data_set_id,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            stream_stall_timeout: Duration::from_millis(self.stream_stall_timeout_ms),
            message_poll: PollPolicy::new(Duration::from_millis(self.message_poll_interval_ms))
                .with_max_attempts(self.message_poll_max_attempts)
                .with_failure_limit(self.poll_failure_limit),
            upload_poll: PollPolicy::new(Duration::from_millis(self.upload_poll_interval_ms))
                .with_max_attempts(Some(self.upload_poll_max_attempts))
                .with_failure_limit(self.poll_failure_limit),
        }
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ClientSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".chatwire"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ClientSettings> {
        self.settings.load_full()
    }

    /// Normalizes, saves, then publishes new settings to readers.
    pub fn update(&self, settings: ClientSettings) -> Result<Arc<ClientSettings>, SettingsError> {
        let settings = Arc::new(settings.normalized());
        let encoded = serde_json::to_vec_pretty(settings.as_ref()).context(EncodeSnafu {
            stage: "encode-settings",
        })?;
        replace_file(&self.config_path, &encoded)?;
        self.settings.store(settings.clone());
        tracing::info!(path = %self.config_path.display(), "settings saved");
        Ok(settings)
    }

    /// Changes one field of the current settings and saves the result.
    pub fn set(&self, key: &str, value: &str) -> Result<Arc<ClientSettings>, SettingsError> {
        let mut settings = ClientSettings::clone(&self.settings());
        settings.set_field(key, value)?;
        self.update(settings)
    }

    fn load_from_disk(path: &Path) -> ClientSettings {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no settings file; using defaults and environment");
        }

        let layered = Figment::from(Serialized::defaults(ClientSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        layered
            .extract::<ClientSettings>()
            .map(ClientSettings::normalized)
            .unwrap_or_else(|error| {
                tracing::warn!(path = %path.display(), error = %error, "settings unreadable; using defaults");
                ClientSettings::default()
            })
    }
}

/// Writes next to `path` and renames over it, so readers never see a half-written file.
fn replace_file(path: &Path, contents: &[u8]) -> Result<(), SettingsError> {
    let directory = path.parent().context(NoParentSnafu {
        stage: "locate-settings-directory",
        path,
    })?;
    std::fs::create_dir_all(directory).context(SettingsIoSnafu {
        stage: "create-settings-directory",
        path: directory,
    })?;

    let staged = path.with_extension("json.tmp");
    std::fs::write(&staged, contents).context(SettingsIoSnafu {
        stage: "write-staged-settings",
        path: &staged,
    })?;
    std::fs::rename(&staged, path).context(SettingsIoSnafu {
        stage: "replace-settings-file",
        path,
    })
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("unknown setting '{key}' on `{stage}`"))]
    UnknownField { stage: &'static str, key: String },
    #[snafu(display("'{value}' is not a valid value for '{key}' on `{stage}`"))]
    InvalidValue {
        stage: &'static str,
        key: String,
        value: String,
    },
    #[snafu(display("settings path {path:?} has no parent directory on `{stage}`"))]
    NoParent { stage: &'static str, path: PathBuf },
    #[snafu(display("failed to encode settings on `{stage}`: {source}"))]
    Encode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("settings i/o failed for {path:?} on `{stage}`: {source}"))]
    SettingsIo {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

fn parse_field<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, SettingsError> {
    value.parse().ok().context(InvalidValueSnafu {
        stage: "parse-settings-field",
        key,
        value,
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn or_default(value: u64, default: u64) -> u64 {
    if value == 0 { default } else { value }
}
