#![forbid(unsafe_code)]

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use buzzer_contracts::device::DeviceRegistration;
use buzzer_contracts::pitch::{NextPitchSnapshot, Pitch, PitchDocument, PitchDraft, PitchId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const REGISTRY_CONNECT_TIMEOUT_MS_DEFAULT: u64 = 3_000;
pub const REGISTRY_REQUEST_TIMEOUT_MS_DEFAULT: u64 = 10_000;

const ERROR_MESSAGE_MAX_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryClientError {
    #[error("registry transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyReleased(String),

    #[error("registry rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("registry response could not be decoded: {0}")]
    Decode(String),
}

/// Error body every registry route answers with on failure.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegistryErrorBody {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextUpdateAck {
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryClientConfig {
    /// Absolute base URL; route paths are appended to it.
    pub base_url: String,
    pub basic_auth: Option<(String, String)>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl RegistryClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            basic_auth: None,
            connect_timeout_ms: REGISTRY_CONNECT_TIMEOUT_MS_DEFAULT,
            request_timeout_ms: REGISTRY_REQUEST_TIMEOUT_MS_DEFAULT,
        }
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((username.into(), password.into()));
        self
    }
}

/// Blocking HTTP client for the registry routes. Every call is a single
/// request with bounded timeouts and no retries; callers retry on their next
/// tick.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    config: RegistryClientConfig,
    agent: ureq::Agent,
}

impl RegistryClient {
    pub fn new(config: RegistryClientConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(config.connect_timeout_ms))
            .timeout_read(Duration::from_millis(config.request_timeout_ms))
            .timeout_write(Duration::from_millis(config.request_timeout_ms))
            .build();
        Self { config, agent }
    }

    pub fn config(&self) -> &RegistryClientConfig {
        &self.config
    }

    pub fn fetch_next(&self) -> Result<NextPitchSnapshot, RegistryClientError> {
        let doc: PitchDocument = self.call(self.request("GET", "next"))?;
        NextPitchSnapshot::from_document(doc)
            .map_err(|err| RegistryClientError::Decode(err.to_string()))
    }

    /// Returns whether the registry accepted it as a change.
    pub fn announce_next(&self, snapshot: &NextPitchSnapshot) -> Result<bool, RegistryClientError> {
        let ack: NextUpdateAck =
            self.send(self.request("POST", "next"), &snapshot.to_document())?;
        Ok(ack.changed)
    }

    pub fn register_device(
        &self,
        registration: &DeviceRegistration,
    ) -> Result<(), RegistryClientError> {
        let _: serde_json::Value = self.send(self.request("POST", "device"), registration)?;
        Ok(())
    }

    pub fn list_pitches(&self) -> Result<Vec<Pitch>, RegistryClientError> {
        self.call(self.request("GET", "pitches"))
    }

    pub fn lookup_pitch(&self, id: &PitchId) -> Result<Pitch, RegistryClientError> {
        self.call(self.request("GET", &format!("pitches/{id}")))
    }

    pub fn create_pitch(&self, draft: &PitchDraft) -> Result<Pitch, RegistryClientError> {
        self.send(self.request("POST", "pitches"), draft)
    }

    pub fn release_pitch(&self, id: &PitchId) -> Result<Pitch, RegistryClientError> {
        self.call(self.request("POST", &format!("pitches/{id}/release")))
    }

    pub fn delete_pitch(&self, id: &PitchId) -> Result<(), RegistryClientError> {
        self.request("DELETE", &format!("pitches/{id}"))
            .call()
            .map_err(map_ureq_error)?;
        Ok(())
    }

    fn request(&self, method: &str, path: &str) -> ureq::Request {
        let url = join_url(&self.config.base_url, path);
        debug!(method, url = %url, "registry request");
        let req = self.agent.request(method, &url);
        match &self.config.basic_auth {
            Some((user, pass)) => req.set("authorization", &basic_auth_header(user, pass)),
            None => req,
        }
    }

    fn call<T: DeserializeOwned>(&self, req: ureq::Request) -> Result<T, RegistryClientError> {
        let resp = req.call().map_err(map_ureq_error)?;
        decode(resp)
    }

    fn send<B: Serialize, T: DeserializeOwned>(
        &self,
        req: ureq::Request,
        body: &B,
    ) -> Result<T, RegistryClientError> {
        let resp = req.send_json(body).map_err(map_ureq_error)?;
        decode(resp)
    }
}

pub fn basic_auth_header(username: &str, password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{username}:{password}")))
}

pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn decode<T: DeserializeOwned>(resp: ureq::Response) -> Result<T, RegistryClientError> {
    resp.into_json::<T>()
        .map_err(|err| RegistryClientError::Decode(err.to_string()))
}

fn map_ureq_error(err: ureq::Error) -> RegistryClientError {
    match err {
        ureq::Error::Status(status, resp) => {
            let message = resp
                .into_json::<RegistryErrorBody>()
                .map(|b| b.message)
                .unwrap_or_default();
            let message = bounded_message(if message.is_empty() {
                format!("http status {status}")
            } else {
                message
            });
            match status {
                404 => RegistryClientError::NotFound(message),
                409 => RegistryClientError::AlreadyReleased(message),
                _ => RegistryClientError::Rejected { status, message },
            }
        }
        ureq::Error::Transport(t) => RegistryClientError::Transport(bounded_message(t.to_string())),
    }
}

fn bounded_message(msg: String) -> String {
    if msg.len() > ERROR_MESSAGE_MAX_LEN {
        msg.chars().take(ERROR_MESSAGE_MAX_LEN).collect()
    } else {
        msg
    }
}
