#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use buzzer_os::config::{optional_var, ConfigError};

use crate::auth::BasicAuth;

pub const ENV_HTTP_BIND: &str = "BUZZER_HTTP_BIND";
pub const ENV_STORE_PATH: &str = "BUZZER_STORE_PATH";
pub const ENV_CACHE_PATH: &str = "BUZZER_CACHE_PATH";
pub const ENV_ANNOUNCE_INTERVAL: &str = "BUZZER_ANNOUNCE_INTERVAL_SECS";
pub const ENV_USERNAME: &str = "BUZZER_USERNAME";
pub const ENV_PASSWORD: &str = "BUZZER_PASSWORD";

pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_ANNOUNCE_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct RegistryServerConfig {
    pub bind: SocketAddr,
    /// `None` keeps pitches and the next-pitch snapshot in memory only.
    pub store_path: Option<PathBuf>,
    pub cache_path: Option<PathBuf>,
    /// `None` disables the announcer; `POST /next` is then the only writer.
    pub announce_interval: Option<Duration>,
    pub auth: Option<BasicAuth>,
}

impl RegistryServerConfig {
    pub fn from_env(ephemeral: bool) -> Result<Self, ConfigError> {
        Self::from_env_var_map(|key| std::env::var(key).ok(), ephemeral)
    }

    pub fn from_env_var_map<F>(mut env_getter: F, ephemeral: bool) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let bind_raw = optional_var(&mut env_getter, ENV_HTTP_BIND)
            .unwrap_or_else(|| DEFAULT_HTTP_BIND.to_string());
        let bind = bind_raw.parse::<SocketAddr>().map_err(|_| ConfigError::Invalid {
            key: ENV_HTTP_BIND,
            reason: format!("'{bind_raw}' is not a socket address"),
        })?;

        let (store_path, cache_path) = if ephemeral {
            (None, None)
        } else {
            let store = optional_var(&mut env_getter, ENV_STORE_PATH)
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("buzzer_registry.pitches.json"));
            let cache = optional_var(&mut env_getter, ENV_CACHE_PATH)
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("buzzer_registry.cache"));
            (Some(store), Some(cache))
        };

        let announce_interval = match optional_var(&mut env_getter, ENV_ANNOUNCE_INTERVAL) {
            None => Some(Duration::from_secs(DEFAULT_ANNOUNCE_INTERVAL_SECS)),
            Some(raw) => match raw.parse::<u64>() {
                Ok(0) => None,
                Ok(secs) => Some(Duration::from_secs(secs)),
                Err(_) => {
                    return Err(ConfigError::Invalid {
                        key: ENV_ANNOUNCE_INTERVAL,
                        reason: format!("'{raw}' is not a whole number of seconds"),
                    })
                }
            },
        };

        let auth = optional_var(&mut env_getter, ENV_USERNAME).map(|user| {
            let pass = env_getter(ENV_PASSWORD).unwrap_or_default();
            BasicAuth::new(user, &pass)
        });

        Ok(Self {
            bind,
            store_path,
            cache_path,
            announce_interval,
            auth,
        })
    }
}
