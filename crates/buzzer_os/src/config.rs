#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use buzzer_contracts::pitch::DEFAULT_DISPLAY_TZ;
use buzzer_engines::registry_client::RegistryClientConfig;
use buzzer_engines::sign::SignEffect;
use chrono_tz::Tz;

use crate::hardware::BoardLayout;
use crate::keypad::KeypadSelector;

pub const ENV_KEYPAD_DEVICE: &str = "PBUZZER_KEYPAD_DEVICE";
pub const ENV_BUZZER_PITCH_URL: &str = "PBUZZER_PITCH_URL";
pub const ENV_BUZZER_CHECK_INTERVAL: &str = "PBUZZER_PITCH_CHECK_INTERVAL";
pub const ENV_GPIO_BASE: &str = "PBUZZER_GPIO_BASE";
pub const ENV_GPIO_PINS: &str = "PBUZZER_GPIO_PINS";
pub const ENV_DEVICE_NAME: &str = "PBUZZER_DEVICE_NAME";
pub const ENV_BUZZER_REGISTRY_USERNAME: &str = "PBUZZER_REGISTRY_USERNAME";
pub const ENV_BUZZER_REGISTRY_PASSWORD: &str = "PBUZZER_REGISTRY_PASSWORD";

pub const ENV_TICKER_DEVICE: &str = "PTICKER_DEVICE";
pub const ENV_TICKER_PITCH_URL: &str = "PTICKER_PITCH_URL";
pub const ENV_TICKER_CHECK_INTERVAL: &str = "PTICKER_PITCH_CHECK_INTERVAL";
pub const ENV_TICKER_EFFECT: &str = "PTICKER_EFFECT";
pub const ENV_TICKER_REGISTRY_USERNAME: &str = "PTICKER_REGISTRY_USERNAME";
pub const ENV_TICKER_REGISTRY_PASSWORD: &str = "PTICKER_REGISTRY_PASSWORD";

pub const ENV_DISPLAY_TZ: &str = "BUZZER_DISPLAY_TZ";

pub const DEFAULT_GPIO_BASE: &str = "/sys/class/gpio";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} is not set")]
    Missing { key: &'static str },

    #[error("{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

/// Reads `key`, treating blank values as unset.
pub fn optional_var<F>(env_getter: &mut F, key: &str) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    env_getter(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn required_var<F>(env_getter: &mut F, key: &'static str) -> Result<String, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    optional_var(env_getter, key).ok_or(ConfigError::Missing { key })
}

/// Absolute http(s) URL with a host.
pub fn parse_registry_url(key: &'static str, raw: &str) -> Result<String, ConfigError> {
    let url = url::Url::parse(raw).map_err(|err| invalid(key, format!("'{raw}': {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(key, format!("'{raw}' must be an http or https URL")));
    }
    if url.host_str().is_none() {
        return Err(invalid(key, format!("'{raw}' has no host")));
    }
    Ok(raw.to_string())
}

pub fn parse_positive_secs(key: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    match raw.parse::<u64>() {
        Ok(0) => Err(invalid(key, "must be a positive number of seconds")),
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(_) => Err(invalid(key, format!("'{raw}' is not a whole number of seconds"))),
    }
}

pub fn parse_display_tz<F>(env_getter: &mut F) -> Result<Tz, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    match optional_var(env_getter, ENV_DISPLAY_TZ) {
        Some(raw) => raw
            .parse::<Tz>()
            .map_err(|_| invalid(ENV_DISPLAY_TZ, format!("unknown time zone '{raw}'"))),
        None => Ok(DEFAULT_DISPLAY_TZ),
    }
}

fn parse_basic_auth<F>(
    env_getter: &mut F,
    user_key: &'static str,
    pass_key: &'static str,
) -> Option<(String, String)>
where
    F: FnMut(&str) -> Option<String>,
{
    let user = optional_var(env_getter, user_key)?;
    let pass = env_getter(pass_key).unwrap_or_default();
    Some((user, pass))
}

/// `name=pin` pairs, e.g. `light=17,horn=27,confirm=22`. Unnamed roles keep
/// their defaults.
pub fn parse_gpio_pins(raw: &str) -> Result<BoardLayout, ConfigError> {
    let mut layout = BoardLayout::default();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, pin) = pair
            .split_once('=')
            .ok_or_else(|| invalid(ENV_GPIO_PINS, format!("'{pair}' is not name=pin")))?;
        let pin: u8 = pin
            .trim()
            .parse()
            .map_err(|_| invalid(ENV_GPIO_PINS, format!("'{pin}' is not a pin number")))?;
        let slot = match name.trim() {
            "light" => &mut layout.light_relay,
            "horn" => &mut layout.horn_relay,
            "confirm" => &mut layout.confirm_switch,
            "light_button" => &mut layout.light_button,
            "horn_button" => &mut layout.horn_button,
            other => return Err(invalid(ENV_GPIO_PINS, format!("unknown role '{other}'"))),
        };
        *slot = pin;
    }
    let mut pins: Vec<u8> = layout.inputs().into_iter().chain(layout.outputs()).collect();
    pins.sort_unstable();
    pins.dedup();
    if pins.len() != 5 {
        return Err(invalid(ENV_GPIO_PINS, "every role needs its own pin"));
    }
    Ok(layout)
}

/// GPIO root and pin roles; all the reset tool needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardConfig {
    pub gpio_base: PathBuf,
    pub layout: BoardLayout,
}

impl BoardConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_var_map(|key| std::env::var(key).ok())
    }

    pub fn from_env_var_map<F>(mut env_getter: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let gpio_base = optional_var(&mut env_getter, ENV_GPIO_BASE)
            .unwrap_or_else(|| DEFAULT_GPIO_BASE.to_string())
            .into();
        let layout = match optional_var(&mut env_getter, ENV_GPIO_PINS) {
            Some(raw) => parse_gpio_pins(&raw)?,
            None => BoardLayout::default(),
        };
        Ok(Self { gpio_base, layout })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub keypad: KeypadSelector,
    pub registry: RegistryClientConfig,
    pub check_interval: Duration,
    pub gpio_base: PathBuf,
    pub layout: BoardLayout,
    pub device_name: Option<String>,
    pub display_tz: Tz,
}

impl DeviceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_var_map(|key| std::env::var(key).ok())
    }

    pub fn from_env_var_map<F>(mut env_getter: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let keypad_raw = required_var(&mut env_getter, ENV_KEYPAD_DEVICE)?;
        let keypad = KeypadSelector::parse(&keypad_raw)
            .ok_or(ConfigError::Missing { key: ENV_KEYPAD_DEVICE })?;
        let url = parse_registry_url(
            ENV_BUZZER_PITCH_URL,
            &required_var(&mut env_getter, ENV_BUZZER_PITCH_URL)?,
        )?;
        let check_interval = parse_positive_secs(
            ENV_BUZZER_CHECK_INTERVAL,
            &required_var(&mut env_getter, ENV_BUZZER_CHECK_INTERVAL)?,
        )?;
        let BoardConfig { gpio_base, layout } = BoardConfig::from_env_var_map(&mut env_getter)?;
        let device_name = optional_var(&mut env_getter, ENV_DEVICE_NAME);
        let display_tz = parse_display_tz(&mut env_getter)?;

        let mut registry = RegistryClientConfig::new(url);
        if let Some((user, pass)) = parse_basic_auth(
            &mut env_getter,
            ENV_BUZZER_REGISTRY_USERNAME,
            ENV_BUZZER_REGISTRY_PASSWORD,
        ) {
            registry = registry.with_basic_auth(user, pass);
        }

        Ok(Self {
            keypad,
            registry,
            check_interval,
            gpio_base,
            layout,
            device_name,
            display_tz,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignConfig {
    pub device: PathBuf,
    pub registry: RegistryClientConfig,
    pub check_interval: Duration,
    pub effect: SignEffect,
    pub display_tz: Tz,
}

impl SignConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_var_map(|key| std::env::var(key).ok())
    }

    pub fn from_env_var_map<F>(mut env_getter: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let device = PathBuf::from(required_var(&mut env_getter, ENV_TICKER_DEVICE)?);
        if !device.exists() {
            return Err(invalid(
                ENV_TICKER_DEVICE,
                format!("'{}' does not exist", device.display()),
            ));
        }
        let url = parse_registry_url(
            ENV_TICKER_PITCH_URL,
            &required_var(&mut env_getter, ENV_TICKER_PITCH_URL)?,
        )?;
        let check_interval = parse_positive_secs(
            ENV_TICKER_CHECK_INTERVAL,
            &required_var(&mut env_getter, ENV_TICKER_CHECK_INTERVAL)?,
        )?;
        let effect = match optional_var(&mut env_getter, ENV_TICKER_EFFECT) {
            Some(raw) => raw
                .parse::<SignEffect>()
                .map_err(|err| invalid(ENV_TICKER_EFFECT, err.to_string()))?,
            None => SignEffect::default(),
        };
        let display_tz = parse_display_tz(&mut env_getter)?;

        let mut registry = RegistryClientConfig::new(url);
        if let Some((user, pass)) = parse_basic_auth(
            &mut env_getter,
            ENV_TICKER_REGISTRY_USERNAME,
            ENV_TICKER_REGISTRY_PASSWORD,
        ) {
            registry = registry.with_basic_auth(user, pass);
        }

        Ok(Self {
            device,
            registry,
            check_interval,
            effect,
            display_tz,
        })
    }
}
