#![forbid(unsafe_code)]

use buzzer_contracts::pitch::{
    format_display_minute, NextPitchSnapshot, Pitch, PitchDraft, PitchId, DISPLAY_MINUTE_FORMAT,
};
use buzzer_engines::registry_client::{RegistryClient, RegistryClientConfig, RegistryClientError};
use buzzer_os::config::{optional_var, parse_display_tz, parse_registry_url, required_var, ConfigError};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

pub const ENV_URL: &str = "BUZZER_URL";
pub const ENV_USERNAME: &str = "BUZZER_USERNAME";
pub const ENV_PASSWORD: &str = "BUZZER_PASSWORD";

pub const USAGE: &str = "usage: buzzer pitch <add <speaker> <title> <date>|ls|release <id>|rm <id>> | buzzer next";

/// Operator view of the registry.
pub trait PitchAdmin {
    fn list(&self) -> Result<Vec<Pitch>, RegistryClientError>;
    fn create(&self, draft: &PitchDraft) -> Result<Pitch, RegistryClientError>;
    fn release(&self, id: &PitchId) -> Result<Pitch, RegistryClientError>;
    fn delete(&self, id: &PitchId) -> Result<(), RegistryClientError>;
    fn next(&self) -> Result<NextPitchSnapshot, RegistryClientError>;
}

impl PitchAdmin for RegistryClient {
    fn list(&self) -> Result<Vec<Pitch>, RegistryClientError> {
        self.list_pitches()
    }

    fn create(&self, draft: &PitchDraft) -> Result<Pitch, RegistryClientError> {
        self.create_pitch(draft)
    }

    fn release(&self, id: &PitchId) -> Result<Pitch, RegistryClientError> {
        self.release_pitch(id)
    }

    fn delete(&self, id: &PitchId) -> Result<(), RegistryClientError> {
        self.delete_pitch(id)
    }

    fn next(&self) -> Result<NextPitchSnapshot, RegistryClientError> {
        self.fetch_next()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliConfig {
    pub base_url: String,
    pub username: Option<String>,
    /// `None` with a username set means the password still has to be asked for.
    pub password: Option<String>,
    pub display_tz: Tz,
}

impl CliConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_var_map(|key| std::env::var(key).ok())
    }

    pub fn from_env_var_map<F>(mut env_getter: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let raw_url = required_var(&mut env_getter, ENV_URL)?;
        let base_url = parse_registry_url(ENV_URL, &raw_url)?;
        let username = optional_var(&mut env_getter, ENV_USERNAME);
        let password = env_getter(ENV_PASSWORD);
        let display_tz = parse_display_tz(&mut env_getter)?;
        Ok(Self {
            base_url,
            username,
            password,
            display_tz,
        })
    }

    pub fn needs_password(&self) -> bool {
        self.username.is_some() && self.password.is_none()
    }

    pub fn client_config(&self) -> RegistryClientConfig {
        let config = RegistryClientConfig::new(self.base_url.clone());
        match &self.username {
            Some(user) => config.with_basic_auth(user.clone(), self.password.clone().unwrap_or_default()),
            None => config,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PitchCommand {
    Add(PitchDraft),
    List,
    Release(PitchId),
    Remove(PitchId),
    Next,
}

pub fn parse_command(args: &[String], tz: Tz) -> Result<PitchCommand, String> {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["next"] => Ok(PitchCommand::Next),
        ["pitch", "ls"] => Ok(PitchCommand::List),
        ["pitch", "add", speaker, title, date] => Ok(PitchCommand::Add(PitchDraft::v1(
            *speaker,
            *title,
            parse_pitch_date(date, tz)?,
        ))),
        ["pitch", "add", ..] => Err("usage: buzzer pitch add <speaker> <title> <date>".to_string()),
        ["pitch", "release", id] => Ok(PitchCommand::Release(parse_pitch_id(id)?)),
        ["pitch", "rm", id] => Ok(PitchCommand::Remove(parse_pitch_id(id)?)),
        ["pitch", sub, ..] => Err(format!(
            "unknown pitch subcommand: {sub}. expected one of: add, ls, release, rm"
        )),
        _ => Err(USAGE.to_string()),
    }
}

/// RFC 3339, or `dd.mm.yyyy HH:MM` read as wall time in `tz`.
pub fn parse_pitch_date(raw: &str, tz: Tz) -> Result<DateTime<Utc>, String> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, DISPLAY_MINUTE_FORMAT).map_err(|_| {
        format!("invalid date '{raw}'. expected RFC 3339 or dd.mm.yyyy HH:MM")
    })?;
    tz.from_local_datetime(&naive)
        .single()
        .map(|at| at.with_timezone(&Utc))
        .ok_or_else(|| format!("date '{raw}' is ambiguous or skipped in {tz}"))
}

fn parse_pitch_id(raw: &str) -> Result<PitchId, String> {
    PitchId::new(raw).map_err(|e| format!("invalid pitch id '{raw}': {e}"))
}

pub fn format_pitch_row(pitch: &Pitch, tz: Tz) -> String {
    let state = match pitch.released_at {
        Some(at) => format!("released {}", format_display_minute(at, tz)),
        None => "pending".to_string(),
    };
    format!("{}\t{}\t{}", pitch.id, state, pitch.display_line(tz))
}

pub fn execute_pitch_command(
    admin: &dyn PitchAdmin,
    command: &PitchCommand,
    tz: Tz,
) -> Result<String, String> {
    match command {
        PitchCommand::Add(draft) => {
            let pitch = admin
                .create(draft)
                .map_err(|e| format!("failed to add pitch: {e}"))?;
            Ok(pitch.id.to_string())
        }
        PitchCommand::List => {
            let pitches = admin
                .list()
                .map_err(|e| format!("failed to list pitches: {e}"))?;
            Ok(pitches
                .iter()
                .map(|p| format_pitch_row(p, tz))
                .collect::<Vec<_>>()
                .join("\n"))
        }
        PitchCommand::Release(id) => {
            let pitch = admin
                .release(id)
                .map_err(|e| format!("failed to release pitch: {e}"))?;
            Ok(format_pitch_row(&pitch, tz))
        }
        PitchCommand::Remove(id) => {
            admin
                .delete(id)
                .map_err(|e| format!("failed to remove pitch: {e}"))?;
            Ok("OK".to_string())
        }
        PitchCommand::Next => {
            let snapshot = admin
                .next()
                .map_err(|e| format!("failed to fetch next pitch: {e}"))?;
            Ok(snapshot
                .pitch()
                .map(|p| format_pitch_row(p, tz))
                .unwrap_or_else(|| "NONE".to_string()))
        }
    }
}
