#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::{ContractViolation, SchemaVersion, Validate};

pub const PITCH_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const PITCH_ID_MAX_LEN: usize = 32;
pub const PITCH_TEXT_MAX_LEN: usize = 256;

/// Zone used when a pitch is rendered for people standing in front of the device.
pub const DEFAULT_DISPLAY_TZ: Tz = chrono_tz::Europe::Zurich;

pub const DISPLAY_MINUTE_FORMAT: &str = "%d.%m.%Y %H:%M";
const DISPLAY_SECOND_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PitchId(String);

impl PitchId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = PitchId(id.into());
        id.validate()?;
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for PitchId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.is_empty() {
            return Err(ContractViolation::MissingField { field: "pitch.id" });
        }
        if self.0.len() > PITCH_ID_MAX_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "pitch.id",
                reason: "must be <= 32 chars",
            });
        }
        if !self.0.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(ContractViolation::InvalidValue {
                field: "pitch.id",
                reason: "must be ascii alphanumeric",
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for PitchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller input for a new pitch; the store assigns the id and registration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PitchDraft {
    pub speaker: String,
    pub title: String,
    #[serde(rename = "date")]
    pub scheduled_at: DateTime<Utc>,
}

impl PitchDraft {
    pub fn v1(
        speaker: impl Into<String>,
        title: impl Into<String>,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            speaker: speaker.into(),
            title: title.into(),
            scheduled_at,
        }
    }

    /// Structural checks plus the requirement that the pitch lies strictly after `now`.
    pub fn validate_at(&self, now: DateTime<Utc>) -> Result<(), ContractViolation> {
        self.validate()?;
        if self.scheduled_at <= now {
            return Err(ContractViolation::InvalidValue {
                field: "pitch.date",
                reason: "must be in the future",
            });
        }
        Ok(())
    }
}

impl Validate for PitchDraft {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_text("pitch.speaker", &self.speaker)?;
        validate_text("pitch.title", &self.title)?;
        Ok(())
    }
}

fn validate_text(field: &'static str, value: &str) -> Result<(), ContractViolation> {
    if value.trim().is_empty() {
        return Err(ContractViolation::MissingField { field });
    }
    if value.len() > PITCH_TEXT_MAX_LEN {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be <= 256 bytes",
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pitch {
    pub id: PitchId,
    pub speaker: String,
    pub title: String,
    pub scheduled_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    /// `Some` exactly when the pitch has been released.
    pub released_at: Option<DateTime<Utc>>,
}

impl Pitch {
    pub fn from_draft(id: PitchId, draft: PitchDraft, registered_at: DateTime<Utc>) -> Self {
        Self {
            id,
            speaker: draft.speaker.trim().to_string(),
            title: draft.title.trim().to_string(),
            scheduled_at: draft.scheduled_at,
            registered_at,
            released_at: None,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released_at.is_some()
    }

    pub fn to_document(&self) -> PitchDocument {
        PitchDocument::from(self)
    }

    /// `"<speaker> - <title> - <dd.mm.yyyy HH:MM>"` in the given zone.
    pub fn display_line(&self, tz: Tz) -> String {
        format!(
            "{} - {} - {}",
            self.speaker,
            self.title,
            format_display_minute(self.scheduled_at, tz)
        )
    }
}

/// JSON shape shared by the registry HTTP surface and the snapshot file.
///
/// An empty `id` means "nothing announced". Field names are kept short and
/// lowercase because deployed devices already speak this format.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PitchDocument {
    pub id: String,
    pub speaker: String,
    pub title: String,
    pub date: Option<DateTime<Utc>>,
    pub registeredat: Option<DateTime<Utc>>,
    pub started: bool,
    pub startedat: Option<DateTime<Utc>>,
}

impl PitchDocument {
    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }

    /// `Ok(None)` for the empty document.
    pub fn into_pitch(self) -> Result<Option<Pitch>, ContractViolation> {
        if self.is_empty() {
            return Ok(None);
        }
        let id = PitchId::new(self.id)?;
        let scheduled_at = self
            .date
            .ok_or(ContractViolation::MissingField { field: "pitch.date" })?;
        let registered_at = self.registeredat.ok_or(ContractViolation::MissingField {
            field: "pitch.registeredat",
        })?;
        let released_at = if self.started {
            Some(self.startedat.ok_or(ContractViolation::MissingField {
                field: "pitch.startedat",
            })?)
        } else {
            None
        };
        Ok(Some(Pitch {
            id,
            speaker: self.speaker,
            title: self.title,
            scheduled_at,
            registered_at,
            released_at,
        }))
    }
}

impl From<&Pitch> for PitchDocument {
    fn from(p: &Pitch) -> Self {
        Self {
            id: p.id.as_str().to_string(),
            speaker: p.speaker.clone(),
            title: p.title.clone(),
            date: Some(p.scheduled_at),
            registeredat: Some(p.registered_at),
            started: p.is_released(),
            startedat: p.released_at,
        }
    }
}

impl Serialize for Pitch {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        PitchDocument::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Pitch {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let doc = PitchDocument::deserialize(deserializer)?;
        doc.into_pitch()
            .map_err(serde::de::Error::custom)?
            .ok_or_else(|| serde::de::Error::custom("pitch.id is required"))
    }
}

/// What devices currently see as the next announced pitch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NextPitchSnapshot(Option<Pitch>);

impl NextPitchSnapshot {
    pub fn empty() -> Self {
        Self(None)
    }

    pub fn of(pitch: Pitch) -> Self {
        Self(Some(pitch))
    }

    pub fn pitch(&self) -> Option<&Pitch> {
        self.0.as_ref()
    }

    pub fn into_pitch(self) -> Option<Pitch> {
        self.0
    }

    /// Empty string for the empty snapshot, so two empty snapshots compare equal by id.
    pub fn id_str(&self) -> &str {
        self.0.as_ref().map(|p| p.id.as_str()).unwrap_or("")
    }

    pub fn to_document(&self) -> PitchDocument {
        self.0.as_ref().map(PitchDocument::from).unwrap_or_default()
    }

    pub fn from_document(doc: PitchDocument) -> Result<Self, ContractViolation> {
        Ok(Self(doc.into_pitch()?))
    }
}

pub fn format_display_minute(at: DateTime<Utc>, tz: Tz) -> String {
    at.with_timezone(&tz).format(DISPLAY_MINUTE_FORMAT).to_string()
}

pub fn format_display_second(at: DateTime<Utc>, tz: Tz) -> String {
    at.with_timezone(&tz).format(DISPLAY_SECOND_FORMAT).to_string()
}

/// Countdown to `scheduled_at` as `"- 01h 02m 03s"` before the pitch and
/// `" 01h 02m 03s"` once it is overdue.
pub fn format_countdown(now: DateTime<Utc>, scheduled_at: DateTime<Utc>) -> String {
    let delta = now.signed_duration_since(scheduled_at);
    let sign = if delta < chrono::Duration::zero() { "-" } else { "" };
    let total = delta.num_seconds().unsigned_abs();
    let hrs = total / 3600;
    let min = (total % 3600) / 60;
    let sec = total % 60;
    format!("{sign} {hrs:02}h {min:02}m {sec:02}s")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn pitch(id: &str) -> Pitch {
        Pitch::from_draft(
            PitchId::new(id).unwrap(),
            PitchDraft::v1("Ada", "Engines", at(2024, 6, 1, 12, 0)),
            at(2024, 5, 1, 9, 0),
        )
    }

    #[test]
    fn at_pitch_01_id_rejects_empty_and_whitespace() {
        assert!(matches!(
            PitchId::new(""),
            Err(ContractViolation::MissingField { field: "pitch.id" })
        ));
        assert!(PitchId::new("2024 01").is_err());
        assert_eq!(PitchId::new("202401").unwrap().as_str(), "202401");
    }

    #[test]
    fn at_pitch_02_draft_requires_speaker_title_and_future_date() {
        let now = at(2024, 5, 1, 9, 0);
        let ok = PitchDraft::v1("Ada", "Engines", at(2024, 6, 1, 12, 0));
        assert!(ok.validate_at(now).is_ok());

        let blank = PitchDraft::v1("  ", "Engines", at(2024, 6, 1, 12, 0));
        assert!(matches!(
            blank.validate_at(now),
            Err(ContractViolation::MissingField {
                field: "pitch.speaker"
            })
        ));

        let past = PitchDraft::v1("Ada", "Engines", now);
        assert!(matches!(
            past.validate_at(now),
            Err(ContractViolation::InvalidValue {
                field: "pitch.date",
                ..
            })
        ));
    }

    #[test]
    fn at_pitch_03_document_uses_wire_field_names() {
        let json = serde_json::to_value(pitch("202401")).unwrap();
        assert_eq!(json["id"], "202401");
        assert_eq!(json["speaker"], "Ada");
        assert_eq!(json["started"], false);
        assert!(json["startedat"].is_null());
        assert_eq!(json["date"], "2024-06-01T12:00:00Z");
        assert_eq!(json["registeredat"], "2024-05-01T09:00:00Z");
    }

    #[test]
    fn at_pitch_04_empty_document_is_empty_snapshot() {
        let snapshot = NextPitchSnapshot::from_document(PitchDocument::default()).unwrap();
        assert_eq!(snapshot, NextPitchSnapshot::empty());
        assert_eq!(snapshot.id_str(), "");
        let parsed: PitchDocument = serde_json::from_str("{}").unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn at_pitch_05_startedat_ignored_unless_started() {
        let mut doc = pitch("202401").to_document();
        doc.startedat = Some(at(1, 1, 1, 0, 0));
        let p = doc.into_pitch().unwrap().unwrap();
        assert!(!p.is_released());
    }

    #[test]
    fn at_pitch_06_display_line_uses_zurich_time() {
        // 12:00 UTC on 1 June is 14:00 in Zurich (CEST).
        assert_eq!(
            pitch("202401").display_line(DEFAULT_DISPLAY_TZ),
            "Ada - Engines - 01.06.2024 14:00"
        );
    }

    #[test]
    fn at_pitch_07_countdown_sign_and_fields() {
        let scheduled = at(2024, 6, 1, 12, 0);
        let before = scheduled - chrono::Duration::seconds(3723);
        assert_eq!(format_countdown(before, scheduled), "- 01h 02m 03s");
        let after = scheduled + chrono::Duration::seconds(59);
        assert_eq!(format_countdown(after, scheduled), " 00h 00m 59s");
    }
}
