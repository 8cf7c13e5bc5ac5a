#![forbid(unsafe_code)]

use std::io::Write;
use std::sync::{Mutex, MutexGuard, PoisonError};

use buzzer_contracts::pitch::{format_countdown, format_display_second, Pitch, PitchId};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::warn;

pub const KEYPAD_PROMPT: &str = "Enter a valid Pitch Code to release the Buzzer ... ";
pub const ARMED_TEXT: &str = "Pitch Code valid - Please press the Buzzer to release the Pitch ...\n";

pub fn keypad_text(code: &str) -> String {
    format!("{code}\n{KEYPAD_PROMPT}")
}

pub fn released_text(at: DateTime<Utc>, id: &PitchId, tz: Tz) -> String {
    format!("{} - Pitch {id} released", format_display_second(at, tz))
}

pub fn error_text(err: &dyn std::fmt::Display) -> String {
    format!("ERROR: {err}")
}

pub fn status_text(address: &str) -> String {
    format!("IP: {address}")
}

/// Operator-facing screen of the buzzer box. Implementations must tolerate
/// calls from the controller thread and the refresh task concurrently.
pub trait StatusDisplay: Send + Sync {
    fn show_pitch(&self, pitch: &Pitch);

    fn show_keypad(&self, text: &str);

    fn show_status(&self, text: &str);

    /// Redraws time-dependent content (the countdown).
    fn refresh(&self, now: DateTime<Utc>);

    fn clear(&self);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayState {
    pub pitch_line: String,
    pub countdown: String,
    pub keypad: String,
    pub status: String,
    scheduled_at: Option<DateTime<Utc>>,
}

impl DisplayState {
    fn render(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n",
            self.pitch_line, self.countdown, self.keypad, self.status
        )
    }
}

/// Text screen: every change redraws the whole frame to `out`.
pub struct ConsoleDisplay<W: Write + Send> {
    state: Mutex<DisplayState>,
    out: Mutex<W>,
    tz: Tz,
}

impl<W: Write + Send> ConsoleDisplay<W> {
    pub fn new(out: W, tz: Tz) -> Self {
        Self {
            state: Mutex::new(DisplayState {
                keypad: keypad_text(""),
                ..DisplayState::default()
            }),
            out: Mutex::new(out),
            tz,
        }
    }

    pub fn state(&self) -> DisplayState {
        self.lock_state().clone()
    }

    pub fn with_output<T>(&self, f: impl FnOnce(&W) -> T) -> T {
        f(&self.out.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn lock_state(&self) -> MutexGuard<'_, DisplayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut DisplayState)) {
        let frame = {
            let mut state = self.lock_state();
            let before = state.clone();
            f(&mut state);
            if *state == before {
                return;
            }
            state.render()
        };
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = out.write_all(frame.as_bytes()).and_then(|_| out.flush()) {
            warn!(error = %err, "display write failed");
        }
    }
}

impl<W: Write + Send> StatusDisplay for ConsoleDisplay<W> {
    fn show_pitch(&self, pitch: &Pitch) {
        let line = pitch.display_line(self.tz);
        self.update(|s| {
            s.pitch_line = line;
            s.scheduled_at = Some(pitch.scheduled_at);
        });
    }

    fn show_keypad(&self, text: &str) {
        self.update(|s| s.keypad = text.to_string());
    }

    fn show_status(&self, text: &str) {
        self.update(|s| s.status = text.to_string());
    }

    fn refresh(&self, now: DateTime<Utc>) {
        self.update(|s| {
            if let Some(at) = s.scheduled_at {
                s.countdown = format_countdown(now, at);
            }
        });
    }

    fn clear(&self) {
        self.update(|s| *s = DisplayState::default());
    }
}
