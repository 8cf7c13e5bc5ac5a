#![forbid(unsafe_code)]

//! Framing for the serial LED sign.
//!
//! Start packet, payload `"ABC"` with the fixed effect:
//!
//! ```text
//! 01 5A 30 30 02 41 41 1B 20   62   20   41 42 43   04
//! |-------- header ---------| |mod| |dh| |payload| |eot|
//! ```
//!
//! The stop packet is the same header with modifier `0x61`, the data header
//! and EOT, and no payload. The sign never acknowledges anything.

use std::io::Write;
use std::str::FromStr;

use buzzer_contracts::pitch::Pitch;
use chrono_tz::Tz;
use tracing::debug;

use crate::sink::{PitchSink, SinkError};

pub const PACKET_HEADER: [u8; 9] = [0x01, 0x5A, 0x30, 0x30, 0x02, 0x41, 0x41, 0x1B, 0x20];
pub const STOP_MODIFIER: u8 = 0x61;
pub const DATA_HEADER: u8 = 0x20;
pub const EOT: u8 = 0x04;

const PAYLOAD_REPLACEMENT: u8 = b'?';

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("no such effect: {0}")]
    UnknownEffect(String),

    #[error("sign transport failed: {0}")]
    Transport(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SignEffect {
    #[default]
    Rotate,
    Fixed,
    Flash,
    RollUp,
    RollDown,
    RollLeft,
    RollRight,
    WipeUp,
    WipeDown,
}

impl SignEffect {
    pub const ALL: [SignEffect; 9] = [
        SignEffect::Rotate,
        SignEffect::Fixed,
        SignEffect::Flash,
        SignEffect::RollUp,
        SignEffect::RollDown,
        SignEffect::RollLeft,
        SignEffect::RollRight,
        SignEffect::WipeUp,
        SignEffect::WipeDown,
    ];

    pub fn modifier(self) -> u8 {
        match self {
            SignEffect::Rotate => b'a',
            SignEffect::Fixed => b'b',
            SignEffect::Flash => b'c',
            SignEffect::RollUp => b'e',
            SignEffect::RollDown => b'f',
            SignEffect::RollLeft => b'g',
            SignEffect::RollRight => b'h',
            SignEffect::WipeUp => b'i',
            SignEffect::WipeDown => b'j',
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SignEffect::Rotate => "rotate",
            SignEffect::Fixed => "fixed",
            SignEffect::Flash => "flash",
            SignEffect::RollUp => "rollUp",
            SignEffect::RollDown => "rollDown",
            SignEffect::RollLeft => "rollLeft",
            SignEffect::RollRight => "rollRight",
            SignEffect::WipeUp => "wipeUp",
            SignEffect::WipeDown => "wipeDown",
        }
    }
}

impl FromStr for SignEffect {
    type Err = SignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SignEffect::ALL
            .into_iter()
            .find(|e| e.name() == s)
            .ok_or_else(|| SignError::UnknownEffect(s.to_string()))
    }
}

pub fn encode_start(effect: SignEffect, text: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PACKET_HEADER.len() + text.len() + 3);
    buf.extend_from_slice(&PACKET_HEADER);
    buf.push(effect.modifier());
    buf.push(DATA_HEADER);
    buf.extend(text.chars().map(payload_byte));
    buf.push(EOT);
    buf
}

pub fn encode_stop() -> Vec<u8> {
    let mut buf = Vec::with_capacity(PACKET_HEADER.len() + 3);
    buf.extend_from_slice(&PACKET_HEADER);
    buf.push(STOP_MODIFIER);
    buf.push(DATA_HEADER);
    buf.push(EOT);
    buf
}

// Payload must stay printable ASCII so it can never contain framing bytes.
fn payload_byte(c: char) -> u8 {
    if c.is_ascii() && !c.is_ascii_control() {
        c as u8
    } else {
        PAYLOAD_REPLACEMENT
    }
}

/// Drives a sign over any byte transport (a serial device file in production).
#[derive(Debug)]
pub struct SignProtocol<W: Write> {
    transport: W,
    effect: SignEffect,
}

impl<W: Write> SignProtocol<W> {
    pub fn new(transport: W) -> Self {
        Self {
            transport,
            effect: SignEffect::default(),
        }
    }

    pub fn with_effect(mut self, effect: SignEffect) -> Self {
        self.effect = effect;
        self
    }

    pub fn set_effect(&mut self, effect: SignEffect) {
        self.effect = effect;
    }

    pub fn effect(&self) -> SignEffect {
        self.effect
    }

    pub fn start(&mut self, text: &str) -> Result<(), SignError> {
        self.send(&encode_start(self.effect, text))
    }

    pub fn stop(&mut self) -> Result<(), SignError> {
        self.send(&encode_stop())
    }

    /// Full redraw: stop, then start with the new text.
    pub fn update(&mut self, text: &str) -> Result<(), SignError> {
        self.stop()?;
        self.start(text)
    }

    pub fn transport_ref(&self) -> &W {
        &self.transport
    }

    pub fn into_inner(self) -> W {
        self.transport
    }

    fn send(&mut self, packet: &[u8]) -> Result<(), SignError> {
        self.transport.write_all(packet)?;
        self.transport.flush()?;
        debug!(bytes = packet.len(), "sign packet sent");
        Ok(())
    }
}

/// Plugs a sign into the sync loop, rendering each pitch as its display line.
#[derive(Debug)]
pub struct SignSink<W: Write> {
    protocol: SignProtocol<W>,
    display_tz: Tz,
}

impl<W: Write> SignSink<W> {
    pub fn new(protocol: SignProtocol<W>, display_tz: Tz) -> Self {
        Self {
            protocol,
            display_tz,
        }
    }

    pub fn protocol_ref(&self) -> &SignProtocol<W> {
        &self.protocol
    }
}

impl<W: Write + Send> PitchSink for SignSink<W> {
    fn update(&mut self, pitch: &Pitch) -> Result<(), SinkError> {
        let line = pitch.display_line(self.display_tz);
        self.protocol.update(&line).map_err(SinkError::from)
    }

    fn stop(&mut self) -> Result<(), SinkError> {
        self.protocol.stop().map_err(SinkError::from)
    }
}
