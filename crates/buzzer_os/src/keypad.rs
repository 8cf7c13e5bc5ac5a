#![forbid(unsafe_code)]

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::hardware::HardwareError;

pub const EV_KEY: u16 = 1;
pub const KEY_STATE_DOWN: i32 = 1;

/// `struct input_event` on 64-bit Linux: timeval (16) + type + code + value.
pub const INPUT_EVENT_SIZE: usize = 24;

pub const KEY_KP0: u16 = 82;
pub const KEY_KP1: u16 = 79;
pub const KEY_KP2: u16 = 80;
pub const KEY_KP3: u16 = 81;
pub const KEY_KP4: u16 = 75;
pub const KEY_KP5: u16 = 76;
pub const KEY_KP6: u16 = 77;
pub const KEY_KP7: u16 = 71;
pub const KEY_KP8: u16 = 72;
pub const KEY_KP9: u16 = 73;
pub const KEY_KPENTER: u16 = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawInputEvent {
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

impl RawInputEvent {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, HardwareError> {
        if buf.len() != INPUT_EVENT_SIZE {
            return Err(HardwareError::Protocol(format!(
                "input event of {} bytes, expected {INPUT_EVENT_SIZE}",
                buf.len()
            )));
        }
        Ok(Self {
            kind: u16::from_ne_bytes([buf[16], buf[17]]),
            code: u16::from_ne_bytes([buf[18], buf[19]]),
            value: i32::from_ne_bytes([buf[20], buf[21], buf[22], buf[23]]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeypadEvent {
    Digit(char),
    Enter,
}

/// Keypad digit keys and the digit each one produces.
pub const KEYPAD_DIGITS: [(u16, char); 10] = [
    (KEY_KP0, '0'),
    (KEY_KP1, '1'),
    (KEY_KP2, '2'),
    (KEY_KP3, '3'),
    (KEY_KP4, '4'),
    (KEY_KP5, '5'),
    (KEY_KP6, '6'),
    (KEY_KP7, '7'),
    (KEY_KP8, '8'),
    (KEY_KP9, '9'),
];

/// Only key-down events of numeric keypad keys are meaningful; everything
/// else (releases, autorepeat, sync events, other keys) decodes to `None`.
pub fn decode_key(raw: RawInputEvent) -> Option<KeypadEvent> {
    if raw.kind != EV_KEY || raw.value != KEY_STATE_DOWN {
        return None;
    }
    if raw.code == KEY_KPENTER {
        return Some(KeypadEvent::Enter);
    }
    KEYPAD_DIGITS
        .iter()
        .find(|(code, _)| *code == raw.code)
        .map(|(_, digit)| KeypadEvent::Digit(*digit))
}

pub fn scancode_for_digit(digit: char) -> Option<u16> {
    KEYPAD_DIGITS
        .iter()
        .find(|(_, d)| *d == digit)
        .map(|(code, _)| *code)
}

/// Blocking source of raw key events.
pub trait KeypadSource: Send {
    fn next_event(&mut self) -> Result<RawInputEvent, HardwareError>;
}

/// Reads `struct input_event` records from an evdev character device.
#[derive(Debug)]
pub struct EvdevKeypad {
    path: PathBuf,
    file: File,
}

impl EvdevKeypad {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, HardwareError> {
        let path = path.into();
        let file = File::open(&path).map_err(|err| {
            HardwareError::Init(format!("open keypad '{}': {err}", path.display()))
        })?;
        info!(path = %path.display(), "keypad opened");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeypadSource for EvdevKeypad {
    fn next_event(&mut self) -> Result<RawInputEvent, HardwareError> {
        let mut buf = [0u8; INPUT_EVENT_SIZE];
        let mut filled = 0;
        while filled < INPUT_EVENT_SIZE {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Err(HardwareError::Device(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "keypad device closed",
                    )));
                }
                return RawInputEvent::from_bytes(&buf[..filled]);
            }
            filled += n;
        }
        RawInputEvent::from_bytes(&buf)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeypadSelector {
    Path(PathBuf),
    /// Substring of the device name reported by the kernel.
    Name(String),
}

impl KeypadSelector {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if raw.starts_with('/') {
            Some(KeypadSelector::Path(PathBuf::from(raw)))
        } else {
            Some(KeypadSelector::Name(raw.to_string()))
        }
    }

    /// Resolves to an event device path. Names are looked up under
    /// `<sys_input>/eventN/device/name` and mapped to `<dev_input>/eventN`.
    pub fn resolve(&self, sys_input: &Path, dev_input: &Path) -> Result<PathBuf, HardwareError> {
        match self {
            KeypadSelector::Path(p) => Ok(p.clone()),
            KeypadSelector::Name(name) => {
                let entries = fs::read_dir(sys_input).map_err(|err| {
                    HardwareError::Init(format!(
                        "list input devices '{}': {err}",
                        sys_input.display()
                    ))
                })?;
                let mut candidates: Vec<String> = entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| e.file_name().into_string().ok())
                    .filter(|n| n.starts_with("event"))
                    .collect();
                candidates.sort();
                for event in candidates {
                    let dev_name =
                        fs::read_to_string(sys_input.join(&event).join("device").join("name"))
                            .unwrap_or_default();
                    if dev_name.contains(name.as_str()) {
                        return Ok(dev_input.join(event));
                    }
                }
                Err(HardwareError::Init(format!(
                    "no input device matching '{name}' found"
                )))
            }
        }
    }
}
