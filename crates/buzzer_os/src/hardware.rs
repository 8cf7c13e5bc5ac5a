#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error("hardware initialization failed: {0}")]
    Init(String),

    #[error("gpio {pin} access failed: {source}")]
    Io {
        pin: u8,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed device data: {0}")]
    Protocol(String),

    #[error("input device failed: {0}")]
    Device(#[from] std::io::Error),
}

/// Digital I/O board: switches in, relays out. Reads report the raw electrical
/// level; callers decide polarity.
pub trait DigitalBoard: Send + Sync {
    fn read_input(&self, pin: u8) -> Result<bool, HardwareError>;

    fn write_output(&self, pin: u8, high: bool) -> Result<(), HardwareError>;
}

/// Pin assignment for the buzzer box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardLayout {
    pub light_relay: u8,
    pub horn_relay: u8,
    pub confirm_switch: u8,
    pub light_button: u8,
    pub horn_button: u8,
    /// Switches pull the line low when pressed.
    pub inputs_active_low: bool,
}

impl Default for BoardLayout {
    fn default() -> Self {
        Self {
            light_relay: 17,
            horn_relay: 27,
            confirm_switch: 22,
            light_button: 23,
            horn_button: 24,
            inputs_active_low: true,
        }
    }
}

impl BoardLayout {
    pub fn inputs(&self) -> [u8; 3] {
        [self.confirm_switch, self.light_button, self.horn_button]
    }

    pub fn outputs(&self) -> [u8; 2] {
        [self.light_relay, self.horn_relay]
    }

    pub fn is_active(&self, level: bool) -> bool {
        level != self.inputs_active_low
    }
}

/// Linux sysfs GPIO (`<base>/gpioN/value`).
#[derive(Debug, Clone)]
pub struct SysfsGpioBoard {
    base: PathBuf,
}

impl SysfsGpioBoard {
    /// Exports every pin in `layout` and sets its direction. Fails if the
    /// gpio root is missing or a pin cannot be configured.
    pub fn open(base: impl Into<PathBuf>, layout: &BoardLayout) -> Result<Self, HardwareError> {
        let base = base.into();
        if !base.is_dir() {
            return Err(HardwareError::Init(format!(
                "gpio root '{}' not found",
                base.display()
            )));
        }
        let board = Self { base };
        for pin in layout.inputs() {
            board.configure(pin, "in")?;
        }
        for pin in layout.outputs() {
            board.configure(pin, "out")?;
        }
        info!(base = %board.base.display(), "gpio board ready");
        Ok(board)
    }

    fn pin_dir(&self, pin: u8) -> PathBuf {
        self.base.join(format!("gpio{pin}"))
    }

    fn configure(&self, pin: u8, direction: &str) -> Result<(), HardwareError> {
        let dir = self.pin_dir(pin);
        if !dir.exists() {
            write_sysfs(&self.base.join("export"), &pin.to_string())
                .map_err(|err| HardwareError::Init(format!("export gpio{pin}: {err}")))?;
        }
        write_sysfs(&dir.join("direction"), direction)
            .map_err(|err| HardwareError::Init(format!("direction gpio{pin}: {err}")))?;
        debug!(pin, direction, "gpio configured");
        Ok(())
    }
}

fn write_sysfs(path: &Path, value: &str) -> std::io::Result<()> {
    fs::write(path, value.as_bytes())
}

impl DigitalBoard for SysfsGpioBoard {
    fn read_input(&self, pin: u8) -> Result<bool, HardwareError> {
        let raw = fs::read_to_string(self.pin_dir(pin).join("value"))
            .map_err(|source| HardwareError::Io { pin, source })?;
        match raw.trim() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(HardwareError::Protocol(format!(
                "gpio{pin} value '{other}'"
            ))),
        }
    }

    fn write_output(&self, pin: u8, high: bool) -> Result<(), HardwareError> {
        let value = if high { "1" } else { "0" };
        write_sysfs(&self.pin_dir(pin).join("value"), value)
            .map_err(|source| HardwareError::Io { pin, source })
    }
}

/// Board kept entirely in memory. Unset inputs read high (released, for an
/// active-low layout).
#[derive(Debug, Default)]
pub struct MemoryBoard {
    inputs: Mutex<BTreeMap<u8, bool>>,
    outputs: Mutex<BTreeMap<u8, bool>>,
}

impl MemoryBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_input(&self, pin: u8, level: bool) {
        self.inputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pin, level);
    }

    pub fn output(&self, pin: u8) -> bool {
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pin)
            .copied()
            .unwrap_or(false)
    }
}

impl DigitalBoard for MemoryBoard {
    fn read_input(&self, pin: u8) -> Result<bool, HardwareError> {
        Ok(self
            .inputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pin)
            .copied()
            .unwrap_or(true))
    }

    fn write_output(&self, pin: u8, high: bool) -> Result<(), HardwareError> {
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pin, high);
        Ok(())
    }
}

/// One relay-driven output (light or horn). The last commanded state is kept
/// in an atomic so watcher tasks and the controller can share it.
pub struct Output {
    name: &'static str,
    board: Arc<dyn DigitalBoard>,
    relay: u8,
    on: AtomicBool,
}

impl std::fmt::Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Output")
            .field("name", &self.name)
            .field("relay", &self.relay)
            .field("on", &self.is_on())
            .finish()
    }
}

impl Output {
    pub fn new(name: &'static str, board: Arc<dyn DigitalBoard>, relay: u8) -> Self {
        Self {
            name,
            board,
            relay,
            on: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn on(&self) -> Result<(), HardwareError> {
        self.board.write_output(self.relay, true)?;
        self.on.store(true, Ordering::SeqCst);
        info!(output = self.name, "output on");
        Ok(())
    }

    pub fn off(&self) -> Result<(), HardwareError> {
        self.board.write_output(self.relay, false)?;
        if self.on.swap(false, Ordering::SeqCst) {
            info!(output = self.name, "output off");
        }
        Ok(())
    }

    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct OutputPair {
    pub light: Arc<Output>,
    pub horn: Arc<Output>,
}

impl OutputPair {
    pub fn from_layout(board: Arc<dyn DigitalBoard>, layout: &BoardLayout) -> Self {
        Self {
            light: Arc::new(Output::new("light", board.clone(), layout.light_relay)),
            horn: Arc::new(Output::new("horn", board, layout.horn_relay)),
        }
    }

    /// Switches both on; a failure on one does not skip the other.
    pub fn all_on(&self) {
        for output in [&self.light, &self.horn] {
            if let Err(err) = output.on() {
                warn!(output = output.name(), error = %err, "output could not be switched on");
            }
        }
    }

    pub fn all_off(&self) {
        for output in [&self.light, &self.horn] {
            if let Err(err) = output.off() {
                warn!(output = output.name(), error = %err, "output could not be switched off");
            }
        }
    }

    pub fn both_on(&self) -> bool {
        self.light.is_on() && self.horn.is_on()
    }
}
