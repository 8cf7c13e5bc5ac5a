#![forbid(unsafe_code)]

pub mod config;
pub mod controller;
pub mod display;
pub mod hardware;
pub mod keypad;
pub mod registry;
pub mod runtime;
pub mod sync;
pub mod watchers;

pub use config::{BoardConfig, ConfigError, DeviceConfig, SignConfig};
pub use controller::{ControllerEvent, ControllerStep, ReleaseController, ReleaseState};
pub use runtime::{DeviceParts, DeviceRuntime};
