#![forbid(unsafe_code)]

pub mod common;
pub mod device;
pub mod pitch;

pub use common::{ContractViolation, SchemaVersion, Validate};
