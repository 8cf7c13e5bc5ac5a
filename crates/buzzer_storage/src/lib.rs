#![forbid(unsafe_code)]

pub mod devices;
pub mod error;
pub mod next_pitch;
mod persist;
pub mod pitch_store;

pub use devices::DeviceRegistry;
pub use error::StorageError;
pub use next_pitch::NextPitchCache;
pub use pitch_store::PitchStore;
