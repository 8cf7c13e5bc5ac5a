#![forbid(unsafe_code)]

pub mod pitch_cli;
