#![forbid(unsafe_code)]

pub mod registry_client;
pub mod sign;
pub mod sink;
