#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ContractViolation, Validate};

pub const DEVICE_NAME_MAX_LEN: usize = 64;
pub const DEVICE_ADDRESS_MAX_LEN: usize = 512;

/// Liveness ping body sent by devices to `POST /device`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub name: String,
    pub ip: String,
}

impl DeviceRegistration {
    pub fn v1(name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
        }
    }
}

impl Validate for DeviceRegistration {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.name.trim().is_empty() {
            return Err(ContractViolation::MissingField {
                field: "device.name",
            });
        }
        if self.name.len() > DEVICE_NAME_MAX_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "device.name",
                reason: "must be <= 64 bytes",
            });
        }
        if self.ip.len() > DEVICE_ADDRESS_MAX_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "device.ip",
                reason: "must be <= 512 bytes",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub name: String,
    #[serde(rename = "ip")]
    pub address: String,
    pub last_seen: DateTime<Utc>,
}

impl DeviceRecord {
    pub fn from_registration(reg: DeviceRegistration, last_seen: DateTime<Utc>) -> Self {
        Self {
            name: reg.name.trim().to_string(),
            address: reg.ip,
            last_seen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_device_01_registration_requires_name() {
        assert!(DeviceRegistration::v1("buzzer", "10.0.0.2/24").validate().is_ok());
        assert!(matches!(
            DeviceRegistration::v1(" ", "10.0.0.2/24").validate(),
            Err(ContractViolation::MissingField {
                field: "device.name"
            })
        ));
    }
}
