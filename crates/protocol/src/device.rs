use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{DEVICE_ID_MAX_LEN, DEVICE_ID_MIN_LEN};

/// Error returned for a malformed device identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceIdError {
    #[error("device identifier must be {DEVICE_ID_MIN_LEN}-{DEVICE_ID_MAX_LEN} characters, got {0}")]
    Length(usize),

    #[error("device identifier must be alphanumeric")]
    NotAlphanumeric,
}

/// A short client-generated token identifying one participant for the
/// duration of a session.
///
/// Always validated: ASCII alphanumeric, 3-20 characters. The derived `Ord`
/// (lexicographic over the raw string) is the total order used for the
/// offer-initiator tie-break, so both peers compute the same winner.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Parses and validates a device identifier.
    pub fn parse(s: impl Into<String>) -> Result<Self, DeviceIdError> {
        let s = s.into();
        if s.len() < DEVICE_ID_MIN_LEN || s.len() > DEVICE_ID_MAX_LEN {
            return Err(DeviceIdError::Length(s.len()));
        }
        if !s.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(DeviceIdError::NotAlphanumeric);
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = DeviceIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}
