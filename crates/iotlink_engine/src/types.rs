//! Value types shared across the engine seam.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of characters in a device UID.
pub const UID_LEN: usize = 20;

/// Opaque handle the engine assigns to an open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u32);

impl SessionId {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returned when a string cannot be used as a [`DeviceUid`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("device UID must be exactly {UID_LEN} characters, got {length}")]
pub struct UidError {
    pub length: usize,
}

/// A validated 20-character device identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceUid(String);

impl DeviceUid {
    /// Validate `raw` as a device UID.
    pub fn parse(raw: impl Into<String>) -> Result<Self, UidError> {
        let raw = raw.into();
        let length = raw.chars().count();
        if length != UID_LEN {
            return Err(UidError { length });
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DeviceUid {
    type Error = UidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<DeviceUid> for String {
    fn from(uid: DeviceUid) -> Self {
        uid.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_accepts_exact_length() {
        let uid = DeviceUid::parse("ABCDEFGHIJ1234567890").unwrap();
        assert_eq!(uid.as_str(), "ABCDEFGHIJ1234567890");
        assert_eq!(uid.to_string().len(), UID_LEN);
    }

    #[test]
    fn test_uid_rejects_wrong_lengths() {
        for bad in ["", "SHORT", "ABCDEFGHIJ123456789", "ABCDEFGHIJ12345678901"] {
            let err = DeviceUid::parse(bad).unwrap_err();
            assert_eq!(err.length, bad.chars().count());
        }
    }

    #[test]
    fn test_uid_counts_characters_not_bytes() {
        // 20 characters, more than 20 bytes.
        let uid = DeviceUid::parse("ÄBCDEFGHIJ123456789Ö");
        assert!(uid.is_ok());
    }
}
