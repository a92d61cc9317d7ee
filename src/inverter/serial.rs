use crate::prelude::*;

use serde::{Serialize, Serializer};

pub const SERIAL_LEN: usize = 10;

/// Fixed-width ASCII identifier carried by both wire formats (dongle and inverter serials).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Serial([u8; SERIAL_LEN]);

impl Serial {
    pub fn as_bytes(&self) -> &[u8; SERIAL_LEN] {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// True when every byte is a printable ASCII letter or digit, as real serials are.
    pub fn is_plausible(&self) -> bool {
        self.0.iter().all(|b| b.is_ascii_alphanumeric())
    }
}

impl From<[u8; SERIAL_LEN]> for Serial {
    fn from(bytes: [u8; SERIAL_LEN]) -> Self {
        Self(bytes)
    }
}

// short input is zero padded, long input truncated
impl From<&[u8]> for Serial {
    fn from(bytes: &[u8]) -> Self {
        let mut result = [0u8; SERIAL_LEN];
        let len = std::cmp::min(bytes.len(), SERIAL_LEN);
        result[..len].copy_from_slice(&bytes[..len]);
        Self(result)
    }
}

impl From<&str> for Serial {
    fn from(s: &str) -> Self {
        Self::from(s.as_bytes())
    }
}

impl std::fmt::Display for Serial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(SERIAL_LEN);
        write!(f, "{}", String::from_utf8_lossy(&self.0[..end]))
    }
}

impl std::fmt::Debug for Serial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Serial({})", self)
    }
}

impl Serialize for Serial {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl std::str::FromStr for Serial {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != SERIAL_LEN {
            bail!("{} must be exactly {} characters", s, SERIAL_LEN);
        }

        let mut r = [0u8; SERIAL_LEN];
        r.copy_from_slice(s.as_bytes());
        Ok(Self(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_short_input() {
        let serial = Serial::from("AB12");
        assert_eq!(serial.as_bytes(), b"AB12\0\0\0\0\0\0");
        assert_eq!(serial.to_string(), "AB12");
        assert!(!serial.is_plausible());
    }

    #[test]
    fn from_str_requires_exact_length() {
        assert!(Serial::from_str("0123456789").is_ok());
        assert!(Serial::from_str("012345678").is_err());
        assert!(Serial::from_str("0123456789A").is_err());
    }

    #[test]
    fn blank_serial() {
        assert!(Serial::default().is_blank());
        assert!(!Serial::from("1").is_blank());
    }
}
