//! PLC device address parsing and formatting
//!
//! Address notation is a device letter (or multi-letter prefix) followed by
//! a numeric offset, decimal or hex depending on the device. Unknown
//! prefixes are rejected here, at configuration load, never at read time.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("unrecognized device prefix in address {0:?}")]
    UnknownDevice(String),
    #[error("invalid offset in address {0:?}")]
    InvalidOffset(String),
    #[error("empty address")]
    Empty,
}

/// Supported Mitsubishi device codes. Ordering matters for prefix matching:
/// multi-letter prefixes (`SM`, `SD`, `ZR`) must be tried before the
/// single-letter ones they would otherwise collide with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceCode {
    D,
    W,
    M,
    B,
    X,
    Y,
    Sm,
    Sd,
    R,
    Zr,
}

impl DeviceCode {
    /// All recognized prefixes, longest first so parsing never matches a
    /// two-letter device as a one-letter device plus a stray character.
    const ALL: &'static [(&'static str, DeviceCode)] = &[
        ("SM", DeviceCode::Sm),
        ("SD", DeviceCode::Sd),
        ("ZR", DeviceCode::Zr),
        ("D", DeviceCode::D),
        ("W", DeviceCode::W),
        ("M", DeviceCode::M),
        ("B", DeviceCode::B),
        ("X", DeviceCode::X),
        ("Y", DeviceCode::Y),
        ("R", DeviceCode::R),
    ];

    /// Notation prefix as written by an operator, e.g. `"D"`, `"SM"`.
    pub fn prefix(self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(_, d)| *d == self)
            .map(|(p, _)| *p)
            .expect("exhaustive")
    }

    /// Two-character ASCII device code used on the wire in an MC3E frame.
    pub fn wire_code(self) -> &'static str {
        match self {
            DeviceCode::D => "D*",
            DeviceCode::W => "W*",
            DeviceCode::M => "M*",
            DeviceCode::B => "B*",
            DeviceCode::X => "X*",
            DeviceCode::Y => "Y*",
            DeviceCode::Sm => "SM",
            DeviceCode::Sd => "SD",
            DeviceCode::R => "R*",
            DeviceCode::Zr => "ZR",
        }
    }

    /// Whether this device is read as individual bits rather than 16-bit words.
    pub fn is_bit_device(self) -> bool {
        matches!(
            self,
            DeviceCode::M | DeviceCode::B | DeviceCode::X | DeviceCode::Y | DeviceCode::Sm
        )
    }

    /// Whether operator notation for this device's offset is hexadecimal.
    /// `X`/`Y` (physical I/O) and `B` (link relay) are conventionally hex;
    /// the rest are decimal.
    fn offset_is_hex(self) -> bool {
        matches!(self, DeviceCode::X | DeviceCode::Y | DeviceCode::B)
    }
}

/// A single device address: device code plus numeric offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress {
    pub device: DeviceCode,
    pub offset: u32,
}

impl DeviceAddress {
    pub fn new(device: DeviceCode, offset: u32) -> Self {
        Self { device, offset }
    }

    /// Parse operator notation, e.g. `"D100"`, `"X1A"`, `"SM400"`.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddressError::Empty);
        }
        let upper = s.to_uppercase();

        let (prefix, device) = DeviceCode::ALL
            .iter()
            .find(|(p, _)| upper.starts_with(p))
            .ok_or_else(|| AddressError::UnknownDevice(s.to_string()))?;

        let rest = &upper[prefix.len()..];
        if rest.is_empty() {
            return Err(AddressError::InvalidOffset(s.to_string()));
        }

        let offset = if device.offset_is_hex() {
            u32::from_str_radix(rest, 16)
        } else {
            rest.parse::<u32>()
        }
        .map_err(|_| AddressError::InvalidOffset(s.to_string()))?;

        Ok(DeviceAddress::new(*device, offset))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.device.offset_is_hex() {
            write!(f, "{}{:X}", self.device.prefix(), self.offset)
        } else {
            write!(f, "{}{}", self.device.prefix(), self.offset)
        }
    }
}
