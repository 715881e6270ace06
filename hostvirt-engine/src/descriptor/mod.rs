//! Structured libvirt documents.
//!
//! Every document exchanged with the hypervisor is a serde struct encoded and
//! decoded with `quick-xml`. Attributes are fields renamed `@name`, element
//! text is `$text`. Nothing in the engine looks at the XML as a string.

mod builder;
mod domain;
mod host;
pub mod patch;
mod snapshot;
mod storage;

pub use builder::{DomainSpec, PciAddress, ResolvedSpec, CONFIG_ISO_TARGET, INSTALLER_ISO_TARGET};
pub use domain::*;
pub use host::*;
pub use snapshot::*;
pub use storage::*;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{HypervisorError, Result};

/// Encode a document, indented two spaces.
pub fn to_xml<T: Serialize>(value: &T) -> Result<String> {
    let mut buffer = String::new();
    let mut serializer = quick_xml::se::Serializer::new(&mut buffer);
    serializer.indent(' ', 2);
    value.serialize(serializer)?;
    Ok(buffer)
}

/// Decode a document.
pub fn from_xml<T: DeserializeOwned>(xml: &str) -> Result<T> {
    Ok(quick_xml::de::from_str(xml)?)
}

/// An element that is either present and empty, like `<readonly/>`, or absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flag {}

/// A number with a `unit` attribute, like `<capacity unit='bytes'>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaledValue {
    #[serde(rename = "@unit", skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(rename = "$text")]
    pub value: u64,
}

impl ScaledValue {
    pub fn new(unit: &str, value: u64) -> Self {
        Self { unit: Some(unit.to_string()), value }
    }

    pub fn bytes(value: u64) -> Self {
        Self::new("bytes", value)
    }

    pub fn kib(value: u64) -> Self {
        Self::new("KiB", value)
    }

    /// The value in bytes, honouring libvirt's unit suffixes.
    pub fn to_bytes(&self) -> Result<u64> {
        let unit = self.unit.as_deref().unwrap_or("bytes");
        let multiplier: u64 = match unit {
            "b" | "B" | "bytes" => 1,
            "k" | "K" | "KiB" => 1 << 10,
            "KB" => 1_000,
            "m" | "M" | "MiB" => 1 << 20,
            "MB" => 1_000_000,
            "g" | "G" | "GiB" => 1 << 30,
            "GB" => 1_000_000_000,
            "t" | "T" | "TiB" => 1 << 40,
            "TB" => 1_000_000_000_000,
            "p" | "P" | "PiB" => 1 << 50,
            "PB" => 1_000_000_000_000_000,
            "e" | "E" | "EiB" => 1 << 60,
            "EB" => 1_000_000_000_000_000_000,
            other => return Err(HypervisorError::XmlError(format!("unknown size unit '{}'", other))),
        };
        self.value
            .checked_mul(multiplier)
            .ok_or_else(|| HypervisorError::XmlError(format!("size {} {} overflows 64 bits", self.value, unit)))
    }

    /// The value in KiB.
    pub fn to_kib(&self) -> Result<u64> {
        Ok(self.to_bytes()? / 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaled_value_units() {
        assert_eq!(ScaledValue::bytes(512).to_bytes().unwrap(), 512);
        assert_eq!(ScaledValue::kib(4).to_bytes().unwrap(), 4096);
        assert_eq!(ScaledValue::new("GiB", 2).to_bytes().unwrap(), 2 << 30);
        assert_eq!(ScaledValue::new("G", 20).to_kib().unwrap(), 20 * 1024 * 1024);
        assert_eq!(ScaledValue { unit: None, value: 7 }.to_bytes().unwrap(), 7);
    }

    #[test]
    fn test_scaled_value_decode() {
        let value: ScaledValue = from_xml("<capacity unit='bytes'>21474836480</capacity>").unwrap();
        assert_eq!(value.to_bytes().unwrap(), 20 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_unknown_unit_is_rejected() {
        let err = ScaledValue::new("furlongs", 3).to_bytes().unwrap_err();
        assert!(err.to_string().contains("unknown size unit 'furlongs'"));
        assert_eq!(ScaledValue::new("PiB", 1).to_bytes().unwrap(), 1 << 50);
        assert!(ScaledValue::new("EiB", 64).to_bytes().is_err());
    }
}
