//! Device id table
//!
//! Decides which attached devices get a channel. Entries match either on
//! VID/PID or on the interface class triple.

use crate::device::DeviceIdentity;
use std::fmt;
use thiserror::Error;

/// Vendor/product of the default supported device
pub const DEFAULT_VENDOR_ID: u16 = 0x0499;
pub const DEFAULT_PRODUCT_ID: u16 = 0x3002;

/// Mass storage, transparent SCSI, bulk-only transport
pub const MASS_STORAGE_CLASS: u8 = 0x08;
pub const SCSI_SUBCLASS: u8 = 0x06;
pub const BULK_ONLY_PROTOCOL: u8 = 0x50;

/// Malformed `VID:PID` filter string
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid id filter '{filter}': {reason}")]
pub struct FilterError {
    pub filter: String,
    pub reason: String,
}

/// One id table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceMatch {
    /// Vendor ID plus product ID, `None` matching any product
    Device {
        vendor_id: u16,
        product_id: Option<u16>,
    },
    /// Interface class/subclass/protocol
    InterfaceInfo { class: u8, subclass: u8, protocol: u8 },
}

impl DeviceMatch {
    pub fn matches(&self, identity: &DeviceIdentity) -> bool {
        match *self {
            DeviceMatch::Device {
                vendor_id,
                product_id,
            } => {
                identity.vendor_id == vendor_id
                    && product_id.is_none_or(|pid| identity.product_id == pid)
            }
            DeviceMatch::InterfaceInfo {
                class,
                subclass,
                protocol,
            } => {
                identity.class == class
                    && identity.subclass == subclass
                    && identity.protocol == protocol
            }
        }
    }

    /// Parse a filter of the form `0xVVVV:0xPPPP` or `0xVVVV:*`
    pub fn parse_filter(filter: &str) -> Result<Self, FilterError> {
        let fail = |reason: String| FilterError {
            filter: filter.to_string(),
            reason,
        };

        let (vid, pid) = filter
            .split_once(':')
            .ok_or_else(|| fail("expected VID:PID (e.g. '0x1234:0x5678' or '0x1234:*')".into()))?;

        let vendor_id = parse_hex_id(vid, "VID").map_err(fail)?;
        let product_id = match pid {
            "*" => None,
            pid => Some(parse_hex_id(pid, "PID").map_err(fail)?),
        };

        Ok(DeviceMatch::Device {
            vendor_id,
            product_id,
        })
    }
}

impl fmt::Display for DeviceMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMatch::Device {
                vendor_id,
                product_id: Some(pid),
            } => write!(f, "{:04x}:{:04x}", vendor_id, pid),
            DeviceMatch::Device {
                vendor_id,
                product_id: None,
            } => write!(f, "{:04x}:*", vendor_id),
            DeviceMatch::InterfaceInfo {
                class,
                subclass,
                protocol,
            } => write!(f, "class {:02x}/{:02x}/{:02x}", class, subclass, protocol),
        }
    }
}

fn parse_hex_id(id: &str, what: &str) -> Result<u16, String> {
    let hex = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| format!("{} '{}' must start with '0x'", what, id))?;
    if hex.is_empty() || hex.len() > 4 {
        return Err(format!("{} '{}' must have 1-4 hex digits", what, id));
    }
    u16::from_str_radix(hex, 16).map_err(|_| format!("{} '{}' is not a hex number", what, id))
}

/// Ordered list of entries; a device matches if any entry matches
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdTable {
    entries: Vec<DeviceMatch>,
}

impl IdTable {
    /// Empty table, matching nothing
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in table: the default device and the mass-storage class
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.push(DeviceMatch::Device {
            vendor_id: DEFAULT_VENDOR_ID,
            product_id: Some(DEFAULT_PRODUCT_ID),
        });
        table.push(DeviceMatch::InterfaceInfo {
            class: MASS_STORAGE_CLASS,
            subclass: SCSI_SUBCLASS,
            protocol: BULK_ONLY_PROTOCOL,
        });
        table
    }

    pub fn push(&mut self, entry: DeviceMatch) {
        if !self.entries.contains(&entry) {
            self.entries.push(entry);
        }
    }

    pub fn entries(&self) -> &[DeviceMatch] {
        &self.entries
    }

    /// First entry matching `identity`
    pub fn find(&self, identity: &DeviceIdentity) -> Option<&DeviceMatch> {
        self.entries.iter().find(|entry| entry.matches(identity))
    }

    pub fn matches(&self, identity: &DeviceIdentity) -> bool {
        self.find(identity).is_some()
    }

    /// True if any entry can match on VID/PID alone
    pub fn matches_ids(&self, vendor_id: u16, product_id: u16) -> bool {
        self.entries.iter().any(|entry| {
            matches!(entry, DeviceMatch::Device { .. })
                && entry.matches(&DeviceIdentity {
                    vendor_id,
                    product_id,
                    class: 0,
                    subclass: 0,
                    protocol: 0,
                })
        })
    }
}

impl FromIterator<DeviceMatch> for IdTable {
    fn from_iter<I: IntoIterator<Item = DeviceMatch>>(iter: I) -> Self {
        let mut table = Self::new();
        for entry in iter {
            table.push(entry);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(vid: u16, pid: u16, class: u8, subclass: u8, protocol: u8) -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: vid,
            product_id: pid,
            class,
            subclass,
            protocol,
        }
    }

    #[test]
    fn test_default_table_matches_device_ids() {
        let table = IdTable::with_defaults();
        assert!(table.matches(&identity(0x0499, 0x3002, 0xff, 0, 0)));
        assert!(!table.matches(&identity(0x0499, 0x3003, 0xff, 0, 0)));
    }

    #[test]
    fn test_default_table_matches_mass_storage() {
        let table = IdTable::with_defaults();
        assert!(table.matches(&identity(0x1234, 0x5678, 0x08, 0x06, 0x50)));
        // UAS protocol is a different triple
        assert!(!table.matches(&identity(0x1234, 0x5678, 0x08, 0x06, 0x62)));
    }

    #[test]
    fn test_parse_filter() {
        assert_eq!(
            DeviceMatch::parse_filter("0x1234:0x5678").unwrap(),
            DeviceMatch::Device {
                vendor_id: 0x1234,
                product_id: Some(0x5678)
            }
        );
        assert_eq!(
            DeviceMatch::parse_filter("0XABCD:*").unwrap(),
            DeviceMatch::Device {
                vendor_id: 0xabcd,
                product_id: None
            }
        );
    }

    #[test]
    fn test_parse_filter_rejects_garbage() {
        for bad in ["1234:5678", "0x1234", "0x:0x1", "0x12345:0x1", "0xzz:0x1", "*:0x1"] {
            assert!(DeviceMatch::parse_filter(bad).is_err(), "{} accepted", bad);
        }
    }

    #[test]
    fn test_wildcard_product() {
        let table: IdTable = [DeviceMatch::parse_filter("0x1234:*").unwrap()]
            .into_iter()
            .collect();
        assert!(table.matches_ids(0x1234, 0x0001));
        assert!(table.matches_ids(0x1234, 0xffff));
        assert!(!table.matches_ids(0x1235, 0x0001));
    }

    #[test]
    fn test_push_deduplicates() {
        let mut table = IdTable::with_defaults();
        table.push(DeviceMatch::Device {
            vendor_id: DEFAULT_VENDOR_ID,
            product_id: Some(DEFAULT_PRODUCT_ID),
        });
        assert_eq!(table.entries().len(), 2);
    }

    #[test]
    fn test_display() {
        let table = IdTable::with_defaults();
        let shown: Vec<String> = table.entries().iter().map(|e| e.to_string()).collect();
        assert_eq!(shown, vec!["0499:3002", "class 08/06/50"]);
    }
}
