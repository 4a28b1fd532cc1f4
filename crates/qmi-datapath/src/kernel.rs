//! Kernel network device backing a port's data path.
//!
//! The data path needs a handful of facts about the net device (index,
//! driver, a few sysfs attributes). [`KernelDevice`] is the seam; the
//! default [`SysfsNetDevice`] reads them from `/sys/class/net`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Maximum interface name length (including null terminator).
pub const IFNAMSIZ: usize = 16;

/// Default sysfs root for network devices.
pub const SYSFS_NET: &str = "/sys/class/net";

/// Data attribute holding the IPA TX endpoint id.
pub const ATTR_TX_ENDPOINT_ID: &str = "ipa_tx_endpoint_id";
/// Data attribute holding the IPA RX endpoint id.
pub const ATTR_RX_ENDPOINT_ID: &str = "ipa_rx_endpoint_id";
/// Data attribute listing checksum offload features.
pub const ATTR_OFFLOAD_FEATURES: &str = "offload_features";
/// Physical device attribute holding the USB interface number.
pub const ATTR_INTERFACE_NUMBER: &str = "bInterfaceNumber";

/// A kernel network device.
pub trait KernelDevice: Send + Sync {
    /// Interface name.
    fn name(&self) -> &str;

    /// Interface index.
    fn ifindex(&self) -> Result<u32>;

    /// Name of the bound driver, if known.
    fn driver(&self) -> Option<String>;

    /// Attribute of the net device itself, trimmed.
    fn attribute(&self, name: &str) -> Option<String>;

    /// Attribute of the physical device behind the interface, trimmed.
    fn physdev_attribute(&self, name: &str) -> Option<String>;
}

/// Validate an interface name.
pub fn validate_ifname(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidAttribute("empty interface name".to_string()));
    }

    if name.len() >= IFNAMSIZ {
        return Err(Error::InvalidAttribute(format!(
            "interface name too long (max {} chars)",
            IFNAMSIZ - 1
        )));
    }

    if name.contains('/') || name.contains('\0') || name.chars().any(|c| c.is_whitespace()) {
        return Err(Error::InvalidAttribute(format!(
            "invalid interface name: {:?}",
            name
        )));
    }

    Ok(())
}

/// Parse an integer attribute value, decimal or `0x` hexadecimal.
pub fn parse_u32(value: &str) -> Option<u32> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// A net device looked up in sysfs.
#[derive(Debug, Clone)]
pub struct SysfsNetDevice {
    name: String,
    root: PathBuf,
}

impl SysfsNetDevice {
    /// Look up `name` under `/sys/class/net`.
    pub fn new(name: &str) -> Result<Self> {
        Self::with_root(SYSFS_NET, name)
    }

    /// Look up `name` under a different sysfs root.
    pub fn with_root(root: impl AsRef<Path>, name: &str) -> Result<Self> {
        validate_ifname(name)?;
        let root = root.as_ref().to_path_buf();
        if !root.join(name).exists() {
            return Err(Error::NotFound(format!("interface {}", name)));
        }
        Ok(Self {
            name: name.to_string(),
            root,
        })
    }

    fn path(&self) -> PathBuf {
        self.root.join(&self.name)
    }

    fn read(path: &Path) -> Option<String> {
        fs::read_to_string(path)
            .ok()
            .map(|s| s.trim().to_string())
    }
}

impl KernelDevice for SysfsNetDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn ifindex(&self) -> Result<u32> {
        let content = fs::read_to_string(self.path().join("ifindex"))
            .map_err(|_| Error::NotFound(format!("interface {}", self.name)))?;
        content
            .trim()
            .parse()
            .map_err(|_| Error::InvalidAttribute(format!("ifindex of {}", self.name)))
    }

    fn driver(&self) -> Option<String> {
        let target = fs::read_link(self.path().join("device").join("driver")).ok()?;
        target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }

    fn attribute(&self, name: &str) -> Option<String> {
        Self::read(&self.path().join(name))
    }

    fn physdev_attribute(&self, name: &str) -> Option<String> {
        Self::read(&self.path().join("device").join(name))
    }
}
