//! Tunables for a QMI port's data path.

use std::time::Duration;

/// Links created up front by the preallocated (qmi_wwan) backend.
pub const DEFAULT_POOL_SIZE: usize = 4;
/// Downlink aggregation size requested from the device.
pub const DEFAULT_DL_MAX_SIZE: u32 = 32768;
/// Largest downlink aggregate rmnet accepts over qmi_wwan.
pub const RMNET_QMI_WWAN_DL_MAX_SIZE: u32 = 16384;
/// Datagrams per downlink aggregate requested from the device.
pub const DEFAULT_DL_MAX_DATAGRAMS: u32 = 32;

/// Per-request timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Timeouts {
    /// Initial open of the control channel.
    pub open: Duration,
    /// Reopen with an explicit CTL data format.
    pub reopen: Duration,
    pub close: Duration,
    pub allocate_client: Duration,
    pub release_client: Duration,
    /// WDA get/set data format.
    pub wda: Duration,
    /// DPM open port.
    pub dpm: Duration,
    /// Multiplexed link add/delete.
    pub link: Duration,
    /// Netlink link up/down and MTU.
    pub netlink: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            open: Duration::from_secs(45),
            reopen: Duration::from_secs(10),
            close: Duration::from_secs(5),
            allocate_client: Duration::from_secs(10),
            release_client: Duration::from_secs(3),
            wda: Duration::from_secs(10),
            dpm: Duration::from_secs(10),
            link: Duration::from_secs(10),
            netlink: Duration::from_secs(5),
        }
    }
}

/// Configuration of a [`QmiPort`](crate::QmiPort).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use qmi_datapath::PortConfig;
///
/// let config = PortConfig::new()
///     .pool_size(2)
///     .netlink_timeout(Duration::from_secs(2));
/// assert_eq!(config.pool_size, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PortConfig {
    /// Size of the preallocated link pool.
    pub pool_size: usize,
    /// Downlink aggregation size requested from the device.
    pub dl_max_size: u32,
    /// Aggregation size ceiling when rmnet runs over qmi_wwan.
    pub rmnet_qmi_wwan_max_size: u32,
    /// Datagrams per downlink aggregate.
    pub dl_max_datagrams: u32,
    pub timeouts: Timeouts,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            dl_max_size: DEFAULT_DL_MAX_SIZE,
            rmnet_qmi_wwan_max_size: RMNET_QMI_WWAN_DL_MAX_SIZE,
            dl_max_datagrams: DEFAULT_DL_MAX_DATAGRAMS,
            timeouts: Timeouts::default(),
        }
    }
}

impl PortConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the preallocated link pool size.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the downlink aggregation size requested from the device.
    pub fn dl_max_size(mut self, size: u32) -> Self {
        self.dl_max_size = size;
        self
    }

    /// Set the aggregation ceiling for rmnet over qmi_wwan.
    pub fn rmnet_qmi_wwan_max_size(mut self, size: u32) -> Self {
        self.rmnet_qmi_wwan_max_size = size;
        self
    }

    /// Set the number of datagrams per downlink aggregate.
    pub fn dl_max_datagrams(mut self, datagrams: u32) -> Self {
        self.dl_max_datagrams = datagrams;
        self
    }

    /// Replace all timeouts.
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set the netlink request timeout.
    pub fn netlink_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.netlink = timeout;
        self
    }
}
