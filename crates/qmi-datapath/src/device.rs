//! The protocol transport the data path drives.
//!
//! [`QmiDevice`] abstracts the control channel to the modem: client
//! allocation, the WDA and DPM requests used during negotiation, and the
//! kernel-side knobs the transport library exposes (expected data format,
//! multiplexed link management). Message encoding stays with the
//! implementor.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use bitflags::bitflags;

use crate::error::Result;
use crate::format::{AggregationProtocol, Protocol};

/// Device-side services a client can be allocated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum Service {
    Dms,
    Nas,
    Wds,
    Wda,
    Dpm,
    Uim,
    Voice,
    Loc,
    Pdc,
    Other(u8),
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dms => f.write_str("dms"),
            Self::Nas => f.write_str("nas"),
            Self::Wds => f.write_str("wds"),
            Self::Wda => f.write_str("wda"),
            Self::Dpm => f.write_str("dpm"),
            Self::Uim => f.write_str("uim"),
            Self::Voice => f.write_str("voice"),
            Self::Loc => f.write_str("loc"),
            Self::Pdc => f.write_str("pdc"),
            Self::Other(id) => write!(f, "service-{}", id),
        }
    }
}

/// Distinguishes several clients of the same service on one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum ClientFlag {
    #[default]
    Default,
    /// WDS client bound to IPv4 sessions.
    WdsIpv4,
    /// WDS client bound to IPv6 sessions.
    WdsIpv6,
}

/// Handle of an allocated service client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId {
    pub service: Service,
    /// Client id assigned by the device.
    pub cid: u8,
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.service, self.cid)
    }
}

bitflags! {
    /// Flags for opening the control channel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpenFlags: u32 {
        /// Query service versions while opening.
        const VERSION_INFO = 1 << 0;
        /// Go through the multiplexing proxy.
        const PROXY = 1 << 1;
        /// Ask the device for 802.3 framing through CTL.
        const NET_802_3 = 1 << 2;
        /// Ask the device for raw IP through CTL.
        const NET_RAW_IP = 1 << 3;
        /// Disable QoS headers on the data path.
        const NET_NO_QOS_HEADER = 1 << 4;
    }
}

bitflags! {
    /// Checksum offload flags for a new multiplexed link.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LinkFlags: u32 {
        const INGRESS_MAP_CKSUMV4 = 1 << 0;
        const EGRESS_MAP_CKSUMV4 = 1 << 1;
        const INGRESS_MAP_CKSUMV5 = 1 << 2;
        const EGRESS_MAP_CKSUMV5 = 1 << 3;
    }
}

/// Encapsulation the kernel driver expects on the main interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum ExpectedDataFormat {
    #[default]
    Unknown,
    Ieee8023,
    RawIp,
    /// Aggregated frames are handed untouched to rmnet.
    QmapPassThrough,
}

impl fmt::Display for ExpectedDataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Ieee8023 => "802-3",
            Self::RawIp => "raw-ip",
            Self::QmapPassThrough => "qmap-pass-through",
        })
    }
}

/// Physical bus of a data endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum EndpointType {
    #[default]
    Undefined,
    Hsic,
    Hsusb,
    Pcie,
    Embedded,
    BamDmux,
}

/// Identifies the data endpoint a request refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EndpointInfo {
    pub endpoint_type: EndpointType,
    pub interface_number: u32,
}

impl EndpointInfo {
    /// Check if the endpoint is known well enough to be sent to the device.
    pub fn is_defined(&self) -> bool {
        self.endpoint_type != EndpointType::Undefined
    }
}

/// Data format as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceDataFormat {
    pub link_layer_protocol: Protocol,
    pub uplink_aggregation: Option<AggregationProtocol>,
    /// `None` when the device does not report aggregation at all.
    pub downlink_aggregation: Option<AggregationProtocol>,
    pub downlink_max_size: u32,
    pub downlink_max_datagrams: u32,
}

impl DeviceDataFormat {
    /// Check if the device reported aggregation support.
    pub fn aggregation_supported(&self) -> bool {
        self.downlink_aggregation.is_some()
    }

    /// Downlink aggregation, `Disabled` when not reported.
    pub fn aggregation(&self) -> AggregationProtocol {
        self.downlink_aggregation
            .unwrap_or(AggregationProtocol::Disabled)
    }
}

/// Parameters of a WDA set-data-format request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFormatRequest {
    pub link_layer_protocol: Protocol,
    pub uplink_aggregation: AggregationProtocol,
    pub downlink_aggregation: AggregationProtocol,
    pub downlink_max_size: u32,
    pub downlink_max_datagrams: u32,
    pub endpoint: Option<EndpointInfo>,
}

/// Hardware data port handed to the DPM service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareDataPort {
    pub endpoint: EndpointInfo,
    pub rx_endpoint_id: u32,
    pub tx_endpoint_id: u32,
}

/// A multiplexed link created on top of a main interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinkInfo {
    pub name: String,
    pub mux_id: u32,
}

/// Control channel to the modem.
///
/// Protocol errors reported by the device must come back as
/// [`Error::Protocol`](crate::Error::Protocol) so that callers can react to
/// specific codes.
pub trait QmiDevice: Send + Sync {
    /// Open the control channel.
    fn open(&self, flags: OpenFlags, timeout: Duration) -> impl Future<Output = Result<()>> + Send;

    /// Close the control channel.
    fn close(&self, timeout: Duration) -> impl Future<Output = Result<()>> + Send;

    /// Allocate a client for `service`.
    fn allocate_client(
        &self,
        service: Service,
        timeout: Duration,
    ) -> impl Future<Output = Result<ClientId>> + Send;

    /// Release a client, also releasing its id on the device.
    fn release_client(
        &self,
        client: ClientId,
        timeout: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    /// WDA get-data-format.
    fn get_data_format(
        &self,
        client: ClientId,
        endpoint: Option<EndpointInfo>,
        timeout: Duration,
    ) -> impl Future<Output = Result<DeviceDataFormat>> + Send;

    /// WDA set-data-format; returns the format the device applied.
    fn set_data_format(
        &self,
        client: ClientId,
        request: &DataFormatRequest,
        timeout: Duration,
    ) -> impl Future<Output = Result<DeviceDataFormat>> + Send;

    /// DPM open-port for the given hardware data ports.
    fn open_dpm_port(
        &self,
        client: ClientId,
        ports: &[HardwareDataPort],
        timeout: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Create a multiplexed link on `base_iface` with an automatically
    /// assigned mux id. The name starts with `ifname_prefix`.
    fn add_link(
        &self,
        base_iface: &str,
        ifname_prefix: &str,
        flags: LinkFlags,
        timeout: Duration,
    ) -> impl Future<Output = Result<LinkInfo>> + Send;

    /// Delete one multiplexed link.
    fn delete_link(
        &self,
        name: &str,
        mux_id: u32,
        timeout: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Names of the multiplexed links on `base_iface`.
    fn list_links(&self, base_iface: &str) -> Result<Vec<String>>;

    /// Delete every multiplexed link on `base_iface`.
    fn delete_all_links(
        &self,
        base_iface: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Encapsulation the kernel currently expects.
    fn expected_data_format(&self) -> Result<ExpectedDataFormat>;

    /// Change the encapsulation the kernel expects.
    fn set_expected_data_format(&self, format: ExpectedDataFormat) -> Result<()>;

    /// Check if the kernel driver accepts `format` as expected encapsulation.
    fn supports_expected_data_format(&self, format: ExpectedDataFormat) -> bool;

    /// Check if the kernel driver can add and delete multiplexed links.
    fn supports_link_management(&self) -> bool;
}
