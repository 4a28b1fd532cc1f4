//! Capability probing from driver identity and device support checks.

use std::fmt;

use tracing::debug;

use crate::device::{
    EndpointInfo, EndpointType, ExpectedDataFormat, HardwareDataPort, LinkFlags, QmiDevice,
};
use crate::format::{AggregationProtocol, KernelDataMode};
use crate::kernel::{
    ATTR_INTERFACE_NUMBER, ATTR_OFFLOAD_FEATURES, ATTR_RX_ENDPOINT_ID, ATTR_TX_ENDPOINT_ID,
    KernelDevice, parse_u32,
};

/// Kernel driver behind a data port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetDriver {
    QmiWwan,
    MhiNet,
    Ipa,
    BamDmux,
    Other(String),
    Unknown,
}

impl NetDriver {
    /// Classify a driver name as reported by sysfs.
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some("qmi_wwan") => Self::QmiWwan,
            Some("mhi_net") | Some("mhi-net") => Self::MhiNet,
            Some("ipa") => Self::Ipa,
            Some("bam-dmux") | Some("bam_dmux") => Self::BamDmux,
            Some(other) => Self::Other(other.to_string()),
            None => Self::Unknown,
        }
    }

    /// Driver of a kernel device.
    pub fn of(device: &dyn KernelDevice) -> Self {
        Self::from_name(device.driver().as_deref())
    }

    /// Check if this is qmi_wwan, the only driver with a switchable
    /// expected data format.
    pub fn is_qmi_wwan(&self) -> bool {
        matches!(self, Self::QmiWwan)
    }
}

impl fmt::Display for NetDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QmiWwan => f.write_str("qmi_wwan"),
            Self::MhiNet => f.write_str("mhi_net"),
            Self::Ipa => f.write_str("ipa"),
            Self::BamDmux => f.write_str("bam-dmux"),
            Self::Other(name) => f.write_str(name),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Kernel modes known without asking the device, or `None` for qmi_wwan.
pub fn static_kernel_modes(driver: &NetDriver) -> Option<KernelDataMode> {
    match driver {
        NetDriver::QmiWwan => None,
        NetDriver::BamDmux => Some(KernelDataMode::RAW_IP),
        NetDriver::Ipa => Some(KernelDataMode::MUX_RMNET),
        NetDriver::MhiNet => Some(KernelDataMode::RAW_IP | KernelDataMode::MUX_RMNET),
        NetDriver::Other(_) | NetDriver::Unknown => Some(KernelDataMode::RAW_IP),
    }
}

/// Kernel data modes the driver supports.
///
/// For qmi_wwan this switches the expected data format to raw IP, since link
/// management support can only be checked in that mode. Callers reload the
/// current mode afterwards.
pub fn load_supported_kernel_modes<D: QmiDevice>(driver: &NetDriver, device: &D) -> KernelDataMode {
    if let Some(modes) = static_kernel_modes(driver) {
        return modes;
    }

    if !device.supports_expected_data_format(ExpectedDataFormat::RawIp) {
        debug!("raw-ip unsupported by kernel, only 802.3 available");
        return KernelDataMode::FRAMED_8023;
    }

    let mut modes = KernelDataMode::RAW_IP | KernelDataMode::FRAMED_8023;

    match device.set_expected_data_format(ExpectedDataFormat::RawIp) {
        Ok(()) if device.supports_link_management() => modes |= KernelDataMode::MUX_QMIWWAN,
        Ok(()) => debug!("kernel link management unsupported"),
        Err(e) => debug!(error = %e, "couldn't switch to raw-ip to check link management"),
    }

    if device.supports_expected_data_format(ExpectedDataFormat::QmapPassThrough) {
        modes |= KernelDataMode::MUX_RMNET;
    }

    modes
}

/// Current kernel mode of a qmi_wwan port.
///
/// Raw IP with QMAP aggregation on the device means qmi_wwan is already
/// doing its own multiplexing.
pub fn kernel_mode_from_expected(
    expected: ExpectedDataFormat,
    device_aggregation: AggregationProtocol,
) -> KernelDataMode {
    match expected {
        ExpectedDataFormat::RawIp if device_aggregation.is_qmap() => KernelDataMode::MUX_QMIWWAN,
        ExpectedDataFormat::RawIp => KernelDataMode::RAW_IP,
        ExpectedDataFormat::Ieee8023 => KernelDataMode::FRAMED_8023,
        ExpectedDataFormat::QmapPassThrough => KernelDataMode::MUX_RMNET,
        ExpectedDataFormat::Unknown => KernelDataMode::empty(),
    }
}

/// Current kernel mode of a port whose driver has no switchable format.
pub fn kernel_mode_assumed(supported: KernelDataMode, device_aggregation: AggregationProtocol) -> KernelDataMode {
    if device_aggregation.is_qmap() && supported.contains(KernelDataMode::MUX_RMNET) {
        KernelDataMode::MUX_RMNET
    } else if supported.contains(KernelDataMode::RAW_IP) {
        KernelDataMode::RAW_IP
    } else {
        KernelDataMode::FRAMED_8023
    }
}

/// Expected data format qmi_wwan needs for a kernel mode.
pub fn expected_format_for(mode: KernelDataMode) -> ExpectedDataFormat {
    if mode == KernelDataMode::MUX_RMNET {
        ExpectedDataFormat::QmapPassThrough
    } else if mode == KernelDataMode::MUX_QMIWWAN || mode == KernelDataMode::RAW_IP {
        ExpectedDataFormat::RawIp
    } else if mode == KernelDataMode::FRAMED_8023 {
        ExpectedDataFormat::Ieee8023
    } else {
        ExpectedDataFormat::Unknown
    }
}

/// Endpoint type implied by the driver.
pub fn endpoint_type(driver: &NetDriver) -> EndpointType {
    match driver {
        NetDriver::QmiWwan => EndpointType::Hsusb,
        NetDriver::MhiNet => EndpointType::Pcie,
        NetDriver::Ipa => EndpointType::Embedded,
        NetDriver::BamDmux => EndpointType::BamDmux,
        NetDriver::Other(_) | NetDriver::Unknown => EndpointType::Undefined,
    }
}

/// Endpoint info of a data port.
///
/// The interface number is the USB interface (`bInterfaceNumber`, hex) when
/// there is one, else 0.
pub fn endpoint_info(driver: &NetDriver, data: &dyn KernelDevice) -> EndpointInfo {
    let interface_number = data
        .physdev_attribute(ATTR_INTERFACE_NUMBER)
        .and_then(|value| u32::from_str_radix(value.trim(), 16).ok())
        .unwrap_or(0);
    EndpointInfo {
        endpoint_type: endpoint_type(driver),
        interface_number,
    }
}

/// Hardware data port of an ipa data interface, from its endpoint ids.
pub fn hardware_data_port(endpoint: EndpointInfo, data: &dyn KernelDevice) -> Option<HardwareDataPort> {
    let tx_endpoint_id = data.attribute(ATTR_TX_ENDPOINT_ID).as_deref().and_then(parse_u32)?;
    let rx_endpoint_id = data.attribute(ATTR_RX_ENDPOINT_ID).as_deref().and_then(parse_u32)?;
    Some(HardwareDataPort {
        endpoint,
        rx_endpoint_id,
        tx_endpoint_id,
    })
}

/// Checksum offload flags for new links, from the data port's advertised
/// offload features and the aggregation version in use.
pub fn link_flags(data: &dyn KernelDevice, aggregation: AggregationProtocol) -> LinkFlags {
    let Some(features) = data.attribute(ATTR_OFFLOAD_FEATURES) else {
        return LinkFlags::empty();
    };
    let (ingress, egress) = match aggregation {
        AggregationProtocol::QmapV5 => (LinkFlags::INGRESS_MAP_CKSUMV5, LinkFlags::EGRESS_MAP_CKSUMV5),
        AggregationProtocol::QmapV4 => (LinkFlags::INGRESS_MAP_CKSUMV4, LinkFlags::EGRESS_MAP_CKSUMV4),
        _ => return LinkFlags::empty(),
    };

    let mut flags = LinkFlags::empty();
    for feature in features.split_whitespace() {
        match feature {
            "rx-csum" | "rx-checksum" => flags |= ingress,
            "tx-csum" | "tx-checksum" => flags |= egress,
            _ => {}
        }
    }
    flags
}
