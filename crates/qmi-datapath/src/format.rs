//! Data format vocabulary and combination selection.
//!
//! A data format is negotiated on two sides at once: the kernel driver
//! ([`KernelDataMode`]) and the device ([`Protocol`] plus
//! [`AggregationProtocol`]). [`COMBINATIONS`] lists the pairings that work
//! together, best first.

use std::fmt;

use bitflags::bitflags;

use crate::error::{Error, Result};

/// Lowest mux id a multiplexed link may use.
pub const MUX_ID_MIN: u32 = 1;
/// Highest mux id a multiplexed link may use.
pub const MUX_ID_MAX: u32 = 254;

bitflags! {
    /// Kernel data modes, as a set of supported modes or as a single
    /// current mode. The empty set means "none".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct KernelDataMode: u32 {
        /// Ethernet-style framing on the main interface.
        const FRAMED_8023 = 1 << 0;
        /// Raw IP on the main interface.
        const RAW_IP = 1 << 1;
        /// rmnet links created on demand over a pass-through main interface.
        const MUX_RMNET = 1 << 2;
        /// qmi_wwan's own multiplexed links, preallocated.
        const MUX_QMIWWAN = 1 << 3;
    }
}

impl KernelDataMode {
    /// Check if any multiplexing mode is included.
    pub fn is_multiplexed(self) -> bool {
        self.intersects(Self::MUX_RMNET | Self::MUX_QMIWWAN)
    }

    fn short_name(self) -> &'static str {
        if self == Self::FRAMED_8023 {
            "802-3"
        } else if self == Self::RAW_IP {
            "raw-ip"
        } else if self == Self::MUX_RMNET {
            "mux-rmnet"
        } else if self == Self::MUX_QMIWWAN {
            "mux-qmiwwan"
        } else {
            "unknown"
        }
    }
}

impl fmt::Display for KernelDataMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        for flag in self.iter() {
            if !first {
                f.write_str(", ")?;
            }
            f.write_str(flag.short_name())?;
            first = false;
        }
        Ok(())
    }
}

/// Link-layer protocol agreed with the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum Protocol {
    #[default]
    Unknown,
    RawIp,
    Framed8023,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::RawIp => "raw-ip",
            Self::Framed8023 => "802-3",
        })
    }
}

/// Downlink/uplink aggregation protocol agreed with the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum AggregationProtocol {
    #[default]
    Unknown,
    Disabled,
    Qmap,
    QmapV4,
    QmapV5,
}

impl AggregationProtocol {
    /// Check if this is one of the QMAP variants.
    pub fn is_qmap(self) -> bool {
        matches!(self, Self::Qmap | Self::QmapV4 | Self::QmapV5)
    }
}

impl fmt::Display for AggregationProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Disabled => "disabled",
            Self::Qmap => "qmap",
            Self::QmapV4 => "qmapv4",
            Self::QmapV5 => "qmapv5",
        })
    }
}

/// What a data format setup should achieve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum DataFormatAction {
    /// Only load the current state.
    Query,
    /// Configure a single, non-multiplexed data session.
    SetDefault,
    /// Configure multiplexing with aggregation, if supported.
    SetMultiplex,
}

/// One kernel mode paired with the device settings it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Combination {
    /// Single kernel mode bit.
    pub kernel_mode: KernelDataMode,
    pub protocol: Protocol,
    pub aggregation: AggregationProtocol,
}

impl Combination {
    const fn new(
        kernel_mode: KernelDataMode,
        protocol: Protocol,
        aggregation: AggregationProtocol,
    ) -> Self {
        Self {
            kernel_mode,
            protocol,
            aggregation,
        }
    }

    /// Check if the device aggregates traffic in this combination.
    pub fn is_aggregating(&self) -> bool {
        self.aggregation != AggregationProtocol::Disabled
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "kernel {} / device {} / aggregation {}",
            self.kernel_mode, self.protocol, self.aggregation
        )
    }
}

/// Supported combinations in order of preference.
pub const COMBINATIONS: [Combination; 7] = [
    Combination::new(
        KernelDataMode::MUX_RMNET,
        Protocol::RawIp,
        AggregationProtocol::QmapV5,
    ),
    Combination::new(
        KernelDataMode::MUX_RMNET,
        Protocol::RawIp,
        AggregationProtocol::QmapV4,
    ),
    Combination::new(
        KernelDataMode::MUX_RMNET,
        Protocol::RawIp,
        AggregationProtocol::Qmap,
    ),
    Combination::new(
        KernelDataMode::MUX_QMIWWAN,
        Protocol::RawIp,
        AggregationProtocol::QmapV5,
    ),
    Combination::new(
        KernelDataMode::MUX_QMIWWAN,
        Protocol::RawIp,
        AggregationProtocol::Qmap,
    ),
    Combination::new(
        KernelDataMode::RAW_IP,
        Protocol::RawIp,
        AggregationProtocol::Disabled,
    ),
    Combination::new(
        KernelDataMode::FRAMED_8023,
        Protocol::Framed8023,
        AggregationProtocol::Disabled,
    ),
];

/// Pick the best combination for `action`.
///
/// Entries whose kernel mode is not in `supported` are skipped. Aggregating
/// entries are only eligible for [`DataFormatAction::SetMultiplex`] and only
/// when the device confirmed it supports aggregation at all.
pub fn select_combination(
    supported: KernelDataMode,
    action: DataFormatAction,
    device_aggregation_supported: bool,
) -> Result<Combination> {
    next_combination(supported, action, device_aggregation_supported, 0)
        .map(|(_, c)| c)
        .ok_or_else(|| {
            Error::Unsupported(format!(
                "no usable data format for kernel modes [{}] ({:?})",
                supported, action
            ))
        })
}

/// First eligible entry of [`COMBINATIONS`] at or after index `from`,
/// together with its index.
pub fn next_combination(
    supported: KernelDataMode,
    action: DataFormatAction,
    device_aggregation_supported: bool,
    from: usize,
) -> Option<(usize, Combination)> {
    COMBINATIONS
        .iter()
        .copied()
        .enumerate()
        .skip(from)
        .filter(|(_, c)| supported.contains(c.kernel_mode))
        .find(|(_, c)| {
            !c.is_aggregating()
                || (action == DataFormatAction::SetMultiplex && device_aggregation_supported)
        })
}

/// Number of multiplexed links the negotiated setup can offer.
pub fn max_multiplexed_links(
    supported: KernelDataMode,
    device_aggregation_supported: bool,
    pool_size: usize,
) -> u32 {
    if !device_aggregation_supported {
        return 0;
    }
    if supported.contains(KernelDataMode::MUX_RMNET) {
        1 + (MUX_ID_MAX - MUX_ID_MIN)
    } else if supported.contains(KernelDataMode::MUX_QMIWWAN) {
        pool_size as u32
    } else {
        0
    }
}
