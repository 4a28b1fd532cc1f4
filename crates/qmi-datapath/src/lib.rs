//! QMI data format negotiation and multiplexed link management.
//!
//! This crate configures the data path between a QMI modem and the Linux
//! network driver serving it: it negotiates the link layer protocol and
//! aggregation with the device, aligns the kernel driver with it, and
//! manages the multiplexed links (one per data session) on top of the main
//! interface.
//!
//! The modem's control channel is not implemented here. Plug one in through
//! the [`QmiDevice`] trait; net devices come in through [`KernelDevice`],
//! with a sysfs-backed [`SysfsNetDevice`] provided.
//!
//! # Features
//!
//! - `serde` - Serialize/Deserialize for configuration and format types
//! - `integration` - Tests against a real netlink socket (need root)
//!
//! # Example
//!
//! ```ignore
//! use qmi_datapath::{DataFormatAction, QmiPort, SysfsNetDevice};
//! use qmi_datapath::netlink::NetlinkTransport;
//! use tokio_util::sync::CancellationToken;
//!
//! let cancel = CancellationToken::new();
//! let port = QmiPort::new("cdc-wdm0", device, NetlinkTransport::shared());
//! port.open(false, &cancel).await?;
//!
//! let data = SysfsNetDevice::new("wwan0")?;
//! port.setup_data_format(&data, DataFormatAction::SetMultiplex, &cancel).await?;
//! println!(
//!     "{} / {}, up to {} links",
//!     port.kernel_data_mode(),
//!     port.aggregation_protocol(),
//!     port.max_multiplexed_links()
//! );
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod kernel;
pub mod link_pool;
pub mod negotiator;
pub mod netlink;
pub mod port;
pub mod probe;
pub mod util;

pub use config::{PortConfig, Timeouts};
pub use device::{
    ClientFlag, ClientId, DataFormatRequest, DeviceDataFormat, EndpointInfo, EndpointType,
    ExpectedDataFormat, HardwareDataPort, LinkFlags, LinkInfo, OpenFlags, QmiDevice, Service,
};
pub use error::{Error, ProtocolError, Result};
pub use format::{
    AggregationProtocol, COMBINATIONS, Combination, DataFormatAction, KernelDataMode, Protocol,
    next_combination, select_combination,
};
pub use kernel::{KernelDevice, SysfsNetDevice};
pub use link_pool::LinkPool;
pub use negotiator::{Negotiation, Negotiator, Step};
pub use port::QmiPort;
pub use probe::NetDriver;
