//! Common test utilities for integration tests.
//!
//! Provides scripted collaborators: `MockDevice` (control channel plus the
//! kernel knobs it exposes), `MockNetlink` (records link requests) and
//! `FakeNetDevice` (a net device with in-memory attributes).

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use qmi_datapath::netlink::LinkControl;
use qmi_datapath::{
    AggregationProtocol, ClientId, DataFormatRequest, DeviceDataFormat, EndpointInfo, Error,
    ExpectedDataFormat, HardwareDataPort, KernelDevice, LinkFlags, LinkInfo, OpenFlags, PortConfig,
    Protocol, ProtocolError, QmiDevice, QmiPort, Result, Service,
};
use tokio_util::sync::CancellationToken;

/// Scripted device and kernel state.
#[derive(Debug, Clone)]
pub struct DeviceState {
    // Control channel
    pub open: bool,
    pub open_calls: Vec<OpenFlags>,
    pub close_calls: usize,
    pub open_delay: Option<Duration>,
    /// CTL data format flags the device refuses on open.
    pub rejected_open_flags: OpenFlags,
    pub next_cid: u8,
    pub allocate_delay: Option<Duration>,
    pub allocated: Vec<ClientId>,
    pub released: Vec<ClientId>,
    /// Release attempts are recorded, then fail.
    pub release_fails: bool,
    pub wda_supported: bool,

    // WDA
    pub protocol: Protocol,
    pub supported_protocols: Vec<Protocol>,
    /// `false` when the device reports no aggregation at all.
    pub aggregation_capable: bool,
    pub aggregation: AggregationProtocol,
    pub supported_aggregations: Vec<AggregationProtocol>,
    /// Aggregation the device applies instead of the requested one.
    pub downgrade_aggregation: Option<AggregationProtocol>,
    pub device_max_size: u32,
    pub current_max_size: u32,
    pub query_fails: bool,
    pub query_needs_endpoint: bool,
    pub get_calls: Vec<Option<EndpointInfo>>,
    pub set_calls: Vec<DataFormatRequest>,

    // DPM
    pub dpm_ports: Vec<HardwareDataPort>,
    pub dpm_fails: bool,

    // Kernel
    pub expected: ExpectedDataFormat,
    pub kernel_formats: Vec<ExpectedDataFormat>,
    /// Accept expected format changes without applying them.
    pub ignore_expected_updates: bool,
    pub expected_updates: Vec<ExpectedDataFormat>,
    pub link_management: bool,

    // Links
    pub links: Vec<LinkInfo>,
    pub next_mux_id: u32,
    pub add_link_delay: Option<Duration>,
    /// Fail the n-th add_link call (0-based).
    pub fail_add_link_at: Option<usize>,
    pub add_link_calls: Vec<LinkFlags>,
    pub deleted_links: Vec<LinkInfo>,
    pub delete_all_calls: Vec<String>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            open: false,
            open_calls: Vec::new(),
            close_calls: 0,
            open_delay: None,
            rejected_open_flags: OpenFlags::empty(),
            next_cid: 1,
            allocate_delay: None,
            allocated: Vec::new(),
            released: Vec::new(),
            release_fails: false,
            wda_supported: true,
            protocol: Protocol::RawIp,
            supported_protocols: vec![Protocol::RawIp, Protocol::Framed8023],
            aggregation_capable: true,
            aggregation: AggregationProtocol::Disabled,
            supported_aggregations: vec![
                AggregationProtocol::QmapV5,
                AggregationProtocol::QmapV4,
                AggregationProtocol::Qmap,
            ],
            downgrade_aggregation: None,
            device_max_size: 32768,
            current_max_size: 0,
            query_fails: false,
            query_needs_endpoint: false,
            get_calls: Vec::new(),
            set_calls: Vec::new(),
            dpm_ports: Vec::new(),
            dpm_fails: false,
            expected: ExpectedDataFormat::RawIp,
            kernel_formats: vec![ExpectedDataFormat::RawIp, ExpectedDataFormat::Ieee8023],
            ignore_expected_updates: false,
            expected_updates: Vec::new(),
            link_management: false,
            links: Vec::new(),
            next_mux_id: 1,
            add_link_delay: None,
            fail_add_link_at: None,
            add_link_calls: Vec::new(),
            deleted_links: Vec::new(),
            delete_all_calls: Vec::new(),
        }
    }
}

/// Scripted control channel.
#[derive(Debug, Default)]
pub struct MockDevice {
    state: Mutex<DeviceState>,
}

impl MockDevice {
    pub fn new(state: DeviceState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// qmi_wwan with raw-ip, add_mux and QMAP pass-through support.
    pub fn qmi_wwan_rmnet() -> Self {
        Self::new(DeviceState {
            kernel_formats: vec![
                ExpectedDataFormat::RawIp,
                ExpectedDataFormat::Ieee8023,
                ExpectedDataFormat::QmapPassThrough,
            ],
            link_management: true,
            ..Default::default()
        })
    }

    /// qmi_wwan with raw-ip and add_mux but no pass-through.
    pub fn qmi_wwan_pooled() -> Self {
        Self::new(DeviceState {
            link_management: true,
            ..Default::default()
        })
    }

    /// qmi_wwan rejecting raw-ip.
    pub fn qmi_wwan_8023_only() -> Self {
        Self::new(DeviceState {
            expected: ExpectedDataFormat::Ieee8023,
            kernel_formats: vec![ExpectedDataFormat::Ieee8023],
            ..Default::default()
        })
    }

    pub fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap()
    }

    pub fn snapshot(&self) -> DeviceState {
        self.state().clone()
    }

    fn current_format(state: &DeviceState) -> DeviceDataFormat {
        DeviceDataFormat {
            link_layer_protocol: state.protocol,
            uplink_aggregation: state.aggregation_capable.then_some(state.aggregation),
            downlink_aggregation: state.aggregation_capable.then_some(state.aggregation),
            downlink_max_size: state.current_max_size,
            downlink_max_datagrams: 32,
        }
    }
}

fn protocol_error(operation: &str, code: ProtocolError) -> Error {
    Error::protocol(operation, code)
}

impl QmiDevice for MockDevice {
    async fn open(&self, flags: OpenFlags, _timeout: Duration) -> Result<()> {
        let delay = {
            let mut state = self.state();
            state.open_calls.push(flags);
            if flags.intersects(state.rejected_open_flags) {
                return Err(protocol_error("open", ProtocolError::InvalidArgument));
            }
            state.open_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state().open = true;
        Ok(())
    }

    async fn close(&self, _timeout: Duration) -> Result<()> {
        let mut state = self.state();
        state.close_calls += 1;
        state.open = false;
        Ok(())
    }

    async fn allocate_client(&self, service: Service, _timeout: Duration) -> Result<ClientId> {
        let delay = self.state().allocate_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if service == Service::Wda && !state.wda_supported {
            return Err(protocol_error("allocate client", ProtocolError::NotSupported));
        }
        let client = ClientId {
            service,
            cid: state.next_cid,
        };
        state.next_cid += 1;
        state.allocated.push(client);
        Ok(client)
    }

    async fn release_client(&self, client: ClientId, _timeout: Duration) -> Result<()> {
        let mut state = self.state();
        state.released.push(client);
        if state.release_fails {
            return Err(Error::timeout("release client", Duration::from_secs(3)));
        }
        state.allocated.retain(|c| *c != client);
        Ok(())
    }

    async fn get_data_format(
        &self,
        _client: ClientId,
        endpoint: Option<EndpointInfo>,
        _timeout: Duration,
    ) -> Result<DeviceDataFormat> {
        let mut state = self.state();
        state.get_calls.push(endpoint);
        if state.query_fails {
            return Err(protocol_error("get data format", ProtocolError::Other(0x47)));
        }
        if state.query_needs_endpoint && endpoint.is_none() {
            return Err(protocol_error("get data format", ProtocolError::MissingArgument));
        }
        Ok(Self::current_format(&state))
    }

    async fn set_data_format(
        &self,
        _client: ClientId,
        request: &DataFormatRequest,
        _timeout: Duration,
    ) -> Result<DeviceDataFormat> {
        let mut state = self.state();
        state.set_calls.push(*request);

        if !state.supported_protocols.contains(&request.link_layer_protocol) {
            return Err(protocol_error("set data format", ProtocolError::InvalidArgument));
        }
        let aggregating = request.downlink_aggregation != AggregationProtocol::Disabled;
        if aggregating
            && (!state.aggregation_capable
                || !state
                    .supported_aggregations
                    .contains(&request.downlink_aggregation))
        {
            return Err(protocol_error("set data format", ProtocolError::InvalidArgument));
        }

        state.protocol = request.link_layer_protocol;
        if state.aggregation_capable {
            state.aggregation = match state.downgrade_aggregation {
                Some(other) if aggregating => other,
                _ => request.downlink_aggregation,
            };
        }
        state.current_max_size = if aggregating {
            request.downlink_max_size.min(state.device_max_size)
        } else {
            0
        };
        Ok(Self::current_format(&state))
    }

    async fn open_dpm_port(
        &self,
        _client: ClientId,
        ports: &[HardwareDataPort],
        _timeout: Duration,
    ) -> Result<()> {
        let mut state = self.state();
        if state.dpm_fails {
            return Err(protocol_error("open port", ProtocolError::NotSupported));
        }
        state.dpm_ports.extend_from_slice(ports);
        Ok(())
    }

    async fn add_link(
        &self,
        _base_iface: &str,
        ifname_prefix: &str,
        flags: LinkFlags,
        _timeout: Duration,
    ) -> Result<LinkInfo> {
        let delay = self.state().add_link_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        let call = state.add_link_calls.len();
        state.add_link_calls.push(flags);
        if state.fail_add_link_at == Some(call) {
            return Err(Error::from_errno(-libc::EBUSY));
        }
        let mux_id = state.next_mux_id;
        state.next_mux_id += 1;
        let link = LinkInfo {
            name: format!("{}{}", ifname_prefix, mux_id),
            mux_id,
        };
        state.links.push(link.clone());
        Ok(link)
    }

    async fn delete_link(&self, name: &str, mux_id: u32, _timeout: Duration) -> Result<()> {
        let mut state = self.state();
        let Some(pos) = state
            .links
            .iter()
            .position(|l| l.name == name && l.mux_id == mux_id)
        else {
            return Err(Error::from_errno(-libc::ENODEV));
        };
        let link = state.links.remove(pos);
        state.deleted_links.push(link);
        Ok(())
    }

    fn list_links(&self, _base_iface: &str) -> Result<Vec<String>> {
        Ok(self.state().links.iter().map(|l| l.name.clone()).collect())
    }

    async fn delete_all_links(&self, base_iface: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.state();
        state.delete_all_calls.push(base_iface.to_string());
        let links = std::mem::take(&mut state.links);
        state.deleted_links.extend(links);
        Ok(())
    }

    fn expected_data_format(&self) -> Result<ExpectedDataFormat> {
        Ok(self.state().expected)
    }

    fn set_expected_data_format(&self, format: ExpectedDataFormat) -> Result<()> {
        let mut state = self.state();
        if !state.kernel_formats.contains(&format) {
            return Err(Error::from_errno(-libc::EINVAL));
        }
        state.expected_updates.push(format);
        if !state.ignore_expected_updates {
            state.expected = format;
        }
        Ok(())
    }

    fn supports_expected_data_format(&self, format: ExpectedDataFormat) -> bool {
        self.state().kernel_formats.contains(&format)
    }

    fn supports_link_management(&self) -> bool {
        let state = self.state();
        state.link_management && state.expected == ExpectedDataFormat::RawIp
    }
}

/// A recorded link request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkRequest {
    pub ifindex: u32,
    pub up: bool,
    pub mtu: Option<u32>,
}

/// Link control recording every request.
#[derive(Debug, Default)]
pub struct MockNetlink {
    pub requests: Mutex<Vec<LinkRequest>>,
    pub fail: Mutex<bool>,
}

impl MockNetlink {
    pub fn requests(&self) -> Vec<LinkRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

impl LinkControl for MockNetlink {
    async fn set_link(
        &self,
        ifindex: u32,
        up: bool,
        mtu: Option<u32>,
        timeout: Duration,
    ) -> Result<()> {
        self.requests
            .lock()
            .unwrap()
            .push(LinkRequest { ifindex, up, mtu });
        if *self.fail.lock().unwrap() {
            return Err(Error::timeout("netlink transaction 1", timeout));
        }
        Ok(())
    }
}

/// A net device with in-memory attributes.
#[derive(Debug, Clone)]
pub struct FakeNetDevice {
    pub name: String,
    pub ifindex: u32,
    pub driver: Option<String>,
    pub attrs: HashMap<String, String>,
    pub physdev: HashMap<String, String>,
}

impl FakeNetDevice {
    pub fn new(name: &str, ifindex: u32, driver: &str) -> Self {
        Self {
            name: name.to_string(),
            ifindex,
            driver: Some(driver.to_string()),
            attrs: HashMap::new(),
            physdev: HashMap::new(),
        }
    }

    /// qmi_wwan interface on USB interface 4.
    pub fn qmi_wwan() -> Self {
        Self::new("wwan0", 5, "qmi_wwan").physdev_attr("bInterfaceNumber", "04")
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.insert(name.to_string(), value.to_string());
        self
    }

    pub fn physdev_attr(mut self, name: &str, value: &str) -> Self {
        self.physdev.insert(name.to_string(), value.to_string());
        self
    }
}

impl KernelDevice for FakeNetDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn ifindex(&self) -> Result<u32> {
        Ok(self.ifindex)
    }

    fn driver(&self) -> Option<String> {
        self.driver.clone()
    }

    fn attribute(&self, name: &str) -> Option<String> {
        self.attrs.get(name).cloned()
    }

    fn physdev_attribute(&self, name: &str) -> Option<String> {
        self.physdev.get(name).cloned()
    }
}

pub type TestPort = QmiPort<MockDevice, Arc<MockNetlink>>;

/// Create a closed port over `device`.
pub fn port(device: MockDevice) -> (TestPort, Arc<MockNetlink>) {
    let netlink = Arc::new(MockNetlink::default());
    let port = QmiPort::new("cdc-wdm0", device, netlink.clone()).with_config(PortConfig::default());
    (port, netlink)
}

/// Create and open a port over `device`.
pub async fn open_port(device: MockDevice) -> (TestPort, Arc<MockNetlink>) {
    let (port, netlink) = port(device);
    port.open(false, &CancellationToken::new()).await.unwrap();
    (port, netlink)
}

/// Check if running as root.
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Skip the test if not running as root.
///
/// Use this at the beginning of integration tests that require root privileges.
#[macro_export]
macro_rules! require_root {
    () => {
        if !crate::common::is_root() {
            eprintln!("Skipping test: requires root");
            return Ok(());
        }
    };
}
