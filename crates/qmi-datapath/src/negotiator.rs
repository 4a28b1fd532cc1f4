//! Data format negotiation.
//!
//! The negotiator drives device (WDA) and kernel (qmi_wwan expected data
//! format) towards one entry of [`COMBINATIONS`](crate::format::COMBINATIONS),
//! re-reading both sides after every change. When the re-read state does not
//! match the target, the next eligible entry becomes the target, until the
//! table runs out.
//!
//! ```text
//! AllocateClient -> LoadSupportedModes -> LoadCurrentMode -> OpenDpmSession
//!   -> QueryDeviceFormat -> SelectCombination -> SyncDeviceFormat
//!   -> SyncMainMtu -> SyncKernelMode -> LoadCurrentMode ... -> Done
//! ```

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PortConfig;
use crate::device::{
    ClientId, DataFormatRequest, DeviceDataFormat, EndpointInfo, ExpectedDataFormat, QmiDevice,
    Service,
};
use crate::error::{Error, Result};
use crate::format::{
    AggregationProtocol, Combination, DataFormatAction, KernelDataMode, Protocol,
    max_multiplexed_links, next_combination,
};
use crate::kernel::KernelDevice;
use crate::netlink::LinkControl;
use crate::probe::{self, NetDriver};
use crate::util::cancellable;

/// Negotiation steps, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    AllocateClient,
    LoadSupportedModes,
    LoadCurrentMode,
    OpenDpmSession,
    QueryDeviceFormat,
    SelectCombination,
    SyncDeviceFormat,
    SyncMainMtu,
    SyncKernelMode,
    Done,
}

/// Kernel and device state as last read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FormatSnapshot {
    pub kernel_mode: KernelDataMode,
    pub protocol: Protocol,
    pub aggregation: AggregationProtocol,
    pub max_aggregation_size: u32,
    /// qmi_wwan only.
    pub expected: ExpectedDataFormat,
}

impl FormatSnapshot {
    /// Check if this state is the given combination.
    pub fn matches(&self, combination: &Combination) -> bool {
        self.kernel_mode == combination.kernel_mode
            && self.protocol == combination.protocol
            && self.aggregation == combination.aggregation
    }
}

/// Outcome of a negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    pub supported: KernelDataMode,
    pub kernel_mode: KernelDataMode,
    pub protocol: Protocol,
    pub aggregation: AggregationProtocol,
    pub max_aggregation_size: u32,
    pub max_multiplexed_links: u32,
    /// DPM client that must stay allocated to keep the hardware data
    /// path open.
    pub dpm_client: Option<ClientId>,
}

/// One data format negotiation on a port.
pub struct Negotiator<'a, D, L> {
    device: &'a D,
    netlink: &'a L,
    data: &'a dyn KernelDevice,
    config: &'a PortConfig,
    cancel: &'a CancellationToken,
    action: DataFormatAction,
    driver: NetDriver,
    endpoint: EndpointInfo,
    supported: Option<KernelDataMode>,
    open_dpm: bool,
    wda: Option<ClientId>,
    dpm: Option<ClientId>,
    current: FormatSnapshot,
    requested: Option<Combination>,
    /// Index of `requested` in `COMBINATIONS`.
    candidate: usize,
    aggregation_supported: bool,
}

impl<'a, D: QmiDevice, L: LinkControl> Negotiator<'a, D, L> {
    /// Prepare a negotiation for the data port `data`.
    pub fn new(
        device: &'a D,
        netlink: &'a L,
        data: &'a dyn KernelDevice,
        config: &'a PortConfig,
        cancel: &'a CancellationToken,
        action: DataFormatAction,
    ) -> Self {
        let driver = NetDriver::of(data);
        let endpoint = probe::endpoint_info(&driver, data);
        Self {
            device,
            netlink,
            data,
            config,
            cancel,
            action,
            open_dpm: driver == NetDriver::Ipa,
            driver,
            endpoint,
            supported: None,
            wda: None,
            dpm: None,
            current: FormatSnapshot::default(),
            requested: None,
            candidate: 0,
            aggregation_supported: false,
        }
    }

    /// Reuse kernel modes loaded by an earlier negotiation.
    pub fn supported_modes(mut self, modes: Option<KernelDataMode>) -> Self {
        self.supported = modes;
        self
    }

    /// Skip the DPM session, e.g. because the port already holds one.
    pub fn skip_dpm(mut self, skip: bool) -> Self {
        if skip {
            self.open_dpm = false;
        }
        self
    }

    /// Run every step to completion.
    pub async fn run(mut self) -> Result<Negotiation> {
        let mut step = Step::AllocateClient;
        let result = loop {
            if step == Step::Done {
                break Ok(());
            }
            debug!(port = %self.data.name(), ?step, "data format negotiation");
            match self.step(step).await {
                Ok(next) => step = next,
                Err(e) => break Err(e),
            }
        };

        if let Some(wda) = self.wda.take() {
            self.release(wda).await;
        }

        match result {
            Ok(()) => Ok(self.outcome()),
            Err(e) => {
                if let Some(dpm) = self.dpm.take() {
                    self.release(dpm).await;
                }
                Err(e)
            }
        }
    }

    fn outcome(&self) -> Negotiation {
        let supported = self.supported.unwrap_or_default();
        let negotiation = Negotiation {
            supported,
            kernel_mode: self.current.kernel_mode,
            protocol: self.current.protocol,
            aggregation: self.current.aggregation,
            max_aggregation_size: self.current.max_aggregation_size,
            max_multiplexed_links: max_multiplexed_links(
                supported,
                self.aggregation_supported,
                self.config.pool_size,
            ),
            dpm_client: self.dpm,
        };
        info!(
            port = %self.data.name(),
            kernel_mode = %negotiation.kernel_mode,
            protocol = %negotiation.protocol,
            aggregation = %negotiation.aggregation,
            max_links = negotiation.max_multiplexed_links,
            "data format negotiated"
        );
        negotiation
    }

    async fn release(&self, client: ClientId) {
        if let Err(e) = self
            .device
            .release_client(client, self.config.timeouts.release_client)
            .await
        {
            warn!(port = %self.data.name(), client = %client, error = %e, "couldn't release client");
        }
    }

    async fn step(&mut self, step: Step) -> Result<Step> {
        match step {
            Step::AllocateClient => self.allocate_client().await,
            Step::LoadSupportedModes => Ok(self.load_supported_modes()),
            Step::LoadCurrentMode => self.load_current_mode(),
            Step::OpenDpmSession => Ok(self.open_dpm_session().await),
            Step::QueryDeviceFormat => self.query_device_format().await,
            Step::SelectCombination => self.select_combination(),
            Step::SyncDeviceFormat => self.sync_device_format().await,
            Step::SyncMainMtu => Ok(self.sync_main_mtu().await),
            Step::SyncKernelMode => self.sync_kernel_mode(),
            Step::Done => Ok(Step::Done),
        }
    }

    async fn allocate_client(&mut self) -> Result<Step> {
        let client = cancellable(
            self.cancel,
            self.device
                .allocate_client(Service::Wda, self.config.timeouts.allocate_client),
        )
        .await?;
        self.wda = Some(client);
        Ok(if self.supported.is_some() {
            Step::LoadCurrentMode
        } else {
            Step::LoadSupportedModes
        })
    }

    fn load_supported_modes(&mut self) -> Step {
        let modes = probe::load_supported_kernel_modes(&self.driver, self.device);
        debug!(port = %self.data.name(), driver = %self.driver, modes = %modes, "supported kernel data modes");
        self.supported = Some(modes);
        Step::LoadCurrentMode
    }

    fn load_current_mode(&mut self) -> Result<Step> {
        if self.driver.is_qmi_wwan() {
            self.current.expected = self.device.expected_data_format()?;
        }
        Ok(if self.open_dpm && self.action != DataFormatAction::Query && self.dpm.is_none() {
            Step::OpenDpmSession
        } else {
            Step::QueryDeviceFormat
        })
    }

    async fn open_dpm_session(&mut self) -> Step {
        // Only ever tried once per negotiation.
        self.open_dpm = false;

        let Some(port) = probe::hardware_data_port(self.endpoint, self.data) else {
            warn!(port = %self.data.name(), "couldn't read data port endpoint ids, skipping DPM");
            return Step::QueryDeviceFormat;
        };

        let client = match cancellable(
            self.cancel,
            self.device
                .allocate_client(Service::Dpm, self.config.timeouts.allocate_client),
        )
        .await
        {
            Ok(client) => client,
            Err(e) => {
                warn!(port = %self.data.name(), error = %e, "couldn't allocate DPM client");
                return Step::QueryDeviceFormat;
            }
        };

        match cancellable(
            self.cancel,
            self.device
                .open_dpm_port(client, &[port], self.config.timeouts.dpm),
        )
        .await
        {
            Ok(()) => self.dpm = Some(client),
            Err(e) => {
                warn!(port = %self.data.name(), error = %e, "couldn't open DPM port");
                self.release(client).await;
            }
        }
        Step::QueryDeviceFormat
    }

    async fn query_device_format(&mut self) -> Result<Step> {
        let wda = self.wda_client()?;
        let timeout = self.config.timeouts.wda;
        let format = match cancellable(
            self.cancel,
            self.device.get_data_format(wda, None, timeout),
        )
        .await
        {
            Err(e) if e.is_missing_argument() && self.endpoint.is_defined() => {
                debug!(port = %self.data.name(), "retrying data format query with endpoint info");
                cancellable(
                    self.cancel,
                    self.device.get_data_format(wda, Some(self.endpoint), timeout),
                )
                .await?
            }
            other => other?,
        };
        self.record_device_format(&format);

        Ok(if self.action == DataFormatAction::Query {
            Step::Done
        } else {
            Step::SelectCombination
        })
    }

    fn record_device_format(&mut self, format: &DeviceDataFormat) {
        self.aggregation_supported |= format.aggregation_supported();
        self.current.protocol = format.link_layer_protocol;
        self.current.aggregation = format.aggregation();
        self.current.max_aggregation_size = format.downlink_max_size;
        self.current.kernel_mode = if self.driver.is_qmi_wwan() {
            probe::kernel_mode_from_expected(self.current.expected, self.current.aggregation)
        } else {
            probe::kernel_mode_assumed(self.supported.unwrap_or_default(), self.current.aggregation)
        };
        debug!(
            port = %self.data.name(),
            kernel_mode = %self.current.kernel_mode,
            protocol = %self.current.protocol,
            aggregation = %self.current.aggregation,
            max_size = self.current.max_aggregation_size,
            "current data format"
        );
    }

    fn select_combination(&mut self) -> Result<Step> {
        let from = match self.requested {
            None => 0,
            Some(requested) if self.current.matches(&requested) => return Ok(Step::Done),
            Some(requested) => {
                debug!(port = %self.data.name(), %requested, "data format not applied");
                self.candidate + 1
            }
        };

        let Some((index, combination)) = next_combination(
            self.supported.unwrap_or_default(),
            self.action,
            self.aggregation_supported,
            from,
        ) else {
            return Err(Error::Unsupported(match self.requested {
                None => format!(
                    "no usable data format for kernel modes [{}] ({:?})",
                    self.supported.unwrap_or_default(),
                    self.action
                ),
                Some(requested) => {
                    format!("data format {} not applied, no combination left", requested)
                }
            }));
        };

        if self.requested.is_none() && self.current.matches(&combination) {
            debug!(port = %self.data.name(), %combination, "data format already set");
            return Ok(Step::Done);
        }
        debug!(port = %self.data.name(), %combination, "selected data format");
        self.requested = Some(combination);
        self.candidate = index;
        Ok(Step::SyncDeviceFormat)
    }

    fn requested(&self) -> Result<Combination> {
        self.requested
            .ok_or_else(|| Error::WrongState("no data format selected".to_string()))
    }

    fn wda_client(&self) -> Result<ClientId> {
        self.wda
            .ok_or_else(|| Error::WrongState("no WDA client allocated".to_string()))
    }

    async fn sync_device_format(&mut self) -> Result<Step> {
        let requested = self.requested()?;
        if self.current.protocol == requested.protocol
            && self.current.aggregation == requested.aggregation
        {
            return Ok(Step::SyncMainMtu);
        }

        let dl_max_size =
            if self.driver.is_qmi_wwan() && requested.kernel_mode == KernelDataMode::MUX_RMNET {
                self.config.rmnet_qmi_wwan_max_size
            } else {
                self.config.dl_max_size
            };
        let request = DataFormatRequest {
            link_layer_protocol: requested.protocol,
            uplink_aggregation: requested.aggregation,
            downlink_aggregation: requested.aggregation,
            downlink_max_size: dl_max_size,
            downlink_max_datagrams: self.config.dl_max_datagrams,
            endpoint: self.endpoint.is_defined().then_some(self.endpoint),
        };

        let wda = self.wda_client()?;
        let applied = cancellable(
            self.cancel,
            self.device
                .set_data_format(wda, &request, self.config.timeouts.wda),
        )
        .await?;

        if applied.link_layer_protocol != requested.protocol
            || applied.aggregation() != requested.aggregation
        {
            return Err(Error::Rejected(format!(
                "device applied {} / {} instead of {} / {}",
                applied.link_layer_protocol,
                applied.aggregation(),
                requested.protocol,
                requested.aggregation
            )));
        }

        self.current.protocol = applied.link_layer_protocol;
        self.current.aggregation = applied.aggregation();
        self.current.max_aggregation_size = applied.downlink_max_size;
        Ok(Step::SyncMainMtu)
    }

    async fn sync_main_mtu(&mut self) -> Step {
        let Ok(requested) = self.requested() else {
            return Step::SyncKernelMode;
        };
        if !self.driver.is_qmi_wwan()
            || requested.kernel_mode != KernelDataMode::MUX_RMNET
            || !requested.is_aggregating()
        {
            return Step::SyncKernelMode;
        }

        let ceiling = self.config.rmnet_qmi_wwan_max_size;
        let mtu = match self.current.max_aggregation_size {
            0 => ceiling,
            size => size.min(ceiling),
        };

        // qmi_wwan only takes MTU changes in 802.3 mode.
        if self.current.expected != ExpectedDataFormat::Ieee8023 {
            if let Err(e) = self
                .device
                .set_expected_data_format(ExpectedDataFormat::Ieee8023)
            {
                warn!(port = %self.data.name(), error = %e, "couldn't switch to 802.3 to update MTU");
                return Step::SyncKernelMode;
            }
            self.current.expected = ExpectedDataFormat::Ieee8023;
        }

        let result = match self.data.ifindex() {
            Ok(ifindex) => {
                cancellable(
                    self.cancel,
                    self.netlink
                        .set_link(ifindex, false, Some(mtu), self.config.timeouts.netlink),
                )
                .await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!(port = %self.data.name(), mtu, "main interface MTU updated"),
            Err(e) => warn!(port = %self.data.name(), mtu, error = %e, "couldn't update main interface MTU"),
        }
        Step::SyncKernelMode
    }

    fn sync_kernel_mode(&mut self) -> Result<Step> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let requested = self.requested()?;
        if self.driver.is_qmi_wwan() {
            let target = probe::expected_format_for(requested.kernel_mode);
            let current = self.device.expected_data_format()?;
            if current != target {
                debug!(port = %self.data.name(), from = %current, to = %target, "updating kernel data format");
                self.device.set_expected_data_format(target)?;
            }
        }
        // Everything is read back on the next round.
        self.current = FormatSnapshot::default();
        Ok(Step::LoadCurrentMode)
    }
}
