//! QMI port data path façade.
//!
//! [`QmiPort`] owns the client table, the negotiated data format and the
//! link pool of one control port. Open, close, reset and data format setup
//! are serialized: while one runs, the others fail with [`Error::Busy`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PortConfig;
use crate::device::{
    ClientFlag, ClientId, EndpointInfo, ExpectedDataFormat, LinkFlags, LinkInfo, OpenFlags,
    QmiDevice, Service,
};
use crate::error::{Error, Result};
use crate::format::{AggregationProtocol, DataFormatAction, KernelDataMode, Protocol};
use crate::kernel::KernelDevice;
use crate::link_pool::LinkPool;
use crate::negotiator::{Negotiation, Negotiator};
use crate::netlink::{LinkControl, NetlinkTransport};
use crate::probe::{self, NetDriver};
use crate::util::cancellable;

type ClientKey = (Service, ClientFlag);

#[derive(Default)]
struct PortState {
    open: bool,
    clients: HashMap<ClientKey, ClientId>,
    supported: Option<KernelDataMode>,
    kernel_mode: KernelDataMode,
    protocol: Protocol,
    aggregation: AggregationProtocol,
    max_aggregation_size: u32,
    max_links: u32,
    endpoint: EndpointInfo,
    /// Set once the first multiplex setup ran; survives close.
    multiplex_activated: bool,
}

impl PortState {
    fn store(&mut self, negotiation: &Negotiation) {
        self.supported = Some(negotiation.supported);
        self.kernel_mode = negotiation.kernel_mode;
        self.protocol = negotiation.protocol;
        self.aggregation = negotiation.aggregation;
        self.max_aggregation_size = negotiation.max_aggregation_size;
        self.max_links = negotiation.max_multiplexed_links;
    }

    fn multiplex_enabled(&self) -> bool {
        self.kernel_mode.is_multiplexed() && self.aggregation.is_qmap()
    }

    /// Check if the cached format already is what `action` would set up.
    fn satisfies(&self, action: DataFormatAction) -> bool {
        if self.supported.is_none() || self.kernel_mode.is_empty() {
            return false;
        }
        match action {
            DataFormatAction::Query => true,
            DataFormatAction::SetMultiplex => self.multiplex_enabled(),
            DataFormatAction::SetDefault => {
                !self.kernel_mode.is_multiplexed()
                    && self.aggregation == AggregationProtocol::Disabled
            }
        }
    }

    fn reset_format(&mut self) {
        self.kernel_mode = KernelDataMode::empty();
        self.protocol = Protocol::Unknown;
        self.aggregation = AggregationProtocol::Unknown;
        self.max_aggregation_size = 0;
        self.max_links = 0;
    }
}

/// Clears the port's in-progress flag when dropped.
struct InProgress<'a>(&'a AtomicBool);

impl<'a> InProgress<'a> {
    fn acquire(flag: &'a AtomicBool, operation: &str) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                Error::Busy(format!(
                    "cannot {}: open, close or data format operation in progress",
                    operation
                ))
            })?;
        Ok(Self(flag))
    }
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn open_flags_for(format: ExpectedDataFormat) -> OpenFlags {
    let base = OpenFlags::VERSION_INFO | OpenFlags::PROXY | OpenFlags::NET_NO_QOS_HEADER;
    if format == ExpectedDataFormat::RawIp {
        base | OpenFlags::NET_RAW_IP
    } else {
        base | OpenFlags::NET_802_3
    }
}

/// Data path of one QMI control port.
///
/// # Example
///
/// ```ignore
/// use qmi_datapath::{DataFormatAction, QmiPort, SysfsNetDevice};
/// use qmi_datapath::netlink::NetlinkTransport;
/// use tokio_util::sync::CancellationToken;
///
/// let cancel = CancellationToken::new();
/// let port = QmiPort::new("cdc-wdm0", device, NetlinkTransport::shared())
///     .with_net_device(SysfsNetDevice::new("wwan0")?);
/// port.open(true, &cancel).await?;
///
/// let data = SysfsNetDevice::new("wwan0")?;
/// port.setup_data_format(&data, DataFormatAction::SetMultiplex, &cancel).await?;
/// let link = port.setup_link(&data, "qmapmux0.", &cancel).await?;
/// ```
pub struct QmiPort<D, L = Arc<NetlinkTransport>> {
    name: String,
    device: D,
    netlink: L,
    config: PortConfig,
    net_device: Option<Box<dyn KernelDevice>>,
    in_progress: AtomicBool,
    state: Mutex<PortState>,
    link_pool: Mutex<Option<Arc<LinkPool>>>,
}

impl<D: QmiDevice, L: LinkControl> QmiPort<D, L> {
    /// Create a closed port.
    pub fn new(name: impl Into<String>, device: D, netlink: L) -> Self {
        Self {
            name: name.into(),
            device,
            netlink,
            config: PortConfig::default(),
            net_device: None,
            in_progress: AtomicBool::new(false),
            state: Mutex::new(PortState::default()),
            link_pool: Mutex::new(None),
        }
    }

    /// Use a non-default configuration.
    pub fn with_config(mut self, config: PortConfig) -> Self {
        self.config = config;
        self
    }

    /// Main net device of the port, used to check the data format on open.
    pub fn with_net_device(mut self, device: impl KernelDevice + 'static) -> Self {
        self.net_device = Some(Box::new(device));
        self
    }

    /// Port name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying control channel.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Port configuration.
    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pool(&self) -> Option<Arc<LinkPool>> {
        self.link_pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace_pool(&self, pool: Option<Arc<LinkPool>>) -> Option<Arc<LinkPool>> {
        std::mem::replace(
            &mut *self
                .link_pool
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            pool,
        )
    }

    fn begin(&self, operation: &str) -> Result<InProgress<'_>> {
        InProgress::acquire(&self.in_progress, operation)
    }

    // ========================================================================
    // Open / close
    // ========================================================================

    /// Open the control channel.
    ///
    /// With `set_data_format` and a known net device, the current data
    /// format is checked. If the device can't report it, the channel is
    /// reopened asking for the kernel's encapsulation through CTL.
    pub async fn open(&self, set_data_format: bool, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.begin("open")?;
        if self.is_open() {
            return Ok(());
        }

        debug!(port = %self.name, "opening QMI device");
        match self.open_sequence(set_data_format, cancel).await {
            Ok(()) => {
                self.state().open = true;
                debug!(port = %self.name, "QMI port open operation finished successfully");
                Ok(())
            }
            Err(e) => {
                debug!(port = %self.name, error = %e, "QMI port open operation failed");
                if let Err(close_err) = self.device.close(self.config.timeouts.close).await {
                    warn!(port = %self.name, error = %close_err, "couldn't close QMI device after failed open");
                }
                Err(e)
            }
        }
    }

    async fn open_sequence(&self, set_data_format: bool, cancel: &CancellationToken) -> Result<()> {
        cancellable(
            cancel,
            self.device.open(
                OpenFlags::VERSION_INFO | OpenFlags::PROXY,
                self.config.timeouts.open,
            ),
        )
        .await?;

        if !set_data_format {
            return Ok(());
        }
        let Some(data) = self.net_device.as_deref() else {
            return Ok(());
        };

        let driver = NetDriver::of(data);
        self.state().endpoint = probe::endpoint_info(&driver, data);

        let kernel_format = if driver.is_qmi_wwan() {
            self.device
                .expected_data_format()
                .unwrap_or(ExpectedDataFormat::Unknown)
        } else {
            debug!(port = %self.name, "assuming default kernel data format: raw-ip");
            ExpectedDataFormat::RawIp
        };

        if kernel_format == ExpectedDataFormat::Unknown {
            debug!(port = %self.name, "unknown kernel data format, falling back to 802.3");
            return self
                .reopen_with_data_format(ExpectedDataFormat::Ieee8023, cancel)
                .await;
        }

        let supported = self.state().supported;
        match Negotiator::new(
            &self.device,
            &self.netlink,
            data,
            &self.config,
            cancel,
            DataFormatAction::Query,
        )
        .supported_modes(supported)
        .run()
        .await
        {
            Ok(negotiation) => {
                self.state().store(&negotiation);
                Ok(())
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                debug!(port = %self.name, error = %e, "couldn't query data format, reopening with CTL data format");
                self.reopen_with_data_format(kernel_format, cancel).await
            }
        }
    }

    async fn reopen_with_data_format(
        &self,
        format: ExpectedDataFormat,
        cancel: &CancellationToken,
    ) -> Result<()> {
        debug!(port = %self.name, "closing device to reopen it right away");
        cancellable(cancel, self.device.close(self.config.timeouts.close)).await?;

        let first = if format == ExpectedDataFormat::RawIp {
            ExpectedDataFormat::RawIp
        } else {
            ExpectedDataFormat::Ieee8023
        };
        let applied = match cancellable(
            cancel,
            self.device
                .open(open_flags_for(first), self.config.timeouts.reopen),
        )
        .await
        {
            Ok(()) => first,
            Err(e) if e.is_protocol_rejected() => {
                let other = if first == ExpectedDataFormat::RawIp {
                    ExpectedDataFormat::Ieee8023
                } else {
                    ExpectedDataFormat::RawIp
                };
                debug!(port = %self.name, error = %e, to = %other, "data format rejected, reopening with the other one");
                cancellable(
                    cancel,
                    self.device
                        .open(open_flags_for(other), self.config.timeouts.reopen),
                )
                .await?;
                other
            }
            Err(e) => return Err(e),
        };

        debug!(port = %self.name, format = %applied, "reopened device with data format");
        self.state().protocol = if applied == ExpectedDataFormat::RawIp {
            Protocol::RawIp
        } else {
            Protocol::Framed8023
        };
        Ok(())
    }

    /// Release all clients, delete all links and close the control channel.
    ///
    /// Client and link cleanup is best-effort.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.begin("close")?;

        let clients: Vec<ClientId> = {
            let mut state = self.state();
            if !state.open {
                return Ok(());
            }
            state.open = false;
            state.reset_format();
            state.clients.drain().map(|(_, client)| client).collect()
        };

        for client in clients {
            if let Err(e) = self
                .device
                .release_client(client, self.config.timeouts.release_client)
                .await
            {
                warn!(port = %self.name, client = %client, error = %e, "couldn't release client");
            }
        }

        if let Some(pool) = self.replace_pool(None) {
            pool.teardown(&self.device, self.config.timeouts.link).await;
        }

        debug!(port = %self.name, "closing QMI device");
        self.device.close(self.config.timeouts.close).await
    }

    // ========================================================================
    // Clients
    // ========================================================================

    /// Allocate a client for `service`, stored under (`service`, `flag`).
    pub async fn allocate_client(
        &self,
        service: Service,
        flag: ClientFlag,
        cancel: &CancellationToken,
    ) -> Result<ClientId> {
        self.check_client_slot(service, flag)?;

        let client = cancellable(
            cancel,
            self.device
                .allocate_client(service, self.config.timeouts.allocate_client),
        )
        .await?;

        let stored = {
            let mut state = self.state();
            match self.check_client_slot_locked(&state, service, flag) {
                Ok(()) => {
                    state.clients.insert((service, flag), client);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        if let Err(e) = stored {
            // Lost a race with a concurrent allocation or close.
            if let Err(release_err) = self
                .device
                .release_client(client, self.config.timeouts.release_client)
                .await
            {
                warn!(port = %self.name, client = %client, error = %release_err, "couldn't release client");
            }
            return Err(e);
        }
        Ok(client)
    }

    fn check_client_slot(&self, service: Service, flag: ClientFlag) -> Result<()> {
        self.check_client_slot_locked(&self.state(), service, flag)
    }

    fn check_client_slot_locked(
        &self,
        state: &PortState,
        service: Service,
        flag: ClientFlag,
    ) -> Result<()> {
        if !state.open {
            return Err(Error::WrongState(format!("port {} not open", self.name)));
        }
        if state.clients.contains_key(&(service, flag)) {
            return Err(Error::AlreadyExists(format!(
                "client for service {} ({:?})",
                service, flag
            )));
        }
        Ok(())
    }

    /// Release the client stored under (`service`, `flag`), if any.
    pub async fn release_client(&self, service: Service, flag: ClientFlag) {
        let Some(client) = self.state().clients.remove(&(service, flag)) else {
            return;
        };
        if let Err(e) = self
            .device
            .release_client(client, self.config.timeouts.release_client)
            .await
        {
            warn!(port = %self.name, client = %client, error = %e, "couldn't release client");
        }
    }

    /// Client stored under (`service`, `flag`).
    pub fn peek_client(&self, service: Service, flag: ClientFlag) -> Option<ClientId> {
        self.state().clients.get(&(service, flag)).copied()
    }

    // ========================================================================
    // Links
    // ========================================================================

    fn multiplex_pool(&self) -> Result<(Arc<LinkPool>, AggregationProtocol)> {
        let aggregation = {
            let state = self.state();
            if !state.multiplex_enabled() {
                return Err(Error::WrongState(format!(
                    "multiplexing not enabled on {} (kernel {}, aggregation {})",
                    self.name, state.kernel_mode, state.aggregation
                )));
            }
            state.aggregation
        };
        let pool = self
            .pool()
            .ok_or_else(|| Error::WrongState(format!("no link pool on {}", self.name)))?;
        Ok((pool, aggregation))
    }

    /// Get a multiplexed link on top of `data` for a new data session.
    ///
    /// `ifname_prefix` is the name prefix for newly created links.
    pub async fn setup_link(
        &self,
        data: &dyn KernelDevice,
        ifname_prefix: &str,
        cancel: &CancellationToken,
    ) -> Result<LinkInfo> {
        let (pool, aggregation) = self.multiplex_pool()?;
        let flags = if pool.is_preallocated() {
            LinkFlags::empty()
        } else {
            probe::link_flags(data, aggregation)
        };
        cancellable(
            cancel,
            pool.setup_link(
                &self.device,
                data.name(),
                ifname_prefix,
                flags,
                self.config.timeouts.link,
            ),
        )
        .await
    }

    /// Give back a link obtained from [`setup_link`](Self::setup_link).
    pub async fn cleanup_link(
        &self,
        link_name: &str,
        mux_id: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (pool, _) = self.multiplex_pool()?;
        cancellable(
            cancel,
            pool.cleanup_link(&self.device, link_name, mux_id, self.config.timeouts.link),
        )
        .await
    }

    /// Number of links currently handed out.
    pub fn allocated_links(&self) -> usize {
        self.pool().map(|p| p.allocated()).unwrap_or(0)
    }

    // ========================================================================
    // Data format
    // ========================================================================

    /// Bring the data format of `data` in line with `action`.
    ///
    /// Does nothing if the cached format already fits, except the very first
    /// multiplex setup, which always starts from a clean state.
    pub async fn setup_data_format(
        &self,
        data: &dyn KernelDevice,
        action: DataFormatAction,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _guard = self.begin("set up data format")?;
        self.check_open()?;

        if action == DataFormatAction::Query {
            return self.negotiate(data, action, cancel).await;
        }

        if action == DataFormatAction::SetDefault {
            let allocated = self.allocated_links();
            if allocated > 0 {
                return Err(Error::Conflict(format!(
                    "{} multiplexed links still allocated on {}",
                    allocated, self.name
                )));
            }
        }

        let first_multiplex = {
            let state = self.state();
            let first = action == DataFormatAction::SetMultiplex && !state.multiplex_activated;
            if !first && state.satisfies(action) {
                debug!(port = %self.name, ?action, "data format already set up");
                return Ok(());
            }
            first
        };

        if first_multiplex {
            debug!(port = %self.name, "first multiplex setup, resetting links");
            self.delete_links(data).await;
        }

        self.bring_down(data, cancel).await?;
        self.negotiate(data, action, cancel).await?;
        if first_multiplex {
            self.state().multiplex_activated = true;
        }
        self.rebuild_pool().await;
        Ok(())
    }

    /// Delete all links on `data`, bring it down and restore the default
    /// data format.
    pub async fn reset(&self, data: &dyn KernelDevice, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.begin("reset")?;
        self.check_open()?;

        info!(port = %self.name, main = %data.name(), "resetting data format");
        self.delete_links(data).await;
        self.bring_down(data, cancel).await?;
        self.negotiate(data, DataFormatAction::SetDefault, cancel)
            .await?;
        self.rebuild_pool().await;
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.state().open {
            Ok(())
        } else {
            Err(Error::WrongState(format!("port {} not open", self.name)))
        }
    }

    async fn delete_links(&self, data: &dyn KernelDevice) {
        if let Some(pool) = self.replace_pool(None) {
            pool.teardown(&self.device, self.config.timeouts.link).await;
        }
        if !self.device.supports_link_management() {
            return;
        }
        if let Err(e) = self
            .device
            .delete_all_links(data.name(), self.config.timeouts.link)
            .await
        {
            warn!(port = %self.name, main = %data.name(), error = %e, "couldn't delete all links");
        }
    }

    async fn bring_down(&self, data: &dyn KernelDevice, cancel: &CancellationToken) -> Result<()> {
        let ifindex = data.ifindex()?;
        cancellable(
            cancel,
            self.netlink
                .set_link(ifindex, false, None, self.config.timeouts.netlink),
        )
        .await
        .map_err(|e| e.with_context(format!("bringing {} down", data.name())))
    }

    async fn negotiate(
        &self,
        data: &dyn KernelDevice,
        action: DataFormatAction,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (supported, has_dpm) = {
            let mut state = self.state();
            state.endpoint = probe::endpoint_info(&NetDriver::of(data), data);
            (
                state.supported,
                state
                    .clients
                    .contains_key(&(Service::Dpm, ClientFlag::Default)),
            )
        };

        let result = Negotiator::new(&self.device, &self.netlink, data, &self.config, cancel, action)
            .supported_modes(supported)
            .skip_dpm(has_dpm)
            .run()
            .await;

        let mut state = self.state();
        match result {
            Ok(negotiation) => {
                state.store(&negotiation);
                if let Some(dpm) = negotiation.dpm_client {
                    state.clients.insert((Service::Dpm, ClientFlag::Default), dpm);
                }
                Ok(())
            }
            Err(e) => {
                // Whatever was half-applied is unknown now.
                if action != DataFormatAction::Query {
                    state.reset_format();
                }
                Err(e)
            }
        }
    }

    async fn rebuild_pool(&self) {
        let mode = self.state().kernel_mode;
        let keep = match self.pool() {
            Some(pool) => {
                (mode == KernelDataMode::MUX_RMNET && !pool.is_preallocated())
                    || (mode == KernelDataMode::MUX_QMIWWAN && pool.is_preallocated())
            }
            None => false,
        };
        if keep {
            return;
        }

        let pool = LinkPool::for_mode(mode, self.config.pool_size).map(Arc::new);
        if let Some(old) = self.replace_pool(pool) {
            old.teardown(&self.device, self.config.timeouts.link).await;
        }
    }

    // ========================================================================
    // Getters
    // ========================================================================

    /// Check if the control channel is open.
    pub fn is_open(&self) -> bool {
        self.state().open
    }

    /// Kernel data modes supported, once loaded.
    pub fn supported_kernel_data_modes(&self) -> Option<KernelDataMode> {
        self.state().supported
    }

    /// Negotiated kernel data mode.
    pub fn kernel_data_mode(&self) -> KernelDataMode {
        self.state().kernel_mode
    }

    /// Negotiated link layer protocol.
    pub fn link_layer_protocol(&self) -> Protocol {
        self.state().protocol
    }

    /// Negotiated aggregation protocol.
    pub fn aggregation_protocol(&self) -> AggregationProtocol {
        self.state().aggregation
    }

    /// Negotiated downlink aggregation size.
    pub fn max_aggregation_size(&self) -> u32 {
        self.state().max_aggregation_size
    }

    /// Multiplexed links the negotiated setup can offer.
    pub fn max_multiplexed_links(&self) -> u32 {
        self.state().max_links
    }

    /// Endpoint info of the last data port used.
    pub fn endpoint_info(&self) -> EndpointInfo {
        self.state().endpoint
    }
}
