//! qmi-dp link command.

use std::time::Duration;

use clap::{Args, ValueEnum};
use qmi_datapath::netlink::{DEFAULT_TIMEOUT, LinkControl, NetlinkTransport};
use qmi_datapath::{KernelDevice, SysfsNetDevice};

#[derive(Clone, Copy, ValueEnum)]
enum State {
    Up,
    Down,
}

#[derive(Args)]
pub struct LinkCmd {
    /// Interface name.
    dev: String,

    /// Administrative state to set.
    state: State,

    /// Set MTU in the same request.
    #[arg(long)]
    mtu: Option<u32>,

    /// Seconds to wait for the kernel's ack.
    #[arg(long)]
    timeout: Option<u64>,
}

impl LinkCmd {
    pub async fn run(&self) -> anyhow::Result<()> {
        let data = SysfsNetDevice::new(&self.dev)?;
        let ifindex = data.ifindex()?;
        let timeout = self
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        let netlink = NetlinkTransport::new();
        netlink
            .set_link(ifindex, matches!(self.state, State::Up), self.mtu, timeout)
            .await?;
        Ok(())
    }
}
