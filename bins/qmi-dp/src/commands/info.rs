//! qmi-dp info command.

use clap::Args;
use qmi_datapath::probe::{self, NetDriver};
use qmi_datapath::{AggregationProtocol, EndpointInfo, HardwareDataPort, KernelDevice, SysfsNetDevice};
use serde::Serialize;

use super::Output;

#[derive(Args)]
pub struct InfoCmd {
    /// Data port interface name.
    dev: String,
}

#[derive(Serialize)]
struct PortInfo {
    ifname: String,
    ifindex: u32,
    driver: String,
    endpoint: EndpointInfo,
    /// `None` when the modes depend on the running kernel (qmi_wwan).
    kernel_modes: Option<String>,
    hardware_port: Option<HardwarePort>,
    qmapv5_link_flags: u32,
}

#[derive(Serialize)]
struct HardwarePort {
    rx_endpoint_id: u32,
    tx_endpoint_id: u32,
}

impl From<HardwareDataPort> for HardwarePort {
    fn from(port: HardwareDataPort) -> Self {
        Self {
            rx_endpoint_id: port.rx_endpoint_id,
            tx_endpoint_id: port.tx_endpoint_id,
        }
    }
}

impl InfoCmd {
    pub fn run(&self, output: &Output) -> anyhow::Result<()> {
        let data = SysfsNetDevice::new(&self.dev)?;
        let driver = NetDriver::of(&data);
        let endpoint = probe::endpoint_info(&driver, &data);

        let info = PortInfo {
            ifname: data.name().to_string(),
            ifindex: data.ifindex()?,
            driver: driver.to_string(),
            endpoint,
            kernel_modes: probe::static_kernel_modes(&driver).map(|m| m.to_string()),
            hardware_port: probe::hardware_data_port(endpoint, &data).map(HardwarePort::from),
            qmapv5_link_flags: probe::link_flags(&data, AggregationProtocol::QmapV5).bits(),
        };

        if output.json {
            return output.print_json(&info);
        }

        println!("{}: index {} driver {}", info.ifname, info.ifindex, info.driver);
        println!(
            "    endpoint {:?} interface {}",
            info.endpoint.endpoint_type, info.endpoint.interface_number
        );
        match &info.kernel_modes {
            Some(modes) => println!("    kernel modes: {}", modes),
            None => println!("    kernel modes: probed through the QMI device"),
        }
        if let Some(port) = &info.hardware_port {
            println!(
                "    hardware port: rx {} tx {}",
                port.rx_endpoint_id, port.tx_endpoint_id
            );
        }
        if info.qmapv5_link_flags != 0 {
            println!("    link flags (qmapv5): {:#x}", info.qmapv5_link_flags);
        }
        Ok(())
    }
}
