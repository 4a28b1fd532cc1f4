//! qmi-dp config command.

use std::fs;
use std::path::PathBuf;

use clap::Args;
use qmi_datapath::PortConfig;

use super::Output;

#[derive(Args)]
pub struct ConfigCmd {
    /// JSON file to load; missing fields take their defaults.
    file: Option<PathBuf>,
}

impl ConfigCmd {
    pub fn run(&self, output: &Output) -> anyhow::Result<()> {
        let config: PortConfig = match &self.file {
            Some(path) => serde_json::from_str(&fs::read_to_string(path)?)?,
            None => PortConfig::default(),
        };

        if output.json {
            return output.print_json(&config);
        }

        println!("pool size: {}", config.pool_size);
        println!("dl max size: {}", config.dl_max_size);
        println!("rmnet over qmi_wwan max size: {}", config.rmnet_qmi_wwan_max_size);
        println!("dl max datagrams: {}", config.dl_max_datagrams);
        let t = &config.timeouts;
        println!(
            "timeouts: open {:?} reopen {:?} close {:?} wda {:?} dpm {:?} link {:?} netlink {:?}",
            t.open, t.reopen, t.close, t.wda, t.dpm, t.link, t.netlink
        );
        Ok(())
    }
}
