//! qmi-dp combinations command.

use clap::{Args, ValueEnum};
use qmi_datapath::format::max_multiplexed_links;
use qmi_datapath::{COMBINATIONS, Combination, DataFormatAction, KernelDataMode, select_combination};
use serde::Serialize;

use super::Output;

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    #[value(name = "802-3")]
    Framed8023,
    RawIp,
    MuxRmnet,
    MuxQmiwwan,
}

impl From<Mode> for KernelDataMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Framed8023 => KernelDataMode::FRAMED_8023,
            Mode::RawIp => KernelDataMode::RAW_IP,
            Mode::MuxRmnet => KernelDataMode::MUX_RMNET,
            Mode::MuxQmiwwan => KernelDataMode::MUX_QMIWWAN,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Action {
    Query,
    SetDefault,
    SetMultiplex,
}

impl From<Action> for DataFormatAction {
    fn from(action: Action) -> Self {
        match action {
            Action::Query => DataFormatAction::Query,
            Action::SetDefault => DataFormatAction::SetDefault,
            Action::SetMultiplex => DataFormatAction::SetMultiplex,
        }
    }
}

#[derive(Args)]
pub struct CombinationsCmd {
    /// Supported kernel modes; selects the best entry for them.
    #[arg(short, long, value_delimiter = ',')]
    modes: Vec<Mode>,

    /// Action to select for.
    #[arg(short, long, value_enum, default_value = "set-multiplex")]
    action: Action,

    /// Assume the device reports no aggregation support.
    #[arg(long)]
    no_aggregation: bool,

    /// Preallocated pool size, for the link count.
    #[arg(long, default_value_t = qmi_datapath::config::DEFAULT_POOL_SIZE)]
    pool_size: usize,
}

#[derive(Serialize)]
struct Selection {
    combination: Combination,
    max_links: u32,
}

impl CombinationsCmd {
    pub fn run(&self, output: &Output) -> anyhow::Result<()> {
        if self.modes.is_empty() {
            if output.json {
                return output.print_json(&COMBINATIONS);
            }
            for (i, combination) in COMBINATIONS.iter().enumerate() {
                println!("{}: {}", i, combination);
            }
            return Ok(());
        }

        let supported = self
            .modes
            .iter()
            .fold(KernelDataMode::empty(), |acc, &m| acc | KernelDataMode::from(m));
        let aggregation = !self.no_aggregation;
        let selection = Selection {
            combination: select_combination(supported, self.action.into(), aggregation)?,
            max_links: max_multiplexed_links(supported, aggregation, self.pool_size),
        };

        if output.json {
            return output.print_json(&selection);
        }
        println!("{}", selection.combination);
        println!("    max links: {}", selection.max_links);
        Ok(())
    }
}
