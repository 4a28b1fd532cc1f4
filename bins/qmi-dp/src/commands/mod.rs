//! qmi-dp subcommands.

pub mod combinations;
pub mod config;
pub mod info;
pub mod link;

use std::io::{self, Write};

use serde::Serialize;

/// How results are printed.
pub struct Output {
    pub json: bool,
    pub pretty: bool,
}

impl Output {
    /// Print `value` as JSON.
    pub fn print_json<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        let mut stdout = io::stdout().lock();
        if self.pretty {
            serde_json::to_writer_pretty(&mut stdout, value)?;
        } else {
            serde_json::to_writer(&mut stdout, value)?;
        }
        writeln!(stdout)?;
        Ok(())
    }
}
