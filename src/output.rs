use std::io::{self, Write};

use serde::Serialize;
use tracing::info;

use crate::app::{ClearResult, ProgressEvent, ProgressSink, SnapshotSummary, VerifyResult};

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_fetch(result: &SnapshotSummary) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_verify(result: &VerifyResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_clear(result: &ClearResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Forwards progress events to the tracing subscriber.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}
