use std::io::{BufRead, Write};

use diagd_rate_limit::StoreRegistry;
use tracing::warn;

/// One line of intake: `<store> <key> [count]`.
#[derive(Debug, PartialEq, Eq)]
pub struct IntakeEvent<'a> {
    pub store: &'a str,
    pub key: &'a str,
    pub count: u32,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct IntakeSummary {
    pub accepted: u64,
    pub throttled: u64,
    pub skipped: u64,
}

/// Parse a line. Blank lines and `#` comments yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<IntakeEvent<'_>>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut parts = line.split_whitespace();
    let store = parts.next().ok_or("missing store")?;
    let key = parts.next().ok_or("missing key")?;
    let count = match parts.next() {
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|e| format!("invalid count '{}': {}", raw, e))?,
        None => 1,
    };
    if parts.next().is_some() {
        return Err("trailing fields".to_string());
    }

    Ok(Some(IntakeEvent { store, key, count }))
}

/// Answer every event read from `input` with `accept` or `throttle`.
///
/// Lines that are not valid UTF-8 are skipped like any other malformed line.
pub fn run(
    mut input: impl BufRead,
    mut output: impl Write,
    registry: &StoreRegistry,
) -> std::io::Result<IntakeSummary> {
    let mut summary = IntakeSummary::default();
    let mut buf = Vec::new();
    let mut index = 0usize;

    loop {
        buf.clear();
        if input.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        index += 1;

        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line,
            Err(e) => {
                warn!(line = index, error = %e, "skipping intake line that is not UTF-8");
                summary.skipped += 1;
                continue;
            }
        };
        let event = match parse_line(line) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(reason) => {
                warn!(line = index, reason = %reason, "skipping malformed intake line");
                summary.skipped += 1;
                continue;
            }
        };

        match registry.take(event.store, event.key, event.count) {
            Ok(true) => {
                summary.accepted += 1;
                writeln!(output, "accept")?;
            }
            Ok(false) => {
                summary.throttled += 1;
                writeln!(output, "throttle")?;
            }
            Err(e) => {
                warn!(line = index, error = %e, "skipping intake line");
                summary.skipped += 1;
            }
        }
        output.flush()?;
    }

    Ok(summary)
}
