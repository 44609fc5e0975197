// =============================================================================
// Console - line-based selection input on stdin
// =============================================================================
//
//   symbol <instrument>     switch instrument (e.g. `symbol bnbusdt`)
//   interval <resolution>   switch resolution (e.g. `interval 5m`)
//   show                    log the active series
//   errors                  log recent diagnostics
//   quit                    stop ingestion and exit
// =============================================================================

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::diagnostics::Diagnostics;
use crate::ingestion::{Command, SeriesSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Select(ConsoleSelect),
    Show,
    Errors,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleSelect {
    Instrument(String),
    Resolution(String),
}

/// Parse one console line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<ConsoleInput>, String> {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        return Ok(None);
    };
    let arg = parts.next();
    if parts.next().is_some() {
        return Err(format!("too many arguments: {line:?}"));
    }

    let input = match (verb.to_lowercase().as_str(), arg) {
        ("symbol" | "instrument", Some(s)) => ConsoleInput::Select(ConsoleSelect::Instrument(s.to_string())),
        ("interval" | "resolution", Some(r)) => ConsoleInput::Select(ConsoleSelect::Resolution(r.to_string())),
        ("show", None) => ConsoleInput::Show,
        ("errors", None) => ConsoleInput::Errors,
        ("quit" | "exit", None) => ConsoleInput::Quit,
        ("symbol" | "instrument" | "interval" | "resolution", None) => {
            return Err(format!("{verb} needs a value"));
        }
        _ => return Err(format!("unknown command: {line:?}")),
    };
    Ok(Some(input))
}

impl From<ConsoleSelect> for Command {
    fn from(select: ConsoleSelect) -> Self {
        match select {
            ConsoleSelect::Instrument(s) => Command::SetInstrument(s),
            ConsoleSelect::Resolution(r) => Command::SetResolution(r),
        }
    }
}

/// Read stdin, forwarding selections to the controller. `quit` requests
/// shutdown; EOF only ends console input.
pub async fn run_console(
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<SeriesSnapshot>,
    diagnostics: Arc<Diagnostics>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("console ready: symbol <s> | interval <r> | show | errors | quit");

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("stdin closed, console input disabled");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to read stdin");
                return;
            }
        };

        match parse_line(&line) {
            Ok(None) => {}
            Ok(Some(ConsoleInput::Select(select))) => {
                if commands.send(select.into()).await.is_err() {
                    return;
                }
            }
            Ok(Some(ConsoleInput::Show)) => {
                let snap = snapshots.borrow();
                info!(
                    key = %snap.key,
                    len = snap.series.len(),
                    last_close = ?snap.series.last_close(),
                    version = snap.version,
                    "active series"
                );
            }
            Ok(Some(ConsoleInput::Errors)) => {
                let counters = diagnostics.counters();
                info!(?counters, "ingestion counters");
                for record in diagnostics.recent_errors() {
                    info!(kind = record.kind, at = %record.at, "{}", record.message);
                }
            }
            Ok(Some(ConsoleInput::Quit)) => {
                let _ = commands.send(Command::Shutdown).await;
                return;
            }
            Err(e) => warn!(error = %e, "ignoring console input"),
        }
    }
}
