//! Journal log follower (`journalctl --user -u UNIT`).

use std::io::Write;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

use unitray_core::config::LogOptions;

use crate::host::HostCommand;

/// Printed once the journal process has exited
pub const STREAM_ENDED: &str = "[log stream ended]";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalRequest {
    pub unit: String,
    /// Lines of history to show first; 0 leaves journalctl's default
    pub lines: u32,
    pub follow: bool,
}

impl JournalRequest {
    pub fn new(unit: impl Into<String>, options: LogOptions) -> Self {
        Self {
            unit: unit.into(),
            lines: options.lines,
            follow: options.follow,
        }
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["--user".to_string(), "-u".to_string(), self.unit.clone()];
        if self.lines > 0 {
            args.push("-n".into());
            args.push(self.lines.to_string());
        }
        args.push("-o".into());
        args.push("short-iso".into());
        if self.follow {
            args.push("-f".into());
        }
        args
    }
}

fn forward<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

/// Stream the journal into `out` until journalctl exits.
///
/// Standard output and error are merged line by line. Dropping the future
/// kills the journal process.
pub async fn stream<W: Write>(
    host: &HostCommand,
    request: &JournalRequest,
    out: &mut W,
) -> std::io::Result<Option<i32>> {
    let args = request.args();
    debug!(command = %host.display_with(&args), "following journal");
    let mut child = host.tokio_command(&args).spawn()?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        forward(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward(stderr, tx.clone());
    }
    drop(tx);

    while let Some(line) = rx.recv().await {
        writeln!(out, "{}", line)?;
        out.flush()?;
    }

    let status = child.wait().await?;
    debug!(code = ?status.code(), "journal exited");
    writeln!(out, "{}", STREAM_ENDED)?;
    Ok(status.code())
}
