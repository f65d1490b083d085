//! Shell-script stand-ins for the host tools.

use tempfile::TempDir;

use crate::host::HostCommand;

/// Write `body` to a script and return a command that runs it through `sh`.
///
/// Keep the returned directory alive for as long as the command is used.
pub fn fake_host(body: &str) -> (TempDir, HostCommand) {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("fake-tool.sh");
    std::fs::write(&script, body).unwrap();
    let host = HostCommand::new("sh").with_prefix([script.to_string_lossy().into_owned()]);
    (dir, host)
}
