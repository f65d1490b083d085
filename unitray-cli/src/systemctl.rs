use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use unitray_core::candidate::{
    DiscoveryError, UnitFileEntry, UnitProperties, UnitSource, parse_unit_files,
    parse_unit_properties,
};

use crate::host::HostCommand;

/// Every invocation is scoped to the user's service manager
const USER_SCOPE: &str = "--user";

/// Captured result of one finished invocation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn from_std(output: std::process::Output) -> Self {
        Self {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Why an invocation produced no output to interpret
#[derive(Debug, thiserror::Error)]
pub enum SystemctlError {
    #[error("Command timed out")]
    Timeout,
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
}

/// Async access to the user service manager
#[async_trait]
pub trait ServiceManager: Send + Sync + 'static {
    /// Run with `args` after the user-scope flag, killing the process after `timeout`
    async fn run(&self, args: &[String], timeout: Duration)
    -> Result<CommandOutput, SystemctlError>;
}

/// `systemctl --user`
#[derive(Clone, Debug)]
pub struct Systemctl {
    host: HostCommand,
}

impl Systemctl {
    pub fn new(host: HostCommand) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &HostCommand {
        &self.host
    }

    fn scoped<S: AsRef<str>>(args: &[S]) -> Vec<String> {
        std::iter::once(USER_SCOPE.to_string())
            .chain(args.iter().map(|a| a.as_ref().to_string()))
            .collect()
    }

    /// Synchronous invocation, for discovery and one-off checks
    pub fn run_blocking<S: AsRef<str>>(
        &self,
        args: &[S],
    ) -> Result<CommandOutput, SystemctlError> {
        let args = Self::scoped(args);
        debug!(command = %self.host.display_with(&args), "running");
        let output = self
            .host
            .std_command(&args)
            .output()
            .map_err(|source| SystemctlError::Spawn {
                command: self.host.display_with(&args),
                source,
            })?;
        Ok(CommandOutput::from_std(output))
    }
}

#[async_trait]
impl ServiceManager for Systemctl {
    async fn run(
        &self,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, SystemctlError> {
        let args = Self::scoped(args);
        let command = self.host.display_with(&args);
        debug!(%command, ?timeout, "running");

        // kill_on_drop reaps the child when the timeout drops the future
        let child = self.host.tokio_command(&args).output();
        match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => {
                let output = CommandOutput::from_std(output);
                debug!(%command, code = ?output.code, "finished");
                Ok(output)
            }
            Ok(Err(source)) => Err(SystemctlError::Spawn { command, source }),
            Err(_) => {
                warn!(%command, ?timeout, "timed out");
                Err(SystemctlError::Timeout)
            }
        }
    }
}

impl UnitSource for Systemctl {
    fn list_unit_files(&self) -> Result<Vec<UnitFileEntry>, DiscoveryError> {
        let output = self
            .run_blocking(&["list-unit-files", "--type=service", "--no-legend", "--no-pager"])
            .map_err(|e| DiscoveryError(e.to_string()))?;
        if !output.success() {
            return Err(DiscoveryError(format!(
                "exit code {:?}: {}",
                output.code,
                output.stderr.trim()
            )));
        }
        Ok(parse_unit_files(&output.stdout))
    }

    fn describe(&self, unit: &str) -> UnitProperties {
        match self.run_blocking(&[
            "show",
            unit,
            "--property=Description",
            "--property=FragmentPath",
        ]) {
            Ok(output) if output.success() => parse_unit_properties(&output.stdout),
            Ok(output) => {
                debug!(unit, code = ?output.code, "show failed");
                UnitProperties::default()
            }
            Err(e) => {
                debug!(unit, error = %e, "show failed");
                UnitProperties::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fake_host;
    use unitray_core::candidate::discover;

    const SCRIPT: &str = r#"
[ "$1" = "--user" ] || { echo "missing --user" >&2; exit 64; }
shift
case "$1" in
  is-active) echo active; exit 0 ;;
  stop) echo "Failed to stop $2: Unit $2 not loaded." >&2; exit 5 ;;
  restart) sleep 5 ;;
  list-unit-files)
    printf 'myapp.service enabled enabled\n'
    printf 'dbus-broker.service static -\n'
    ;;
  show)
    if [ "$2" = "myapp.service" ]; then
      printf 'Description=My App\nFragmentPath=/home/u/.config/systemd/user/myapp.service\n'
    else
      exit 1
    fi
    ;;
esac
"#;

    #[tokio::test]
    async fn test_run_captures_output() {
        let (_dir, host) = fake_host(SCRIPT);
        let systemctl = Systemctl::new(host);

        let out = systemctl
            .run(&["is-active".into(), "a.service".into()], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "active");

        let out = systemctl
            .run(&["stop".into(), "a.service".into()], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.code, Some(5));
        assert!(out.stderr.contains("not loaded"));
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let (_dir, host) = fake_host(SCRIPT);
        let systemctl = Systemctl::new(host);
        let result = systemctl
            .run(&["restart".into(), "a.service".into()], Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(SystemctlError::Timeout)));
        assert_eq!(SystemctlError::Timeout.to_string(), "Command timed out");
    }

    #[tokio::test]
    async fn test_run_spawn_error() {
        let systemctl = Systemctl::new(HostCommand::new("/nonexistent/unitray-systemctl"));
        let result = systemctl
            .run(&["is-active".into(), "a.service".into()], Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(SystemctlError::Spawn { .. })));
    }

    #[test]
    fn test_discovery_through_systemctl() {
        let (_dir, host) = fake_host(SCRIPT);
        let found = discover(&Systemctl::new(host));
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].unit, "myapp.service");
        assert_eq!(found[0].description, "My App");
        assert!(!found[0].hidden);
        // show failed: empty description, no path
        assert_eq!(found[1].description, "");
        assert_eq!(found[1].fragment_path, None);
        assert!(found[1].hidden);
    }

    #[test]
    fn test_enumeration_failure_is_empty() {
        let (_dir, host) = fake_host("exit 1");
        assert!(discover(&Systemctl::new(host)).is_empty());

        let missing = Systemctl::new(HostCommand::new("/nonexistent/unitray-systemctl"));
        assert!(discover(&missing).is_empty());
    }
}
