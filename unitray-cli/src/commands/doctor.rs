use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use unitray_core::candidate::UnitSource;
use unitray_core::config::TrayConfig;

use crate::host::HostCommand;
use crate::systemctl::Systemctl;

#[derive(Debug)]
pub struct Check {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub hint: Option<String>,
}

impl Check {
    fn ok(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: message.into(),
            hint: None,
        }
    }

    fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: message.into(),
            hint: None,
        }
    }

    fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Print environment and configuration checks; returns how many failed
pub fn run_doctor<W: Write>(
    systemctl: &Systemctl,
    journalctl: &HostCommand,
    config_path: &Path,
    out: &mut W,
) -> std::io::Result<usize> {
    writeln!(out, "unitray doctor\n")?;

    let mut checks = vec![
        check_version("systemctl", systemctl.host()),
        check_user_manager(systemctl),
        check_version("journalctl", journalctl),
    ];

    writeln!(out, "Environment:")?;
    for check in &checks {
        print_check(out, check)?;
    }
    writeln!(out)?;

    writeln!(out, "Configuration: {}", config_path.display())?;
    let (config_check, config) = check_config(config_path);
    print_check(out, &config_check)?;
    checks.push(config_check);
    writeln!(out)?;

    if let Some(config) = config.filter(|c| c.tracked().next().is_some()) {
        writeln!(out, "Services:")?;
        for check in check_units(systemctl, &config) {
            print_check(out, &check)?;
            checks.push(check);
        }
        writeln!(out)?;
    }

    let failed: Vec<_> = checks.iter().filter(|c| !c.passed).collect();
    if failed.is_empty() {
        writeln!(out, "All checks passed!")?;
    } else {
        writeln!(out, "Issues found:")?;
        for check in &failed {
            writeln!(out, "  - {}: {}", check.name, check.message)?;
        }
    }
    Ok(failed.len())
}

fn print_check<W: Write>(out: &mut W, check: &Check) -> std::io::Result<()> {
    let icon = if check.passed { "✓" } else { "✗" };
    let color = if check.passed { "\x1b[32m" } else { "\x1b[31m" };
    let reset = "\x1b[0m";

    writeln!(out, "  {}{}{} {}: {}", color, icon, reset, check.name, check.message)?;
    if let Some(hint) = &check.hint {
        writeln!(out, "    └─ {}", hint)?;
    }
    Ok(())
}

/// `<tool> --version`, reporting the first line
fn check_version(name: &str, tool: &HostCommand) -> Check {
    match tool.std_command(&["--version"]).output() {
        Ok(output) if output.status.success() => {
            let text = String::from_utf8_lossy(&output.stdout);
            let first = text.lines().next().unwrap_or("").trim().to_string();
            Check::ok(name, if first.is_empty() { "available".into() } else { first })
        }
        Ok(output) => Check::fail(
            name,
            format!("exited with {:?}", output.status.code()),
        ),
        Err(_) => Check::fail(name, "not found")
            .with_hint(format!("`{}` must be on PATH", tool.display_with::<&str>(&[]))),
    }
}

fn check_user_manager(systemctl: &Systemctl) -> Check {
    const NAME: &str = "user manager";
    match systemctl.run_blocking(&["is-system-running"]) {
        // exits non-zero for "degraded" and friends, which still answers
        Ok(output) => {
            let state = output.stdout.trim();
            if state.is_empty() {
                let detail = output.stderr.lines().next().unwrap_or("no answer").trim().to_string();
                Check::fail(NAME, detail)
                    .with_hint("Is a user session bus available (DBUS_SESSION_BUS_ADDRESS)?")
            } else if state == "offline" {
                Check::fail(NAME, state)
            } else {
                Check::ok(NAME, state)
            }
        }
        Err(e) => Check::fail(NAME, e.to_string()),
    }
}

fn check_config(path: &Path) -> (Check, Option<TrayConfig>) {
    const NAME: &str = "config";
    if !path.exists() {
        let check = Check::ok(NAME, "not created yet")
            .with_hint("Run `unitray` or `unitray add UNIT` to create it");
        return (check, None);
    }
    match TrayConfig::load(path) {
        Ok(config) => {
            let tracked = config.tracked().count();
            let untracked = config.services.len() - tracked;
            let mut message = format!("{} service(s)", tracked);
            if untracked > 0 {
                message.push_str(&format!(", {} without a unit", untracked));
            }
            (Check::ok(NAME, message), Some(config))
        }
        Err(e) => (Check::fail(NAME, e.to_string()), None),
    }
}

/// Every configured unit should exist among the user's unit files
fn check_units(systemctl: &Systemctl, config: &TrayConfig) -> Vec<Check> {
    let known: BTreeMap<String, String> = match systemctl.list_unit_files() {
        Ok(entries) => entries.into_iter().map(|e| (e.unit, e.state)).collect(),
        Err(e) => {
            return vec![Check::fail("units", e.to_string())];
        }
    };

    config
        .tracked()
        .map(|(unit, svc)| {
            let name = svc.display_name();
            match known.get(unit) {
                Some(state) => Check::ok(name, format!("{} [{}]", unit, state)),
                None => Check::fail(name, format!("{} not found in user unit files", unit))
                    .with_hint("Check `systemctl --user list-unit-files`"),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fake_host;
    use unitray_core::config::ManagedService;

    const SYSTEMCTL: &str = r#"
case "$1" in
  --version) echo "systemd 255 (255.4-1)"; echo "+PAM +AUDIT"; exit 0 ;;
esac
shift
case "$1" in
  is-system-running) echo degraded; exit 1 ;;
  list-unit-files) printf 'comfyui.service enabled enabled\n' ;;
esac
"#;

    fn run(config: Option<&TrayConfig>, journal_body: &str) -> (usize, String) {
        let (_sd, systemctl) = fake_host(SYSTEMCTL);
        let (_jd, journalctl) = fake_host(journal_body);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.yaml");
        if let Some(config) = config {
            config.save(&path).unwrap();
        }
        let mut out = Vec::new();
        let failures =
            run_doctor(&Systemctl::new(systemctl), &journalctl, &path, &mut out).unwrap();
        (failures, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_doctor_all_good() {
        let config = TrayConfig {
            services: vec![ManagedService::new("comfyui.service").with_name("ComfyUI")],
        };
        let (failures, out) = run(Some(&config), "echo 'systemd 255'");
        assert_eq!(failures, 0, "{}", out);
        assert!(out.contains("systemctl: systemd 255 (255.4-1)"));
        assert!(out.contains("user manager: degraded"));
        assert!(out.contains("ComfyUI: comfyui.service [enabled]"));
        assert!(out.contains("All checks passed!"));
    }

    #[test]
    fn test_doctor_reports_unknown_units() {
        let config = TrayConfig {
            services: vec![ManagedService::new("gone.service")],
        };
        let (failures, out) = run(Some(&config), "exit 0");
        assert_eq!(failures, 1);
        assert!(out.contains("gone.service not found in user unit files"));
        assert!(out.contains("Issues found:"));
    }

    #[test]
    fn test_doctor_without_config() {
        let (failures, out) = run(None, "exit 2");
        // journalctl exited non-zero
        assert_eq!(failures, 1);
        assert!(out.contains("config: not created yet"));
        assert!(!out.contains("Services:"));
    }

    #[test]
    fn test_doctor_missing_tools() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = Vec::new();
        let failures = run_doctor(
            &Systemctl::new(HostCommand::new("/nonexistent/systemctl")),
            &HostCommand::new("/nonexistent/journalctl"),
            &dir.path().join("services.yaml"),
            &mut out,
        )
        .unwrap();
        assert_eq!(failures, 3);
    }
}
