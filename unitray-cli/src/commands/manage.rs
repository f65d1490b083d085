//! `unitray list|select|add|remove|open`: the management surface

use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, bail};
use serde::Serialize;
use tracing::info;

use unitray_core::candidate::{UnitCandidate, UnitSource};
use unitray_core::config::{ManagedService, OpenAction, TrayConfig, ensure_config};
use unitray_core::discovery::{DiscoveryCache, select_candidates};

/// Program URLs are handed to
const URL_OPENER: &str = "xdg-open";

#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Include filtered units
    pub all: bool,
    pub filter: Option<String>,
    pub json: bool,
}

#[derive(Serialize)]
struct ListRow<'a> {
    #[serde(flatten)]
    candidate: &'a UnitCandidate,
    selected: bool,
}

/// Print discovered units, configured ones first-class even when filtered
pub fn run_list<S: UnitSource, W: Write>(
    cache: &DiscoveryCache<S>,
    config: &TrayConfig,
    options: &ListOptions,
    out: &mut W,
) -> anyhow::Result<()> {
    let selected = config.active_units();
    let listed = cache.list_services(options.all, &selected, false);
    let filter = options.filter.as_deref().unwrap_or("");
    let rows = select_candidates(&listed, options.all, &selected, filter);

    if options.json {
        let rows: Vec<ListRow> = rows
            .iter()
            .map(|c| ListRow {
                candidate: c,
                selected: selected.contains(&c.unit),
            })
            .collect();
        serde_json::to_writer_pretty(&mut *out, &rows)?;
        writeln!(out)?;
        return Ok(());
    }

    if rows.is_empty() {
        writeln!(out, "No services found.")?;
        return Ok(());
    }
    for c in rows {
        let mark = if selected.contains(&c.unit) { "[x]" } else { "[ ]" };
        let hidden = if c.hidden { " (filtered)" } else { "" };
        writeln!(out, "{} {} [{}]{}", mark, c.display_text(), c.state, hidden)?;
    }
    Ok(())
}

/// Replace the configured services with `units`, in the given order.
///
/// Units already configured keep their settings; new ones are named after
/// their description. Every unit must be a discovered user unit.
pub fn run_select<S: UnitSource, W: Write>(
    cache: &DiscoveryCache<S>,
    path: &Path,
    units: &[String],
    out: &mut W,
) -> anyhow::Result<()> {
    let config = ensure_config(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let wanted = target_units(&TrayConfig::default(), units);
    let required: BTreeSet<String> = wanted.iter().cloned().collect();
    let listed = cache.list_services(true, &required, false);

    let mut chosen = Vec::with_capacity(wanted.len());
    for unit in &wanted {
        let Some(candidate) = listed.iter().find(|c| &c.unit == unit) else {
            bail!("{} is not a user unit", unit);
        };
        chosen.push(candidate);
    }

    let next = config.apply_selection(chosen);
    next.save(path)?;
    info!(services = next.services.len(), "selection saved");
    for (unit, service) in next.tracked() {
        writeln!(out, "[x] {} ({})", service.display_name(), unit)?;
    }
    Ok(())
}

/// Add `unit` to the saved configuration, creating the file if needed
pub fn run_add<W: Write>(
    path: &Path,
    unit: &str,
    name: Option<String>,
    out: &mut W,
) -> anyhow::Result<bool> {
    let unit = unit.trim();
    if unit.is_empty() {
        bail!("unit name is empty");
    }

    let mut config = ensure_config(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let mut service = ManagedService::new(unit);
    if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
        service = service.with_name(name);
    }

    if !config.add_service(service) {
        writeln!(out, "{} is already configured", unit)?;
        return Ok(false);
    }
    config.save(path)?;
    info!(unit, "service added");
    writeln!(out, "Added {}", unit)?;
    Ok(true)
}

pub fn run_remove<W: Write>(path: &Path, unit: &str, out: &mut W) -> anyhow::Result<bool> {
    let mut config = TrayConfig::load(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    if !config.remove_service(unit.trim()) {
        writeln!(out, "{} is not configured", unit)?;
        return Ok(false);
    }
    config.save(path)?;
    info!(unit, "service removed");
    writeln!(out, "Removed {}", unit)?;
    Ok(true)
}

/// Program and arguments that carry out an open action
pub fn open_argv(action: &OpenAction) -> Vec<String> {
    match action {
        OpenAction::Url { url, .. } => vec![URL_OPENER.to_string(), url.clone()],
        OpenAction::Command { command, .. } => command.argv(),
    }
}

/// Launch the `index`-th open action of `unit` without waiting for it
pub fn run_open<W: Write>(
    config: &TrayConfig,
    unit: &str,
    index: usize,
    out: &mut W,
) -> anyhow::Result<()> {
    let Some(service) = config.find(unit) else {
        bail!("{} is not configured", unit);
    };
    let actions = service.open_actions();
    let Some(action) = actions.get(index) else {
        if actions.is_empty() {
            bail!("{} has no open actions", unit);
        }
        bail!("{} has {} open action(s); index {} is out of range", unit, actions.len(), index);
    };

    let argv = open_argv(action);
    let Some((program, args)) = argv.split_first() else {
        bail!("open action '{}' has no command", action.label());
    };
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to launch {}", program))?;

    info!(unit, label = action.label(), "launched open action");
    writeln!(out, "{}: {}", service.display_name(), action.label())?;
    Ok(())
}

/// Units a one-shot command applies to: the given ones, or every configured unit
pub fn target_units(config: &TrayConfig, given: &[String]) -> Vec<String> {
    if given.is_empty() {
        return config.active_units().into_iter().collect();
    }
    let mut seen = BTreeSet::new();
    given
        .iter()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty() && seen.insert(u.clone()))
        .collect()
}
