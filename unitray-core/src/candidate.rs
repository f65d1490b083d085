//! Unit discovery
//!
//! Enumerates user unit files through a [`UnitSource`] and classifies each
//! one as visible or filtered. Classification is purely static: enablement
//! state, template suffixes, and a list of desktop/session noise prefixes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Enablement states a user can meaningfully start and stop
pub const MANAGEABLE_STATES: &[&str] = &[
    "enabled",
    "disabled",
    "generated",
    "enabled-runtime",
    "disabled-runtime",
    "linked",
    "linked-runtime",
    "transient",
];

/// Lowercase prefixes of session helpers and OS namespaces hidden by default
pub const NOISE_PREFIXES: &[&str] = &[
    "dbus-",
    "org.",
    "gnome-",
    "kde-",
    "plasma-",
    "xdg-",
    "systemd-",
    "pipewire",
    "evolution-",
    "tracker-",
    "app-",
];

const TEMPLATE_SUFFIX: &str = "@.service";
const AUTOSTART_SUFFIX: &str = "@autostart.service";

/// A unit found on the system
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitCandidate {
    pub unit: String,
    /// Raw enablement state from `list-unit-files`
    pub state: String,
    pub description: String,
    /// Absent for transient and generated units
    pub fragment_path: Option<PathBuf>,
    pub hidden: bool,
}

impl UnitCandidate {
    pub fn classify(
        unit: impl Into<String>,
        state: impl Into<String>,
        properties: UnitProperties,
    ) -> Self {
        let unit = unit.into();
        let state = state.into();
        let hidden = !is_visible(&unit, &state, properties.fragment_path.as_deref());
        Self {
            unit,
            state,
            description: properties.description,
            fragment_path: properties.fragment_path,
            hidden,
        }
    }

    /// "unit — description", or just the unit
    pub fn display_text(&self) -> String {
        if self.description.is_empty() {
            self.unit.clone()
        } else {
            format!("{} — {}", self.unit, self.description)
        }
    }

    /// Sort key used by listings: description, falling back to the unit
    pub fn sort_key(&self) -> String {
        if self.description.is_empty() {
            self.unit.to_lowercase()
        } else {
            self.description.to_lowercase()
        }
    }
}

/// Whether a unit should be offered without the "show filtered" toggle.
///
/// The fragment path does not take part in the decision today; it is part of
/// the signature so classification sees everything discovery knows.
pub fn is_visible(unit: &str, state: &str, _fragment_path: Option<&Path>) -> bool {
    if !MANAGEABLE_STATES.contains(&state) {
        return false;
    }
    if unit.ends_with(TEMPLATE_SUFFIX) || unit.ends_with(AUTOSTART_SUFFIX) {
        return false;
    }
    let lowered = unit.to_lowercase();
    !NOISE_PREFIXES.iter().any(|p| lowered.starts_with(p))
}

/// One row of `list-unit-files`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitFileEntry {
    pub unit: String,
    pub state: String,
}

/// Parse `list-unit-files --no-legend` output: `<unit> <state> [preset]`
pub fn parse_unit_files(stdout: &str) -> Vec<UnitFileEntry> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let unit = parts.next()?;
            let state = parts.next()?;
            Some(UnitFileEntry {
                unit: unit.to_string(),
                state: state.to_string(),
            })
        })
        .collect()
}

/// Description and definition path of one unit
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnitProperties {
    pub description: String,
    pub fragment_path: Option<PathBuf>,
}

/// Parse `show --property=Description --property=FragmentPath` output
pub fn parse_unit_properties(stdout: &str) -> UnitProperties {
    let mut props = UnitProperties::default();
    for line in stdout.lines() {
        if let Some(value) = line.strip_prefix("Description=") {
            props.description = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("FragmentPath=") {
            let value = value.trim();
            props.fragment_path = (!value.is_empty()).then(|| PathBuf::from(value));
        }
    }
    props
}

/// Enumeration failed; discovery turns this into an empty result
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unit enumeration failed: {0}")]
pub struct DiscoveryError(pub String);

/// Where discovery reads unit information from
pub trait UnitSource: Send + Sync {
    /// All service unit files with their enablement state
    fn list_unit_files(&self) -> Result<Vec<UnitFileEntry>, DiscoveryError>;

    /// Description and fragment path; defaults when the query fails
    fn describe(&self, unit: &str) -> UnitProperties;
}

/// Enumerate and classify every unit. Never fails: enumeration errors yield
/// an empty list.
pub fn discover(source: &dyn UnitSource) -> Vec<UnitCandidate> {
    let entries = match source.list_unit_files() {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "discovery found nothing");
            return Vec::new();
        }
    };

    let candidates: Vec<UnitCandidate> = entries
        .into_iter()
        .map(|entry| {
            let props = source.describe(&entry.unit);
            UnitCandidate::classify(entry.unit, entry.state, props)
        })
        .collect();

    debug!(
        total = candidates.len(),
        hidden = candidates.iter().filter(|c| c.hidden).count(),
        "discovered units"
    );
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticSource {
        listing: Result<Vec<UnitFileEntry>, DiscoveryError>,
    }

    impl UnitSource for StaticSource {
        fn list_unit_files(&self) -> Result<Vec<UnitFileEntry>, DiscoveryError> {
            self.listing.clone()
        }

        fn describe(&self, unit: &str) -> UnitProperties {
            UnitProperties {
                description: format!("About {}", unit),
                fragment_path: Some(PathBuf::from(format!(
                    "/home/u/.config/systemd/user/{}",
                    unit
                ))),
            }
        }
    }

    #[test]
    fn test_classification_rules() {
        assert!(!is_visible("dbus-org.foo.service", "enabled", None));
        assert!(is_visible("myapp.service", "enabled", None));
        assert!(!is_visible("template@.service", "enabled", None));
        assert!(!is_visible("template@.service", "disabled", None));
        assert!(!is_visible("myapp.service", "masked", None));
        assert!(!is_visible("myapp.service", "static", None));
        assert!(!is_visible("foo@autostart.service", "generated", None));
        assert!(!is_visible("PipeWire-pulse.service", "enabled", None));
        assert!(!is_visible("Org.freedesktop.service", "enabled", None));
        assert!(is_visible("comfyui.service", "linked-runtime", None));
        assert!(is_visible("instance@web.service", "transient", None));
    }

    #[test]
    fn test_candidate_hidden_flag() {
        let c = UnitCandidate::classify("myapp.service", "masked", UnitProperties::default());
        assert!(c.hidden);
        let c = UnitCandidate::classify("myapp.service", "enabled", UnitProperties::default());
        assert!(!c.hidden);
    }

    #[test]
    fn test_parse_unit_files() {
        let out = "\
comfyui.service                 enabled  enabled
dbus-broker.service             static   -

syncthing@.service              disabled enabled
broken
";
        let entries = parse_unit_files(out);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].unit, "comfyui.service");
        assert_eq!(entries[0].state, "enabled");
        assert_eq!(entries[2].state, "disabled");
    }

    #[test]
    fn test_parse_unit_properties() {
        let props = parse_unit_properties(
            "Description=ComfyUI server \nFragmentPath=/home/u/.config/systemd/user/comfyui.service\n",
        );
        assert_eq!(props.description, "ComfyUI server");
        assert_eq!(
            props.fragment_path.as_deref(),
            Some(Path::new("/home/u/.config/systemd/user/comfyui.service"))
        );

        let props = parse_unit_properties("Description=a=b\nFragmentPath=\n");
        assert_eq!(props.description, "a=b");
        assert_eq!(props.fragment_path, None);

        assert_eq!(parse_unit_properties(""), UnitProperties::default());
    }

    #[test]
    fn test_discover_classifies_in_order() {
        let source = StaticSource {
            listing: Ok(vec![
                UnitFileEntry {
                    unit: "myapp.service".into(),
                    state: "enabled".into(),
                },
                UnitFileEntry {
                    unit: "gnome-shell.service".into(),
                    state: "enabled".into(),
                },
            ]),
        };
        let found = discover(&source);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].unit, "myapp.service");
        assert!(!found[0].hidden);
        assert_eq!(found[0].description, "About myapp.service");
        assert!(found[1].hidden);
    }

    #[test]
    fn test_discover_swallows_enumeration_failure() {
        let source = StaticSource {
            listing: Err(DiscoveryError("exit status 1".into())),
        };
        assert!(discover(&source).is_empty());
    }

    #[test]
    fn test_display_and_sort_key() {
        let mut c = UnitCandidate::classify("b.service", "enabled", UnitProperties::default());
        assert_eq!(c.display_text(), "b.service");
        assert_eq!(c.sort_key(), "b.service");
        c.description = "Alpha Server".into();
        assert_eq!(c.display_text(), "b.service — Alpha Server");
        assert_eq!(c.sort_key(), "alpha server");
    }
}
