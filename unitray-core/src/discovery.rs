//! Short-lived cache over unit discovery, plus the selection rules the
//! management surface applies on top of it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use crate::candidate::{UnitCandidate, UnitSource, discover};
use crate::clock::Clock;

/// How long a discovery pass is reused
pub const DISCOVERY_TTL: Duration = Duration::from_secs(3);

#[derive(Clone)]
struct Listing {
    at: Instant,
    units: Arc<Vec<UnitCandidate>>,
}

/// Caches the full classified unit list for [`DISCOVERY_TTL`].
///
/// Concurrent callers that all see a stale slot may each run discovery; the
/// slot is replaced whole, so the last finished pass wins and readers never
/// see a partial list.
pub struct DiscoveryCache<S> {
    source: S,
    clock: Arc<dyn Clock>,
    slot: RwLock<Option<Listing>>,
}

impl<S: UnitSource> DiscoveryCache<S> {
    pub fn new(source: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            clock,
            slot: RwLock::new(None),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// The full classified list, rediscovered when stale or forced
    pub fn snapshot(&self, force_refresh: bool) -> Arc<Vec<UnitCandidate>> {
        let now = self.clock.now();
        if !force_refresh {
            if let Some(listing) = self.slot.read().as_ref() {
                if now.saturating_duration_since(listing.at) < DISCOVERY_TTL {
                    debug!("discovery cache hit");
                    return listing.units.clone();
                }
            }
        }

        debug!(force_refresh, "running unit discovery");
        let units = Arc::new(discover(&self.source));
        *self.slot.write() = Some(Listing {
            at: now,
            units: units.clone(),
        });
        units
    }

    /// Candidates to offer: visible ones, plus hidden ones when asked for or
    /// when already part of the saved configuration
    pub fn list_services(
        &self,
        include_hidden: bool,
        required_units: &BTreeSet<String>,
        force_refresh: bool,
    ) -> Vec<UnitCandidate> {
        self.snapshot(force_refresh)
            .iter()
            .filter(|c| include_hidden || !c.hidden || required_units.contains(&c.unit))
            .cloned()
            .collect()
    }
}

/// Filter and order candidates for the management surface.
///
/// Keeps a candidate when `show_hidden` is set, when it is not hidden, or when
/// it is already selected; then applies a case-insensitive text filter on the
/// display text and sorts by description (unit when there is none).
pub fn select_candidates<'a>(
    all: &'a [UnitCandidate],
    show_hidden: bool,
    selected: &BTreeSet<String>,
    filter: &str,
) -> Vec<&'a UnitCandidate> {
    let needle = filter.trim().to_lowercase();
    let mut picked: Vec<&UnitCandidate> = all
        .iter()
        .filter(|c| show_hidden || !c.hidden || selected.contains(&c.unit))
        .filter(|c| needle.is_empty() || c.display_text().to_lowercase().contains(&needle))
        .collect();
    picked.sort_by_key(|c| c.sort_key());
    picked
}
