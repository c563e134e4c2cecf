//! Read-through view of the cluster's pool resources.

use std::collections::BTreeMap;
use std::sync::Arc;

use poolkeeper_id::SlotNamer;
use serde::Serialize;
use tracing::{debug, trace};

use super::{ClusterApi, ResourcePhase};
use crate::error::PoolError;

/// Phase of a pool slot, derived from one listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotPhase {
    /// Absent from the listing.
    Free,
    /// Present and usable.
    Active,
    /// Present and being deleted.
    Terminating,
}

impl From<ResourcePhase> for SlotPhase {
    fn from(phase: ResourcePhase) -> Self {
        match phase {
            ResourcePhase::Active => SlotPhase::Active,
            ResourcePhase::Terminating => SlotPhase::Terminating,
        }
    }
}

/// Pool slots as seen by one cluster listing.
#[derive(Debug, Clone)]
pub struct Snapshot {
    namer: SlotNamer,
    capacity: u32,
    /// Occupied slots by index. Missing indices are free.
    occupied: BTreeMap<u32, ResourcePhase>,
    /// Pool-pattern names at or beyond `capacity`.
    out_of_range: Vec<(String, ResourcePhase)>,
}

impl Snapshot {
    /// Classify a listing. Names that are not pool names are dropped.
    pub fn classify<'a, I>(namer: &SlotNamer, capacity: u32, listing: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, ResourcePhase)>,
    {
        let mut occupied = BTreeMap::new();
        let mut out_of_range = Vec::new();

        for (name, phase) in listing {
            match namer.index_of(name) {
                Some(index) if index < capacity => {
                    // A name listed twice counts as terminating if either
                    // entry says so.
                    occupied
                        .entry(index)
                        .and_modify(|existing| {
                            if phase == ResourcePhase::Terminating {
                                *existing = phase;
                            }
                        })
                        .or_insert(phase);
                }
                Some(_) => out_of_range.push((name.to_string(), phase)),
                None => trace!(name, "Ignoring non-pool resource"),
            }
        }

        Self {
            namer: namer.clone(),
            capacity,
            occupied,
            out_of_range,
        }
    }

    /// Capacity the snapshot was classified against.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Phase of a pool slot; `None` for names outside the pool.
    pub fn phase_of(&self, name: &str) -> Option<SlotPhase> {
        let index = self.namer.index_in(name, self.capacity)?;
        Some(
            self.occupied
                .get(&index)
                .map_or(SlotPhase::Free, |phase| SlotPhase::from(*phase)),
        )
    }

    /// Free slot names, ascending by index.
    pub fn free(&self) -> Vec<String> {
        (0..self.capacity)
            .filter(|index| !self.occupied.contains_key(index))
            .map(|index| self.namer.name_for(index))
            .collect()
    }

    /// Active slot names, ascending by index.
    pub fn active(&self) -> Vec<String> {
        self.with_phase(ResourcePhase::Active)
    }

    /// Terminating slot names, ascending by index.
    pub fn terminating(&self) -> Vec<String> {
        self.with_phase(ResourcePhase::Terminating)
    }

    /// Pool-pattern resources outside the current capacity.
    pub fn out_of_range(&self) -> &[(String, ResourcePhase)] {
        &self.out_of_range
    }

    /// Number of occupied slots within capacity.
    pub fn occupied_count(&self) -> usize {
        self.occupied.len()
    }

    fn with_phase(&self, wanted: ResourcePhase) -> Vec<String> {
        self.occupied
            .iter()
            .filter(|(_, phase)| **phase == wanted)
            .map(|(index, _)| self.namer.name_for(*index))
            .collect()
    }
}

/// Queries the cluster and classifies pool slots.
///
/// Every call goes to the cluster; nothing is cached between snapshots.
#[derive(Clone)]
pub struct ClusterView {
    cluster: Arc<dyn ClusterApi>,
    namer: SlotNamer,
}

impl ClusterView {
    /// Create a view over the given cluster.
    pub fn new(cluster: Arc<dyn ClusterApi>, namer: SlotNamer) -> Self {
        Self { cluster, namer }
    }

    /// The namer used for classification.
    pub fn namer(&self) -> &SlotNamer {
        &self.namer
    }

    /// Take a fresh snapshot. Query failures are returned, not retried.
    pub async fn snapshot(&self, capacity: u32) -> Result<Snapshot, PoolError> {
        let listing = self.cluster.list().await.map_err(PoolError::ClusterQuery)?;

        let snapshot = Snapshot::classify(
            &self.namer,
            capacity,
            listing.iter().map(|r| (r.name.as_str(), r.phase)),
        );

        debug!(
            capacity,
            listed = listing.len(),
            occupied = snapshot.occupied_count(),
            out_of_range = snapshot.out_of_range().len(),
            "Cluster snapshot taken"
        );

        Ok(snapshot)
    }
}
