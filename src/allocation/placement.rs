//! Placement Strategy
//!
//! Picks devices for the bricks of one brick-set from an in-memory pool of
//! candidates. Nodes are walked as a ring interleaved across zones and
//! rotated by a seed, so different sets start on different nodes while the
//! same seed always yields the same placement.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use tracing::debug;

// =============================================================================
// Placement Candidate
// =============================================================================

/// A device that may receive a brick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementCandidate {
    pub node_id: String,
    pub device_id: String,
    /// Failure domain of the node
    pub zone: u32,
    /// Free capacity in KiB
    pub free: u64,
}

/// Where one brick of a set lands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub node_id: String,
    pub device_id: String,
    pub zone: u32,
}

impl From<&PlacementCandidate> for Placement {
    fn from(c: &PlacementCandidate) -> Self {
        Self {
            node_id: c.node_id.clone(),
            device_id: c.device_id.clone(),
            zone: c.zone,
        }
    }
}

/// How much diversity a slot insists on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Spread {
    /// Distinct device only
    Device,
    /// Distinct node
    Node,
    /// Distinct node in a distinct zone
    Zone,
}

#[derive(Debug, Clone)]
struct NodeSlot {
    node_id: String,
    zone: u32,
    devices: Vec<PlacementCandidate>,
}

// =============================================================================
// Placement Engine
// =============================================================================

/// Pool of candidate devices, consumed as bricks are placed
#[derive(Debug, Clone, Default)]
pub struct PlacementEngine {
    ring: Vec<NodeSlot>,
}

impl PlacementEngine {
    /// Build the ring from candidates; node order within a zone follows input order
    pub fn new(candidates: Vec<PlacementCandidate>) -> Self {
        let mut zones: BTreeMap<u32, Vec<NodeSlot>> = BTreeMap::new();
        for candidate in candidates {
            let nodes = zones.entry(candidate.zone).or_default();
            match nodes.iter_mut().find(|n| n.node_id == candidate.node_id) {
                Some(node) => node.devices.push(candidate),
                None => nodes.push(NodeSlot {
                    node_id: candidate.node_id.clone(),
                    zone: candidate.zone,
                    devices: vec![candidate],
                }),
            }
        }

        // Interleave zones: first node of every zone, then the second, ...
        let mut ring = Vec::new();
        let mut queues: Vec<_> = zones.into_values().map(|v| v.into_iter()).collect();
        loop {
            let before = ring.len();
            for queue in queues.iter_mut() {
                if let Some(node) = queue.next() {
                    ring.push(node);
                }
            }
            if ring.len() == before {
                break;
            }
        }

        Self { ring }
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.ring.len()
    }

    /// Total free space left in the pool
    pub fn free(&self) -> u64 {
        self.ring
            .iter()
            .flat_map(|n| n.devices.iter())
            .map(|d| d.free)
            .sum()
    }

    fn start(&self, seed: &str) -> usize {
        if self.ring.is_empty() {
            return 0;
        }
        // CRC32 keeps placements stable across builds and toolchains
        (crc32fast::hash(seed.as_bytes()) as usize) % self.ring.len()
    }

    /// Place `count` bricks of `size` KiB each
    ///
    /// `siblings` are bricks of the same set that already exist; new bricks
    /// avoid their devices and, where possible, their nodes and zones. The
    /// chosen devices' free space is consumed from the pool.
    pub fn select_set(
        &mut self,
        seed: &str,
        count: usize,
        size: u64,
        siblings: &[Placement],
    ) -> Result<Vec<Placement>> {
        let start = self.start(seed);
        let mut taken: Vec<Placement> = siblings.to_vec();
        let mut selected = Vec::with_capacity(count);

        for slot in 0..count {
            let found = [Spread::Zone, Spread::Node, Spread::Device]
                .into_iter()
                .find_map(|spread| {
                    self.pick(start, size, &taken, spread)
                        .map(|index| (spread, index))
                });

            let Some((spread, (n, d))) = found else {
                return Err(Error::NoSpace(format!(
                    "no device with {} KiB free for brick {} of {}",
                    size,
                    slot + 1,
                    count
                )));
            };

            if spread < Spread::Zone {
                debug!(
                    "Degraded placement for slot {} of set {}: {:?} diversity only",
                    slot, seed, spread
                );
            }

            let device = &mut self.ring[n].devices[d];
            device.free -= size;
            let placement = Placement::from(&*device);
            taken.push(placement.clone());
            selected.push(placement);
        }

        Ok(selected)
    }

    /// Ring position and device index of the best device for one slot
    fn pick(
        &self,
        start: usize,
        size: u64,
        taken: &[Placement],
        spread: Spread,
    ) -> Option<(usize, usize)> {
        let len = self.ring.len();
        for step in 0..len {
            let n = (start + step) % len;
            let node = &self.ring[n];

            if spread >= Spread::Node && taken.iter().any(|t| t.node_id == node.node_id) {
                continue;
            }
            if spread >= Spread::Zone && taken.iter().any(|t| t.zone == node.zone) {
                continue;
            }

            let best = node
                .devices
                .iter()
                .enumerate()
                .filter(|(_, d)| d.free >= size)
                .filter(|(_, d)| !taken.iter().any(|t| t.device_id == d.device_id))
                .max_by(|(ia, a), (ib, b)| a.free.cmp(&b.free).then(ib.cmp(ia)));

            if let Some((d, _)) = best {
                return Some((n, d));
            }
        }
        None
    }
}
