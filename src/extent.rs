//! The `ExtentManager` is an allocator for equally-sized chunks of
//! the log file (extents) and for the block-sized slots inside them.
//!
//! It must maintain these critical safety properties:
//!
//! A. We must not overwrite a slot while it may contain the most
//!    recent durable copy of a block, or a chunk of the index snapshot
//!    that the latest durable metablock points at.
//! B. We must not overwrite an extent while records in it may be
//!    needed by log replay, meaning records that are newer than the
//!    latest durable metablock.
//!
//! Both are guaranteed by never writing into an extent twice between
//! being opened and being freed, and by delaying the reuse of freed
//! extents: an extent whose last tenant goes away moves to
//! `PendingFree`, and only becomes `Free` after the next metablock is
//! durable. At that point nothing it held can be needed by recovery.
use std::collections::BTreeMap;

use fnv::{FnvHashMap, FnvHashSet};

use crate::{
    BlockId, Config, Location, MB_EXTENT_SEPARATION, MB_NEXTENTS,
    id_allocator::Allocator,
};

/// What occupies a live slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Tenant {
    /// The current version of a block.
    Block(BlockId),
    /// A chunk of the index snapshot referenced by the latest
    /// metablock, or of a snapshot being written.
    Index,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum ExtentState {
    /// Not tracked and available for reuse.
    Free,
    /// The single extent currently receiving appends.
    Active,
    /// Full or closed. Only ever loses tenants.
    Inactive,
    /// Has no tenants left, but may not be reused until the next
    /// metablock is durable.
    PendingFree,
    /// Holds the static header or metablock ring slots.
    Reserved,
}

use self::ExtentState::*;

#[derive(Debug)]
struct Extent {
    state: ExtentState,
    next_slot: u32,
    tenants: FnvHashMap<u32, Tenant>,
}

impl Extent {
    fn opened() -> Extent {
        Extent { state: Active, next_slot: 0, tenants: FnvHashMap::default() }
    }

    fn live(&self) -> usize {
        self.tenants.len()
    }

    fn holds_index(&self) -> bool {
        self.tenants.values().any(|t| *t == Tenant::Index)
    }

    fn active_to_inactive(&mut self, id: u64) {
        log::trace!("setting extent {} to Inactive", id);
        assert_eq!(
            self.state, Active,
            "extent {} should have been Active before closing",
            id
        );
        self.state = Inactive;
    }

    fn inactive_to_pending_free(&mut self, id: u64) {
        log::trace!("setting extent {} to PendingFree", id);
        assert_eq!(self.state, Inactive);
        assert_eq!(
            self.live(),
            0,
            "extent {} still has live tenants {:?}",
            id,
            self.tenants
        );
        self.state = PendingFree;
    }
}

/// Per-state extent counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExtentCounts {
    pub active: usize,
    pub inactive: usize,
    pub pending_free: usize,
    pub reserved: usize,
    /// The number of extents ever opened by this process.
    pub opened: u64,
}

/// Tracks the state and live tenants of every extent in the log file.
#[derive(Debug)]
pub(crate) struct ExtentManager {
    slots_per_extent: u32,
    extents: BTreeMap<u64, Extent>,
    allocator: Allocator,
    active: Option<u64>,
    opened: u64,
}

/// Returns the extents that hold the static header and the metablock
/// ring.
pub(crate) fn reserved_extents() -> impl Iterator<Item = u64> {
    (0..MB_NEXTENTS).map(|i| i * MB_EXTENT_SEPARATION)
}

impl ExtentManager {
    /// An extent manager for a brand new log file.
    pub(crate) fn new(config: &Config) -> ExtentManager {
        ExtentManager::recover(config, std::iter::empty(), 0)
    }

    /// Rebuilds extent bookkeeping after recovery. `live` yields the
    /// location of every current tenant. Every extent below
    /// `file_extents` that holds no live tenant starts out
    /// `PendingFree`, as replay may still need its records until a
    /// fresh metablock has been written.
    pub(crate) fn recover<I>(
        config: &Config,
        live: I,
        file_extents: u64,
    ) -> ExtentManager
    where
        I: IntoIterator<Item = (Location, Tenant)>,
    {
        let mut extents: BTreeMap<u64, Extent> = BTreeMap::new();

        for reserved in reserved_extents() {
            extents.insert(
                reserved,
                Extent {
                    state: Reserved,
                    next_slot: 0,
                    tenants: FnvHashMap::default(),
                },
            );
        }

        for (location, tenant) in live {
            let extent = extents.entry(location.extent).or_insert_with(|| {
                Extent {
                    state: Inactive,
                    next_slot: config.slots_per_extent(),
                    tenants: FnvHashMap::default(),
                }
            });
            assert_ne!(
                extent.state, Reserved,
                "recovered tenant {:?} inside reserved extent {}",
                tenant, location.extent
            );
            let prev = extent.tenants.insert(location.slot, tenant);
            assert!(
                prev.is_none(),
                "two tenants {:?} and {:?} recovered at location {}",
                prev,
                tenant,
                location
            );
        }

        for id in 0..file_extents {
            extents.entry(id).or_insert_with(|| Extent {
                state: PendingFree,
                next_slot: config.slots_per_extent(),
                tenants: FnvHashMap::default(),
            });
        }

        let in_use: FnvHashSet<u64> = extents.keys().copied().collect();
        let allocator = Allocator::from_allocated(&in_use);

        log::debug!(
            "recovered {} extents, {} of them pending free",
            extents.len(),
            extents.values().filter(|e| e.state == PendingFree).count()
        );

        ExtentManager {
            slots_per_extent: config.slots_per_extent(),
            extents,
            allocator,
            active: None,
            opened: 0,
        }
    }

    /// Returns the next slot of the active extent, opening a new
    /// extent when there is none or it is full.
    pub(crate) fn allocate_slot(&mut self, tenant: Tenant) -> Location {
        let extent_id = match self.active {
            Some(id) if self.extents[&id].next_slot < self.slots_per_extent => id,
            _ => {
                self.close_active();
                self.open_extent()
            }
        };

        let extent = self
            .extents
            .get_mut(&extent_id)
            .expect("the active extent is always tracked");
        let slot = extent.next_slot;
        extent.next_slot += 1;
        extent.tenants.insert(slot, tenant);

        let location = Location { extent: extent_id, slot };
        log::trace!("allocated slot {} for {:?}", location, tenant);

        if extent.next_slot == self.slots_per_extent {
            self.close_active();
        }

        location
    }

    fn open_extent(&mut self) -> u64 {
        let id = self.allocator.allocate();
        assert!(
            !self.extents.contains_key(&id),
            "allocator handed out tracked extent {}",
            id
        );

        log::debug!("opening extent {}", id);
        self.extents.insert(id, Extent::opened());
        self.active = Some(id);
        self.opened += 1;
        id
    }

    pub(crate) fn active_extent(&self) -> Option<u64> {
        self.active
    }

    /// Stops appending to the active extent. The next allocation
    /// opens a fresh one.
    pub(crate) fn close_active(&mut self) {
        let Some(id) = self.active.take() else {
            return;
        };
        let extent = self
            .extents
            .get_mut(&id)
            .expect("the active extent is always tracked");
        extent.active_to_inactive(id);
        if extent.live() == 0 {
            extent.inactive_to_pending_free(id);
        }
    }

    /// Forgets the tenant at `location`. Returns the tenant that was
    /// removed, if any.
    pub(crate) fn mark_garbage(&mut self, location: Location) -> Option<Tenant> {
        let Some(extent) = self.extents.get_mut(&location.extent) else {
            log::warn!("marking garbage in untracked extent {}", location);
            return None;
        };

        let removed = extent.tenants.remove(&location.slot);
        log::trace!("marked {} garbage, removed {:?}", location, removed);

        if extent.state == Inactive && extent.live() == 0 {
            extent.inactive_to_pending_free(location.extent);
        }

        removed
    }

    /// Returns the tenant occupying `location`.
    pub(crate) fn tenant_at(&self, location: Location) -> Option<Tenant> {
        self.extents
            .get(&location.extent)
            .and_then(|e| e.tenants.get(&location.slot).copied())
    }

    /// Inactive extents whose live fraction is below `threshold`,
    /// ordered by fewest live blocks first and then by extent id.
    /// Extents holding index chunks are never candidates.
    pub(crate) fn gc_candidates(&self, threshold: f64) -> Vec<u64> {
        let total = f64::from(self.slots_per_extent);

        let mut candidates: Vec<(usize, u64)> = self
            .extents
            .iter()
            .filter(|(_, e)| e.state == Inactive && !e.holds_index())
            .filter(|(_, e)| (e.live() as f64 / total) < threshold)
            .map(|(id, e)| (e.live(), *id))
            .collect();

        candidates.sort_unstable();
        candidates.into_iter().map(|(_, id)| id).collect()
    }

    /// The live blocks of `extent`, ordered by slot.
    pub(crate) fn live_blocks(&self, extent: u64) -> Vec<(Location, BlockId)> {
        let Some(e) = self.extents.get(&extent) else {
            return vec![];
        };

        let mut ret: Vec<(Location, BlockId)> = e
            .tenants
            .iter()
            .filter_map(|(slot, tenant)| match tenant {
                Tenant::Block(id) => Some((Location { extent, slot: *slot }, *id)),
                Tenant::Index => None,
            })
            .collect();
        ret.sort_unstable();
        ret
    }

    /// Releases an extent whose tenants have all been relocated.
    ///
    /// # Panics
    ///
    /// Panics if the extent still has live tenants.
    pub(crate) fn free_extent(&mut self, id: u64) {
        let extent = self
            .extents
            .get_mut(&id)
            .unwrap_or_else(|| panic!("freeing untracked extent {}", id));
        assert_eq!(
            extent.live(),
            0,
            "freeing extent {} with live tenants {:?}",
            id,
            extent.tenants
        );
        match extent.state {
            PendingFree => {}
            Inactive => extent.inactive_to_pending_free(id),
            other => panic!("freeing extent {} in state {:?}", id, other),
        }
    }

    /// Called once a metablock is durable: every extent that was
    /// `PendingFree` when it was written becomes reusable.
    pub(crate) fn metablock_persisted(&mut self) -> usize {
        let freed: Vec<u64> = self
            .extents
            .iter()
            .filter(|(_, e)| e.state == PendingFree)
            .map(|(id, _)| *id)
            .collect();

        for id in &freed {
            self.extents.remove(id);
            self.allocator.free(*id);
        }

        if !freed.is_empty() {
            log::debug!("released extents {:?} for reuse", freed);
        }

        freed.len()
    }

    pub(crate) fn state(&self, id: u64) -> ExtentState {
        self.extents.get(&id).map(|e| e.state).unwrap_or(Free)
    }

    pub(crate) fn live_count(&self, id: u64) -> usize {
        self.extents.get(&id).map(Extent::live).unwrap_or(0)
    }

    /// The number of extents the log file must hold.
    pub(crate) fn extent_tip(&self) -> u64 {
        self.extents.keys().next_back().map(|id| id + 1).unwrap_or(0)
    }

    pub(crate) fn counts(&self) -> ExtentCounts {
        let mut counts = ExtentCounts { opened: self.opened, ..Default::default() };
        for extent in self.extents.values() {
            match extent.state {
                Active => counts.active += 1,
                Inactive => counts.inactive += 1,
                PendingFree => counts.pending_free += 1,
                Reserved => counts.reserved += 1,
                Free => {}
            }
        }
        counts
    }
}
