use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The access mode of a block operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    /// Shared access. Any number of readers may hold a block at once.
    Read,
    /// Exclusive access. A writer holds a block alone.
    Write,
}

impl Access {
    /// Returns `true` if a holder in mode `self` may coexist with a
    /// holder in mode `other`.
    pub fn is_compatible_with(self, other: Access) -> bool {
        matches!((self, other), (Access::Read, Access::Read))
    }
}

/// Keeps write batches and checkpoints apart.
///
/// Every write batch holds a shared `Protector` from the moment its
/// log sequence numbers are assigned until the block index reflects
/// it. A checkpoint takes the exclusive side, so the index snapshot it
/// captures never misses a batch whose records carry lower sequence
/// numbers than the snapshot claims to cover.
#[derive(Debug, Default)]
pub(crate) struct CheckpointGate {
    rw: RwLock<()>,
}

pub(crate) enum Protector<'a> {
    #[allow(dead_code)]
    Write(RwLockWriteGuard<'a, ()>),
    #[allow(dead_code)]
    Read(RwLockReadGuard<'a, ()>),
}

impl CheckpointGate {
    pub(crate) fn batch(&self) -> Protector<'_> {
        Protector::Read(self.rw.read())
    }

    pub(crate) fn checkpoint(&self) -> Protector<'_> {
        Protector::Write(self.rw.write())
    }
}
