// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Per-thread speculative logs: the read set and the bloom-filter-fronted
//! write set.
//!
//! Both sets are flat vectors whose capacity survives `clear`, so a steady
//! stream of transactions does not allocate. The write set additionally
//! keeps a 64-bit filter over cell addresses; a clear filter bit proves a
//! cell is not in the set and skips the linear scan on the read fast path.

use std::sync::Arc;

use crate::tvar::{RawVar, VarBase};

pub(crate) type Hash = u64;

/// One bit per cell address. Cells in the set always light their bit; a lit
/// bit may be a false positive and is resolved by scanning.
#[inline(always)]
pub(crate) fn reference_hash(addr: usize) -> Hash {
    const SHIFT: u32 = std::mem::align_of::<RawVar>().trailing_zeros();
    1u64 << ((addr >> SHIFT) & 63)
}

pub(crate) struct ReadEntry {
    var: Arc<dyn VarBase>,
}

impl ReadEntry {
    #[inline(always)]
    pub(crate) fn raw(&self) -> &RawVar {
        self.var.raw()
    }
}

/// Cells observed by the running transaction; validated against the
/// snapshot at commit.
#[derive(Default)]
pub(crate) struct ReadSet {
    entries: Vec<ReadEntry>,
}

impl ReadSet {
    #[inline]
    pub(crate) fn push(&mut self, var: Arc<dyn VarBase>) {
        self.entries.push(ReadEntry { var });
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ReadEntry> {
        self.entries.iter()
    }

    pub(crate) fn shrink_to_fit(&mut self) {
        self.entries.shrink_to_fit();
    }
}

pub(crate) struct WriteEntry {
    var: Arc<dyn VarBase>,
    pending: usize,
}

impl WriteEntry {
    #[inline(always)]
    pub(crate) fn raw(&self) -> &RawVar {
        self.var.raw()
    }

    #[inline(always)]
    pub(crate) fn pending(&self) -> usize {
        self.pending
    }
}

/// Result of probing the write set for a cell.
pub(crate) enum WriteSetLookup {
    /// Index of the entry holding the pending value.
    Hit(usize),
    /// Not present; carries the cell's filter bit so the caller can push
    /// without rehashing.
    Miss(Hash),
}

/// Pending writes of the running transaction.
#[derive(Default)]
pub(crate) struct WriteSet {
    filter: Hash,
    entries: Vec<WriteEntry>,
}

impl WriteSet {
    #[inline(always)]
    pub(crate) fn filter(&self) -> Hash {
        self.filter
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[allow(dead_code)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.filter = 0;
        self.entries.clear();
    }

    #[inline]
    pub(crate) fn push(&mut self, var: Arc<dyn VarBase>, pending: usize, hash: Hash) {
        debug_assert!(hash != 0);
        self.filter |= hash;
        self.entries.push(WriteEntry { var, pending });
    }

    /// Biased against finding the cell: a clear filter bit answers without
    /// touching the entries.
    pub(crate) fn lookup(&self, addr: usize) -> WriteSetLookup {
        let hash = reference_hash(addr);
        if self.filter & hash == 0 {
            return WriteSetLookup::Miss(hash);
        }
        match self.entries.iter().position(|e| e.raw().addr() == addr) {
            Some(index) => WriteSetLookup::Hit(index),
            None => WriteSetLookup::Miss(hash),
        }
    }

    /// Read-path probe: `None` when the cell has no pending write.
    pub(crate) fn find(&self, addr: usize) -> Option<&WriteEntry> {
        if self.filter & reference_hash(addr) == 0 {
            return None;
        }
        self.entries.iter().find(|e| e.raw().addr() == addr)
    }

    #[inline]
    pub(crate) fn pending_mut(&mut self, index: usize) -> &mut usize {
        &mut self.entries[index].pending
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &WriteEntry> {
        self.entries.iter()
    }

    pub(crate) fn shrink_to_fit(&mut self) {
        self.entries.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tvar::TVar;

    #[test]
    fn test_filter_miss_skips_scan() {
        let var = TVar::new(0usize);
        let set = WriteSet::default();

        match set.lookup(var.raw().addr()) {
            WriteSetLookup::Miss(hash) => {
                assert_eq!(hash, reference_hash(var.raw().addr()))
            }
            WriteSetLookup::Hit(_) => panic!("empty set cannot hit"),
        }
        assert!(set.find(var.raw().addr()).is_none());
    }

    #[test]
    fn test_lookup_after_push() {
        let a = TVar::new(1usize);
        let b = TVar::new(2usize);
        let mut set = WriteSet::default();

        let hash = reference_hash(a.raw().addr());
        set.push(a.base(), 17, hash);

        match set.lookup(a.raw().addr()) {
            WriteSetLookup::Hit(index) => {
                assert_eq!(set.iter().nth(index).unwrap().pending(), 17)
            }
            WriteSetLookup::Miss(_) => panic!("pushed cell must be found"),
        }

        // b may collide in the filter, but the scan must still miss
        match set.lookup(b.raw().addr()) {
            WriteSetLookup::Miss(_) => {}
            WriteSetLookup::Hit(_) => panic!("b was never pushed"),
        }
    }

    #[test]
    fn test_pending_overwrite() {
        let a = TVar::new(1usize);
        let mut set = WriteSet::default();
        let hash = reference_hash(a.raw().addr());
        set.push(a.base(), 17, hash);

        if let WriteSetLookup::Hit(index) = set.lookup(a.raw().addr()) {
            *set.pending_mut(index) = 33;
        }
        assert_eq!(set.find(a.raw().addr()).unwrap().pending(), 33);
    }

    #[test]
    fn test_clear_resets_filter() {
        let a = TVar::new(1usize);
        let mut set = WriteSet::default();
        set.push(a.base(), 0, reference_hash(a.raw().addr()));

        set.clear();
        assert!(set.is_empty());
        assert_eq!(set.filter(), 0);
    }
}
