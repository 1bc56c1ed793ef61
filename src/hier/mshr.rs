use std::collections::HashMap;

use smallvec::SmallVec;

use crate::base::ComponentId;
use crate::timeq::Cycle;

/// One in-flight miss (or writeback) for a line.  Requests that arrive for the same line while
/// it is outstanding queue up in `merged`, oldest first.
#[derive(Debug)]
pub struct MshrEntry<K, R> {
    pub line_addr: u64,
    pub kind: K,
    pub requester: ComponentId,
    pub issued_at: Cycle,
    /// Sub-requests (acks, data) still owed before the entry can complete.
    pub pending: u32,
    pub merged: SmallVec<[R; 2]>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Allocation<R> {
    /// A new entry was created; the caller must issue the upstream request.
    Primary,
    /// The request was coalesced onto an outstanding entry.
    Secondary,
    /// The table is full; the request is handed back to be stalled.
    Full(R),
}

/// Bounded table of outstanding misses, keyed by line address.
#[derive(Debug)]
pub struct MshrTable<K, R> {
    capacity: usize,
    entries: HashMap<u64, MshrEntry<K, R>>,
    peak: usize,
}

impl<K, R> MshrTable<K, R> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            peak: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Highest occupancy ever observed.
    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn has_entry(&self, line_addr: u64) -> bool {
        self.entries.contains_key(&line_addr)
    }

    pub fn lookup(&self, line_addr: u64) -> Option<&MshrEntry<K, R>> {
        self.entries.get(&line_addr)
    }

    pub fn lookup_mut(&mut self, line_addr: u64) -> Option<&mut MshrEntry<K, R>> {
        self.entries.get_mut(&line_addr)
    }

    pub fn allocate(
        &mut self,
        line_addr: u64,
        kind: K,
        requester: ComponentId,
        now: Cycle,
        request: R,
    ) -> Allocation<R> {
        if let Some(entry) = self.entries.get_mut(&line_addr) {
            entry.merged.push(request);
            return Allocation::Secondary;
        }
        if !self.reserve(line_addr, kind, requester, now) {
            return Allocation::Full(request);
        }
        if let Some(entry) = self.entries.get_mut(&line_addr) {
            entry.merged.push(request);
        }
        Allocation::Primary
    }

    /// Create an entry that starts without any queued request (e.g. a writeback).
    /// Returns false if the line already has an entry or the table is full.
    pub fn reserve(&mut self, line_addr: u64, kind: K, requester: ComponentId, now: Cycle) -> bool {
        if self.entries.contains_key(&line_addr) || self.is_full() {
            return false;
        }
        self.entries.insert(
            line_addr,
            MshrEntry {
                line_addr,
                kind,
                requester,
                issued_at: now,
                pending: 0,
                merged: SmallVec::new(),
            },
        );
        self.peak = self.peak.max(self.entries.len());
        true
    }

    pub fn complete(&mut self, line_addr: u64) -> Option<MshrEntry<K, R>> {
        self.entries.remove(&line_addr)
    }
}
