//! Per-stage queues, partitioned by share.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};

use ferry_core::TransferRequest;
use tokio::time::Instant;

/// A request waiting for a slot in one stage.
#[derive(Debug)]
pub(crate) struct QueueEntry {
    pub(crate) request: TransferRequest,
    /// Effective priority within the share.
    pub(crate) priority: u64,
    /// Global enqueue order; lower is older.
    pub(crate) seq: u64,
    pub(crate) enqueued_at: Instant,
}

impl QueueEntry {
    fn key(&self) -> (u64, Reverse<u64>) {
        (self.priority, Reverse(self.seq))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Requests waiting for one stage, highest priority then oldest first per share.
#[derive(Debug, Default)]
pub(crate) struct StageQueue {
    shares: BTreeMap<String, BinaryHeap<QueueEntry>>,
    len: usize,
}

impl StageQueue {
    pub(crate) fn push(&mut self, entry: QueueEntry) {
        self.shares
            .entry(entry.request.share().to_string())
            .or_default()
            .push(entry);
        self.len += 1;
    }

    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn share_len(&self, share: &str) -> usize {
        self.shares.get(share).map_or(0, BinaryHeap::len)
    }

    /// Head entry of every non-empty share.
    pub(crate) fn heads(&self) -> impl Iterator<Item = (&str, &QueueEntry)> {
        self.shares
            .iter()
            .filter_map(|(share, heap)| heap.peek().map(|head| (share.as_str(), head)))
    }

    pub(crate) fn pop(&mut self, share: &str) -> Option<QueueEntry> {
        let heap = self.shares.get_mut(share)?;
        let entry = heap.pop()?;
        if heap.is_empty() {
            self.shares.remove(share);
        }
        self.len -= 1;
        Some(entry)
    }

    /// Remove the best entry, across all shares, that satisfies `predicate`.
    pub(crate) fn take_best_where(
        &mut self,
        mut predicate: impl FnMut(&QueueEntry) -> bool,
    ) -> Option<QueueEntry> {
        let (share, seq) = self
            .shares
            .iter()
            .flat_map(|(share, heap)| heap.iter().map(move |entry| (share, entry)))
            .filter(|(_, entry)| predicate(*entry))
            .max_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(share, entry)| (share.clone(), entry.seq))?;
        self.take_matching(&share, |entry| entry.seq == seq)
            .into_iter()
            .next()
    }

    /// Remove every entry whose request satisfies `predicate`.
    pub(crate) fn take_where(
        &mut self,
        mut predicate: impl FnMut(&TransferRequest) -> bool,
    ) -> Vec<QueueEntry> {
        let shares: Vec<String> = self.shares.keys().cloned().collect();
        let mut taken = Vec::new();
        for share in shares {
            taken.extend(self.take_matching(&share, |entry| predicate(&entry.request)));
        }
        taken
    }

    /// Every queued entry, in no particular order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.shares.values().flat_map(BinaryHeap::iter)
    }

    fn take_matching(
        &mut self,
        share: &str,
        mut predicate: impl FnMut(&QueueEntry) -> bool,
    ) -> Vec<QueueEntry> {
        let Some(heap) = self.shares.remove(share) else {
            return Vec::new();
        };
        let (taken, kept): (Vec<_>, Vec<_>) = heap.into_vec().into_iter().partition(|e| predicate(e));
        self.len -= taken.len();
        if !kept.is_empty() {
            self.shares.insert(share.to_string(), BinaryHeap::from(kept));
        }
        taken
    }
}
