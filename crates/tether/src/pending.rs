//! The pending-request table: in-flight acknowledged operations awaiting a
//! response.
//!
//! Entries are inserted before the send job is enqueued, so a response
//! arriving arbitrarily fast always finds its entry. Removal is atomic,
//! which makes completion exactly-once even when a response races close.

use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::cache::CacheKey;
use crate::error::ChannelError;

pub(crate) type Completion = oneshot::Sender<Result<Value, ChannelError>>;

pub(crate) struct PendingEntry {
    completion: Completion,
    /// Where to memoize the result on normal completion, if the submission
    /// opted in.
    pub(crate) cache: Option<(CacheKey, Duration)>,
}

impl PendingEntry {
    pub fn new(completion: Completion, cache: Option<(CacheKey, Duration)>) -> Self {
        Self { completion, cache }
    }

    /// Resolve the caller-visible future. A dropped receiver just means the
    /// caller stopped waiting.
    pub fn complete(self, result: Result<Value, ChannelError>) {
        let _ = self.completion.send(result);
    }
}

#[derive(Default)]
pub(crate) struct PendingTable {
    entries: DashMap<u64, PendingEntry>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, sequence: u64, entry: PendingEntry) {
        self.entries.insert(sequence, entry);
    }

    pub fn remove(&self, sequence: u64) -> Option<PendingEntry> {
        self.entries.remove(&sequence).map(|(_, entry)| entry)
    }

    /// Force-complete every entry, exactly once each. Used on close.
    pub fn fail_all(&self, error: impl Fn() -> ChannelError) {
        let sequences: Vec<u64> = self.entries.iter().map(|e| *e.key()).collect();
        for sequence in sequences {
            if let Some((_, entry)) = self.entries.remove(&sequence) {
                entry.complete(Err(error()));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn completion_is_exactly_once() {
        let table = PendingTable::new();
        let (tx, mut rx) = oneshot::channel();
        table.insert(3, PendingEntry::new(tx, None));
        assert_eq!(table.len(), 1);

        table.remove(3).unwrap().complete(Ok(json!(1)));
        assert!(table.remove(3).is_none());
        assert_eq!(rx.try_recv().unwrap().unwrap(), json!(1));
    }

    #[test]
    fn fail_all_drains_the_table() {
        let table = PendingTable::new();
        let mut receivers = Vec::new();
        for sequence in 0..4u64 {
            let (tx, rx) = oneshot::channel();
            table.insert(sequence, PendingEntry::new(tx, None));
            receivers.push(rx);
        }

        table.fail_all(|| ChannelError::Closed);
        assert_eq!(table.len(), 0);
        for mut rx in receivers {
            assert!(matches!(rx.try_recv().unwrap(), Err(ChannelError::Closed)));
        }
    }
}
