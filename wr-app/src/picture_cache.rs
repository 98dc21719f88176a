//! Short-lived per-user queue of picture URLs waiting for a text message.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::AbortHandle;

struct PictureEntry {
    refs: Vec<String>,
    /// Identifies the expiry timer that currently owns this entry.
    seq: u64,
    expiry: AbortHandle,
}

pub struct PictureCache {
    entries: Arc<DashMap<String, PictureEntry>>,
    expiry: Duration,
    next_seq: AtomicU64,
}

impl PictureCache {
    pub fn new(expiry: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            expiry,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Append `image_ref` under `key` and restart the key's expiry window.
    #[tracing::instrument(level = "debug", skip_all, fields(key = %key))]
    pub fn append(&self, key: &str, image_ref: impl Into<String>) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let expiry = self.schedule_expiry(key.to_string(), seq);

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.refs.push(image_ref.into());
                entry.seq = seq;
                let previous = std::mem::replace(&mut entry.expiry, expiry);
                previous.abort();
                tracing::debug!(pending = entry.refs.len(), "picture appended");
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PictureEntry {
                    refs: vec![image_ref.into()],
                    seq,
                    expiry,
                });
                tracing::debug!(pending = 1, "picture cache entry created");
            }
        }
    }

    /// Take every pending picture for `key` in append order, clearing the entry.
    pub fn pop_all(&self, key: &str) -> Vec<String> {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                entry.expiry.abort();
                entry.refs
            }
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn schedule_expiry(&self, key: String, seq: u64) -> AbortHandle {
        let entries = self.entries.clone();
        let expiry = self.expiry;
        tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            if entries.remove_if(&key, |_, entry| entry.seq == seq).is_some() {
                tracing::debug!(key = %key, ?expiry, "picture cache entry expired");
            }
        })
        .abort_handle()
    }
}
