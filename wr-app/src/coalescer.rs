//! In-flight request coalescing keyed by platform message id.
//!
//! The platform resends a message (same `MsgId`) when no reply arrives inside its
//! window. Every occurrence of an id maps onto a single generation task:
//!
//! - the first sighting creates a [`PendingEntry`] and spawns the task;
//! - later sightings attach to it and bump `retry_count`;
//! - non-final waiters give up after `reply_window` without touching the task;
//! - the final retry (`retry_count >= final_retry`) waits for the task unconditionally.
//!
//! Entries leave the store when the task finishes (success, error or panic) or when
//! `entry_expiry` elapses, whichever happens first.

use crate::fallback;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;

/// Produces the reply text for one inbound message. Failures are expected to be
/// mapped to user-facing text by the implementation.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, user_id: &str, text: &str) -> String;
}

#[derive(Debug, Clone, Copy)]
pub struct CoalescerConfig {
    pub reply_window: Duration,
    pub final_retry: u32,
    pub entry_expiry: Duration,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            reply_window: Duration::from_millis(4500),
            final_retry: 3,
            entry_expiry: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Coalesced {
    Reply(String),
    /// This waiter stopped waiting; the generation keeps running for later retries.
    Abandoned,
}

type ReplySlot = watch::Receiver<Option<String>>;

struct PendingEntry {
    seq: u64,
    retry_count: u32,
    reply: ReplySlot,
    expiry: AbortHandle,
}

/// Process-wide map of in-flight generations.
#[derive(Default)]
pub struct PendingStore {
    entries: DashMap<String, PendingEntry>,
}

impl PendingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn retry_count(&self, message_id: &str) -> Option<u32> {
        self.entries.get(message_id).map(|entry| entry.retry_count)
    }

    /// Remove the entry for `message_id` only if it still belongs to generation `seq`.
    fn remove_generation(&self, message_id: &str, seq: u64) -> bool {
        match self.entries.remove_if(message_id, |_, entry| entry.seq == seq) {
            Some((_, entry)) => {
                entry.expiry.abort();
                true
            }
            None => false,
        }
    }
}

pub struct Coalescer {
    store: Arc<PendingStore>,
    generator: Arc<dyn ReplyGenerator>,
    config: CoalescerConfig,
    next_seq: AtomicU64,
}

impl Coalescer {
    pub fn new(
        store: Arc<PendingStore>,
        generator: Arc<dyn ReplyGenerator>,
        config: CoalescerConfig,
    ) -> Self {
        Self {
            store,
            generator,
            config,
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<PendingStore> {
        &self.store
    }

    /// Reply to `text` from `user_id`, sharing one generation across all
    /// occurrences of `message_id`.
    #[tracing::instrument(level = "info", skip_all, fields(message_id = %message_id))]
    pub async fn handle(&self, message_id: &str, user_id: &str, text: &str) -> Coalesced {
        let generator = self.generator.clone();
        let user_id = user_id.to_string();
        let text = text.to_string();
        self.coalesce(message_id, async move { generator.generate(&user_id, &text).await })
            .await
    }

    /// Coalesce an arbitrary reply task under `message_id`. `task` is only spawned
    /// when no entry exists for the id; otherwise it is dropped unpolled.
    pub async fn coalesce<F>(&self, message_id: &str, task: F) -> Coalesced
    where
        F: Future<Output = String> + Send + 'static,
    {
        let (reply, retry_count) = self.attach_or_start(message_id, task);
        if retry_count >= self.config.final_retry {
            tracing::info!(
                message_id = %message_id,
                retry_count,
                "final retry; waiting for generation without deadline"
            );
            return Coalesced::Reply(wait_to_completion(reply).await);
        }

        let outcome = wait_within(reply, self.config.reply_window).await;
        if outcome == Coalesced::Abandoned {
            tracing::info!(
                message_id = %message_id,
                retry_count,
                reply_window = ?self.config.reply_window,
                "reply window elapsed; leaving generation to later retries"
            );
        }
        outcome
    }

    fn attach_or_start<F>(&self, message_id: &str, task: F) -> (ReplySlot, u32)
    where
        F: Future<Output = String> + Send + 'static,
    {
        match self.store.entries.entry(message_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.retry_count += 1;
                tracing::debug!(
                    message_id = %message_id,
                    retry_count = entry.retry_count,
                    "attached to in-flight generation"
                );
                (entry.reply.clone(), entry.retry_count)
            }
            Entry::Vacant(vacant) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                let (reply_tx, reply_rx) = watch::channel(None);
                let expiry = self.schedule_expiry(message_id.to_string(), seq);
                self.spawn_generation(message_id.to_string(), seq, reply_tx, task);
                vacant.insert(PendingEntry {
                    seq,
                    retry_count: 1,
                    reply: reply_rx.clone(),
                    expiry,
                });
                tracing::debug!(message_id = %message_id, "started generation");
                (reply_rx, 1)
            }
        }
    }

    fn spawn_generation<F>(
        &self,
        message_id: String,
        seq: u64,
        reply_tx: watch::Sender<Option<String>>,
        task: F,
    ) where
        F: Future<Output = String> + Send + 'static,
    {
        let store = self.store.clone();
        let generation = tokio::spawn(task);
        tokio::spawn(async move {
            let reply = match generation.await {
                Ok(reply) => reply,
                Err(error) => {
                    tracing::error!(%error, message_id = %message_id, "generation task failed");
                    fallback::INTERNAL_ERROR.to_string()
                }
            };
            reply_tx.send_replace(Some(reply));
            store.remove_generation(&message_id, seq);
        });
    }

    fn schedule_expiry(&self, message_id: String, seq: u64) -> AbortHandle {
        let store = self.store.clone();
        let expiry = self.config.entry_expiry;
        tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            if store.remove_generation(&message_id, seq) {
                tracing::warn!(
                    message_id = %message_id,
                    ?expiry,
                    "pending entry expired before its generation finished"
                );
            }
        })
        .abort_handle()
    }
}

/// Wait until the generation publishes its reply. Never gives up on its own.
async fn wait_to_completion(mut reply: ReplySlot) -> String {
    match reply.wait_for(Option::is_some).await {
        Ok(value) => Option::clone(&value).unwrap_or_default(),
        Err(_) => fallback::INTERNAL_ERROR.to_string(),
    }
}

/// Wait at most `window`; dropping out early leaves the generation untouched.
async fn wait_within(reply: ReplySlot, window: Duration) -> Coalesced {
    match tokio::time::timeout(window, wait_to_completion(reply)).await {
        Ok(text) => Coalesced::Reply(text),
        Err(_) => Coalesced::Abandoned,
    }
}
