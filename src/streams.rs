// src/streams.rs
//! In-memory registry of live generation streams.
//!
//! One generation task owns the publisher side of a stream; a reader
//! (usually an SSE connection) claims the subscription side and drains
//! fragments until the producer is done. Entries are ephemeral: they never
//! survive a restart, and a reader that arrives after release gets a
//! terminal "no stream" answer instead of blocking.

use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Producer half of a stream. Publishing never blocks; once the registry
/// entry is released and this handle is dropped, subscribers observe
/// end-of-stream after draining whatever was buffered.
pub struct StreamPublisher {
    chunks: mpsc::UnboundedSender<String>,
}

impl StreamPublisher {
    /// Push one text fragment. Returns false when the subscriber is gone,
    /// which producers treat as "keep generating, nobody is watching".
    pub fn publish(&self, fragment: impl Into<String>) -> bool {
        self.chunks.send(fragment.into()).is_ok()
    }
}

/// Reader half of a stream. At most one logical reader claims it.
pub struct StreamSubscription {
    chunks: mpsc::UnboundedReceiver<String>,
}

impl StreamSubscription {
    /// Next fragment in publish order, or `None` once the producer has
    /// finished and the buffer is drained.
    pub async fn next_fragment(&mut self) -> Option<String> {
        self.chunks.recv().await
    }
}

struct StreamEntry {
    // Held until a subscriber claims it, so fragments published before the
    // reader connects are buffered rather than lost. The publisher handle
    // is the only sender; dropping it is what closes the channel.
    rx: Option<mpsc::UnboundedReceiver<String>>,
}

/// Concurrency-safe map from a session key (branch or chat id) to a live
/// stream. Injected into the orchestrator and handlers; tests instantiate
/// their own isolated registries.
pub struct StreamRegistry {
    entries: RwLock<HashMap<Uuid, StreamEntry>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Open a fresh stream for `key`, replacing any prior entry. Callers
    /// must not allocate twice for the same key without an intervening
    /// release; the registry does not police that.
    pub async fn allocate(&self, key: Uuid) -> StreamPublisher {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut entries = self.entries.write().await;
        entries.insert(key, StreamEntry { rx: Some(rx) });
        StreamPublisher { chunks: tx }
    }

    /// Claim the reader side for `key`. `None` means no active generation
    /// (or the reader side was already claimed) and must surface to the
    /// client as a terminal "no stream" signal, never a hang.
    pub async fn subscribe(&self, key: Uuid) -> Option<StreamSubscription> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&key)?;
        entry
            .rx
            .take()
            .map(|chunks| StreamSubscription { chunks })
    }

    /// Non-claiming probe used for "is something generating" view flags.
    pub async fn is_active(&self, key: Uuid) -> bool {
        self.entries.read().await.contains_key(&key)
    }

    /// Drop the entry for `key`. Called exactly once per allocate, after
    /// the producer's last publish. The channel closes only when the last
    /// sender goes away, so a subscriber mid-read keeps draining buffered
    /// fragments and then sees end-of-stream.
    pub async fn release(&self, key: Uuid) {
        let mut entries = self.entries.write().await;
        entries.remove(&key);
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_without_allocate_is_not_found() {
        let registry = StreamRegistry::new();
        assert!(registry.subscribe(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_release_removes_entry() {
        let registry = StreamRegistry::new();
        let key = Uuid::new_v4();
        let _publisher = registry.allocate(key).await;
        assert!(registry.is_active(key).await);

        registry.release(key).await;
        assert!(!registry.is_active(key).await);
        assert!(registry.subscribe(key).await.is_none());
    }

    #[tokio::test]
    async fn test_fragments_arrive_in_publish_order() {
        let registry = StreamRegistry::new();
        let key = Uuid::new_v4();
        let publisher = registry.allocate(key).await;

        let mut sub = registry.subscribe(key).await.expect("stream is live");
        let reader = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(fragment) = sub.next_fragment().await {
                seen.push(fragment);
            }
            seen
        });

        for fragment in ["to", "ken", "s"] {
            assert!(publisher.publish(fragment));
        }
        registry.release(key).await;
        drop(publisher);

        assert_eq!(reader.await.unwrap(), vec!["to", "ken", "s"]);
    }

    #[tokio::test]
    async fn test_late_subscriber_drains_buffered_fragments() {
        let registry = StreamRegistry::new();
        let key = Uuid::new_v4();
        let publisher = registry.allocate(key).await;
        publisher.publish("early");

        // Claimed after publishing started, before release.
        let mut sub = registry.subscribe(key).await.expect("stream is live");
        publisher.publish("late");
        registry.release(key).await;
        drop(publisher);

        assert_eq!(sub.next_fragment().await.as_deref(), Some("early"));
        assert_eq!(sub.next_fragment().await.as_deref(), Some("late"));
        assert_eq!(sub.next_fragment().await, None);
    }

    #[tokio::test]
    async fn test_second_subscribe_does_not_steal_the_stream() {
        let registry = StreamRegistry::new();
        let key = Uuid::new_v4();
        let _publisher = registry.allocate(key).await;

        assert!(registry.subscribe(key).await.is_some());
        // The reader side is single-claim; a second reader gets "no stream".
        assert!(registry.subscribe(key).await.is_none());
        // The entry itself is still live for probes.
        assert!(registry.is_active(key).await);
    }

    #[tokio::test]
    async fn test_publish_after_reader_drop_is_a_noop() {
        let registry = StreamRegistry::new();
        let key = Uuid::new_v4();
        let publisher = registry.allocate(key).await;

        let sub = registry.subscribe(key).await.expect("stream is live");
        drop(sub);

        // Producer keeps going; the registry entry is still its to release.
        assert!(!publisher.publish("nobody listening"));
        registry.release(key).await;
        assert!(!registry.is_active(key).await);
    }
}
