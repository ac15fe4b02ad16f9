//! Output change feed.
//!
//! The generation loop keeps the text of the turn in progress in an
//! [`ObservedOutput`]. Every mutation is diffed against the previous value and
//! pushed as [`OutputChange`]s to at most one subscriber. Resetting the value
//! at the end of a turn always produces a [`OutputChange::Removed`], even when
//! the turn produced no text, so a subscriber can rely on it as the turn
//! boundary.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// One span of difference between two successive output values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChange {
    Inserted(String),
    Removed(String),
}

impl OutputChange {
    /// Changes that turn `old` into `new`, split at their longest common prefix.
    pub fn between(old: &str, new: &str) -> Vec<OutputChange> {
        let prefix = old
            .char_indices()
            .zip(new.chars())
            .take_while(|((_, a), b)| a == b)
            .map(|((i, a), _)| i + a.len_utf8())
            .last()
            .unwrap_or(0);

        let mut changes = Vec::with_capacity(2);
        if prefix < old.len() {
            changes.push(OutputChange::Removed(old[prefix..].to_string()));
        }
        if prefix < new.len() {
            changes.push(OutputChange::Inserted(new[prefix..].to_string()));
        }
        changes
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<OutputChange>,
}

static NEXT_SUBSCRIBER: AtomicU64 = AtomicU64::new(1);

/// Delivery point for output changes. Cheap to clone.
#[derive(Clone, Default)]
pub struct OutputFeed {
    slot: Arc<Mutex<Option<Subscriber>>>,
}

impl OutputFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the single subscriber, replacing any previous one.
    pub fn subscribe(&self) -> OutputSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = NEXT_SUBSCRIBER.fetch_add(1, Ordering::Relaxed);
        *self.slot.lock() = Some(Subscriber { id, tx });
        OutputSubscription {
            id,
            rx,
            feed: self.clone(),
        }
    }

    pub fn has_subscriber(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn publish(&self, change: OutputChange) {
        let mut slot = self.slot.lock();
        if let Some(sub) = slot.as_ref() {
            if sub.tx.send(change).is_err() {
                *slot = None;
            }
        }
    }

    /// Drop the subscriber so its receiver sees the end of the feed.
    pub fn close(&self) {
        self.slot.lock().take();
    }

    fn unsubscribe(&self, id: u64) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|sub| sub.id == id) {
            *slot = None;
        }
    }
}

/// Receiving end of an [`OutputFeed`]. Dropping it deregisters.
pub struct OutputSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<OutputChange>,
    feed: OutputFeed,
}

impl OutputSubscription {
    /// Next change, or `None` once the feed is closed or replaced.
    pub async fn recv(&mut self) -> Option<OutputChange> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<OutputChange> {
        self.rx.try_recv().ok()
    }
}

impl Drop for OutputSubscription {
    fn drop(&mut self) {
        self.feed.unsubscribe(self.id);
    }
}

/// A string whose every mutation is published to an [`OutputFeed`].
pub struct ObservedOutput {
    value: String,
    feed: OutputFeed,
}

impl ObservedOutput {
    pub fn new(feed: OutputFeed) -> Self {
        Self {
            value: String::new(),
            feed,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn push(&mut self, piece: &str) {
        if piece.is_empty() {
            return;
        }
        self.value.push_str(piece);
        self.feed.publish(OutputChange::Inserted(piece.to_string()));
    }

    /// Replace the whole value, publishing the difference.
    pub fn set(&mut self, new: String) {
        for change in OutputChange::between(&self.value, &new) {
            self.feed.publish(change);
        }
        self.value = new;
    }

    /// Clear the value and return what it held. Always publishes a removal.
    pub fn reset(&mut self) -> String {
        let old = std::mem::take(&mut self.value);
        self.feed.publish(OutputChange::Removed(old.clone()));
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_of_append_is_insertion() {
        assert_eq!(
            OutputChange::between("Par", "Paris"),
            vec![OutputChange::Inserted("is".into())]
        );
    }

    #[test]
    fn diff_of_reset_is_removal() {
        assert_eq!(
            OutputChange::between("Paris", ""),
            vec![OutputChange::Removed("Paris".into())]
        );
    }

    #[test]
    fn diff_of_rewrite_removes_then_inserts() {
        assert_eq!(
            OutputChange::between("café au lait", "café noir"),
            vec![
                OutputChange::Removed("au lait".into()),
                OutputChange::Inserted("noir".into()),
            ]
        );
        assert!(OutputChange::between("same", "same").is_empty());
    }

    #[test]
    fn diff_respects_multibyte_boundaries() {
        let changes = OutputChange::between("é", "e");
        assert_eq!(
            changes,
            vec![
                OutputChange::Removed("é".into()),
                OutputChange::Inserted("e".into()),
            ]
        );
    }

    #[tokio::test]
    async fn observed_output_publishes_pushes_and_reset() {
        let feed = OutputFeed::new();
        let mut sub = feed.subscribe();
        let mut out = ObservedOutput::new(feed.clone());

        out.push("Hel");
        out.push("");
        out.push("lo");
        assert_eq!(out.reset(), "Hello");
        out.reset();

        assert_eq!(sub.recv().await, Some(OutputChange::Inserted("Hel".into())));
        assert_eq!(sub.recv().await, Some(OutputChange::Inserted("lo".into())));
        assert_eq!(sub.recv().await, Some(OutputChange::Removed("Hello".into())));
        assert_eq!(sub.recv().await, Some(OutputChange::Removed(String::new())));
    }

    #[test]
    fn dropping_subscription_deregisters() {
        let feed = OutputFeed::new();
        let sub = feed.subscribe();
        assert!(feed.has_subscriber());
        drop(sub);
        assert!(!feed.has_subscriber());
    }

    #[test]
    fn stale_subscription_does_not_remove_newer_one() {
        let feed = OutputFeed::new();
        let old = feed.subscribe();
        let mut new = feed.subscribe();
        drop(old);
        assert!(feed.has_subscriber());
        feed.publish(OutputChange::Inserted("x".into()));
        assert_eq!(new.try_recv(), Some(OutputChange::Inserted("x".into())));
    }

    #[tokio::test]
    async fn close_ends_the_subscription() {
        let feed = OutputFeed::new();
        let mut sub = feed.subscribe();
        feed.close();
        assert_eq!(sub.recv().await, None);
    }
}
