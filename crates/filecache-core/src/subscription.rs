//! Eviction subscriptions
//!
//! A subscription pins its object: the eviction engine never deletes an
//! object while a subscription on it is open. When the object is chosen
//! for eviction it is marked expired instead and the subscriber gets one
//! `Evicted` event. The files of expired objects are reclaimed once every
//! subscription on them has been dropped. Deleting the object drops the
//! sending side, which ends the subscription without an event.

use tokio::sync::mpsc;

/// Event delivered to a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// The object was expired by the eviction engine
    Evicted { path_name: String, type_name: String },
}

/// Receiving side of an eviction subscription
///
/// Dropping it releases the object.
#[derive(Debug)]
pub struct Subscription {
    path_name: String,
    receiver: mpsc::Receiver<CacheEvent>,
}

impl Subscription {
    pub(crate) fn new(path_name: impl Into<String>) -> (Self, mpsc::Sender<CacheEvent>) {
        // One event at most is ever sent
        let (sender, receiver) = mpsc::channel(1);
        let subscription = Self {
            path_name: path_name.into(),
            receiver,
        };
        (subscription, sender)
    }

    /// Path name of the watched object
    pub fn path_name(&self) -> &str {
        &self.path_name
    }

    /// Wait for the event
    ///
    /// Returns `None` once the subscription ends without an eviction,
    /// i.e. the object was deleted, its subscription was cancelled or the
    /// service shut down. The object stays pinned until `self` is dropped.
    pub async fn recv(&mut self) -> Option<CacheEvent> {
        self.receiver.recv().await
    }
}
