//! Change notifications.
//!
//! The store announces every change it makes to cached entities. Each
//! notification carries its source so consumers can subscribe to, say, only
//! remote updates:
//!
//! ```rust,ignore
//! let remote = engine.subscribe(Some(ChangeSource::Remote));
//! std::thread::spawn(move || {
//!     while let Ok(change) = remote.recv() {
//!         refresh_map_layer(change.entity_type, &change.changed_ids);
//!     }
//! });
//! ```

use crate::entity::{EntityType, LocalId};
use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeSource {
    /// A local create, update or delete.
    Local,
    /// A sync outcome or remote push.
    Remote,
    /// A schema migration rewrote the record.
    Migration,
}

/// One change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    /// Type of the changed entities.
    pub entity_type: EntityType,
    /// Local ids of the changed entities.
    pub changed_ids: Vec<LocalId>,
    /// Origin of the change.
    pub source: ChangeSource,
}

impl ChangeNotification {
    /// Creates a notification for a single entity.
    pub fn single(entity_type: EntityType, local_id: LocalId, source: ChangeSource) -> Self {
        Self {
            entity_type,
            changed_ids: vec![local_id],
            source,
        }
    }
}

/// Distributes change notifications to subscribers.
///
/// There is one subscriber list per source plus one for all sources.
/// Subscribers whose receiver was dropped are pruned on the next emit.
#[derive(Default)]
pub struct ChangeFeed {
    local: RwLock<Vec<Sender<ChangeNotification>>>,
    remote: RwLock<Vec<Sender<ChangeNotification>>>,
    migration: RwLock<Vec<Sender<ChangeNotification>>>,
    all: RwLock<Vec<Sender<ChangeNotification>>>,
}

impl ChangeFeed {
    /// Creates a feed with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to one source, or to all sources with `None`.
    pub fn subscribe(&self, source: Option<ChangeSource>) -> Receiver<ChangeNotification> {
        let (tx, rx) = mpsc::channel();
        self.list(source).write().push(tx);
        rx
    }

    /// Emits a notification.
    pub fn emit(&self, notification: ChangeNotification) {
        if notification.changed_ids.is_empty() {
            return;
        }
        self.list(Some(notification.source))
            .write()
            .retain(|tx| tx.send(notification.clone()).is_ok());
        self.all.write().retain(|tx| tx.send(notification.clone()).is_ok());
    }

    /// Returns the number of subscribers across all lists.
    pub fn subscriber_count(&self) -> usize {
        self.local.read().len() + self.remote.read().len() + self.migration.read().len() + self.all.read().len()
    }

    fn list(&self, source: Option<ChangeSource>) -> &RwLock<Vec<Sender<ChangeNotification>>> {
        match source {
            Some(ChangeSource::Local) => &self.local,
            Some(ChangeSource::Remote) => &self.remote,
            Some(ChangeSource::Migration) => &self.migration,
            None => &self.all,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn subscribers_see_only_their_source() {
        let feed = ChangeFeed::new();
        let local = feed.subscribe(Some(ChangeSource::Local));
        let remote = feed.subscribe(Some(ChangeSource::Remote));
        let all = feed.subscribe(None);

        let id = LocalId::new();
        feed.emit(ChangeNotification::single(EntityType::Specimen, id, ChangeSource::Remote));

        assert!(local.try_recv().is_err());
        let got = remote.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(got.changed_ids, vec![id]);
        assert_eq!(all.recv().unwrap().source, ChangeSource::Remote);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe(Some(ChangeSource::Migration));
        assert_eq!(feed.subscriber_count(), 1);
        drop(rx);

        feed.emit(ChangeNotification::single(
            EntityType::Capture,
            LocalId::new(),
            ChangeSource::Migration,
        ));
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn empty_notifications_are_not_sent() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe(None);
        feed.emit(ChangeNotification {
            entity_type: EntityType::Telemetry,
            changed_ids: Vec::new(),
            source: ChangeSource::Local,
        });
        assert!(rx.try_recv().is_err());
    }
}
