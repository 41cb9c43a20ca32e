use std::sync::{Arc, Mutex, RwLock};

use crate::snapshot::SessionSnapshot;

/// Trait for receiving snapshot versions from the core.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait SnapshotObserver: Send + Sync {
    fn on_snapshot(&self, snapshot: &SessionSnapshot);
}

struct PublisherInner {
    current: SessionSnapshot,
    last_version: u64,
    observers: Vec<(u64, Arc<dyn SnapshotObserver>)>,
    next_id: u64,
}

/// Single-writer, multi-reader broadcast of the session snapshot.
///
/// There is one canonical current version at any instant; every observer
/// sees the same sequence of versions, starting with the version current
/// at subscribe time. Versions are assigned by the writer while it still
/// holds its state lock, and delivery is serialized under `order`, so a
/// snapshot that lost the race to a newer one is dropped instead of
/// reaching observers late.
#[derive(Clone)]
pub struct SnapshotPublisher {
    inner: Arc<RwLock<PublisherInner>>,
    order: Arc<Mutex<()>>,
}

/// Handle returned by [`SnapshotPublisher::subscribe`]; used to stop
/// delivery to the associated observer.
pub struct Subscription {
    inner: Arc<RwLock<PublisherInner>>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        let mut inner = self.inner.write().unwrap();
        inner.observers.retain(|(id, _)| *id != self.id);
    }
}

impl SnapshotPublisher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(PublisherInner {
                current: SessionSnapshot::default(),
                last_version: 0,
                observers: Vec::new(),
                next_id: 0,
            })),
            order: Arc::new(Mutex::new(())),
        }
    }

    /// Register an observer. The current snapshot is delivered synchronously
    /// before this returns, so no initial state is ever missed.
    pub fn subscribe(&self, observer: Arc<dyn SnapshotObserver>) -> Subscription {
        let _order = self.order.lock().unwrap();
        let (id, current) = {
            let mut inner = self.inner.write().unwrap();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.observers.push((id, observer.clone()));
            (id, inner.current.clone())
        };
        observer.on_snapshot(&current);
        Subscription {
            inner: self.inner.clone(),
            id,
        }
    }

    /// Synchronous peek at the current snapshot.
    pub fn current(&self) -> SessionSnapshot {
        self.inner.read().unwrap().current.clone()
    }

    /// Replace the current snapshot and notify every observer, assigning
    /// the next version number.
    pub fn publish(&self, snapshot: SessionSnapshot) {
        self.publish_inner(None, snapshot);
    }

    /// Replace the current snapshot with one the writer stamped while it
    /// still held its own state lock. A version at or below the current
    /// one means the snapshot raced a newer sibling to delivery and lost;
    /// it is dropped so observers never see state move backwards.
    pub fn publish_version(&self, version: u64, snapshot: SessionSnapshot) {
        self.publish_inner(Some(version), snapshot);
    }

    fn publish_inner(&self, version: Option<u64>, snapshot: SessionSnapshot) {
        let _order = self.order.lock().unwrap();
        let observers = {
            let mut inner = self.inner.write().unwrap();
            let version = version.unwrap_or(inner.last_version + 1);
            if version <= inner.last_version {
                tracing::debug!(version, "dropping out-of-order snapshot");
                return;
            }
            inner.last_version = version;
            inner.current = snapshot.clone();
            inner.observers.clone()
        };
        for (_, observer) in observers {
            observer.on_snapshot(&snapshot);
        }
    }
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ConnectionPhase;
    use std::sync::Mutex;

    struct Capture {
        phases: Mutex<Vec<ConnectionPhase>>,
    }

    impl Capture {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                phases: Mutex::new(Vec::new()),
            })
        }
    }

    impl SnapshotObserver for Capture {
        fn on_snapshot(&self, snapshot: &SessionSnapshot) {
            self.phases.lock().unwrap().push(snapshot.phase.clone());
        }
    }

    #[test]
    fn subscribe_delivers_current_snapshot_immediately() {
        let publisher = SnapshotPublisher::new();
        let capture = Capture::new();
        let _sub = publisher.subscribe(capture.clone());
        assert_eq!(
            *capture.phases.lock().unwrap(),
            vec![ConnectionPhase::Disconnected]
        );
    }

    #[test]
    fn publish_reaches_every_observer() {
        let publisher = SnapshotPublisher::new();
        let a = Capture::new();
        let b = Capture::new();
        let _sa = publisher.subscribe(a.clone());
        let _sb = publisher.subscribe(b.clone());

        let mut snap = SessionSnapshot::default();
        snap.set_phase(ConnectionPhase::Connecting);
        publisher.publish(snap);

        for capture in [&a, &b] {
            assert_eq!(
                *capture.phases.lock().unwrap(),
                vec![ConnectionPhase::Disconnected, ConnectionPhase::Connecting]
            );
        }
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let publisher = SnapshotPublisher::new();
        let capture = Capture::new();
        let sub = publisher.subscribe(capture.clone());
        sub.unsubscribe();

        let mut snap = SessionSnapshot::default();
        snap.set_phase(ConnectionPhase::Connecting);
        publisher.publish(snap);

        assert_eq!(
            *capture.phases.lock().unwrap(),
            vec![ConnectionPhase::Disconnected]
        );
    }

    #[test]
    fn stale_version_is_dropped() {
        let publisher = SnapshotPublisher::new();
        let capture = Capture::new();
        let _sub = publisher.subscribe(capture.clone());

        let mut newer = SessionSnapshot::default();
        newer.set_phase(ConnectionPhase::Connected);
        publisher.publish_version(5, newer);

        let mut older = SessionSnapshot::default();
        older.set_phase(ConnectionPhase::Connecting);
        publisher.publish_version(3, older);

        assert_eq!(publisher.current().phase, ConnectionPhase::Connected);
        assert_eq!(
            *capture.phases.lock().unwrap(),
            vec![ConnectionPhase::Disconnected, ConnectionPhase::Connected]
        );
    }

    #[test]
    fn current_reflects_last_published_version() {
        let publisher = SnapshotPublisher::new();
        let mut snap = SessionSnapshot::default();
        snap.set_phase(ConnectionPhase::Connected);
        publisher.publish(snap);
        assert_eq!(publisher.current().phase, ConnectionPhase::Connected);
    }
}
