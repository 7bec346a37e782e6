//! Multicast data flows and scan synchronization events.
//!
//! A [`DataFlow`] is the channel on which a component publishes
//! [`DataArray`]s to its subscribers. Subscriptions are explicit tokens so
//! cleanup is deterministic: dropping the token unsubscribes. The first
//! subscriber triggers `start_generate` on the owning component, the last
//! one leaving triggers `stop_generate`.
//!
//! A [`SyncEvent`] is a named rendezvous with counting semantics: each
//! `notify()` releases exactly one waiter, and multiple concurrent waiters
//! each need their own notify. A flow bound to a sync event makes the engine
//! wait for one notify before each scan start, and disables item dropping
//! for lagging subscribers.

use crate::data::DataArray;
use crate::{AcqError, AcqResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tracing::warn;

/// Named rendezvous releasing one waiter per notify.
#[derive(Clone)]
pub struct SyncEvent {
    inner: Arc<EventInner>,
}

struct EventInner {
    name: String,
    sem: Semaphore,
}

impl SyncEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventInner {
                name: name.into(),
                sem: Semaphore::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Release exactly one waiter (queued if none is waiting yet).
    pub fn notify(&self) {
        self.inner.sem.add_permits(1);
    }

    /// Wait for one notify.
    pub async fn wait(&self) {
        if let Ok(permit) = self.inner.sem.acquire().await {
            permit.forget();
        }
    }

    /// Wait for one notify, up to `timeout`. Returns false on timeout.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

impl std::fmt::Debug for SyncEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEvent")
            .field("name", &self.inner.name)
            .finish()
    }
}

/// Implemented by the component owning a flow; told when the subscriber
/// count crosses zero in either direction.
pub trait FlowSource: Send + Sync {
    fn start_generate(&self);
    fn stop_generate(&self);
}

/// Callback invoked synchronously for every published array.
pub type FlowListener = Arc<dyn Fn(&DataArray) + Send + Sync>;

struct FlowState {
    next_id: u64,
    listeners: Vec<(u64, FlowListener)>,
    source: Option<Arc<dyn FlowSource>>,
    sync: Option<SyncEvent>,
    max_discard: usize,
}

struct FlowShared {
    name: String,
    state: Mutex<FlowState>,
}

/// Multicast channel of [`DataArray`].
#[derive(Clone)]
pub struct DataFlow {
    shared: Arc<FlowShared>,
}

/// Handle for one subscription; dropping it unsubscribes.
pub struct SubscriptionToken {
    id: u64,
    flow: Weak<FlowShared>,
}

impl DataFlow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(FlowShared {
                name: name.into(),
                state: Mutex::new(FlowState {
                    next_id: 0,
                    listeners: Vec::new(),
                    source: None,
                    sync: None,
                    max_discard: 0,
                }),
            }),
        }
    }

    /// Attach the generating component.
    pub fn set_source(&self, source: Arc<dyn FlowSource>) {
        self.shared.state.lock().source = Some(source);
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Register a listener; returns the token that keeps it alive.
    pub fn subscribe(&self, listener: FlowListener) -> SubscriptionToken {
        let (token, source) = {
            let mut state = self.shared.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.listeners.push((id, listener));
            let source = if state.listeners.len() == 1 {
                state.source.clone()
            } else {
                None
            };
            (
                SubscriptionToken {
                    id,
                    flow: Arc::downgrade(&self.shared),
                },
                source,
            )
        };
        if let Some(source) = source {
            source.start_generate();
        }
        token
    }

    fn unsubscribe_id(shared: &FlowShared, id: u64) {
        let source = {
            let mut state = shared.state.lock();
            let before = state.listeners.len();
            state.listeners.retain(|(lid, _)| *lid != id);
            if before > 0 && state.listeners.is_empty() {
                state.source.clone()
            } else {
                None
            }
        };
        if let Some(source) = source {
            source.stop_generate();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.state.lock().listeners.len()
    }

    /// Deliver `data` to every subscriber, synchronously, in subscription
    /// order. A panicking listener is isolated and logged; the rest still
    /// run.
    pub fn notify(&self, data: &DataArray) {
        let listeners: Vec<(u64, FlowListener)> = self.shared.state.lock().listeners.clone();
        for (id, listener) in listeners {
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| listener(data)));
            if outcome.is_err() {
                warn!(flow = %self.shared.name, listener = id, "listener panicked during notify");
            }
        }
    }

    /// Await the next published array (single-shot).
    pub async fn get(&self) -> AcqResult<DataArray> {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<DataArray>(1);
        let token = self.subscribe(Arc::new(move |da| {
            let _ = tx.try_send(da.clone());
        }));
        let out = rx.recv().await.ok_or_else(|| {
            AcqError::External(format!("flow '{}' closed before a sample", self.shared.name))
        });
        drop(token);
        out
    }

    /// Bind (or unbind, with `None`) a sync event. While bound, the engine
    /// waits for one notify per scan start and `max_discard` is forced to 0.
    /// Mid-scan rebinds take effect at the next scan boundary, which is when
    /// the engine reads the binding.
    pub fn synchronized_on(&self, event: Option<SyncEvent>) {
        let mut state = self.shared.state.lock();
        if event.is_some() {
            state.max_discard = 0;
        }
        state.sync = event;
    }

    /// The currently bound sync event, if any.
    pub fn sync_event(&self) -> Option<SyncEvent> {
        self.shared.state.lock().sync.clone()
    }

    /// Allowed backlog for buffered subscribers before the oldest item may
    /// be dropped; 0 means never drop. Forced to 0 while a sync event is
    /// bound.
    pub fn set_max_discard(&self, n: usize) {
        let mut state = self.shared.state.lock();
        if state.sync.is_some() && n != 0 {
            warn!(flow = %self.shared.name, "max_discard forced to 0 while synchronized");
            state.max_discard = 0;
        } else {
            state.max_discard = n;
        }
    }

    pub fn max_discard(&self) -> usize {
        self.shared.state.lock().max_discard
    }

    /// Subscribe with a queue the receiver drains at its own pace. When the
    /// backlog exceeds `max_discard` (and it is non-zero) the oldest item is
    /// silently dropped, counted in [`BufferedSubscription::dropped`].
    pub fn subscribe_buffered(&self) -> BufferedSubscription {
        let queue: Arc<Mutex<VecDeque<DataArray>>> = Arc::new(Mutex::new(VecDeque::new()));
        let notify = Arc::new(Notify::new());
        let dropped = Arc::new(AtomicU64::new(0));

        let q = queue.clone();
        let n = notify.clone();
        let d = dropped.clone();
        let shared = Arc::downgrade(&self.shared);
        let token = self.subscribe(Arc::new(move |da| {
            let limit = shared
                .upgrade()
                .map(|s| s.state.lock().max_discard)
                .unwrap_or(0);
            let mut queue = q.lock();
            queue.push_back(da.clone());
            if limit > 0 {
                while queue.len() > limit {
                    queue.pop_front();
                    d.fetch_add(1, Ordering::Relaxed);
                }
            }
            drop(queue);
            n.notify_one();
        }));

        BufferedSubscription {
            queue,
            notify,
            dropped,
            _token: token,
        }
    }
}

impl Drop for SubscriptionToken {
    fn drop(&mut self) {
        if let Some(shared) = self.flow.upgrade() {
            DataFlow::unsubscribe_id(&shared, self.id);
        }
    }
}

/// Receiver half of [`DataFlow::subscribe_buffered`].
pub struct BufferedSubscription {
    queue: Arc<Mutex<VecDeque<DataArray>>>,
    notify: Arc<Notify>,
    dropped: Arc<AtomicU64>,
    _token: SubscriptionToken,
}

impl BufferedSubscription {
    /// Await the next queued array.
    pub async fn next(&mut self) -> DataArray {
        loop {
            if let Some(da) = self.queue.lock().pop_front() {
                return da;
            }
            self.notify.notified().await;
        }
    }

    /// Items silently discarded so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DynArray, Dtype};
    use crate::metadata::Metadata;
    use std::sync::atomic::AtomicUsize;

    fn sample() -> DataArray {
        DataArray::new(DynArray::zeros(Dtype::U16, &[2, 2]), Metadata::default())
    }

    #[test]
    fn test_notify_order_and_token_drop() {
        let flow = DataFlow::new("det0");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = seen.clone();
        let t1 = flow.subscribe(Arc::new(move |_| s1.lock().push(1)));
        let s2 = seen.clone();
        let _t2 = flow.subscribe(Arc::new(move |_| s2.lock().push(2)));

        flow.notify(&sample());
        assert_eq!(*seen.lock(), vec![1, 2]);

        drop(t1);
        flow.notify(&sample());
        assert_eq!(*seen.lock(), vec![1, 2, 2]);
    }

    #[test]
    fn test_start_stop_generate() {
        struct Counter {
            starts: AtomicUsize,
            stops: AtomicUsize,
        }
        impl FlowSource for Counter {
            fn start_generate(&self) {
                self.starts.fetch_add(1, Ordering::SeqCst);
            }
            fn stop_generate(&self) {
                self.stops.fetch_add(1, Ordering::SeqCst);
            }
        }

        let flow = DataFlow::new("cam");
        let counter = Arc::new(Counter {
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        });
        flow.set_source(counter.clone());

        let a = flow.subscribe(Arc::new(|_| {}));
        let b = flow.subscribe(Arc::new(|_| {}));
        assert_eq!(counter.starts.load(Ordering::SeqCst), 1);

        drop(a);
        assert_eq!(counter.stops.load(Ordering::SeqCst), 0);
        drop(b);
        assert_eq!(counter.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let flow = DataFlow::new("noisy");
        let _bad = flow.subscribe(Arc::new(|_| panic!("listener bug")));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _good = flow.subscribe(Arc::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        flow.notify(&sample());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sync_event_counting() {
        let ev = SyncEvent::new("start");
        ev.notify();
        assert!(ev.wait_timeout(Duration::from_millis(50)).await);
        // second wait needs a second notify
        assert!(!ev.wait_timeout(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_get_receives_next() {
        let flow = DataFlow::new("once");
        let f2 = flow.clone();
        let task = tokio::spawn(async move { f2.get().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        flow.notify(&sample());
        let got = task.await.unwrap().unwrap();
        assert_eq!(got.shape(), &[2, 2]);
    }

    #[test]
    fn test_sync_binding_forces_no_discard() {
        let flow = DataFlow::new("gated");
        flow.set_max_discard(4);
        assert_eq!(flow.max_discard(), 4);
        flow.synchronized_on(Some(SyncEvent::new("e")));
        assert_eq!(flow.max_discard(), 0);
        flow.set_max_discard(8);
        assert_eq!(flow.max_discard(), 0);
    }

    #[tokio::test]
    async fn test_buffered_discard() {
        let flow = DataFlow::new("live");
        flow.set_max_discard(2);
        let mut sub = flow.subscribe_buffered();
        for _ in 0..5 {
            flow.notify(&sample());
        }
        assert_eq!(sub.dropped(), 3);
        let _ = sub.next().await;
    }
}
