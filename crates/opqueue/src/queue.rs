use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Notify, mpsc};
use tracing::{debug, trace, warn};

use crate::operation::{Operation, QueuedOperation, ReferenceId};

/// Concurrency of a freshly created queue.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Events emitted by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// Waiting and running lists both became empty.
    Idle,
}

/// Owned copy of the queue's lists at one instant.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    /// In admission order.
    pub waiting: Vec<QueuedOperation>,
    pub running: Vec<QueuedOperation>,
}

/// Bounded-concurrency FIFO scheduler.
///
/// Cloning yields another handle to the same queue. Starting operations
/// spawns tokio tasks, so the mutating methods must be called from
/// within a tokio runtime.
#[derive(Clone)]
pub struct OperationQueue {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<QueueState>,
    idle: Notify,
    events_tx: mpsc::Sender<QueueEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<QueueEvent>>>,
}

struct QueueState {
    concurrency: usize,
    next_reference: ReferenceId,
    waiting: VecDeque<QueuedOperation>,
    running: Vec<QueuedOperation>,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.running.is_empty()
    }
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationQueue {
    /// Creates a queue running one operation at a time.
    pub fn new() -> Self {
        Self::with_concurrency(DEFAULT_CONCURRENCY)
    }

    /// Creates a queue running up to `concurrency` operations (at least one).
    pub fn with_concurrency(concurrency: usize) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    concurrency: concurrency.max(1),
                    next_reference: 0,
                    waiting: VecDeque::new(),
                    running: Vec::new(),
                }),
                idle: Notify::new(),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&self) -> Option<mpsc::Receiver<QueueEvent>> {
        self.inner
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Current concurrency limit.
    pub fn concurrency(&self) -> usize {
        self.inner.lock_state().concurrency
    }

    /// Raises the concurrency limit to `max(current, concurrency)`.
    ///
    /// The limit never decreases. Raising it immediately starts waiting
    /// operations into the new slots.
    pub fn set_concurrency(&self, concurrency: usize) {
        let admitted = {
            let mut state = self.inner.lock_state();
            if concurrency <= state.concurrency {
                return;
            }
            state.concurrency = concurrency;
            admit(&mut state)
        };
        debug!(concurrency, "queue concurrency raised");
        start_all(&self.inner, admitted);
    }

    /// Appends an operation and starts it if a slot is free.
    pub fn enqueue(&self, operation: Arc<dyn Operation>) -> ReferenceId {
        self.enqueue_with(|_| operation)
    }

    /// Like [`enqueue`](Self::enqueue), but builds the operation from its
    /// reference so the operation can report under the same id.
    ///
    /// `build` runs while the queue is locked and must not call back into it.
    pub fn enqueue_with<F>(&self, build: F) -> ReferenceId
    where
        F: FnOnce(ReferenceId) -> Arc<dyn Operation>,
    {
        let (reference, admitted) = {
            let mut state = self.inner.lock_state();
            state.next_reference += 1;
            let reference = state.next_reference;
            let operation = build(reference);
            state.waiting.push_back(QueuedOperation {
                reference,
                operation,
            });
            (reference, admit(&mut state))
        };
        trace!(reference, "operation enqueued");
        start_all(&self.inner, admitted);
        reference
    }

    /// Removes a still-waiting operation so it never starts.
    ///
    /// Returns `false` if the reference is unknown or already running;
    /// aborting a running operation is up to the operation itself.
    pub fn cancel_waiting(&self, reference: ReferenceId) -> bool {
        self.cancel_waiting_with(reference, |_| {})
    }

    /// Like [`cancel_waiting`](Self::cancel_waiting), but runs `on_removed`
    /// with the removed entry before any resulting idle signal is sent.
    ///
    /// `on_removed` runs after the queue lock is released.
    pub fn cancel_waiting_with<F>(&self, reference: ReferenceId, on_removed: F) -> bool
    where
        F: FnOnce(&QueuedOperation),
    {
        let (removed, became_idle) = {
            let mut state = self.inner.lock_state();
            let removed = state
                .waiting
                .iter()
                .position(|e| e.reference == reference)
                .and_then(|pos| state.waiting.remove(pos));
            let became_idle = removed.is_some() && state.is_idle();
            (removed, became_idle)
        };
        let Some(entry) = removed else {
            return false;
        };

        debug!(reference, "waiting operation cancelled");
        on_removed(&entry);
        if became_idle {
            self.inner.signal_idle();
        }
        true
    }

    /// Returns a copy of the waiting and running lists.
    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.inner.lock_state();
        QueueSnapshot {
            waiting: state.waiting.iter().cloned().collect(),
            running: state.running.clone(),
        }
    }

    /// Number of waiting plus running operations.
    pub fn operations_count(&self) -> usize {
        let state = self.inner.lock_state();
        state.waiting.len() + state.running.len()
    }

    /// Returns `true` if nothing is waiting or running.
    pub fn is_idle(&self) -> bool {
        self.inner.lock_state().is_idle()
    }

    /// Resolves once the queue is idle. Returns immediately if it already is.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signal_idle(&self) {
        debug!("queue idle");
        if let Err(e) = self.events_tx.try_send(QueueEvent::Idle) {
            trace!("idle event not delivered: {e}");
        }
        self.idle.notify_waiters();
    }
}

/// Starts admitted operations, each on its own task. Called with the
/// state lock released.
fn start_all(inner: &Arc<Inner>, admitted: Vec<QueuedOperation>) {
    for entry in admitted {
        run(inner, entry);
    }
}

/// Moves operations from waiting to running while slots are free.
fn admit(state: &mut QueueState) -> Vec<QueuedOperation> {
    let mut admitted = Vec::new();
    while state.running.len() < state.concurrency {
        let Some(entry) = state.waiting.pop_front() else {
            break;
        };
        state.running.push(entry.clone());
        admitted.push(entry);
    }
    admitted
}

fn run(inner: &Arc<Inner>, entry: QueuedOperation) {
    let inner = Arc::clone(inner);
    let reference = entry.reference;
    trace!(reference, "operation started");

    tokio::spawn(async move {
        let operation = entry.operation;
        // Separate task so a panicking operation still frees its slot.
        let result = tokio::spawn(async move { operation.start().await }).await;
        if let Err(e) = result {
            warn!(reference, error = %e, "operation aborted");
        }
        complete(&inner, reference);
    });
}

/// Frees the slot of a finished operation and refills it in the same
/// critical section. Every mutation admits before releasing the lock, so
/// an operation never waits while a slot is free.
fn complete(inner: &Arc<Inner>, reference: ReferenceId) {
    let (admitted, became_idle) = {
        let mut state = inner.lock_state();
        if let Some(pos) = state.running.iter().position(|e| e.reference == reference) {
            state.running.swap_remove(pos);
        }
        let admitted = admit(&mut state);
        (admitted, state.is_idle())
    };
    trace!(reference, "operation completed");

    if became_idle {
        inner.signal_idle();
    }
    start_all(inner, admitted);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OperationFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    /// Operation that records its start and blocks until released.
    struct GatedOp {
        id: usize,
        started: mpsc::UnboundedSender<usize>,
        gate: Mutex<Option<oneshot::Receiver<()>>>,
    }

    impl Operation for GatedOp {
        fn start(&self) -> OperationFuture<'_> {
            Box::pin(async move {
                let _ = self.started.send(self.id);
                let gate = self.gate.lock().unwrap().take();
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
            })
        }
    }

    fn gated(
        id: usize,
        started: &mpsc::UnboundedSender<usize>,
    ) -> (Arc<GatedOp>, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        let op = Arc::new(GatedOp {
            id,
            started: started.clone(),
            gate: Mutex::new(Some(rx)),
        });
        (op, tx)
    }

    /// Operation that tracks how many instances run at once.
    struct CountingOp {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        order: Arc<Mutex<Vec<usize>>>,
        id: usize,
    }

    impl Operation for CountingOp {
        fn start(&self) -> OperationFuture<'_> {
            Box::pin(async move {
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                self.order.lock().unwrap().push(self.id);
                for _ in 0..3 {
                    tokio::task::yield_now().await;
                }
                self.running.fetch_sub(1, Ordering::SeqCst);
            })
        }
    }

    struct PanickingOp;

    impl Operation for PanickingOp {
        fn start(&self) -> OperationFuture<'_> {
            Box::pin(async move { panic!("operation failed") })
        }
    }

    async fn next_started(rx: &mut mpsc::UnboundedReceiver<usize>) -> usize {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("operation did not start")
            .unwrap()
    }

    async fn assert_no_start(rx: &mut mpsc::UnboundedReceiver<usize>) {
        let res = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(res.is_err(), "unexpected start: {res:?}");
    }

    #[tokio::test]
    async fn two_slots_three_operations() {
        let queue = OperationQueue::with_concurrency(2);
        let mut events = queue.take_events().unwrap();
        let (started_tx, mut started) = mpsc::unbounded_channel();

        let (a, release_a) = gated(0, &started_tx);
        let (b, release_b) = gated(1, &started_tx);
        let (c, release_c) = gated(2, &started_tx);
        queue.enqueue(a);
        queue.enqueue(b);
        let ref_c = queue.enqueue(c);

        let mut first = vec![next_started(&mut started).await, next_started(&mut started).await];
        first.sort();
        assert_eq!(first, vec![0, 1]);
        assert_no_start(&mut started).await;

        let snap = queue.snapshot();
        assert_eq!(snap.running.len(), 2);
        assert_eq!(snap.waiting.len(), 1);
        assert_eq!(snap.waiting[0].reference, ref_c);

        release_a.send(()).unwrap();
        assert_eq!(next_started(&mut started).await, 2);
        assert!(!queue.is_idle());

        release_b.send(()).unwrap();
        release_c.send(()).unwrap();
        queue.wait_idle().await;

        let idle = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert_eq!(idle, Some(QueueEvent::Idle));
        let extra = tokio::time::timeout(Duration::from_millis(50), events.recv()).await;
        assert!(extra.is_err(), "idle fired more than once");
    }

    #[tokio::test]
    async fn admission_is_fifo() {
        let queue = OperationQueue::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in 0..5 {
            queue.enqueue(Arc::new(CountingOp {
                running: Arc::clone(&running),
                peak: Arc::clone(&peak),
                order: Arc::clone(&order),
                id,
            }));
        }
        queue.wait_idle().await;

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn running_never_exceeds_concurrency() {
        let queue = OperationQueue::with_concurrency(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in 0..40 {
            queue.enqueue(Arc::new(CountingOp {
                running: Arc::clone(&running),
                peak: Arc::clone(&peak),
                order: Arc::clone(&order),
                id,
            }));
            assert!(queue.snapshot().running.len() <= 3);
        }
        queue.wait_idle().await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(order.lock().unwrap().len(), 40);
    }

    #[tokio::test]
    async fn cancelled_waiting_operation_never_starts() {
        let queue = OperationQueue::new();
        let (started_tx, mut started) = mpsc::unbounded_channel();
        let (a, release_a) = gated(0, &started_tx);
        let (b, _release_b) = gated(1, &started_tx);

        let ref_a = queue.enqueue(a);
        let ref_b = queue.enqueue(b);
        assert_eq!(next_started(&mut started).await, 0);

        // Running operations are not the queue's to cancel.
        assert!(!queue.cancel_waiting(ref_a));
        assert!(queue.cancel_waiting(ref_b));
        assert!(!queue.cancel_waiting(ref_b));

        release_a.send(()).unwrap();
        queue.wait_idle().await;
        assert_no_start(&mut started).await;
    }

    #[tokio::test]
    async fn cancelling_last_waiting_signals_idle_once() {
        let queue = OperationQueue::new();
        let mut events = queue.take_events().unwrap();
        let (started_tx, mut started) = mpsc::unbounded_channel();
        let (a, release_a) = gated(0, &started_tx);
        let (b, _release_b) = gated(1, &started_tx);

        queue.enqueue(a);
        let ref_b = queue.enqueue(b);
        assert_eq!(next_started(&mut started).await, 0);
        queue.cancel_waiting(ref_b);
        assert!(events.try_recv().is_err());

        release_a.send(()).unwrap();
        queue.wait_idle().await;
        let idle = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert_eq!(idle, Some(QueueEvent::Idle));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_hook_sees_only_waiting_operations() {
        let queue = OperationQueue::new();
        let (started_tx, mut started) = mpsc::unbounded_channel();
        let (a, release_a) = gated(0, &started_tx);
        let (b, _release_b) = gated(1, &started_tx);

        let ref_a = queue.enqueue(a);
        let ref_b = queue.enqueue(b);
        assert_eq!(next_started(&mut started).await, 0);

        let mut seen = Vec::new();
        assert!(!queue.cancel_waiting_with(ref_a, |e| seen.push(e.reference)));
        assert!(queue.cancel_waiting_with(ref_b, |e| seen.push(e.reference)));
        assert!(!queue.cancel_waiting_with(ref_b, |e| seen.push(e.reference)));
        assert_eq!(seen, vec![ref_b]);

        release_a.send(()).unwrap();
        queue.wait_idle().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn waiting_always_has_running_ahead() {
        let queue = OperationQueue::with_concurrency(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in 0..40 {
            queue.enqueue(Arc::new(CountingOp {
                running: Arc::clone(&running),
                peak: Arc::clone(&peak),
                order: Arc::clone(&order),
                id,
            }));
        }
        while !queue.is_idle() {
            let snap = queue.snapshot();
            assert!(snap.waiting.is_empty() || snap.running.len() == 2);
            tokio::task::yield_now().await;
        }
        assert_eq!(order.lock().unwrap().len(), 40);
    }

    #[tokio::test]
    async fn raising_concurrency_dispatches() {
        let queue = OperationQueue::new();
        let (started_tx, mut started) = mpsc::unbounded_channel();
        let mut releases = Vec::new();
        for id in 0..3 {
            let (op, release) = gated(id, &started_tx);
            queue.enqueue(op);
            releases.push(release);
        }
        assert_eq!(next_started(&mut started).await, 0);
        assert_no_start(&mut started).await;

        queue.set_concurrency(3);
        assert_eq!(queue.concurrency(), 3);
        let mut rest = vec![next_started(&mut started).await, next_started(&mut started).await];
        rest.sort();
        assert_eq!(rest, vec![1, 2]);

        // Never lowers.
        queue.set_concurrency(1);
        assert_eq!(queue.concurrency(), 3);

        for release in releases {
            release.send(()).unwrap();
        }
        queue.wait_idle().await;
    }

    #[tokio::test]
    async fn failing_operation_frees_its_slot() {
        let queue = OperationQueue::new();
        let (started_tx, mut started) = mpsc::unbounded_channel();
        let (after, release) = gated(7, &started_tx);

        queue.enqueue(Arc::new(PanickingOp));
        queue.enqueue(after);
        assert_eq!(next_started(&mut started).await, 7);

        release.send(()).unwrap();
        queue.wait_idle().await;
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn references_are_unique() {
        let queue = OperationQueue::new();
        let (started_tx, _started) = mpsc::unbounded_channel();
        let mut refs = Vec::new();
        let mut releases = Vec::new();
        for id in 0..10 {
            let (op, release) = gated(id, &started_tx);
            refs.push(queue.enqueue(op));
            releases.push(release);
        }
        let mut dedup = refs.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), refs.len());

        for release in releases {
            let _ = release.send(());
        }
        queue.wait_idle().await;
    }

    #[tokio::test]
    async fn enqueue_with_passes_the_reference() {
        let queue = OperationQueue::new();
        let (started_tx, mut started) = mpsc::unbounded_channel();
        let mut release = None;
        let reference = queue.enqueue_with(|reference| {
            let (op, tx) = gated(reference as usize, &started_tx);
            release = Some(tx);
            op as Arc<dyn Operation>
        });
        assert_eq!(next_started(&mut started).await, reference as usize);

        release.unwrap().send(()).unwrap();
        queue.wait_idle().await;
    }

    #[tokio::test]
    async fn snapshot_is_a_copy() {
        let queue = OperationQueue::new();
        let (started_tx, _started) = mpsc::unbounded_channel();
        let (a, release_a) = gated(0, &started_tx);
        let (b, release_b) = gated(1, &started_tx);
        queue.enqueue(a);
        queue.enqueue(b);

        let mut snap = queue.snapshot();
        snap.waiting.clear();
        snap.running.clear();
        assert_eq!(queue.operations_count(), 2);

        release_a.send(()).unwrap();
        release_b.send(()).unwrap();
        queue.wait_idle().await;
    }

    #[tokio::test]
    async fn empty_queue_is_idle() {
        let queue = OperationQueue::default();
        assert!(queue.is_idle());
        queue.wait_idle().await;
        assert!(queue.take_events().is_some());
        assert!(queue.take_events().is_none());
    }
}
