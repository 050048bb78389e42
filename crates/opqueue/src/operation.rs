use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Future returned by [`Operation::start`].
pub type OperationFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Identifier handed out by [`OperationQueue::enqueue`](crate::OperationQueue::enqueue).
///
/// Unique for the lifetime of the queue that issued it.
pub type ReferenceId = u64;

/// A unit of work the queue can start.
///
/// The returned future resolving is the completion signal. Operations
/// report their own success or failure through their own channels; the
/// queue ignores the outcome.
pub trait Operation: Send + Sync + 'static {
    fn start(&self) -> OperationFuture<'_>;
}

/// An operation together with its queue reference.
#[derive(Clone)]
pub struct QueuedOperation {
    pub reference: ReferenceId,
    pub operation: Arc<dyn Operation>,
}

impl fmt::Debug for QueuedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedOperation")
            .field("reference", &self.reference)
            .finish_non_exhaustive()
    }
}
