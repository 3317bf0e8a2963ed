use std::fmt::Debug;
use std::fmt::Display;
use std::hash::Hash;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheError;
use crate::error::StoreError;

/// Anything that can drop a cache segment. Lets the batching queue invalidate the cache without knowing its value
/// type.
pub trait SegmentInvalidator: Send + Sync + 'static {
    fn invalidate(&self, segment: &str) -> bool;
}

/// The backend side of a [`BatchQueue`](crate::batch::BatchQueue): executes one combined write per flushed window.
#[async_trait]
pub trait BatchWriter: Sized + Send + Sync + 'static {
    /// Operation kind. Every kind has its own coalescing window.
    type Kind: Debug + Display + Hash + Clone + Eq + Send + Sync + 'static;
    /// Entity key within a kind. At most one payload per key is pending at any time.
    type Key: Debug + Display + Hash + Clone + Eq + Send + Sync + 'static;
    type Payload: Debug + Clone + Send + Sync + 'static;

    /// Apply all `(key, payload)` pairs of one window in a single store operation. Pairs come in the order their keys
    /// were first enqueued within the window.
    async fn write_batch(&self, kind: &Self::Kind, batch: Vec<(Self::Key, Self::Payload)>) -> Result<(), CacheError>;

    /// Segments to drop once a batch of `kind` has been written.
    fn affected_segments(&self, _kind: &Self::Kind, _keys: &[Self::Key]) -> Vec<String> {
        Vec::new()
    }
}

/// A recurring aggregate refresh run by the [`PrecomputeScheduler`](crate::scheduler::PrecomputeScheduler).
#[async_trait]
pub trait PrecomputeJob<V>: Send + Sync + 'static
where
    V: Send + 'static,
{
    /// Key of the produced value in the `precomputed` segment.
    fn name(&self) -> &str;

    fn ttl(&self) -> Duration {
        Duration::from_secs(300)
    }

    fn priority(&self) -> i32 {
        0
    }

    async fn compute(&self) -> Result<V, CacheError>;
}

/// Opens connections to the backing store for the [`ConnectionPool`](crate::pool::ConnectionPool).
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;

    async fn connect(&self, slot: usize) -> Result<Self::Connection, StoreError>;

    /// Readiness check run right after [`connect()`](Self::connect). A failure leaves the slot out of the pool.
    async fn ready(&self, _connection: &Self::Connection) -> Result<(), StoreError> {
        Ok(())
    }
}
