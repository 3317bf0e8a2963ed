use std::fmt::Debug;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use fieldx_plus::fx_plus;
use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::error::CacheError;
use crate::error::StoreError;
use crate::traits::Connector;
use crate::types::CircuitState;
use crate::types::PoolStats;

struct ReadyPool<T> {
    // Sorted by slot number.
    connections:   Vec<(usize, Arc<T>)>,
    init_duration: Duration,
}

/// Fixed-size set of connections to the backing store, handed out round-robin.
///
/// A slot whose connection fails to open or to become ready within `ready_timeout` is left out; the pool works as
/// long as one slot made it. There is no health checking after [`init()`](Self::init): a connection that starts
/// failing later still gets its turn.
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`ConnectionPool`].", "", "See [`ConnectionPool::builder()`] method."),
        method_doc("Implement builder pattern for [`ConnectionPool`]."),
    )
)]
pub struct ConnectionPool<C>
where
    C: Connector,
{
    #[fieldx(get(clone), builder(required, into))]
    connector: Arc<C>,

    /// Number of connections to open.
    #[fieldx(get(copy), default(4))]
    size: usize,

    /// How long a single slot may take to connect and pass its readiness check.
    #[fieldx(get(copy), default(Duration::from_secs(10)))]
    ready_timeout: Duration,

    #[fieldx(private, get(off), builder(off), default(OnceCell::new()))]
    ready: OnceCell<ReadyPool<C::Connection>>,

    #[fieldx(private, get(off), builder(off), default(AtomicUsize::new(0)))]
    next: AtomicUsize,

    #[fieldx(private, get(off), builder(off), default(AtomicU64::new(0)))]
    builds: AtomicU64,
}

impl<C> ConnectionPool<C>
where
    C: Connector,
{
    /// Open the pool. Concurrent callers share one build; once a build succeeded, further calls return right away.
    /// A failed build leaves the pool uninitialized so that a later call retries.
    ///
    /// Returns the number of usable connections.
    pub async fn init(&self) -> Result<usize, CacheError> {
        let ready = self.ready.get_or_try_init(|| self.build()).await?;
        Ok(ready.connections.len())
    }

    #[instrument(level = "trace", skip(self), fields(size = self.size()))]
    async fn build(&self) -> Result<ReadyPool<C::Connection>, CacheError> {
        let started = Instant::now();
        let size = self.size();
        let ready_timeout = self.ready_timeout();
        self.builds.fetch_add(1, Ordering::Relaxed);

        let mut attempts = JoinSet::new();
        for slot in 0..size {
            let connector = self.connector();
            attempts.spawn(async move {
                let opened = tokio::time::timeout(ready_timeout, Self::open_slot(connector, slot))
                    .await
                    .unwrap_or_else(|_| {
                        Err(StoreError::NotReady {
                            slot,
                            reason: format!("not ready within {ready_timeout:?}"),
                        })
                    });
                (slot, opened)
            });
        }

        let mut connections = Vec::with_capacity(size);
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok((slot, Ok(connection))) => connections.push((slot, Arc::new(connection))),
                Ok((slot, Err(err))) => warn!(slot, error = %err, "connection left out of the pool"),
                Err(err) => warn!(error = %err, "connection task did not complete"),
            }
        }

        if connections.is_empty() {
            error!(attempted = size, "no connection became ready");
            return Err(CacheError::PoolExhausted { attempted: size });
        }

        connections.sort_by_key(|(slot, _)| *slot);
        let init_duration = started.elapsed();
        info!(connected = connections.len(), configured = size, ?init_duration, "connection pool ready");

        Ok(ReadyPool {
            connections,
            init_duration,
        })
    }

    async fn open_slot(connector: Arc<C>, slot: usize) -> Result<C::Connection, StoreError> {
        let connection = connector.connect(slot).await?;
        connector.ready(&connection).await?;
        Ok(connection)
    }

    /// Next connection in round-robin order.
    pub fn connection(&self) -> Result<Arc<C::Connection>, CacheError> {
        let ready = self.ready.get().ok_or(CacheError::PoolNotInitialized)?;
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % ready.connections.len();
        Ok(ready.connections[idx].1.clone())
    }

    pub fn is_initialized(&self) -> bool {
        self.ready.initialized()
    }

    /// Slots that made it into the pool, ascending.
    pub fn connected_slots(&self) -> Vec<usize> {
        self.ready
            .get()
            .map(|r| r.connections.iter().map(|(slot, _)| *slot).collect())
            .unwrap_or_default()
    }

    pub fn circuit_state(&self) -> CircuitState {
        if self.is_initialized() {
            CircuitState::Closed
        }
        else {
            CircuitState::Open
        }
    }

    pub fn stats(&self) -> PoolStats {
        let ready = self.ready.get();
        PoolStats {
            configured:    self.size(),
            connected:     ready.map_or(0, |r| r.connections.len()),
            builds:        self.builds.load(Ordering::Relaxed),
            init_duration: ready.map(|r| r.init_duration),
        }
    }
}

impl<C> Debug for ConnectionPool<C>
where
    C: Connector,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("size", &self.size())
            .field("connected", &self.connected_slots())
            .finish()
    }
}
