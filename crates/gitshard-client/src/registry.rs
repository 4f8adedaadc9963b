//! Live connections to every shard, rebuilt on topology changes.
//!
//! Readers take an `Arc` of the current [`ConnectionSnapshot`] and never
//! block on a reconcile in progress. A reconcile builds the next snapshot
//! off to the side, publishes it with a single pointer swap, and only then
//! closes the connections of the snapshot it replaced.

use crate::config::{ClientConfig, ConfigSource};
use crate::routing::ShardDirectory;
use async_trait::async_trait;
use futures::future::join_all;
use gitshard_core::{DomainError, GitserverServiceClient, TransportErrorKind};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tarpc::client::Config;
use tokio::sync::{Mutex, OnceCell};
use tokio_serde::formats::Bincode;
use tracing::{debug, info, warn};

/// Opens and closes connections to shard addresses.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Conn: Clone + Send + Sync + 'static;

    /// One connection attempt to `addr`.
    async fn dial(&self, addr: &str) -> Result<Self::Conn, DomainError>;

    /// Release a connection that is no longer published.
    async fn close(&self, addr: &str, conn: Self::Conn);
}

/// Dials binary RPC connections over TCP.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    config: ClientConfig,
}

impl TcpDialer {
    /// Dialer applying the connect timeout and pending-request limit of
    /// `config` to every connection it opens.
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Conn = GitserverServiceClient;

    async fn dial(&self, addr: &str) -> Result<GitserverServiceClient, DomainError> {
        debug!("Connecting to shard at {}", addr);

        let transport = tokio::time::timeout(
            self.config.connect_timeout(),
            tarpc::serde_transport::tcp::connect(addr, Bincode::default),
        )
        .await
        .map_err(|_| {
            DomainError::transport(
                TransportErrorKind::Unavailable,
                format!("connect to {} timed out", addr),
            )
        })?
        .map_err(|e| {
            DomainError::transport(
                TransportErrorKind::Unavailable,
                format!("connect to {}: {}", addr, e),
            )
        })?;

        let mut tarpc_config = Config::default();
        tarpc_config.max_in_flight_requests = self.config.max_pending_requests;

        let client = GitserverServiceClient::new(tarpc_config, transport).spawn();
        info!("Connected to shard at {}", addr);
        Ok(client)
    }

    async fn close(&self, addr: &str, conn: GitserverServiceClient) {
        // The dispatch task ends once the last clone of the client is gone.
        drop(conn);
        debug!("Released connection to {}", addr);
    }
}

/// Connection state of one address.
#[derive(Debug, Clone)]
pub enum ShardConnection<C> {
    Ready(C),
    /// The dial failed; calls routed here return this error until the next
    /// address change.
    Failed(DomainError),
}

/// Directory plus one connection entry per directory address.
#[derive(Debug)]
pub struct ConnectionSnapshot<C> {
    directory: ShardDirectory,
    connections: Arc<HashMap<String, ShardConnection<C>>>,
}

impl<C: Clone> ConnectionSnapshot<C> {
    fn empty() -> Self {
        Self {
            directory: ShardDirectory::default(),
            connections: Arc::new(HashMap::new()),
        }
    }

    pub fn directory(&self) -> &ShardDirectory {
        &self.directory
    }

    pub fn connections(&self) -> &Arc<HashMap<String, ShardConnection<C>>> {
        &self.connections
    }

    /// Connection for `addr`, or the error that prevented it.
    pub fn connection(&self, addr: &str) -> Result<C, DomainError> {
        match self.connections.get(addr) {
            Some(ShardConnection::Ready(conn)) => Ok(conn.clone()),
            Some(ShardConnection::Failed(err)) => Err(err.clone()),
            None => Err(DomainError::transport(
                TransportErrorKind::Other,
                format!("no connection for shard {}", addr),
            )),
        }
    }
}

/// Owns the published snapshot and swaps it on reconcile.
pub struct ConnectionRegistry<D: Dialer> {
    dialer: Arc<D>,
    snapshot: RwLock<Arc<ConnectionSnapshot<D::Conn>>>,
    reconcile_lock: Mutex<()>,
}

impl<D: Dialer> ConnectionRegistry<D> {
    /// Registry with an empty directory.
    pub fn new(dialer: Arc<D>) -> Self {
        Self {
            dialer,
            snapshot: RwLock::new(Arc::new(ConnectionSnapshot::empty())),
            reconcile_lock: Mutex::new(()),
        }
    }

    /// Currently published snapshot.
    pub fn current(&self) -> Arc<ConnectionSnapshot<D::Conn>> {
        Arc::clone(&*self.snapshot.read())
    }

    /// Bring the registry in line with `directory`.
    ///
    /// A directory whose address list matches the published one (same
    /// entries, same order) reuses every existing connection. Any other
    /// change dials each new address once, concurrently, and closes the old
    /// connections after the new snapshot is visible.
    pub async fn reconcile(&self, directory: ShardDirectory) {
        let _guard = self.reconcile_lock.lock().await;
        let current = self.current();

        if current.directory.addresses() == directory.addresses() {
            debug!(
                shards = directory.addresses().len(),
                pins = directory.pinned().len(),
                "Updating pins without reconnecting"
            );
            self.publish(ConnectionSnapshot {
                directory,
                connections: Arc::clone(&current.connections),
            });
            return;
        }

        info!(
            from = current.directory.addresses().len(),
            to = directory.addresses().len(),
            "Shard addresses changed, reconnecting"
        );

        let dials = directory.addresses().iter().map(|addr| {
            let dialer = Arc::clone(&self.dialer);
            async move {
                let conn = match dialer.dial(addr).await {
                    Ok(conn) => ShardConnection::Ready(conn),
                    Err(e) => {
                        warn!("Failed to connect to shard {}: {}", addr, e);
                        ShardConnection::Failed(e)
                    }
                };
                (addr.clone(), conn)
            }
        });
        let connections: HashMap<_, _> = join_all(dials).await.into_iter().collect();

        let previous = self.publish(ConnectionSnapshot {
            directory,
            connections: Arc::new(connections),
        });

        for (addr, entry) in previous.connections.iter() {
            if let ShardConnection::Ready(conn) = entry {
                self.dialer.close(addr, conn.clone()).await;
            }
        }
    }

    fn publish(&self, next: ConnectionSnapshot<D::Conn>) -> Arc<ConnectionSnapshot<D::Conn>> {
        std::mem::replace(&mut *self.snapshot.write(), Arc::new(next))
    }
}

/// Registry initialized on first use, then kept current by a watcher task.
pub struct LazyRegistry<D: Dialer> {
    source: Arc<dyn ConfigSource>,
    dialer: Arc<D>,
    cell: OnceCell<Arc<ConnectionRegistry<D>>>,
}

impl<D: Dialer> LazyRegistry<D> {
    pub fn new(source: Arc<dyn ConfigSource>, dialer: D) -> Self {
        Self {
            source,
            dialer: Arc::new(dialer),
            cell: OnceCell::new(),
        }
    }

    /// Registry, initializing it on the first call. Concurrent first callers
    /// wait for the same initialization.
    pub async fn get(&self) -> Arc<ConnectionRegistry<D>> {
        let registry = self
            .cell
            .get_or_init(|| async {
                let registry = Arc::new(ConnectionRegistry::new(Arc::clone(&self.dialer)));
                let mut rx = self.source.subscribe();
                let initial = rx.borrow_and_update().clone();
                registry.reconcile(ShardDirectory::from_config(&initial)).await;

                tokio::spawn(watch_config(Arc::downgrade(&registry), rx));
                registry
            })
            .await;
        Arc::clone(registry)
    }

    /// Current snapshot.
    pub async fn snapshot(&self) -> Arc<ConnectionSnapshot<D::Conn>> {
        self.get().await.current()
    }
}

async fn watch_config<D: Dialer>(
    registry: Weak<ConnectionRegistry<D>>,
    mut rx: tokio::sync::watch::Receiver<crate::config::FleetConfig>,
) {
    while rx.changed().await.is_ok() {
        let config = rx.borrow_and_update().clone();
        let Some(registry) = registry.upgrade() else {
            break;
        };
        registry.reconcile(ShardDirectory::from_config(&config)).await;
    }
    debug!("Fleet config watcher stopped");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{FleetConfig, WatchConfigSource};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    pub(crate) struct FakeConn {
        pub addr: String,
        pub id: usize,
    }

    #[derive(Default)]
    pub(crate) struct FakeDialer {
        next_id: AtomicUsize,
        pub dials: parking_lot::Mutex<Vec<String>>,
        pub closed: parking_lot::Mutex<Vec<usize>>,
        pub failing: parking_lot::Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl Dialer for FakeDialer {
        type Conn = Arc<FakeConn>;

        async fn dial(&self, addr: &str) -> Result<Arc<FakeConn>, DomainError> {
            self.dials.lock().push(addr.to_string());
            if self.failing.lock().contains(addr) {
                return Err(DomainError::transport(
                    TransportErrorKind::Unavailable,
                    format!("refused: {}", addr),
                ));
            }
            Ok(Arc::new(FakeConn {
                addr: addr.to_string(),
                id: self.next_id.fetch_add(1, Ordering::SeqCst),
            }))
        }

        async fn close(&self, _addr: &str, conn: Arc<FakeConn>) {
            self.closed.lock().push(conn.id);
        }
    }

    fn directory(addrs: &[&str], pins: &[(&str, &str)]) -> ShardDirectory {
        ShardDirectory::new(
            addrs.iter().map(|a| a.to_string()).collect(),
            pins.iter()
                .map(|(r, a)| (r.to_string(), a.to_string()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_reconcile_dials_every_address() {
        let dialer = Arc::new(FakeDialer::default());
        let registry = ConnectionRegistry::new(Arc::clone(&dialer));

        registry.reconcile(directory(&["a", "b", "c"], &[])).await;

        let snapshot = registry.current();
        assert_eq!(snapshot.connections().len(), 3);
        for addr in ["a", "b", "c"] {
            assert_eq!(snapshot.connection(addr).unwrap().addr, addr);
        }
        assert_eq!(dialer.dials.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_pin_only_change_keeps_connections() {
        let dialer = Arc::new(FakeDialer::default());
        let registry = ConnectionRegistry::new(Arc::clone(&dialer));
        registry.reconcile(directory(&["a", "b", "c"], &[])).await;
        let before = registry.current();

        registry
            .reconcile(directory(&["a", "b", "c"], &[("repo2", "a")]))
            .await;
        let after = registry.current();

        assert!(Arc::ptr_eq(before.connections(), after.connections()));
        assert_eq!(dialer.dials.lock().len(), 3);
        assert!(dialer.closed.lock().is_empty());
        assert_eq!(after.directory().pinned().len(), 1);
        assert!(before.directory().pinned().is_empty());
    }

    #[tokio::test]
    async fn test_address_change_reconnects_and_closes_old() {
        let dialer = Arc::new(FakeDialer::default());
        let registry = ConnectionRegistry::new(Arc::clone(&dialer));
        registry.reconcile(directory(&["a", "b"], &[])).await;
        let old_ids: Vec<usize> = ["a", "b"]
            .iter()
            .map(|addr| registry.current().connection(addr).unwrap().id)
            .collect();

        registry.reconcile(directory(&["a", "b", "c"], &[])).await;
        let snapshot = registry.current();

        assert_eq!(snapshot.connections().len(), 3);
        assert!(snapshot.connection("c").is_ok());

        let mut closed = dialer.closed.lock().clone();
        closed.sort();
        let mut expected = old_ids;
        expected.sort();
        assert_eq!(closed, expected);
    }

    #[tokio::test]
    async fn test_reorder_counts_as_change() {
        let dialer = Arc::new(FakeDialer::default());
        let registry = ConnectionRegistry::new(Arc::clone(&dialer));
        registry.reconcile(directory(&["a", "b"], &[])).await;
        registry.reconcile(directory(&["b", "a"], &[])).await;
        assert_eq!(dialer.dials.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_failed_dial_recorded_and_not_closed() {
        let dialer = Arc::new(FakeDialer::default());
        dialer.failing.lock().insert("b".to_string());
        let registry = ConnectionRegistry::new(Arc::clone(&dialer));

        registry.reconcile(directory(&["a", "b"], &[])).await;
        let snapshot = registry.current();
        assert!(snapshot.connection("a").is_ok());
        let err = snapshot.connection("b").unwrap_err();
        assert!(err.is_unavailable());

        dialer.failing.lock().clear();
        registry.reconcile(directory(&["a", "b", "c"], &[])).await;
        // Only the successful "a" connection of the first snapshot is closed.
        assert_eq!(dialer.closed.lock().len(), 1);
        assert!(registry.current().connection("b").is_ok());
    }

    #[tokio::test]
    async fn test_unknown_address() {
        let registry = ConnectionRegistry::new(Arc::new(FakeDialer::default()));
        registry.reconcile(directory(&["a"], &[])).await;
        assert!(registry.current().connection("zzz").is_err());
    }

    #[tokio::test]
    async fn test_readers_never_see_torn_snapshot() {
        let dialer = Arc::new(FakeDialer::default());
        let registry = Arc::new(ConnectionRegistry::new(Arc::clone(&dialer)));
        registry.reconcile(directory(&["a", "b"], &[])).await;

        let reader = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for _ in 0..2000 {
                    let snapshot = registry.current();
                    let addrs: HashSet<&String> = snapshot.directory().addresses().iter().collect();
                    let conns: HashSet<&String> = snapshot.connections().keys().collect();
                    assert_eq!(addrs, conns);
                    tokio::task::yield_now().await;
                }
            })
        };

        for i in 0..50 {
            let addrs: Vec<String> = (0..(i % 5 + 1)).map(|n| format!("s{}", n)).collect();
            let refs: Vec<&str> = addrs.iter().map(String::as_str).collect();
            registry.reconcile(directory(&refs, &[])).await;
        }
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_lazy_registry_initializes_once_and_watches() {
        let source = Arc::new(WatchConfigSource::new(FleetConfig::new(vec![
            "a".into(),
            "b".into(),
        ])));
        let lazy = Arc::new(LazyRegistry::new(source.clone(), FakeDialer::default()));

        let (first, second) = tokio::join!(lazy.get(), lazy.get());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.current().connections().len(), 2);
        assert_eq!(lazy.dialer.dials.lock().len(), 2);

        source.update(FleetConfig::new(vec!["a".into(), "b".into(), "c".into()]));
        for _ in 0..100 {
            if lazy.snapshot().await.connections().len() == 3 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(lazy.snapshot().await.connections().len(), 3);
    }

    #[tokio::test]
    async fn test_lazy_registry_pin_only_update() {
        let source = Arc::new(WatchConfigSource::new(FleetConfig::new(vec!["a".into()])));
        let lazy = LazyRegistry::new(source.clone(), FakeDialer::default());
        let before = lazy.snapshot().await;

        source.update(FleetConfig::new(vec!["a".into()]).with_pin("repo", "a"));
        for _ in 0..100 {
            if !lazy.snapshot().await.directory().pinned().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let after = lazy.snapshot().await;
        assert_eq!(after.directory().pinned().len(), 1);
        assert!(Arc::ptr_eq(before.connections(), after.connections()));
    }
}
