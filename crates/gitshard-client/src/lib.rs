//! # gitshard-client
//!
//! Client-side routing and transport for a sharded git-hosting fleet.
//! Repositories are mapped to shards by hashing their normalized name,
//! shard connections are kept in an atomically swapped registry that
//! follows live configuration, and every operation can travel over either
//! binary RPC or the legacy HTTP/JSON surface with identical error
//! semantics.
//!
//! ```rust,ignore
//! use gitshard_client::{ClientConfig, FleetConfig, GitserverClient, WatchConfigSource};
//!
//! let source = Arc::new(WatchConfigSource::new(FleetConfig::new(vec![
//!     "gitserver-1:3178".into(),
//!     "gitserver-2:3178".into(),
//! ])));
//! let client = GitserverClient::new(ClientConfig::default(), source)?;
//!
//! let ctx = client.context();
//! let object = client.get_object(&ctx, &"github.com/org/repo".into(), "HEAD").await?;
//! ```

pub mod client;
pub mod config;
pub mod context;
pub mod fanout;
pub mod registry;
pub mod retry;
pub mod routing;
pub mod translate;
pub mod transport;

pub use client::GitserverClient;
pub use config::{
    ClientConfig, ConfigError, ConfigSource, FleetConfig, GitshardConfig, WatchConfigSource,
    MAX_CONCURRENT_SHARD_CALLS,
};
pub use context::{CallContext, Protocol};
pub use fanout::{group_by_shard, Dispatcher, MergePolicy, PartialResult, ShardBatch};
pub use registry::{
    ConnectionRegistry, ConnectionSnapshot, Dialer, LazyRegistry, ShardConnection, TcpDialer,
};
pub use retry::{Operation, RetryPolicy};
pub use routing::{addr_for_key, ShardDirectory};
pub use translate::{ambiguous_revision, is_revision_not_found, translate, RawError};
pub use transport::{ResponseStream, SearchOutcome, Transport};
