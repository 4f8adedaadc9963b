//! # gitshard
//!
//! Routing and transport for a fleet of git shards. Every repository lives
//! on exactly one shard, chosen by hashing its normalized name unless an
//! operator pinned it elsewhere. Calls travel over binary RPC or the legacy
//! HTTP surface with the same error semantics on both.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use gitshard::prelude::*;
//! use std::sync::Arc;
//!
//! let source = Arc::new(WatchConfigSource::new(FleetConfig::new(vec![
//!     "gitserver-1:3178".into(),
//!     "gitserver-2:3178".into(),
//! ])));
//! let client = GitserverClient::new(ClientConfig::default(), source.clone())?;
//!
//! let ctx = client.context().with_timeout(Duration::from_secs(5));
//! match client.get_object(&ctx, &"github.com/org/repo".into(), "HEAD").await {
//!     Ok(object) => println!("{}", object.id),
//!     Err(DomainError::RepoNotExist { clone_in_progress: true, .. }) => println!("cloning"),
//!     Err(err) => return Err(err.into()),
//! }
//!
//! // Add a shard; connections are re-dialed in the background.
//! source.update(FleetConfig::new(vec![
//!     "gitserver-1:3178".into(),
//!     "gitserver-2:3178".into(),
//!     "gitserver-3:3178".into(),
//! ]));
//! ```
//!
//! ## Crates
//!
//! - [`gitshard_core`] - repository names, error taxonomy, wire messages and the RPC service
//! - [`gitshard_client`] - routing, connection registry, transports, retry and fan-out
//! - `gitshard_server` - shard endpoint serving both protocols (feature `server`)

pub use gitshard_client as client;
pub use gitshard_core as core;

#[cfg(feature = "server")]
pub use gitshard_server as server;

/// Prelude module for convenient imports.
pub mod prelude {
    // Names and errors
    pub use gitshard_core::{DomainError, MultiError, RepoName, TransportErrorKind};

    // Messages
    pub use gitshard_core::{
        ArchiveFormat, ArchiveRequest, CommitMatch, CreateCommitFromPatchRequest, ExecRequest,
        GitObject, PatchMetadata, RepoCommit, RepoInfo, RevisionSpecifier, SearchEvent,
        SearchRequest,
    };

    // Client
    pub use gitshard_client::{
        CallContext, ClientConfig, ConfigSource, FleetConfig, GitserverClient, GitshardConfig,
        MergePolicy, PartialResult, Protocol, ResponseStream, WatchConfigSource,
    };

    #[cfg(feature = "server")]
    pub use gitshard_server::{spawn_shard, CommandExecutor, MemoryExecutor, MemoryRepo};
}
