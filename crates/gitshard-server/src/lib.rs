//! # gitshard-server
//!
//! The shard side of the fleet. A [`ShardServer`] exposes a
//! [`CommandExecutor`] over both the binary RPC service and the legacy
//! HTTP/JSON routes, and [`serve`] accepts both on a single port.
//!
//! [`MemoryExecutor`] hosts in-memory repositories and supports fault
//! injection; it backs the workspace's end-to-end tests.
//!
//! ```rust,ignore
//! use gitshard_server::{spawn_shard, MemoryExecutor, MemoryRepo};
//!
//! let executor = MemoryExecutor::new()
//!     .with_repo("github.com/org/repo", MemoryRepo::new().with_commit("abc", "alice", "init"));
//! let shard = spawn_shard("127.0.0.1:0", Arc::new(executor)).await?;
//! println!("serving on {}", shard.addr());
//! ```

pub mod error;
pub mod executor;
pub mod http;
pub mod listener;
pub mod memory;
pub mod rpc;

pub use error::BackendError;
pub use executor::{BackendResult, CommandExecutor, SearchOutput};
pub use http::{create_router, HttpError};
pub use listener::{classify, serve, spawn_shard, ShardHandle, WireProtocol};
pub use memory::{MemoryExecutor, MemoryRepo};
pub use rpc::ShardServer;
