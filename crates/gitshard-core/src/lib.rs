//! # gitshard-core
//!
//! Types shared by gitshard clients and shards: repository names and their
//! normalization, the domain error taxonomy, the wire status model, the
//! request/response messages and the binary RPC service definition.

pub mod error;
pub mod protocol;
pub mod repo;
pub mod service;
pub mod status;

pub use error::{
    excerpt, DomainError, MultiError, ShardFailure, TransportError, TransportErrorKind,
    STDERR_EXCERPT_LIMIT,
};
pub use protocol::*;
pub use repo::RepoName;
pub use service::{GitserverService, GitserverServiceClient, RpcResult};
pub use status::{
    CommandStatusPayload, NotFoundPayload, RpcStatus, StatusCode, StatusDetail,
    EXEC_ERROR_HEADER, EXEC_EXIT_STATUS_HEADER, EXEC_STDERR_HEADER,
};
