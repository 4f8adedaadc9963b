//! One TCP port, two protocols.
//!
//! The first byte of a connection decides how it is served: HTTP requests
//! start with an uppercase method name, while a tarpc frame starts with
//! the high byte of its big-endian length prefix, which is zero for any
//! frame the codec accepts.

use crate::executor::CommandExecutor;
use crate::http::create_router;
use crate::rpc::ShardServer;
use axum::Router;
use futures::StreamExt;
use gitshard_core::GitserverService;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tarpc::server::{BaseChannel, Channel};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio_serde::formats::Bincode;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Protocol spoken on an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireProtocol {
    Rpc,
    Http,
}

/// Classify a connection by its first byte.
pub fn classify(first: u8) -> WireProtocol {
    if first.is_ascii_uppercase() {
        WireProtocol::Http
    } else {
        WireProtocol::Rpc
    }
}

/// Accept connections until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    server: ShardServer,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let router = create_router(server.clone());
    if let Ok(addr) = listener.local_addr() {
        info!("Shard listening on {}", addr);
    }

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Accept failed: {}", e);
                continue;
            }
        };

        let server = server.clone();
        let router = router.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, server, router, shutdown).await {
                debug!(%peer, "Connection ended with error: {}", e);
            }
        });
    }

    debug!("Shard listener stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    server: ShardServer,
    router: Router,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let mut first = [0u8; 1];
    if stream.peek(&mut first).await? == 0 {
        return Ok(());
    }

    match classify(first[0]) {
        WireProtocol::Http => serve_http(stream, router, shutdown).await,
        WireProtocol::Rpc => {
            serve_rpc(stream, server, shutdown).await;
            Ok(())
        }
    }
}

async fn serve_http(stream: TcpStream, router: Router, shutdown: CancellationToken) -> io::Result<()> {
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(stream), TowerToHyperService::new(router));

    tokio::select! {
        result = conn => result.map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
        _ = shutdown.cancelled() => Ok(()),
    }
}

async fn serve_rpc(stream: TcpStream, server: ShardServer, shutdown: CancellationToken) {
    let framed = Framed::new(stream, LengthDelimitedCodec::new());
    let transport = tarpc::serde_transport::new(framed, Bincode::default());

    let requests = BaseChannel::with_defaults(transport)
        .execute(server.serve())
        .for_each(|response| async move {
            tokio::spawn(response);
        });

    tokio::select! {
        _ = requests => {}
        _ = shutdown.cancelled() => {}
    }
}

/// A shard serving on a background task.
pub struct ShardHandle {
    addr: SocketAddr,
    server: ShardServer,
    shutdown: CancellationToken,
    task: JoinHandle<io::Result<()>>,
}

impl ShardHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The endpoint being served, sharing its sessions with every connection.
    pub fn server(&self) -> &ShardServer {
        &self.server
    }

    /// Stop accepting, drop open connections and wait for the listener.
    pub async fn shutdown(mut self) -> io::Result<()> {
        self.shutdown.cancel();
        match (&mut self.task).await {
            Ok(result) => result,
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}

impl Drop for ShardHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Bind `addr` and serve `executor` on it.
pub async fn spawn_shard<A>(addr: A, executor: Arc<dyn CommandExecutor>) -> io::Result<ShardHandle>
where
    A: ToSocketAddrs,
{
    let listener = TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;
    let shutdown = CancellationToken::new();
    let server = ShardServer::new(executor);
    let task = tokio::spawn(serve(listener, server.clone(), shutdown.clone()));
    Ok(ShardHandle {
        addr,
        server,
        shutdown,
        task,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        for method in ["GET", "POST", "PUT", "HEAD", "PRI"] {
            assert_eq!(classify(method.as_bytes()[0]), WireProtocol::Http);
        }
        assert_eq!(classify(0), WireProtocol::Rpc);
    }
}
