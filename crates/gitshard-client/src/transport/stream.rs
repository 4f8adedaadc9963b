//! Streaming responses that honor the call context.

use crate::context::{sleep_until, CallContext};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use futures::Stream;
use gitshard_core::{CommitMatch, DomainError, SearchEvent};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Ordered items of a streaming call.
///
/// The underlying stream is dropped as soon as it ends, fails, or the call
/// context is cancelled or times out, which releases the transport
/// resources behind it.
pub struct ResponseStream<T> {
    inner: Option<BoxStream<'static, Result<T, DomainError>>>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl<T: Send + 'static> ResponseStream<T> {
    pub fn new<S>(ctx: &CallContext, inner: S) -> Self
    where
        S: Stream<Item = Result<T, DomainError>> + Send + 'static,
    {
        Self {
            inner: Some(inner.boxed()),
            cancel: ctx.cancellation().clone(),
            deadline: ctx.deadline(),
        }
    }

    /// Read the first item now so a request-level failure is returned to
    /// the caller instead of surfacing on the first `next_chunk`.
    pub(crate) async fn eager<S>(ctx: &CallContext, inner: S) -> Result<Self, DomainError>
    where
        S: Stream<Item = Result<T, DomainError>> + Send + 'static,
    {
        let mut inner = inner.boxed();
        match ctx.run(async { Ok(inner.next().await) }).await? {
            None => Ok(Self::new(ctx, stream::empty())),
            Some(Err(err)) => Err(err),
            Some(Ok(first)) => Ok(Self::new(
                ctx,
                stream::once(async move { Ok(first) }).chain(inner),
            )),
        }
    }

    /// Next item, `None` once the stream is exhausted.
    pub async fn next_chunk(&mut self) -> Option<Result<T, DomainError>> {
        let inner = self.inner.as_mut()?;
        let item = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Some(Err(DomainError::Canceled)),
            _ = sleep_until(self.deadline) => Some(Err(DomainError::DeadlineExceeded)),
            item = inner.next() => item,
        };
        if !matches!(item, Some(Ok(_))) {
            self.inner = None;
        }
        item
    }

    /// Whether the underlying stream has been released.
    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Stop reading and release the underlying stream.
    pub fn close(&mut self) {
        self.inner = None;
    }

    /// Drain every remaining item.
    pub async fn collect_all(mut self) -> Result<Vec<T>, DomainError> {
        let mut items = Vec::new();
        while let Some(item) = self.next_chunk().await {
            items.push(item?);
        }
        Ok(items)
    }
}

impl ResponseStream<Bytes> {
    /// Concatenate every remaining chunk.
    pub async fn read_to_end(mut self) -> Result<Bytes, DomainError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

/// All matches of a search and whether the shard stopped at the limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOutcome {
    pub matches: Vec<CommitMatch>,
    pub limit_hit: bool,
}

impl ResponseStream<SearchEvent> {
    pub async fn collect_matches(mut self) -> Result<SearchOutcome, DomainError> {
        let mut outcome = SearchOutcome::default();
        while let Some(event) = self.next_chunk().await {
            match event? {
                SearchEvent::Matches { matches } => outcome.matches.extend(matches),
                SearchEvent::Done { limit_hit } => outcome.limit_hit = limit_hit,
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn endless(flag: Arc<AtomicBool>) -> impl Stream<Item = Result<Bytes, DomainError>> + Send {
        let guard = DropFlag(flag);
        stream::unfold(guard, |guard| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Some((Ok(Bytes::from_static(b"x")), guard))
        })
    }

    #[tokio::test]
    async fn test_preserves_order() {
        let ctx = CallContext::default();
        let items = vec![Ok(Bytes::from("a")), Ok(Bytes::from("b")), Ok(Bytes::from("c"))];
        let stream = ResponseStream::new(&ctx, stream::iter(items));
        assert_eq!(stream.read_to_end().await.unwrap(), Bytes::from("abc"));
    }

    #[tokio::test]
    async fn test_error_ends_stream() {
        let ctx = CallContext::default();
        let items = vec![
            Ok(Bytes::from("a")),
            Err(DomainError::command_failed("git", 1, "boom")),
            Ok(Bytes::from("never")),
        ];
        let mut stream = ResponseStream::new(&ctx, stream::iter(items));
        assert!(stream.next_chunk().await.unwrap().is_ok());
        assert!(stream.next_chunk().await.unwrap().is_err());
        assert!(stream.is_closed());
        assert!(stream.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_releases_stream() {
        let ctx = CallContext::default();
        let dropped = Arc::new(AtomicBool::new(false));
        let mut stream = ResponseStream::new(&ctx, endless(Arc::clone(&dropped)));

        assert!(stream.next_chunk().await.unwrap().is_ok());
        ctx.cancel();
        assert_eq!(stream.next_chunk().await, Some(Err(DomainError::Canceled)));
        assert!(dropped.load(Ordering::SeqCst));
        assert!(stream.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_deadline_releases_stream() {
        let ctx = CallContext::default().with_timeout(Duration::from_millis(30));
        let dropped = Arc::new(AtomicBool::new(false));
        let stream = ResponseStream::new(&ctx, endless(Arc::clone(&dropped)));

        let result = stream.read_to_end().await;
        assert_eq!(result, Err(DomainError::DeadlineExceeded));
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_eager_surfaces_first_error() {
        let ctx = CallContext::default();
        let items: Vec<Result<Bytes, DomainError>> = vec![Err(DomainError::RevisionNotFound {
            repo: "r".into(),
            spec: "HEAD".into(),
        })];
        let result = ResponseStream::eager(&ctx, stream::iter(items)).await;
        assert!(matches!(result, Err(DomainError::RevisionNotFound { .. })));

        let items = vec![Ok(Bytes::from("a")), Ok(Bytes::from("b"))];
        let stream = ResponseStream::eager(&ctx, stream::iter(items)).await.unwrap();
        assert_eq!(stream.read_to_end().await.unwrap(), Bytes::from("ab"));
    }

    #[tokio::test]
    async fn test_collect_matches() {
        let ctx = CallContext::default();
        let matched = CommitMatch {
            oid: "abc".into(),
            author: "dev".into(),
            message: "fix".into(),
            diff: None,
        };
        let events = vec![
            Ok(SearchEvent::Matches { matches: vec![matched.clone()] }),
            Ok(SearchEvent::Done { limit_hit: true }),
        ];
        let outcome = ResponseStream::new(&ctx, stream::iter(events))
            .collect_matches()
            .await
            .unwrap();
        assert_eq!(outcome.matches, vec![matched]);
        assert!(outcome.limit_hit);
    }
}
