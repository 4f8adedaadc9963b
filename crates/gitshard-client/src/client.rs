//! Client facade: one method per logical operation.
//!
//! A call resolves its shard against the current registry snapshot, picks
//! the transport named by the call context, runs under the retry policy of
//! its operation and is traced in a span carrying the operation name and
//! the shard address.

use crate::config::{ClientConfig, ConfigSource};
use crate::context::{CallContext, Protocol};
use crate::fanout::{
    every_shard, group_by_shard, no_shards, Dispatcher, MergePolicy, PartialResult,
};
use crate::registry::{ConnectionSnapshot, Dialer, LazyRegistry, TcpDialer};
use crate::retry::{with_retry, Operation, RetryPolicy};
use crate::routing::addr_for_key;
use crate::translate::{ambiguous_revision, classify_revision_error};
use crate::transport::{HttpShared, HttpTransport, ResponseStream, RpcTransport, Transport};
use bytes::Bytes;
use gitshard_core::*;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info_span, warn, Instrument};

type Snapshot = Arc<ConnectionSnapshot<GitserverServiceClient>>;

/// Routing, transport selection and retry for the whole fleet.
pub struct GitserverClient<D = TcpDialer>
where
    D: Dialer<Conn = GitserverServiceClient>,
{
    config: ClientConfig,
    registry: LazyRegistry<D>,
    http: Arc<HttpShared>,
    dispatcher: Dispatcher,
}

impl GitserverClient<TcpDialer> {
    /// Client dialing shards over TCP. No connection is opened until the
    /// first call.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the HTTP client cannot be built from
    /// `config`.
    pub fn new(config: ClientConfig, source: Arc<dyn ConfigSource>) -> Result<Self, DomainError> {
        let dialer = TcpDialer::new(config.clone());
        Self::with_dialer(config, source, dialer)
    }
}

impl<D> GitserverClient<D>
where
    D: Dialer<Conn = GitserverServiceClient>,
{
    /// Client opening its binary connections through `dialer`.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the HTTP client cannot be built from
    /// `config`.
    pub fn with_dialer(
        config: ClientConfig,
        source: Arc<dyn ConfigSource>,
        dialer: D,
    ) -> Result<Self, DomainError> {
        let http = Arc::new(HttpShared::new(&config)?);
        let dispatcher = Dispatcher::new(config.fanout_limit());
        Ok(Self {
            registry: LazyRegistry::new(source, dialer),
            http,
            dispatcher,
            config,
        })
    }

    /// Configuration the client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// HTTP request permits not currently held by an in-flight call.
    pub fn available_http_permits(&self) -> usize {
        self.http.available_permits()
    }

    /// Context using the configured default protocol.
    pub fn context(&self) -> CallContext {
        CallContext::new(self.config.default_protocol)
    }

    /// Shard currently owning `repo`.
    ///
    /// # Errors
    ///
    /// Returns a `NoShards` transport error when no address is configured.
    pub async fn addr_for_repo(&self, repo: &RepoName) -> Result<String, DomainError> {
        let snapshot = self.registry.snapshot().await;
        resolve(&snapshot, repo)
    }

    /// Every configured shard address, in configuration order.
    pub async fn addrs(&self) -> Vec<String> {
        self.registry.snapshot().await.directory().addresses().to_vec()
    }

    fn transport(&self, ctx: &CallContext, snapshot: &Snapshot, addr: &str) -> Arc<dyn Transport> {
        match ctx.protocol {
            Protocol::Rpc => Arc::new(RpcTransport::new(addr, snapshot.connection(addr))),
            Protocol::Http => Arc::new(HttpTransport::new(Arc::clone(&self.http), addr)),
        }
    }

    /// Run one operation against `addr`.
    async fn call_addr<T, F, Fut>(
        &self,
        ctx: &CallContext,
        op: Operation,
        snapshot: &Snapshot,
        addr: &str,
        call: F,
    ) -> Result<T, DomainError>
    where
        F: Fn(Arc<dyn Transport>) -> Fut,
        Fut: Future<Output = Result<T, DomainError>>,
    {
        let transport = self.transport(ctx, snapshot, addr);
        let policy = RetryPolicy::for_call(op, &self.config, ctx);
        let span = info_span!("gitserver", op = op.name(), addr, protocol = %ctx.protocol);

        async {
            let result = with_retry(ctx, op, policy, || call(Arc::clone(&transport))).await;
            match &result {
                Ok(_) => debug!("completed"),
                Err(err) if err.should_report() => warn!(error = %err, "failed"),
                Err(err) => debug!(error = %err, "failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Run one operation against the shard owning `repo`.
    async fn call_repo<T, F, Fut>(
        &self,
        ctx: &CallContext,
        op: Operation,
        repo: &RepoName,
        call: F,
    ) -> Result<T, DomainError>
    where
        F: Fn(Arc<dyn Transport>) -> Fut,
        Fut: Future<Output = Result<T, DomainError>>,
    {
        let snapshot = self.registry.snapshot().await;
        let addr = resolve(&snapshot, repo)?;
        self.call_addr(ctx, op, &snapshot, &addr, call).await
    }

    /// Run one operation against the shard `key` hashes to.
    async fn call_key<T, F, Fut>(
        &self,
        ctx: &CallContext,
        op: Operation,
        key: &str,
        call: F,
    ) -> Result<T, DomainError>
    where
        F: Fn(Arc<dyn Transport>) -> Fut,
        Fut: Future<Output = Result<T, DomainError>>,
    {
        let snapshot = self.registry.snapshot().await;
        let addr = addr_for_key(key, snapshot.directory().addresses())
            .ok_or_else(no_shards)?
            .to_string();
        self.call_addr(ctx, op, &snapshot, &addr, call).await
    }

    /// Run a git command; output is streamed in order.
    ///
    /// # Errors
    ///
    /// Failures before the first output byte are returned here:
    /// `RepoNotExist`, `RevisionNotFound` when git reports a bad object,
    /// `CommandFailed` for any other non-zero exit. Later failures arrive
    /// on the stream. Never retried.
    pub async fn exec(
        &self,
        ctx: &CallContext,
        req: ExecRequest,
    ) -> Result<ResponseStream<Bytes>, DomainError> {
        let repo = req.repo.clone();
        let spec = req
            .ensure_revision
            .clone()
            .unwrap_or_else(|| req.args.join(" "));
        self.call_repo(ctx, Operation::Exec, &repo, |t| {
            let req = req.clone();
            let (repo, spec) = (repo.clone(), spec.clone());
            async move {
                t.exec(ctx, req)
                    .await
                    .map_err(|e| classify_revision_error(e, &repo, &spec))
            }
        })
        .await
    }

    /// Stream an archive of `treeish`.
    ///
    /// # Errors
    ///
    /// As [`GitserverClient::exec`]; a missing `treeish` is reported as
    /// `RevisionNotFound`.
    pub async fn archive(
        &self,
        ctx: &CallContext,
        req: ArchiveRequest,
    ) -> Result<ResponseStream<Bytes>, DomainError> {
        let repo = req.repo.clone();
        self.call_repo(ctx, Operation::Archive, &repo, |t| {
            let req = req.clone();
            async move {
                let (repo, treeish) = (req.repo.clone(), req.treeish.clone());
                t.archive(ctx, req)
                    .await
                    .map_err(|e| classify_revision_error(e, &repo, &treeish))
            }
        })
        .await
    }

    /// Commit search; matches arrive incrementally, followed by `Done`.
    ///
    /// # Errors
    ///
    /// Returns `RepoNotExist` for a repository the shard does not host.
    /// Opening the search is retried while the shard is unavailable.
    pub async fn search(
        &self,
        ctx: &CallContext,
        req: SearchRequest,
    ) -> Result<ResponseStream<SearchEvent>, DomainError> {
        let repo = req.repo.clone();
        self.call_repo(ctx, Operation::Search, &repo, |t| {
            let req = req.clone();
            async move { t.search(ctx, req).await }
        })
        .await
    }

    /// Resolve `object_name` to an object of `repo`.
    ///
    /// # Errors
    ///
    /// Returns `RepoNotExist` or `RevisionNotFound`; transport failures are
    /// retried while the shard is unavailable.
    pub async fn get_object(
        &self,
        ctx: &CallContext,
        repo: &RepoName,
        object_name: &str,
    ) -> Result<GitObject, DomainError> {
        self.call_repo(ctx, Operation::GetObject, repo, |t| {
            let req = GetObjectRequest {
                repo: repo.clone(),
                object_name: object_name.to_string(),
            };
            async move {
                t.get_object(ctx, req)
                    .await
                    .map(|resp| resp.object)
                    .map_err(|e| classify_revision_error(e, repo, object_name))
            }
        })
        .await
    }

    /// Disk usage of one shard.
    ///
    /// # Errors
    ///
    /// Returns the transport error of `addr` once retries are exhausted.
    pub async fn disk_info(&self, ctx: &CallContext, addr: &str) -> Result<DiskInfoResponse, DomainError> {
        let snapshot = self.registry.snapshot().await;
        self.call_addr(ctx, Operation::DiskInfo, &snapshot, addr, |t| async move {
            t.disk_info(ctx).await
        })
        .await
    }

    /// Whether the code host lets the owning shard clone `repo`.
    pub async fn is_repo_cloneable(
        &self,
        ctx: &CallContext,
        repo: &RepoName,
    ) -> Result<IsRepoCloneableResponse, DomainError> {
        self.call_repo(ctx, Operation::IsRepoCloneable, repo, |t| {
            let req = IsRepoCloneableRequest { repo: repo.clone() };
            async move { t.is_repo_cloneable(ctx, req).await }
        })
        .await
    }

    /// Ask the owning shard to clone `repo`. A clone that could not be
    /// started is reported in the response, not as an error.
    pub async fn repo_clone(
        &self,
        ctx: &CallContext,
        repo: &RepoName,
    ) -> Result<RepoCloneResponse, DomainError> {
        self.call_repo(ctx, Operation::RepoClone, repo, |t| {
            let req = RepoCloneRequest { repo: repo.clone() };
            async move { t.repo_clone(ctx, req).await }
        })
        .await
    }

    /// Clone progress of many repositories across the fleet. Shards that
    /// fail are reported in the returned `MultiError`; the rest still
    /// contribute their results.
    ///
    /// # Errors
    ///
    /// Only a fleet with no shards fails the call itself.
    pub async fn repo_clone_progress(
        &self,
        ctx: &CallContext,
        repos: Vec<RepoName>,
    ) -> Result<PartialResult<HashMap<RepoName, RepoCloneProgress>>, DomainError> {
        let snapshot = self.registry.snapshot().await;
        let batches = group_by_shard(snapshot.directory(), repos, |repo| repo)?;

        self.dispatcher
            .dispatch(
                ctx,
                batches,
                MergePolicy::BestEffort,
                |child, batch| {
                    let snapshot = Arc::clone(&snapshot);
                    async move {
                        let req = RepoCloneProgressRequest { repos: batch.items };
                        self.call_addr(&child, Operation::RepoCloneProgress, &snapshot, &batch.addr, |t| {
                            let req = req.clone();
                            let child = &child;
                            async move { t.repo_clone_progress(child, req).await }
                        })
                        .await
                    }
                },
                HashMap::new(),
                |acc: &mut HashMap<RepoName, RepoCloneProgress>,
                 _addr: &str,
                 resp: RepoCloneProgressResponse| acc.extend(resp.results),
            )
            .await
    }

    /// What the owning shards know about each of `repos`. Shards that fail
    /// are reported in the returned `MultiError`.
    pub async fn repo_info(
        &self,
        ctx: &CallContext,
        repos: Vec<RepoName>,
    ) -> Result<PartialResult<HashMap<RepoName, RepoInfo>>, DomainError> {
        let snapshot = self.registry.snapshot().await;
        let batches = group_by_shard(snapshot.directory(), repos, |repo| repo)?;

        self.dispatcher
            .dispatch(
                ctx,
                batches,
                MergePolicy::BestEffort,
                |child, batch| {
                    let snapshot = Arc::clone(&snapshot);
                    async move {
                        let req = RepoInfoRequest { repos: batch.items };
                        self.call_addr(&child, Operation::RepoInfo, &snapshot, &batch.addr, |t| {
                            let req = req.clone();
                            let child = &child;
                            async move { t.repo_info(child, req).await }
                        })
                        .await
                    }
                },
                HashMap::new(),
                |acc: &mut HashMap<RepoName, RepoInfo>, _addr: &str, resp: RepoInfoResponse| {
                    acc.extend(resp.results)
                },
            )
            .await
    }

    /// Repositories cloned anywhere in the fleet, keeping only those found
    /// on the shard that currently owns them. Leftovers of a resharding are
    /// skipped.
    pub async fn list_cloned(
        &self,
        ctx: &CallContext,
    ) -> Result<PartialResult<Vec<RepoName>>, DomainError> {
        let snapshot = self.registry.snapshot().await;
        let batches = every_shard::<()>(snapshot.directory());
        let directory = snapshot.directory();

        let mut listed = self
            .dispatcher
            .dispatch(
                ctx,
                batches,
                MergePolicy::BestEffort,
                |child, batch| {
                    let snapshot = Arc::clone(&snapshot);
                    async move {
                        self.call_addr(&child, Operation::ListCloned, &snapshot, &batch.addr, |t| {
                            let child = &child;
                            async move { t.list_cloned(child).await }
                        })
                        .await
                    }
                },
                Vec::new(),
                |acc: &mut Vec<RepoName>, addr: &str, resp: ListClonedResponse| {
                    acc.extend(
                        resp.repos
                            .into_iter()
                            .filter(|repo| directory.resolve(repo) == Some(addr)),
                    )
                },
            )
            .await?;
        listed.value.sort();
        Ok(listed)
    }

    /// Whether the owning shard has a complete clone of `repo`.
    pub async fn is_repo_cloned(&self, ctx: &CallContext, repo: &RepoName) -> Result<bool, DomainError> {
        self.call_repo(ctx, Operation::IsRepoCloned, repo, |t| {
            let req = IsRepoClonedRequest { repo: repo.clone() };
            async move { t.is_repo_cloned(ctx, req).await.map(|resp| resp.cloned) }
        })
        .await
    }

    /// Commit ids `revs` resolve to in `repo`, in `git rev-parse` order.
    /// An empty list resolves `HEAD`.
    ///
    /// # Errors
    ///
    /// `RevisionNotFound` names the first revision git could not resolve.
    pub async fn resolve_revisions(
        &self,
        ctx: &CallContext,
        repo: &RepoName,
        revs: &[RevisionSpecifier],
    ) -> Result<Vec<String>, DomainError> {
        let mut args = vec!["rev-parse".to_string()];
        if revs.is_empty() {
            args.push(RevisionSpecifier::default().to_git_arg());
        } else {
            args.extend(revs.iter().map(RevisionSpecifier::to_git_arg));
        }
        let spec = args[1..].join(" ");

        self.call_repo(ctx, Operation::ResolveRevisions, repo, |t| {
            let req = ExecRequest {
                repo: repo.clone(),
                args: args.clone(),
                ensure_revision: None,
            };
            let spec = &spec;
            async move {
                let output = match t.exec(ctx, req).await {
                    Ok(stream) => stream.read_to_end().await,
                    Err(err) => Err(err),
                };
                output
                    .map(|bytes| {
                        String::from_utf8_lossy(&bytes)
                            .split_whitespace()
                            .map(str::to_string)
                            .collect()
                    })
                    .map_err(|err| {
                        let missing = match &err {
                            DomainError::CommandFailed { stderr_excerpt, .. } => {
                                ambiguous_revision(stderr_excerpt).map(str::to_string)
                            }
                            _ => None,
                        };
                        match missing {
                            Some(missing) => DomainError::RevisionNotFound {
                                repo: repo.clone(),
                                spec: missing,
                            },
                            None => classify_revision_error(err, repo, spec),
                        }
                    })
            }
        })
        .await
    }

    /// Fetch `repo` unless it was updated within `since`.
    pub async fn repo_update(
        &self,
        ctx: &CallContext,
        repo: &RepoName,
        since: Option<Duration>,
    ) -> Result<RepoUpdateResponse, DomainError> {
        self.call_repo(ctx, Operation::RepoUpdate, repo, |t| {
            let req = RepoUpdateRequest {
                repo: repo.clone(),
                since_secs: since.map(|d| d.as_secs()),
            };
            async move { t.repo_update(ctx, req).await }
        })
        .await
    }

    /// Delete `repo` from the shard that owns its undeleted name.
    pub async fn remove(&self, ctx: &CallContext, repo: &RepoName) -> Result<(), DomainError> {
        let addr = self.addr_for_repo(&repo.undeleted()).await?;
        self.remove_from(ctx, repo, &addr).await
    }

    /// Delete `repo` from a specific shard.
    pub async fn remove_from(
        &self,
        ctx: &CallContext,
        repo: &RepoName,
        addr: &str,
    ) -> Result<(), DomainError> {
        let snapshot = self.registry.snapshot().await;
        self.call_addr(ctx, Operation::RepoDelete, &snapshot, addr, |t| {
            let req = RepoDeleteRequest { repo: repo.clone() };
            async move { t.repo_delete(ctx, req).await }
        })
        .await
    }

    /// `git log` of many commits across the fleet. Commits that do not
    /// resolve are reported inline in their result.
    ///
    /// # Errors
    ///
    /// Any shard failure fails the whole call and cancels the other shards.
    pub async fn batch_log(
        &self,
        ctx: &CallContext,
        repo_commits: Vec<RepoCommit>,
        format: &str,
    ) -> Result<Vec<BatchLogResult>, DomainError> {
        let snapshot = self.registry.snapshot().await;
        let batches = group_by_shard(snapshot.directory(), repo_commits, |rc| &rc.repo)?;

        let merged = self
            .dispatcher
            .dispatch(
                ctx,
                batches,
                MergePolicy::FailFast,
                |child, batch| {
                    let snapshot = Arc::clone(&snapshot);
                    async move {
                        let req = BatchLogRequest {
                            repo_commits: batch.items,
                            format: format.to_string(),
                        };
                        self.call_addr(&child, Operation::BatchLog, &snapshot, &batch.addr, |t| {
                            let req = req.clone();
                            let child = &child;
                            async move { t.batch_log(child, req).await }
                        })
                        .await
                    }
                },
                Vec::new(),
                |acc: &mut Vec<BatchLogResult>, _addr: &str, resp: BatchLogResponse| {
                    acc.extend(resp.results)
                },
            )
            .await?;
        Ok(merged.value)
    }

    /// Create a commit from a patch on the shard owning the target repository.
    ///
    /// # Errors
    ///
    /// Returns `RepoNotExist` or `CommandFailed`; an empty or oversized
    /// patch is rejected by the shard. Never retried.
    pub async fn create_commit_from_patch(
        &self,
        ctx: &CallContext,
        req: CreateCommitFromPatchRequest,
    ) -> Result<CreateCommitFromPatchResponse, DomainError> {
        let repo = req.metadata.repo.clone();
        self.call_repo(ctx, Operation::CreateCommitFromPatch, &repo, |t| {
            let req = req.clone();
            async move { t.create_commit_from_patch(ctx, req).await }
        })
        .await
    }

    /// Repositories of a gitolite host, listed by the shard the host
    /// name hashes to.
    pub async fn list_gitolite(
        &self,
        ctx: &CallContext,
        host: &str,
    ) -> Result<Vec<GitoliteRepo>, DomainError> {
        self.call_key(ctx, Operation::ListGitolite, host, |t| {
            let req = ListGitoliteRequest {
                host: host.to_string(),
            };
            async move { t.list_gitolite(ctx, req).await.map(|resp| resp.repos) }
        })
        .await
    }

    /// Repository statistics of every shard, keyed by address.
    pub async fn repos_stats(
        &self,
        ctx: &CallContext,
    ) -> Result<PartialResult<HashMap<String, ReposStats>>, DomainError> {
        let snapshot = self.registry.snapshot().await;
        let batches = every_shard::<()>(snapshot.directory());

        self.dispatcher
            .dispatch(
                ctx,
                batches,
                MergePolicy::BestEffort,
                |child, batch| {
                    let snapshot = Arc::clone(&snapshot);
                    async move {
                        self.call_addr(&child, Operation::ReposStats, &snapshot, &batch.addr, |t| {
                            let child = &child;
                            async move { t.repos_stats(child).await }
                        })
                        .await
                    }
                },
                HashMap::new(),
                |acc: &mut HashMap<String, ReposStats>, addr: &str, stats: ReposStats| {
                    acc.insert(addr.to_string(), stats);
                },
            )
            .await
    }

    /// Check that `depot_path` exists and is readable with `connection`,
    /// on the shard the Perforce port hashes to.
    ///
    /// # Errors
    ///
    /// Returns `CommandFailed` carrying the `p4` output when it is not.
    pub async fn is_perforce_path_cloneable(
        &self,
        ctx: &CallContext,
        connection: PerforceConnection,
        depot_path: &str,
    ) -> Result<(), DomainError> {
        let key = connection.port.clone();
        self.call_key(ctx, Operation::IsPerforcePathCloneable, &key, |t| {
            let req = IsPerforcePathCloneableRequest {
                connection: connection.clone(),
                depot_path: depot_path.to_string(),
            };
            async move { t.is_perforce_path_cloneable(ctx, req).await }
        })
        .await
    }

    /// Check that `connection` can log in to its Perforce server.
    ///
    /// # Errors
    ///
    /// Returns `CommandFailed` carrying the `p4` output on a failed login.
    pub async fn check_perforce_credentials(
        &self,
        ctx: &CallContext,
        connection: PerforceConnection,
    ) -> Result<(), DomainError> {
        let key = connection.port.clone();
        self.call_key(ctx, Operation::CheckPerforceCredentials, &key, |t| {
            let req = CheckPerforceCredentialsRequest {
                connection: connection.clone(),
            };
            async move { t.check_perforce_credentials(ctx, req).await }
        })
        .await
    }
}

fn resolve(snapshot: &Snapshot, repo: &RepoName) -> Result<String, DomainError> {
    snapshot
        .directory()
        .resolve(repo)
        .map(str::to_string)
        .ok_or_else(no_shards)
}
