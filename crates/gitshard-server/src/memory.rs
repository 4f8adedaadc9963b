//! In-memory repository backend.
//!
//! Hosts a fixed set of fake repositories with commits, refs, files and
//! canned command output. Failures and latency can be injected so the
//! client's retry and fan-out paths can be driven against a real endpoint.

use crate::error::BackendError;
use crate::executor::{BackendResult, CommandExecutor, SearchOutput};
use async_trait::async_trait;
use gitshard_core::{
    ArchiveRequest, CommitMatch, DiskInfoResponse, ExecRequest, GitObject, GitoliteRepo,
    IsRepoCloneableResponse, ObjectKind, PatchMetadata, PerforceConnection, RepoCloneProgress,
    RepoCommit, RepoInfo, RepoName, RepoUpdateRequest, RepoUpdateResponse, ReposStats, SearchRequest,
};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
struct MemoryCommit {
    id: String,
    author: String,
    message: String,
    diff: Option<String>,
}

/// A fake repository.
#[derive(Debug, Clone)]
pub struct MemoryRepo {
    cloned: bool,
    clone_progress: String,
    commits: Vec<MemoryCommit>,
    refs: HashMap<String, String>,
    files: BTreeMap<String, Vec<u8>>,
    outputs: HashMap<Vec<String>, Vec<u8>>,
    last_fetched: Option<u64>,
    last_changed: Option<u64>,
}

impl Default for MemoryRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepo {
    /// An empty, fully cloned repository.
    pub fn new() -> Self {
        Self {
            cloned: true,
            clone_progress: String::new(),
            commits: Vec::new(),
            refs: HashMap::new(),
            files: BTreeMap::new(),
            outputs: HashMap::new(),
            last_fetched: None,
            last_changed: None,
        }
    }

    /// A repository whose clone is still running.
    pub fn cloning(progress: impl Into<String>) -> Self {
        Self {
            cloned: false,
            clone_progress: progress.into(),
            ..Self::new()
        }
    }

    /// Add a commit. The first commit added also becomes `HEAD`.
    pub fn with_commit(
        mut self,
        id: impl Into<String>,
        author: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let id = id.into();
        self.refs.entry("HEAD".to_string()).or_insert_with(|| id.clone());
        self.commits.push(MemoryCommit {
            id,
            author: author.into(),
            message: message.into(),
            diff: None,
        });
        self
    }

    /// Attach a diff to an existing commit.
    pub fn with_diff(mut self, commit_id: &str, diff: impl Into<String>) -> Self {
        if let Some(commit) = self.commits.iter_mut().find(|c| c.id == commit_id) {
            commit.diff = Some(diff.into());
        }
        self
    }

    pub fn with_ref(mut self, name: impl Into<String>, commit_id: impl Into<String>) -> Self {
        self.refs.insert(name.into(), commit_id.into());
        self
    }

    /// A file of the tree served by `archive`.
    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.into(), contents.into());
        self
    }

    /// Canned standard output for `git <args>`.
    pub fn with_output<I, S>(mut self, args: I, stdout: impl Into<Vec<u8>>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs
            .insert(args.into_iter().map(Into::into).collect(), stdout.into());
        self
    }

    fn resolve(&self, spec: &str) -> Option<&MemoryCommit> {
        let id = self.refs.get(spec).map(String::as_str).unwrap_or(spec);
        self.commits.iter().find(|c| c.id == id)
    }

    /// `git rev-parse` over revisions, `--glob=` and `--exclude=` arguments.
    fn rev_parse(&self, args: &[String]) -> BackendResult<Vec<u8>> {
        let mut out = String::new();
        let mut excludes: Vec<&str> = Vec::new();
        for arg in args {
            if let Some(pattern) = arg.strip_prefix("--exclude=") {
                excludes.push(pattern);
            } else if let Some(pattern) = arg.strip_prefix("--glob=") {
                // Excludes apply to the next glob only.
                let mut names: Vec<&String> = self
                    .refs
                    .keys()
                    .filter(|name| glob_matches(pattern, name))
                    .filter(|name| !excludes.iter().any(|ex| glob_matches(ex, name)))
                    .collect();
                names.sort();
                for name in names {
                    out.push_str(&self.refs[name]);
                    out.push('\n');
                }
                excludes.clear();
            } else {
                let commit = self
                    .resolve(arg)
                    .ok_or_else(|| BackendError::ambiguous_argument(arg))?;
                out.push_str(&commit.id);
                out.push('\n');
            }
        }
        Ok(out.into_bytes())
    }

    fn size(&self) -> u64 {
        let files: usize = self.files.values().map(Vec::len).sum();
        let commits: usize = self
            .commits
            .iter()
            .map(|c| c.id.len() + c.author.len() + c.message.len())
            .sum();
        (files + commits) as u64
    }
}

#[derive(Debug, Clone)]
struct PerforceDepot {
    user: String,
    password: String,
    paths: HashSet<String>,
}

#[derive(Debug)]
struct MemoryState {
    repos: HashMap<RepoName, MemoryRepo>,
    cloneable: HashSet<RepoName>,
    gitolite: HashMap<String, Vec<GitoliteRepo>>,
    perforce: HashMap<String, PerforceDepot>,
    disk: DiskInfoResponse,
    failures: VecDeque<BackendError>,
    latency: Option<Duration>,
    calls: HashMap<&'static str, usize>,
    in_flight: usize,
    peak_in_flight: usize,
}

/// [`CommandExecutor`] over in-memory repositories.
pub struct MemoryExecutor {
    state: Mutex<MemoryState>,
}

impl Default for MemoryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                repos: HashMap::new(),
                cloneable: HashSet::new(),
                gitolite: HashMap::new(),
                perforce: HashMap::new(),
                disk: DiskInfoResponse {
                    free_space: 100 << 30,
                    total_space: 200 << 30,
                    percent_used: 50.0,
                },
                failures: VecDeque::new(),
                latency: None,
                calls: HashMap::new(),
                in_flight: 0,
                peak_in_flight: 0,
            }),
        }
    }

    pub fn with_repo(self, name: impl Into<RepoName>, repo: MemoryRepo) -> Self {
        self.insert_repo(name, repo);
        self
    }

    /// A repository the code host has but this shard has not cloned.
    pub fn with_cloneable(self, name: impl Into<RepoName>) -> Self {
        self.state.lock().cloneable.insert(name.into().normalize());
        self
    }

    pub fn with_gitolite(self, host: impl Into<String>, repos: Vec<GitoliteRepo>) -> Self {
        self.state.lock().gitolite.insert(host.into(), repos);
        self
    }

    /// A Perforce server at `port` accepting `user`/`password` and hosting
    /// `paths`.
    pub fn with_perforce<I, S>(
        self,
        port: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        paths: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().perforce.insert(
            port.into(),
            PerforceDepot {
                user: user.into(),
                password: password.into(),
                paths: paths.into_iter().map(Into::into).collect(),
            },
        );
        self
    }

    pub fn with_disk_info(self, disk: DiskInfoResponse) -> Self {
        self.state.lock().disk = disk;
        self
    }

    /// Delay every operation by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = Some(latency);
        self
    }

    pub fn insert_repo(&self, name: impl Into<RepoName>, repo: MemoryRepo) {
        self.state.lock().repos.insert(name.into().normalize(), repo);
    }

    pub fn has_repo(&self, name: &RepoName) -> bool {
        self.state.lock().repos.contains_key(&name.normalize())
    }

    /// Fail the next `count` operations with `err`.
    pub fn fail_next(&self, count: usize, err: BackendError) {
        let mut state = self.state.lock();
        state.failures.extend(std::iter::repeat(err).take(count));
    }

    /// Number of times operation `op` was invoked, failed calls included.
    pub fn calls(&self, op: &str) -> usize {
        self.state.lock().calls.get(op).copied().unwrap_or(0)
    }

    /// Most operations ever running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.state.lock().peak_in_flight
    }

    /// Diff recorded for `commit_id`, e.g. the patch a commit was created from.
    pub fn diff_of(&self, repo: &RepoName, commit_id: &str) -> Option<String> {
        let state = self.state.lock();
        state
            .repos
            .get(&repo.normalize())?
            .commits
            .iter()
            .find(|c| c.id == commit_id)?
            .diff
            .clone()
    }

    /// Count the call, apply latency and pop an injected failure.
    async fn enter(&self, op: &'static str) -> BackendResult<()> {
        let latency = {
            let mut state = self.state.lock();
            *state.calls.entry(op).or_insert(0) += 1;
            state.in_flight += 1;
            state.peak_in_flight = state.peak_in_flight.max(state.in_flight);
            state.latency
        };
        let _running = InFlight(&self.state);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let injected = self.state.lock().failures.pop_front();
        match injected {
            Some(err) => {
                debug!(op, "Injected failure: {}", err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Run `f` against a cloned repository.
    fn with_cloned<T>(
        &self,
        repo: &RepoName,
        f: impl FnOnce(&mut MemoryRepo) -> BackendResult<T>,
    ) -> BackendResult<T> {
        let mut state = self.state.lock();
        let Some(entry) = state.repos.get_mut(&repo.normalize()) else {
            return Err(BackendError::repo_not_found(repo.clone()));
        };
        if !entry.cloned {
            return Err(BackendError::RepoNotFound {
                repo: repo.clone(),
                clone_in_progress: true,
                clone_progress: entry.clone_progress.clone(),
            });
        }
        f(entry)
    }
}

/// Marks one operation as running until dropped.
struct InFlight<'a>(&'a Mutex<MemoryState>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.lock().in_flight -= 1;
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Commit id derived from the patch and where it is applied.
fn patch_commit_id(metadata: &PatchMetadata, patch: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    metadata.repo.as_str().hash(&mut hasher);
    metadata.base_commit.hash(&mut hasher);
    metadata.message.hash(&mut hasher);
    patch.hash(&mut hasher);
    format!("{:040x}", hasher.finish())
}

/// Shell-style glob with `*` only; a pattern without one matches as a
/// prefix, the way `git rev-parse --glob` treats it.
fn glob_matches(pattern: &str, name: &str) -> bool {
    let Some((head, rest)) = pattern.split_once('*') else {
        return name.starts_with(pattern);
    };
    let Some(mut remaining) = name.strip_prefix(head) else {
        return false;
    };
    let mut parts = rest.split('*').peekable();
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            return remaining.ends_with(part);
        }
        match remaining.find(part) {
            Some(at) => remaining = &remaining[at + part.len()..],
            None => return false,
        }
    }
    true
}

fn render_log(commit: &MemoryCommit, format: &str) -> String {
    format
        .replace("%H", &commit.id)
        .replace("%an", &commit.author)
        .replace("%s", &commit.message)
}

fn unknown_command(args: &[String]) -> BackendError {
    BackendError::command(
        "git command failed",
        1,
        format!("git: '{}' is not a git command", args.join(" ")),
    )
}

#[async_trait]
impl CommandExecutor for MemoryExecutor {
    async fn exec(&self, req: &ExecRequest) -> BackendResult<Vec<u8>> {
        self.enter("exec").await?;
        self.with_cloned(&req.repo, |repo| {
            if let Some(rev) = &req.ensure_revision {
                if repo.resolve(rev).is_none() {
                    return Err(BackendError::bad_object(rev));
                }
            }
            if let Some(stdout) = repo.outputs.get(&req.args) {
                return Ok(stdout.clone());
            }
            match req.args.split_first() {
                Some((cmd, revs)) if cmd == "rev-parse" && !revs.is_empty() => repo.rev_parse(revs),
                _ => Err(unknown_command(&req.args)),
            }
        })
    }

    async fn archive(&self, req: &ArchiveRequest) -> BackendResult<Vec<u8>> {
        self.enter("archive").await?;
        self.with_cloned(&req.repo, |repo| {
            if repo.resolve(&req.treeish).is_none() {
                return Err(BackendError::bad_object(&req.treeish));
            }
            // Path header, length, then contents for every selected file.
            let mut out = Vec::new();
            for (path, contents) in &repo.files {
                if !req.paths.is_empty() && !req.paths.iter().any(|p| path.starts_with(p.as_str())) {
                    continue;
                }
                out.extend_from_slice(format!("{}\n{}\n", path, contents.len()).as_bytes());
                out.extend_from_slice(contents);
            }
            Ok(out)
        })
    }

    async fn search(&self, req: &SearchRequest) -> BackendResult<SearchOutput> {
        self.enter("search").await?;
        self.with_cloned(&req.repo, |repo| {
            let query = req.query.to_lowercase();
            let mut matches = repo.commits.iter().filter(|c| {
                c.message.to_lowercase().contains(&query) || c.author.to_lowercase().contains(&query)
            });

            let limit = req.limit.unwrap_or(usize::MAX);
            let mut output = SearchOutput::default();
            for commit in matches.by_ref().take(limit) {
                output.matches.push(CommitMatch {
                    oid: commit.id.clone(),
                    author: commit.author.clone(),
                    message: commit.message.clone(),
                    diff: if req.include_diff {
                        commit.diff.clone()
                    } else {
                        None
                    },
                });
            }
            output.limit_hit = matches.next().is_some();
            Ok(output)
        })
    }

    async fn get_object(&self, repo: &RepoName, object_name: &str) -> BackendResult<GitObject> {
        self.enter("get_object").await?;
        self.with_cloned(repo, |entry| {
            entry
                .resolve(object_name)
                .map(|commit| GitObject {
                    id: commit.id.clone(),
                    kind: ObjectKind::Commit,
                })
                .ok_or_else(|| BackendError::RevisionNotFound {
                    repo: repo.clone(),
                    spec: object_name.to_string(),
                })
        })
    }

    async fn disk_info(&self) -> BackendResult<DiskInfoResponse> {
        self.enter("disk_info").await?;
        Ok(self.state.lock().disk.clone())
    }

    async fn is_repo_cloneable(&self, repo: &RepoName) -> BackendResult<IsRepoCloneableResponse> {
        self.enter("is_repo_cloneable").await?;
        let state = self.state.lock();
        let name = repo.normalize();
        let response = match state.repos.get(&name) {
            Some(entry) => IsRepoCloneableResponse {
                cloneable: true,
                cloned: entry.cloned,
                reason: String::new(),
            },
            None if state.cloneable.contains(&name) => IsRepoCloneableResponse {
                cloneable: true,
                cloned: false,
                reason: String::new(),
            },
            None => IsRepoCloneableResponse {
                cloneable: false,
                cloned: false,
                reason: format!("repository {} not found on code host", repo),
            },
        };
        Ok(response)
    }

    async fn repo_clone(&self, repo: &RepoName) -> BackendResult<Option<String>> {
        self.enter("repo_clone").await?;
        let mut state = self.state.lock();
        let name = repo.normalize();
        if state.repos.contains_key(&name) {
            return Ok(None);
        }
        if !state.cloneable.remove(&name) {
            return Ok(Some(format!("repository {} is not cloneable", repo)));
        }
        state
            .repos
            .insert(name, MemoryRepo::cloning("Cloning into bare repository..."));
        Ok(None)
    }

    async fn repo_clone_progress(&self, repo: &RepoName) -> BackendResult<RepoCloneProgress> {
        self.enter("repo_clone_progress").await?;
        let state = self.state.lock();
        Ok(match state.repos.get(&repo.normalize()) {
            Some(entry) => RepoCloneProgress {
                clone_in_progress: !entry.cloned,
                clone_progress: entry.clone_progress.clone(),
                cloned: entry.cloned,
            },
            None => RepoCloneProgress {
                clone_in_progress: false,
                clone_progress: String::new(),
                cloned: false,
            },
        })
    }

    async fn repo_info(&self, repo: &RepoName) -> BackendResult<RepoInfo> {
        self.enter("repo_info").await?;
        let state = self.state.lock();
        Ok(match state.repos.get(&repo.normalize()) {
            Some(entry) => RepoInfo {
                cloned: entry.cloned,
                clone_in_progress: !entry.cloned,
                clone_progress: entry.clone_progress.clone(),
                last_fetched: entry.last_fetched,
                last_changed: entry.last_changed,
                size_bytes: entry.size(),
            },
            None => RepoInfo::default(),
        })
    }

    async fn list_cloned(&self) -> BackendResult<Vec<RepoName>> {
        self.enter("list_cloned").await?;
        let state = self.state.lock();
        let mut repos: Vec<RepoName> = state
            .repos
            .iter()
            .filter(|(_, entry)| entry.cloned)
            .map(|(name, _)| name.clone())
            .collect();
        repos.sort();
        Ok(repos)
    }

    async fn repo_update(&self, req: &RepoUpdateRequest) -> BackendResult<RepoUpdateResponse> {
        self.enter("repo_update").await?;
        let now = unix_now();
        self.with_cloned(&req.repo, |repo| {
            let fresh = match (req.since_secs, repo.last_fetched) {
                (Some(since), Some(fetched)) => now.saturating_sub(fetched) < since,
                _ => false,
            };
            if !fresh {
                repo.last_fetched = Some(now);
                repo.last_changed.get_or_insert(now);
            }
            Ok(RepoUpdateResponse {
                last_fetched: repo.last_fetched,
                last_changed: repo.last_changed,
                error: None,
            })
        })
    }

    async fn repo_delete(&self, repo: &RepoName) -> BackendResult<()> {
        self.enter("repo_delete").await?;
        match self.state.lock().repos.remove(&repo.normalize()) {
            Some(_) => Ok(()),
            None => Err(BackendError::repo_not_found(repo.clone())),
        }
    }

    async fn log(&self, repo_commit: &RepoCommit, format: &str) -> BackendResult<String> {
        self.enter("log").await?;
        self.with_cloned(&repo_commit.repo, |repo| {
            repo.resolve(&repo_commit.commit_id)
                .map(|commit| render_log(commit, format))
                .ok_or_else(|| BackendError::bad_object(&repo_commit.commit_id))
        })
    }

    async fn create_commit_from_patch(
        &self,
        metadata: &PatchMetadata,
        patch: &[u8],
    ) -> BackendResult<(String, String)> {
        self.enter("create_commit_from_patch").await?;
        if patch.is_empty() {
            return Err(BackendError::InvalidArgument("empty patch".to_string()));
        }
        self.with_cloned(&metadata.repo, |repo| {
            if repo.resolve(&metadata.base_commit).is_none() {
                return Err(BackendError::bad_object(&metadata.base_commit));
            }

            let id = patch_commit_id(metadata, patch);
            let mut target = metadata.target_ref.clone();
            if metadata.unique_ref {
                target = format!("{}-{}", target, &id[id.len() - 8..]);
            }
            repo.commits.push(MemoryCommit {
                id: id.clone(),
                author: format!("{} <{}>", metadata.author_name, metadata.author_email),
                message: metadata.message.clone(),
                diff: Some(String::from_utf8_lossy(patch).into_owned()),
            });
            repo.refs.insert(target.clone(), id.clone());
            Ok((target, id))
        })
    }

    async fn list_gitolite(&self, host: &str) -> BackendResult<Vec<GitoliteRepo>> {
        self.enter("list_gitolite").await?;
        Ok(self
            .state
            .lock()
            .gitolite
            .get(host)
            .cloned()
            .unwrap_or_default())
    }

    async fn repos_stats(&self) -> BackendResult<ReposStats> {
        self.enter("repos_stats").await?;
        let state = self.state.lock();
        Ok(ReposStats {
            repo_count: state.repos.len() as u64,
            git_dir_bytes: state.repos.values().map(MemoryRepo::size).sum(),
            updated_at: unix_now(),
        })
    }

    async fn is_perforce_path_cloneable(
        &self,
        connection: &PerforceConnection,
        depot_path: &str,
    ) -> BackendResult<()> {
        self.enter("is_perforce_path_cloneable").await?;
        let state = self.state.lock();
        let depot = perforce_login(&state, connection)?;
        if depot.paths.contains(depot_path) {
            Ok(())
        } else {
            Err(BackendError::command(
                "p4 files failed",
                1,
                format!("{} - no such file(s).", depot_path),
            ))
        }
    }

    async fn check_perforce_credentials(
        &self,
        connection: &PerforceConnection,
    ) -> BackendResult<()> {
        self.enter("check_perforce_credentials").await?;
        let state = self.state.lock();
        perforce_login(&state, connection).map(|_| ())
    }
}

fn perforce_login<'a>(
    state: &'a MemoryState,
    connection: &PerforceConnection,
) -> BackendResult<&'a PerforceDepot> {
    let depot = state.perforce.get(&connection.port).ok_or_else(|| {
        BackendError::command(
            "p4 login failed",
            1,
            format!("Connect to server failed; check $P4PORT. {}", connection.port),
        )
    })?;
    if depot.user != connection.user || depot.password != connection.password {
        return Err(BackendError::command(
            "p4 login failed",
            1,
            "Perforce password (P4PASSWD) invalid or unset.",
        ));
    }
    Ok(depot)
}
