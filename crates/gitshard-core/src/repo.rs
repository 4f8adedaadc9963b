//! Repository names and their canonical form.
//!
//! Every routing decision is made on the normalized name, so two spellings
//! of the same repository (`repo.git`, `Github.com/Org/Repo`) always land on
//! the same shard.

use serde::{Deserialize, Serialize};

/// Prefix left on a repository name by a soft delete.
const DELETED_PREFIX: &str = "DELETED-";

/// Name of a hosted repository, e.g. `github.com/sourcegraph/sourcegraph`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoName(String);

impl RepoName {
    /// Create a repository name without normalizing it.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Canonical form used for hashing and pinning.
    ///
    /// Strips a trailing `.git`, cleans the path, and lowercases names hosted
    /// on `github.com`, whose paths are case-insensitive.
    pub fn normalize(&self) -> RepoName {
        // Repeated until stable so `normalize` is idempotent for inputs like
        // `repo.git.git` or `repo.git/`.
        let mut current = self.0.clone();
        loop {
            let next = normalize_step(&current);
            if next == current {
                return RepoName(current);
            }
            current = next;
        }
    }

    /// Name with any soft-delete marker (`DELETED-<secs>.<nanos>-`) removed.
    pub fn undeleted(&self) -> RepoName {
        match strip_deleted_marker(&self.0) {
            Some(rest) => RepoName(rest.to_string()),
            None => self.clone(),
        }
    }
}

impl std::fmt::Display for RepoName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RepoName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for RepoName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

fn normalize_step(name: &str) -> String {
    let trimmed = name.strip_suffix(".git").unwrap_or(name);
    let cleaned = clean_path(trimmed);

    let host = cleaned.split('/').next().unwrap_or("");
    if host.eq_ignore_ascii_case("github.com") {
        cleaned.to_lowercase()
    } else {
        cleaned
    }
}

/// Lexically clean a slash-separated path.
fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(last) if *last != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

fn strip_deleted_marker(name: &str) -> Option<&str> {
    let rest = name.strip_prefix(DELETED_PREFIX)?;
    let rest = strip_digits(rest)?;
    let rest = rest.strip_prefix('.')?;
    let rest = strip_digits(rest)?;
    rest.strip_prefix('-')
}

fn strip_digits(s: &str) -> Option<&str> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if end == 0 {
        None
    } else {
        Some(&s[end..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(name: &str) -> String {
        RepoName::from(name).normalize().to_string()
    }

    #[test]
    fn test_normalize_strips_git_suffix() {
        assert_eq!(norm("repo1.git"), "repo1");
        assert_eq!(norm("gitlab.example.com/team/app.git"), "gitlab.example.com/team/app");
    }

    #[test]
    fn test_normalize_cleans_path() {
        assert_eq!(norm("example.com//org/./repo/"), "example.com/org/repo");
        assert_eq!(norm("example.com/org/x/../repo"), "example.com/org/repo");
    }

    #[test]
    fn test_normalize_lowercases_github_only() {
        assert_eq!(
            norm("GitHub.com/Sourcegraph/Sourcegraph.git"),
            "github.com/sourcegraph/sourcegraph"
        );
        assert_eq!(norm("gitlab.com/Org/Repo"), "gitlab.com/Org/Repo");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for name in [
            "repo1.git",
            "github.com/Org/Repo.git",
            "a//b/./c/",
            "../up/one",
            "repo.git.git",
            "repo.git/",
            "github.com/a/b.GIT",
            "plain",
        ] {
            let once = RepoName::from(name).normalize();
            assert_eq!(once.normalize(), once, "not idempotent for {}", name);
        }
    }

    #[test]
    fn test_undeleted() {
        assert_eq!(
            RepoName::from("DELETED-1234567890.123456-github.com/org/repo")
                .undeleted()
                .as_str(),
            "github.com/org/repo"
        );
        assert_eq!(RepoName::from("github.com/org/repo").undeleted().as_str(), "github.com/org/repo");
        assert_eq!(RepoName::from("DELETED-abc-repo").undeleted().as_str(), "DELETED-abc-repo");
    }
}
