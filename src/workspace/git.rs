//! Version-control manager for isolated ticket workspaces.
//!
//! Worktree, rebase, and merge operations shell out to `git`; read-only
//! queries (current branch, dirty check, latest commit) go through libgit2.
//! The manager never touches ticket state - callers map failures onto the
//! board through the pool and merge queue.

use std::path::{Path, PathBuf};

use git2::Repository;
use tokio::process::Command;

use crate::config::WorkspaceConfig;
use crate::errors::WorkspaceError;

/// Replace every character outside `[a-zA-Z0-9-_]` with `-`.
pub fn sanitize_branch(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Lowercase kebab slug of a title, capped at `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// `<prefix><ticket-id>-<kebab-title>` with the title capped at 40 chars.
pub fn branch_name(prefix: &str, ticket_id: &str, title: &str) -> String {
    let slug = slugify(title, 40);
    let id = sanitize_branch(ticket_id);
    if slug.is_empty() {
        format!("{}{}", prefix, id)
    } else {
        format!("{}{}-{}", prefix, id, slug)
    }
}

/// Filesystem-safe directory name for a branch: the common branch prefix
/// is dropped and the remainder sanitised.
pub fn worktree_dir_name(branch: &str) -> String {
    let stripped = branch
        .strip_prefix("feat/")
        .or_else(|| branch.strip_prefix("feature/"))
        .or_else(|| branch.strip_prefix("fix/"))
        .unwrap_or(branch);
    sanitize_branch(stripped)
}

pub struct GitManager {
    repo_path: PathBuf,
    config: WorkspaceConfig,
}

impl GitManager {
    pub fn new(repo_path: &Path, config: WorkspaceConfig) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
            config,
        }
    }

    /// Local-only mode: no fetches or pushes against a remote.
    fn is_local_only(&self) -> bool {
        self.config.bare_repo.is_some()
    }

    fn worktree_root(&self) -> PathBuf {
        self.repo_path.join(".worktrees")
    }

    async fn run_git(&self, dir: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await?;
        if !output.status.success() {
            return Err(WorkspaceError::GitCommand {
                command: format!("git {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn branch_exists(&self, branch: &str) -> Result<bool, WorkspaceError> {
        let repo = Repository::open(&self.repo_path)?;
        Ok(repo.find_branch(branch, git2::BranchType::Local).is_ok())
    }

    /// Create an isolated working copy for `branch` under `.worktrees/`.
    /// A new branch forks off trunk; an existing branch is checked out.
    pub async fn create_worktree(
        &self,
        _ticket_id: &str,
        branch: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        let path = self.worktree_root().join(worktree_dir_name(branch));
        tokio::fs::create_dir_all(self.worktree_root()).await?;
        let path_str = path.to_string_lossy().to_string();

        if self.branch_exists(branch)? {
            self.run_git(&self.repo_path, &["worktree", "add", &path_str, branch])
                .await?;
        } else {
            self.run_git(
                &self.repo_path,
                &[
                    "worktree",
                    "add",
                    "-b",
                    branch,
                    &path_str,
                    &self.config.main_branch,
                ],
            )
            .await?;
        }
        Ok(path)
    }

    /// Remove a worktree, optionally deleting its branch.
    pub async fn remove_worktree(
        &self,
        path: &Path,
        remove_branch: Option<&str>,
    ) -> Result<(), WorkspaceError> {
        let path_str = path.to_string_lossy().to_string();
        self.run_git(
            &self.repo_path,
            &["worktree", "remove", "--force", &path_str],
        )
        .await?;
        if let Some(branch) = remove_branch {
            self.run_git(&self.repo_path, &["branch", "-D", branch])
                .await?;
        }
        Ok(())
    }

    /// Bring a workspace up to date with trunk: fetch (unless local-only)
    /// and rebase. Uncommitted changes abort with a typed error so the dev
    /// agent can resolve them first.
    pub async fn update_worktree(&self, path: &Path) -> Result<(), WorkspaceError> {
        if self.has_uncommitted(path)? {
            return Err(WorkspaceError::Uncommitted {
                path: path.to_string_lossy().to_string(),
            });
        }
        if !self.is_local_only() {
            self.run_git(path, &["fetch", "origin", &self.config.main_branch])
                .await?;
        }
        if let Err(e) = self
            .run_git(path, &["rebase", &self.config.main_branch])
            .await
        {
            // Leave the branch usable for the next attempt.
            let _ = self.run_git(path, &["rebase", "--abort"]).await;
            return Err(WorkspaceError::RebaseFailed {
                path: path.to_string_lossy().to_string(),
                message: e.to_string(),
            });
        }
        Ok(())
    }

    /// Stage everything and commit. Returns false when the tree was clean.
    pub async fn commit(&self, path: &Path, message: &str) -> Result<bool, WorkspaceError> {
        self.run_git(path, &["add", "-A"]).await?;
        if !self.has_uncommitted(path)? {
            return Ok(false);
        }
        self.run_git(path, &["commit", "-m", message]).await?;
        Ok(true)
    }

    /// Push the workspace branch with upstream tracking.
    pub async fn push(&self, path: &Path, branch: &str) -> Result<(), WorkspaceError> {
        if self.is_local_only() {
            tracing::debug!(branch, "local-only mode, skipping push");
            return Ok(());
        }
        self.run_git(path, &["push", "-u", "origin", branch]).await?;
        Ok(())
    }

    /// Squash-merge `branch` into trunk with a synthesised message. Runs in
    /// the trunk checkout at the repository root; callers serialise through
    /// the merge worker.
    pub async fn squash_merge(&self, branch: &str, message: &str) -> Result<(), WorkspaceError> {
        self.run_git(&self.repo_path, &["checkout", &self.config.main_branch])
            .await?;
        if !self.is_local_only() {
            self.run_git(&self.repo_path, &["pull", "origin", &self.config.main_branch])
                .await?;
        }
        if self.config.squash_on_merge {
            if let Err(e) = self
                .run_git(&self.repo_path, &["merge", "--squash", branch])
                .await
            {
                // Leave trunk clean for the next queue entry.
                let _ = self
                    .run_git(&self.repo_path, &["reset", "--hard", "HEAD"])
                    .await;
                return Err(WorkspaceError::MergeFailed {
                    branch: branch.to_string(),
                    message: e.to_string(),
                });
            }
            self.run_git(&self.repo_path, &["commit", "-m", message])
                .await?;
        } else if let Err(e) = self
            .run_git(&self.repo_path, &["merge", "--no-ff", "-m", message, branch])
            .await
        {
            let _ = self.run_git(&self.repo_path, &["merge", "--abort"]).await;
            return Err(WorkspaceError::MergeFailed {
                branch: branch.to_string(),
                message: e.to_string(),
            });
        }
        Ok(())
    }

    pub async fn push_trunk(&self) -> Result<(), WorkspaceError> {
        if self.is_local_only() {
            tracing::debug!("local-only mode, skipping trunk push");
            return Ok(());
        }
        self.run_git(
            &self.repo_path,
            &["push", "origin", &self.config.main_branch],
        )
        .await?;
        Ok(())
    }

    pub fn has_uncommitted(&self, path: &Path) -> Result<bool, WorkspaceError> {
        let repo = Repository::open(path)?;
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }

    pub fn current_branch(&self, path: &Path) -> Result<String, WorkspaceError> {
        let repo = Repository::open(path)?;
        let head = repo.head()?;
        Ok(head.shorthand().unwrap_or("HEAD").to_string())
    }

    /// Latest commit id, or None on an unborn branch.
    pub fn latest_commit(&self, path: &Path) -> Result<Option<String>, WorkspaceError> {
        let repo = Repository::open(path)?;
        let head = match repo.head() {
            Ok(head) => head,
            Err(_) => return Ok(None),
        };
        Ok(head.peel_to_commit().ok().map(|c| c.id().to_string()))
    }
}
