//! Git-backed workspace: the only persistence path for accepted changes.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

const GIT_TIMEOUT: Duration = Duration::from_secs(60);

#[async_trait]
pub trait Workspace: Send + Sync {
    fn root(&self) -> &Path;
    async fn ensure_branch(&self, branch: &str) -> Result<()>;
    /// Commit everything; returns `None` when there was nothing to commit.
    async fn commit(&self, message: &str) -> Result<Option<String>>;
    /// Drop every uncommitted change, including untracked files.
    async fn revert_all(&self) -> Result<()>;
    async fn diff(&self) -> Result<String>;
}

/// Join `relative` onto `root`, refusing absolute paths and `..`.
pub(crate) fn confine(root: &Path, relative: &str) -> Result<PathBuf> {
    let path = Path::new(relative);
    if path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        bail!("refusing to touch a path outside the workspace: {}", relative);
    }
    Ok(root.join(path))
}

pub struct GitWorkspace {
    root: PathBuf,
}

impl GitWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!("git {}", args.join(" "));
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.root).kill_on_drop(true);
        tokio::time::timeout(GIT_TIMEOUT, cmd.output())
            .await
            .map_err(|_| anyhow!("git {} timed out", args.join(" ")))?
            .with_context(|| format!("spawning git {}", args.join(" ")))
    }

    async fn git_checked(&self, args: &[&str]) -> Result<String> {
        let out = self.git(args).await?;
        if !out.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).to_string())
    }
}

#[async_trait]
impl Workspace for GitWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn ensure_branch(&self, branch: &str) -> Result<()> {
        let current = self.git_checked(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        if current.trim() == branch {
            return Ok(());
        }
        let exists = self
            .git(&["show-ref", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
            .await?
            .status
            .success();
        if exists {
            self.git_checked(&["checkout", branch]).await?;
        } else {
            self.git_checked(&["checkout", "-b", branch]).await?;
        }
        info!("Workspace on branch {}", branch);
        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<Option<String>> {
        self.git_checked(&["add", "-A"]).await?;
        let staged = self.git_checked(&["diff", "--cached", "--name-only"]).await?;
        if staged.trim().is_empty() {
            return Ok(None);
        }
        self.git_checked(&["commit", "-m", message]).await?;
        let sha = self.git_checked(&["rev-parse", "--short", "HEAD"]).await?;
        info!("Committed {}: {}", sha.trim(), message);
        Ok(Some(sha.trim().to_string()))
    }

    async fn revert_all(&self) -> Result<()> {
        // An unborn HEAD has nothing to reset to; cleaning is still valid.
        if let Err(e) = self.git_checked(&["reset", "--hard", "HEAD"]).await {
            warn!("git reset failed: {}", e);
        }
        self.git_checked(&["clean", "-fd"]).await?;
        info!("Workspace reverted");
        Ok(())
    }

    async fn diff(&self) -> Result<String> {
        self.git_checked(&["add", "-A", "--intent-to-add"]).await?;
        self.git_checked(&["diff"]).await
    }
}
