//! Source revision control for the application tree.

use crate::error::{Result, UpkeepError};
use crate::process::{CommandRunner, CommandSpec};

pub trait Repository: Send + Sync {
    /// True if the working tree has uncommitted changes.
    fn has_local_changes(&self) -> Result<bool>;
    /// Fetch `branch` from the remote.
    fn fetch(&self, branch: &str) -> Result<()>;
    /// Revision currently checked out.
    fn head(&self) -> Result<String>;
    /// Revision of the fetched remote branch.
    fn remote_head(&self, branch: &str) -> Result<String>;
    /// Force the working tree to `revision`.
    fn checkout(&self, revision: &str) -> Result<()>;
}

pub struct GitRepository {
    remote: String,
    runner: CommandRunner,
}

impl GitRepository {
    /// `runner`'s base dir must be the working tree.
    pub fn new(remote: impl Into<String>, runner: CommandRunner) -> Self {
        Self {
            remote: remote.into(),
            runner,
        }
    }

    fn git<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let out = self.runner.run(&CommandSpec::new("git", args))?;
        Ok(out.stdout.trim().to_string())
    }
}

impl Repository for GitRepository {
    fn has_local_changes(&self) -> Result<bool> {
        let status = self.git(["status", "--porcelain", "--untracked-files=no"])?;
        Ok(!status.is_empty())
    }

    fn fetch(&self, branch: &str) -> Result<()> {
        self.git(["fetch", self.remote.as_str(), branch])?;
        Ok(())
    }

    fn head(&self) -> Result<String> {
        self.git(["rev-parse", "HEAD"])
    }

    fn remote_head(&self, branch: &str) -> Result<String> {
        self.git(["rev-parse", &format!("{}/{branch}", self.remote)])
    }

    fn checkout(&self, revision: &str) -> Result<()> {
        if revision.starts_with('-') {
            return Err(UpkeepError::InvalidCommand(format!(
                "refusing revision '{revision}'"
            )));
        }
        self.git(["reset", "--hard", revision])?;
        Ok(())
    }
}
