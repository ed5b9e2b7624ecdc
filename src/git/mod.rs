//! Version-control backend used by the repository manager.
//!
//! [`Vcs`] creates working copies, [`WorkingCopy`] operates on one. The
//! manager never reaches past these traits, so it can run against the
//! libgit2 implementation in [`repository`] or an in-memory fake.

#[cfg(test)]
pub(crate) mod memory;
pub mod repository;

use std::path::Path;

use thiserror::Error;

use crate::model::{Author, CommitId};

pub use repository::{GitBackend, GitWorkingCopy};

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),
    #[error("Reference {0} was not found")]
    ReferenceNotFound(String),
    #[error("Commit {0} was not found")]
    CommitNotFound(String),
    #[error("{0}")]
    Failed(String),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub id: CommitId,
    pub summary: String,
    pub author: Author,
    /// Seconds since the Unix epoch.
    pub time: i64,
}

pub trait Vcs: Send + Sync + 'static {
    type WorkingCopy: WorkingCopy;

    /// Clones `uri` into `dest`, which must not exist yet.
    fn clone_repository(&self, uri: &str, dest: &Path) -> Result<Self::WorkingCopy, BackendError>;
}

pub trait WorkingCopy: Send + 'static {
    fn path(&self) -> &Path;

    /// Updates remote-tracking references and tags from `remote`.
    fn fetch(&mut self, remote: &str) -> Result<(), BackendError>;

    /// History reachable from `reference`, newest first, at most `limit` entries.
    fn log(&self, reference: &str, limit: usize) -> Result<Vec<CommitInfo>, BackendError>;

    /// Moves HEAD and the working tree to `commit`, returning its full id.
    fn checkout(&mut self, commit: &CommitId) -> Result<CommitId, BackendError>;

    fn stage_all(&mut self) -> Result<(), BackendError>;

    fn commit(&mut self, message: &str, author: &Author) -> Result<CommitId, BackendError>;

    /// `None` when HEAD is detached.
    fn current_branch_name(&self) -> Result<Option<String>, BackendError>;

    fn list_branches(&self) -> Result<Vec<String>, BackendError>;
}
