//! Serialized access to one git working copy.
//!
//! A [`RepositoryManager`] owns a single working copy and runs every
//! operation on it behind one mutex. The working copy handle lives inside
//! that mutex, so nothing can reach the repository without holding it, and
//! the guard releases it on every exit path.
//!
//! Version resolution can go through a [`Cache`]. Commits made through the
//! manager do not invalidate cached entries: a resolved version may lag a
//! local commit until its entry expires.

use std::{
    error::Error as StdError,
    ffi::OsString,
    fs,
    path::{Component, Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    cache::Cache,
    flock::FileLock,
    git::{BackendError, GitBackend, Vcs, WorkingCopy},
    model::{commit_cache_key, Author, CommitId, ParseError, Version, DETACHED_HEAD},
};

/// Remote every working copy is cloned from and fetches from.
pub const ORIGIN: &str = "origin";

const NO_COMMITS: &str = "no commits found for the specified version";

pub type GitRepositoryManager = RepositoryManager<GitBackend>;

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("Repository has not been initialized")]
    NotInitialized,
    #[error("Repository initialization from {uri} failed: {source}")]
    Initialization {
        uri: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
    #[error("Failed to resolve version {version}: {reason}")]
    Resolution { version: String, reason: String },
    #[error("Failed to checkout commit {commit}: {reason}")]
    Checkout { commit: String, reason: String },
    #[error("Cannot commit {path}: {reason}")]
    CommitPrecondition { path: String, reason: String },
    #[error("Repository operation failed: {0}")]
    Backend(#[from] BackendError),
}

/// A version together with the commit it currently points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommit {
    /// The reference that was looked up; the current branch when no version was given.
    pub version: String,
    pub commit_id: CommitId,
}

enum State<W> {
    Uninitialized,
    Ready { working_copy: W, lock: FileLock },
}

pub struct RepositoryManager<V: Vcs> {
    vcs: V,
    origin_uri: String,
    working_copy_path: PathBuf,
    cache: Option<Arc<dyn Cache>>,
    gate: Mutex<State<V::WorkingCopy>>,
}

impl GitRepositoryManager {
    pub fn git(
        origin_uri: impl Into<String>,
        working_copy_path: impl Into<PathBuf>,
        cache: Option<Arc<dyn Cache>>,
    ) -> Self {
        Self::new(GitBackend, origin_uri, working_copy_path, cache)
    }
}

impl<V: Vcs> RepositoryManager<V> {
    pub fn new(
        vcs: V,
        origin_uri: impl Into<String>,
        working_copy_path: impl Into<PathBuf>,
        cache: Option<Arc<dyn Cache>>,
    ) -> Self {
        RepositoryManager {
            vcs,
            origin_uri: origin_uri.into(),
            working_copy_path: working_copy_path.into(),
            cache,
            gate: Mutex::new(State::Uninitialized),
        }
    }

    pub fn origin_uri(&self) -> &str {
        &self.origin_uri
    }

    pub fn working_copy_path(&self) -> &Path {
        &self.working_copy_path
    }

    pub fn is_initialized(&self) -> bool {
        matches!(*self.enter(), State::Ready { .. })
    }

    /// Replaces whatever is at the working copy location with a fresh clone of the origin.
    ///
    /// Uncommitted changes and local commits are discarded.
    pub fn initialize(&self) -> Result<(), RepoError> {
        let mut state = self.enter();
        self.initialize_locked(&mut state)
    }

    /// Initializes only if no working copy is ready yet.
    ///
    /// Returns whether a clone was made.
    pub fn ensure_initialized(&self) -> Result<bool, RepoError> {
        let mut state = self.enter();
        if let State::Ready { .. } = *state {
            return Ok(false);
        }
        warn!(
            "Working copy at {} is not ready, cloning",
            self.working_copy_path.display()
        );
        self.initialize_locked(&mut state)?;
        Ok(true)
    }

    /// Resolves `version` to the commit it points at.
    ///
    /// A blank or missing version means the current branch. See [`Self::resolve`].
    pub fn resolve_commit(&self, version: impl Into<Version>) -> Result<CommitId, RepoError> {
        Ok(self.resolve(version)?.commit_id)
    }

    /// Resolves `version`, reporting the reference that was looked up.
    ///
    /// A blank or missing version means the current branch; with HEAD
    /// detached the target is `HEAD`. `HEAD`, whether given explicitly or
    /// reached that way, names the working copy's own HEAD: it is read
    /// without fetching from the origin and is never cached.
    pub fn resolve(&self, version: impl Into<Version>) -> Result<ResolvedCommit, RepoError> {
        let version = version.into();
        let mut state = self.enter();
        let working_copy = ready(&mut *state)?;

        let target = match version.name() {
            Some(name) => name.to_owned(),
            None => working_copy
                .current_branch_name()
                .map_err(|e| resolution_error(DETACHED_HEAD, e))?
                .unwrap_or_else(|| DETACHED_HEAD.to_owned()),
        };
        // HEAD points into the working copy rather than naming a version.
        let cache = self.cache.as_ref().filter(|_| target != DETACHED_HEAD);
        let key = commit_cache_key(&target);

        if let Some(cached) = cache.and_then(|cache| cache.get(&key)) {
            match cached.parse::<CommitId>() {
                Ok(commit_id) => {
                    debug!("Cache hit for {}: {}", target, commit_id);
                    return Ok(ResolvedCommit {
                        version: target,
                        commit_id,
                    });
                }
                Err(e) => warn!("Ignoring cache entry {}: {}", key, e),
            }
        }

        if target != DETACHED_HEAD {
            debug!("Fetching {} to resolve {}", ORIGIN, target);
            working_copy
                .fetch(ORIGIN)
                .map_err(|e| resolution_error(&target, e))?;
        }
        let latest = working_copy
            .log(&target, 1)
            .map_err(|e| {
                if let Ok(branches) = working_copy.list_branches() {
                    debug!("Could not resolve {}, known branches: {:?}", target, branches);
                }
                resolution_error(&target, e)
            })?
            .into_iter()
            .next()
            .ok_or_else(|| RepoError::Resolution {
                version: target.clone(),
                reason: NO_COMMITS.to_owned(),
            })?;

        if let Some(cache) = cache {
            cache.set(&key, latest.id.to_string());
        }
        debug!("Resolved {} to {}", target, latest.id);
        Ok(ResolvedCommit {
            version: target,
            commit_id: latest.id,
        })
    }

    /// Moves the working copy to `commit_id`, leaving HEAD detached.
    ///
    /// On failure HEAD stays where it was.
    pub fn checkout_commit(&self, commit_id: &str) -> Result<CommitId, RepoError> {
        let mut state = self.enter();
        let working_copy = ready(&mut *state)?;

        let checkout_error = |reason: String| RepoError::Checkout {
            commit: commit_id.to_owned(),
            reason,
        };
        let requested: CommitId = commit_id
            .parse()
            .map_err(|e: ParseError| checkout_error(e.to_string()))?;
        let checked_out = working_copy
            .checkout(&requested)
            .map_err(|e| checkout_error(e.to_string()))?;

        info!("Checked out {}", checked_out);
        Ok(checked_out)
    }

    /// Writes `content` to `file_path`, stages every pending change and commits it.
    ///
    /// The file is created along with any missing parent directories. The path
    /// is taken relative to the working copy; absolute paths must point inside it.
    pub fn commit_changes(
        &self,
        file_path: impl AsRef<Path>,
        content: impl AsRef<[u8]>,
        message: &str,
        author: &str,
    ) -> Result<CommitId, RepoError> {
        let file_path = file_path.as_ref();
        let precondition = |reason: String| RepoError::CommitPrecondition {
            path: file_path.display().to_string(),
            reason,
        };
        let author: Author = author.parse().map_err(|e| precondition(format!("{e}")))?;
        let relative = self.relative_path(file_path).map_err(precondition)?;

        let mut state = self.enter();
        let working_copy = ready(&mut *state)?;

        let target = working_copy.path().join(&relative);
        ensure_contained(working_copy.path(), &target).map_err(precondition)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(BackendError::from)?;
        }
        fs::write(&target, content).map_err(BackendError::from)?;
        working_copy.stage_all()?;
        let commit_id = working_copy.commit(message, &author)?;

        info!("Committed {} as {}", relative.display(), commit_id);
        Ok(commit_id)
    }

    /// The commit HEAD currently points at.
    pub fn current_commit(&self) -> Result<CommitId, RepoError> {
        let mut state = self.enter();
        let working_copy = ready(&mut *state)?;
        working_copy
            .log(DETACHED_HEAD, 1)?
            .into_iter()
            .next()
            .map(|commit| commit.id)
            .ok_or_else(|| BackendError::ReferenceNotFound(DETACHED_HEAD.to_owned()).into())
    }

    fn enter(&self) -> MutexGuard<'_, State<V::WorkingCopy>> {
        self.gate.lock().unwrap_or_else(|poisoned| {
            warn!("A previous repository operation panicked, continuing with its state");
            poisoned.into_inner()
        })
    }

    fn initialize_locked(&self, state: &mut State<V::WorkingCopy>) -> Result<(), RepoError> {
        let init_error = |source: Box<dyn StdError + Send + Sync>| RepoError::Initialization {
            uri: self.origin_uri.clone(),
            source,
        };

        // The previous clone has to be closed before its directory goes away.
        let lock = match std::mem::replace(state, State::Uninitialized) {
            State::Ready { lock, .. } => lock,
            State::Uninitialized => {
                if let Some(parent) = self.working_copy_path.parent() {
                    fs::create_dir_all(parent).map_err(|e| init_error(e.into()))?;
                }
                FileLock::new(&self.lock_path()).map_err(|e| init_error(e.into()))?
            }
        };

        self.remove_working_copy().map_err(|e| init_error(e.into()))?;
        let working_copy = self
            .vcs
            .clone_repository(&self.origin_uri, &self.working_copy_path)
            .map_err(|e| init_error(e.into()))?;

        info!(
            "Initialized working copy {} from {}",
            self.working_copy_path.display(),
            self.origin_uri
        );
        *state = State::Ready { working_copy, lock };
        Ok(())
    }

    fn remove_working_copy(&self) -> std::io::Result<()> {
        let path = &self.working_copy_path;
        match fs::symlink_metadata(path) {
            Ok(metadata) if metadata.is_dir() => {
                info!("Removing existing working copy {}", path.display());
                fs::remove_dir_all(path)
            }
            Ok(_) => fs::remove_file(path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .working_copy_path
            .file_name()
            .map(OsString::from)
            .unwrap_or_default();
        name.push(".lock");
        self.working_copy_path.with_file_name(name)
    }

    /// Normalizes `file_path` to a path relative to the working copy root.
    fn relative_path(&self, file_path: &Path) -> Result<PathBuf, String> {
        let relative = match file_path.strip_prefix(&self.working_copy_path) {
            Ok(inside) if file_path.is_absolute() => inside,
            _ => file_path,
        };

        let mut normalized = PathBuf::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) if normalized.as_os_str().is_empty() && part == ".git" => {
                    return Err("path points into the repository metadata".to_owned())
                }
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err("path must stay inside the working copy".to_owned())
                }
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err("path does not name a file".to_owned());
        }
        Ok(normalized)
    }
}

fn ready<W>(state: &mut State<W>) -> Result<&mut W, RepoError> {
    match state {
        State::Ready { working_copy, .. } => Ok(working_copy),
        State::Uninitialized => Err(RepoError::NotInitialized),
    }
}

/// Rejects a `target` that would leave `root` through a symbolic link already on disk.
///
/// Directories that do not exist yet are created under the deepest existing
/// ancestor, so only that ancestor and the target itself need checking.
fn ensure_contained(root: &Path, target: &Path) -> Result<(), String> {
    let escapes = || "path leaves the working copy through a symbolic link".to_owned();
    let describe = |e: std::io::Error| format!("cannot inspect path: {e}");

    match fs::symlink_metadata(target) {
        Ok(metadata) if metadata.file_type().is_symlink() => return Err(escapes()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(describe(e)),
    }

    let root = root.canonicalize().map_err(describe)?;
    let Some(existing) = target
        .ancestors()
        .skip(1)
        .find(|ancestor| fs::symlink_metadata(ancestor).is_ok())
    else {
        return Err(escapes());
    };
    // Fails for a dangling link, which cannot be written through either.
    let existing = existing.canonicalize().map_err(|_| escapes())?;
    if existing.starts_with(&root) {
        Ok(())
    } else {
        Err(escapes())
    }
}

fn resolution_error(version: &str, error: BackendError) -> RepoError {
    let reason = match error {
        BackendError::ReferenceNotFound(_) => NO_COMMITS.to_owned(),
        other => other.to_string(),
    };
    RepoError::Resolution {
        version: version.to_owned(),
        reason,
    }
}
