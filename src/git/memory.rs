//! In-memory [`Vcs`] for exercising the manager without git.
//!
//! Every working-copy call is counted and checked for overlap with any
//! other call, which is how tests observe the manager's serialization.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use crate::model::{Author, CommitId, DETACHED_HEAD};

use super::{BackendError, CommitInfo, Vcs, WorkingCopy};

#[derive(Debug, Default)]
pub struct Calls {
    pub clones: AtomicUsize,
    pub fetch: AtomicUsize,
    pub log: AtomicUsize,
    pub checkout: AtomicUsize,
    pub commit: AtomicUsize,
    /// Calls that started while another call was still running.
    pub overlaps: AtomicUsize,
    active: AtomicUsize,
}

impl Calls {
    fn enter(&self, counter: Option<&AtomicUsize>) -> ActiveCall<'_> {
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        if self.active.fetch_add(1, Ordering::SeqCst) != 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        // Give a racing caller the chance to show up inside this call.
        std::thread::yield_now();
        ActiveCall(self)
    }
}

struct ActiveCall<'a>(&'a Calls);

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

#[derive(Debug, Clone)]
struct Node {
    info: CommitInfo,
    parent: Option<CommitId>,
}

#[derive(Debug, Clone, Default)]
struct History {
    commits: HashMap<CommitId, Node>,
    branches: BTreeMap<String, CommitId>,
    tags: BTreeMap<String, CommitId>,
}

impl History {
    fn add(
        &mut self,
        ids: &AtomicU64,
        parent: Option<CommitId>,
        summary: &str,
        author: &Author,
    ) -> CommitId {
        let n = ids.fetch_add(1, Ordering::SeqCst) + 1;
        let id: CommitId = format!("{n:040x}").parse().expect("40 hex characters");
        let info = CommitInfo {
            id: id.clone(),
            summary: summary.to_owned(),
            author: author.clone(),
            time: n as i64,
        };
        self.commits.insert(id.clone(), Node { info, parent });
        id
    }

    fn walk(&self, start: &CommitId, limit: usize) -> Vec<CommitInfo> {
        let mut log = Vec::new();
        let mut next = Some(start.clone());
        while let Some(id) = next.filter(|_| log.len() < limit) {
            let node = &self.commits[&id];
            log.push(node.info.clone());
            next = node.parent.clone();
        }
        log
    }
}

struct OriginState {
    history: History,
    default_branch: String,
    reachable: bool,
}

/// Upstream repository shared by the fake backend and the test driving it.
#[derive(Clone)]
pub struct MemoryOrigin {
    state: Arc<Mutex<OriginState>>,
    ids: Arc<AtomicU64>,
}

impl MemoryOrigin {
    /// An origin whose `main` branch holds a single commit.
    pub fn new() -> Self {
        let origin = MemoryOrigin {
            state: Arc::new(Mutex::new(OriginState {
                history: History::default(),
                default_branch: "main".to_owned(),
                reachable: true,
            })),
            ids: Arc::new(AtomicU64::new(0)),
        };
        origin.push_commit("main", "Initial commit");
        origin
    }

    pub fn push_commit(&self, branch: &str, summary: &str) -> CommitId {
        let mut state = self.state.lock().unwrap();
        let parent = state.history.branches.get(branch).cloned();
        let author = Author {
            name: "Origin".to_owned(),
            email: "origin@example.com".to_owned(),
        };
        let id = state.history.add(&self.ids, parent, summary, &author);
        state.history.branches.insert(branch.to_owned(), id.clone());
        id
    }

    pub fn tag(&self, name: &str, id: &CommitId) {
        let mut state = self.state.lock().unwrap();
        state.history.tags.insert(name.to_owned(), id.clone());
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unwrap().reachable = reachable;
    }

    pub fn head(&self, branch: &str) -> CommitId {
        self.state.lock().unwrap().history.branches[branch].clone()
    }

    fn snapshot(&self) -> Result<(History, String), BackendError> {
        let state = self.state.lock().unwrap();
        if !state.reachable {
            return Err(BackendError::Failed("origin is unreachable".to_owned()));
        }
        Ok((state.history.clone(), state.default_branch.clone()))
    }
}

pub struct MemoryVcs {
    pub uri: String,
    pub origin: MemoryOrigin,
    pub calls: Arc<Calls>,
}

impl MemoryVcs {
    pub fn new(uri: &str, origin: MemoryOrigin) -> Self {
        MemoryVcs {
            uri: uri.to_owned(),
            origin,
            calls: Arc::new(Calls::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Head {
    Branch(String),
    Detached(CommitId),
}

pub struct MemoryWorkingCopy {
    path: PathBuf,
    origin: MemoryOrigin,
    calls: Arc<Calls>,
    /// Commits plus local branches.
    local: History,
    /// Branches as last fetched from the origin.
    remote_branches: BTreeMap<String, CommitId>,
    head: Head,
}

impl Vcs for MemoryVcs {
    type WorkingCopy = MemoryWorkingCopy;

    fn clone_repository(&self, uri: &str, dest: &Path) -> Result<MemoryWorkingCopy, BackendError> {
        let _call = self.calls.enter(Some(&self.calls.clones));
        if uri != self.uri {
            return Err(BackendError::Failed(format!("repository {uri} does not exist")));
        }
        let (history, default_branch) = self.origin.snapshot()?;
        std::fs::create_dir_all(dest)?;

        let mut local = history.clone();
        let remote_branches = std::mem::take(&mut local.branches);
        local.branches.insert(
            default_branch.clone(),
            remote_branches[&default_branch].clone(),
        );
        Ok(MemoryWorkingCopy {
            path: dest.to_path_buf(),
            origin: self.origin.clone(),
            calls: Arc::clone(&self.calls),
            local,
            remote_branches,
            head: Head::Branch(default_branch),
        })
    }
}

impl MemoryWorkingCopy {
    fn head_commit(&self) -> Option<CommitId> {
        match &self.head {
            Head::Branch(name) => self.local.branches.get(name).cloned(),
            Head::Detached(id) => Some(id.clone()),
        }
    }

    fn resolve(&self, reference: &str) -> Option<CommitId> {
        if reference == DETACHED_HEAD {
            return self.head_commit();
        }
        self.remote_branches
            .get(reference)
            .or_else(|| self.local.tags.get(reference))
            .or_else(|| self.local.branches.get(reference))
            .cloned()
            .or_else(|| {
                let mut matches = self
                    .local
                    .commits
                    .keys()
                    .filter(|id| id.as_str().starts_with(reference));
                match (matches.next(), matches.next()) {
                    (Some(id), None) => Some(id.clone()),
                    _ => None,
                }
            })
    }
}

impl WorkingCopy for MemoryWorkingCopy {
    fn path(&self) -> &Path {
        &self.path
    }

    fn fetch(&mut self, remote: &str) -> Result<(), BackendError> {
        let _call = self.calls.enter(Some(&self.calls.fetch));
        if remote != "origin" {
            return Err(BackendError::Failed(format!("remote {remote} does not exist")));
        }
        let (history, _) = self.origin.snapshot()?;
        self.local.commits.extend(history.commits);
        self.local.tags.extend(history.tags);
        self.remote_branches = history.branches;
        Ok(())
    }

    fn log(&self, reference: &str, limit: usize) -> Result<Vec<CommitInfo>, BackendError> {
        let _call = self.calls.enter(Some(&self.calls.log));
        let start = self
            .resolve(reference)
            .ok_or_else(|| BackendError::ReferenceNotFound(reference.to_owned()))?;
        Ok(self.local.walk(&start, limit))
    }

    fn checkout(&mut self, commit: &CommitId) -> Result<CommitId, BackendError> {
        let _call = self.calls.enter(Some(&self.calls.checkout));
        let mut matches = self
            .local
            .commits
            .keys()
            .filter(|id| id.as_str().starts_with(commit.as_str()));
        let id = match (matches.next(), matches.next()) {
            (Some(id), None) => id.clone(),
            _ => return Err(BackendError::CommitNotFound(commit.to_string())),
        };
        self.head = Head::Detached(id.clone());
        Ok(id)
    }

    fn stage_all(&mut self) -> Result<(), BackendError> {
        let _call = self.calls.enter(None);
        Ok(())
    }

    fn commit(&mut self, message: &str, author: &Author) -> Result<CommitId, BackendError> {
        let _call = self.calls.enter(Some(&self.calls.commit));
        let parent = self.head_commit();
        let id = self.local.add(&self.origin.ids, parent, message, author);
        match &self.head {
            Head::Branch(name) => {
                self.local.branches.insert(name.clone(), id.clone());
            }
            Head::Detached(_) => self.head = Head::Detached(id.clone()),
        }
        Ok(id)
    }

    fn current_branch_name(&self) -> Result<Option<String>, BackendError> {
        let _call = self.calls.enter(None);
        Ok(match &self.head {
            Head::Branch(name) => Some(name.clone()),
            Head::Detached(_) => None,
        })
    }

    fn list_branches(&self) -> Result<Vec<String>, BackendError> {
        let _call = self.calls.enter(None);
        let local = self.local.branches.keys().cloned();
        let remote = self.remote_branches.keys().map(|name| format!("origin/{name}"));
        Ok(local.chain(remote).collect())
    }
}
