use std::path::{Path, PathBuf};

use git2::{
    build::{CheckoutBuilder, RepoBuilder},
    AutotagOption, BranchType, Commit, Config, Cred, CredentialType, ErrorCode, FetchOptions,
    FetchPrune, IndexAddOption, Oid, RemoteCallbacks, Repository, Signature, Sort,
};
use log::{debug, info, trace};

use crate::model::{Author, CommitId, DETACHED_HEAD};

use super::{BackendError, CommitInfo, Vcs, WorkingCopy};

/// [`Vcs`] backed by libgit2.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitBackend;

pub struct GitWorkingCopy {
    path: PathBuf,
    git_repo: Repository,
}

impl Vcs for GitBackend {
    type WorkingCopy = GitWorkingCopy;

    fn clone_repository(&self, uri: &str, dest: &Path) -> Result<GitWorkingCopy, BackendError> {
        info!("Cloning {} into {}", uri, dest.display());
        let git_repo = RepoBuilder::new()
            .fetch_options(fetch_options())
            .clone(uri, dest)?;
        Ok(GitWorkingCopy {
            path: dest.to_path_buf(),
            git_repo,
        })
    }
}

impl GitWorkingCopy {
    pub fn open(path: &Path) -> Result<Self, BackendError> {
        trace!("Opening existing repository at {}", path.display());
        Ok(GitWorkingCopy {
            path: path.to_path_buf(),
            git_repo: Repository::open(path)?,
        })
    }

    /// Looks `reference` up as a remote branch, then a tag, then any revision git understands.
    fn resolve_reference(&self, reference: &str) -> Result<Oid, BackendError> {
        if reference != DETACHED_HEAD {
            for candidate in [
                format!("refs/remotes/origin/{reference}"),
                format!("refs/tags/{reference}"),
            ] {
                match self.git_repo.find_reference(&candidate) {
                    Ok(found) => {
                        trace!("Resolved {} through {}", reference, candidate);
                        return Ok(found.peel_to_commit()?.id());
                    }
                    Err(e) if is_missing(&e) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        match self.git_repo.revparse_single(reference) {
            Ok(object) => Ok(object.peel_to_commit()?.id()),
            Err(e) if is_missing(&e) => Err(BackendError::ReferenceNotFound(reference.to_owned())),
            Err(e) => Err(e.into()),
        }
    }

    fn head_commit(&self) -> Result<Option<Commit<'_>>, BackendError> {
        match self.git_repo.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?)),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl WorkingCopy for GitWorkingCopy {
    fn path(&self) -> &Path {
        &self.path
    }

    fn fetch(&mut self, remote: &str) -> Result<(), BackendError> {
        let mut remote = self.git_repo.find_remote(remote)?;
        let refspecs: Vec<String> = remote
            .refspecs()
            .filter_map(|refspec| refspec.str().map(|s| s.to_string()))
            .collect();
        debug!("Fetching {:?} from {:?}", refspecs, remote.url());
        remote.fetch(&refspecs, Some(&mut fetch_options()), None)?;
        Ok(())
    }

    fn log(&self, reference: &str, limit: usize) -> Result<Vec<CommitInfo>, BackendError> {
        let start = self.resolve_reference(reference)?;
        let mut walk = self.git_repo.revwalk()?;
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;
        walk.push(start)?;

        walk.take(limit)
            .map(|oid| -> Result<CommitInfo, BackendError> {
                let commit = self.git_repo.find_commit(oid?)?;
                Ok(commit_info(&commit))
            })
            .collect()
    }

    fn checkout(&mut self, commit: &CommitId) -> Result<CommitId, BackendError> {
        let target = self
            .git_repo
            .find_commit_by_prefix(commit.as_str())
            .map_err(|e| {
                if is_missing(&e) || e.code() == ErrorCode::Ambiguous {
                    BackendError::CommitNotFound(commit.to_string())
                } else {
                    e.into()
                }
            })?;

        // HEAD only moves once the tree has been written out.
        self.git_repo
            .checkout_tree(target.as_object(), Some(CheckoutBuilder::new().safe()))?;
        self.git_repo.set_head_detached(target.id())?;

        Ok(target.id().into())
    }

    fn stage_all(&mut self) -> Result<(), BackendError> {
        let mut index = self.git_repo.index()?;
        index.add_all(["*"], IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"], None)?;
        index.write()?;
        Ok(())
    }

    fn commit(&mut self, message: &str, author: &Author) -> Result<CommitId, BackendError> {
        let signature = Signature::now(&author.name, &author.email)?;
        let tree_id = self.git_repo.index()?.write_tree()?;
        let tree = self.git_repo.find_tree(tree_id)?;
        let parent = self.head_commit()?;
        let parents: Vec<&Commit> = parent.iter().collect();

        let oid = self.git_repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &tree,
            &parents,
        )?;
        Ok(oid.into())
    }

    fn current_branch_name(&self) -> Result<Option<String>, BackendError> {
        if self.git_repo.head_detached()? {
            return Ok(None);
        }
        // Unborn branches still have a symbolic HEAD naming them.
        let head = self.git_repo.find_reference("HEAD")?;
        let name = match head.symbolic_target() {
            Some(target) => target.strip_prefix("refs/heads/").map(str::to_owned),
            None => head.shorthand().map(str::to_owned),
        };
        Ok(name)
    }

    fn list_branches(&self) -> Result<Vec<String>, BackendError> {
        let mut names = Vec::new();
        for branch in self.git_repo.branches(None)? {
            let (branch, kind) = branch?;
            if let Some(name) = branch.name()? {
                match kind {
                    BranchType::Local => names.push(name.to_owned()),
                    BranchType::Remote if !name.ends_with("/HEAD") => names.push(name.to_owned()),
                    BranchType::Remote => {}
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

impl From<Oid> for CommitId {
    fn from(oid: Oid) -> Self {
        oid.to_string()
            .parse()
            .expect("git object ids are 40 hex characters")
    }
}

fn commit_info(commit: &Commit) -> CommitInfo {
    let author = commit.author();
    CommitInfo {
        id: commit.id().into(),
        summary: commit.summary().unwrap_or_default().to_owned(),
        author: Author {
            name: author.name().unwrap_or_default().to_owned(),
            email: author.email().unwrap_or_default().to_owned(),
        },
        time: commit.time().seconds(),
    }
}

fn is_missing(error: &git2::Error) -> bool {
    matches!(
        error.code(),
        ErrorCode::NotFound | ErrorCode::InvalidSpec | ErrorCode::UnbornBranch
    )
}

fn fetch_options<'a>() -> FetchOptions<'a> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(|url, username, allowed_types| {
        trace!(
            "Requested credentials for {}, username {:?}, allowed types {:?}",
            url,
            username,
            allowed_types
        );
        if allowed_types.contains(CredentialType::USERNAME) {
            return Cred::username("git");
        }
        if allowed_types.contains(CredentialType::SSH_KEY) {
            return Cred::ssh_key_from_agent(username.unwrap_or("git"));
        }
        if allowed_types.contains(CredentialType::USER_PASS_PLAINTEXT) {
            let git_config = Config::open_default()?;
            return Cred::credential_helper(&git_config, url, username);
        }
        Err(git2::Error::from_str("no valid authentication available"))
    });

    let mut fetch_options = FetchOptions::new();
    fetch_options
        .remote_callbacks(callbacks)
        .download_tags(AutotagOption::All)
        .prune(FetchPrune::On);
    fetch_options
}
