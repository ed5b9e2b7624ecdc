pub mod cache;
pub mod cli;
pub mod config;
pub mod git;
pub mod http;
pub mod manager;
pub mod model;

mod flock;

pub use manager::{GitRepositoryManager, RepoError, RepositoryManager, ResolvedCommit};
