use std::{
    fmt::{self, Display},
    str::FromStr,
    sync::OnceLock,
};

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reference used as the resolution target when HEAD is detached.
pub const DETACHED_HEAD: &str = "HEAD";

const COMMIT_KEY_NAMESPACE: &str = "commit";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid commit id `{0}`: expected 4 to 40 hexadecimal characters")]
    InvalidCommitId(String),
    #[error("Invalid author `{0}`: expected `Name <email>`")]
    InvalidAuthor(String),
}

/// Hexadecimal identifier of a commit, full or abbreviated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommitId(String);

impl CommitId {
    pub const FULL_LENGTH: usize = 40;
    const MIN_LENGTH: usize = 4;

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_full(&self) -> bool {
        self.0.len() == Self::FULL_LENGTH
    }
}

impl FromStr for CommitId {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let valid_length = (Self::MIN_LENGTH..=Self::FULL_LENGTH).contains(&value.len());
        if valid_length && value.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(CommitId(value.to_ascii_lowercase()))
        } else {
            Err(ParseError::InvalidCommitId(value.to_owned()))
        }
    }
}

impl TryFrom<String> for CommitId {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CommitId> for String {
    fn from(value: CommitId) -> Self {
        value.0
    }
}

impl Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity recorded as both author and committer, written as `Name <email>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub name: String,
    pub email: String,
}

impl FromStr for Author {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        static AUTHOR_REGEX: OnceLock<Regex> = OnceLock::new();
        let re = AUTHOR_REGEX.get_or_init(|| {
            Regex::new(r"^\s*(?P<name>[^<>]*[^<>\s])\s*<(?P<email>[^<>\s]+)>\s*$")
                .expect("author pattern is valid")
        });
        let captures = re
            .captures(value)
            .ok_or_else(|| ParseError::InvalidAuthor(value.to_owned()))?;

        Ok(Author {
            name: captures["name"].to_owned(),
            email: captures["email"].to_owned(),
        })
    }
}

impl Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

/// A version requested by a caller: a branch, a tag or a commit id.
///
/// Blank input is normalized to "no version", meaning whatever branch is
/// currently checked out.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Version(Option<String>);

impl Version {
    pub fn new(raw: Option<&str>) -> Self {
        Version(
            raw.map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_owned),
        )
    }

    pub fn current() -> Self {
        Version(None)
    }

    pub fn name(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl From<&str> for Version {
    fn from(value: &str) -> Self {
        Version::new(Some(value))
    }
}

impl From<Option<&str>> for Version {
    fn from(value: Option<&str>) -> Self {
        Version::new(value)
    }
}

/// Cache key under which the commit id of `target` is stored.
pub fn commit_cache_key(target: &str) -> String {
    format!("{COMMIT_KEY_NAMESPACE}:{target}")
}
