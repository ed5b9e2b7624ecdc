use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::bail;
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use crate::cache::{Cache, MemoryCache};

const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_LISTEN: &str = "127.0.0.1:3000";

pub struct RepogateConfig {
    pub origin_uri: String,
    pub working_copy: PathBuf,
    /// Zero disables caching.
    pub cache_ttl: Duration,
    pub listen: String,
}

/// Values given on the command line, applied over every other source.
#[derive(Default, Debug, Clone)]
pub struct Overrides {
    pub origin_uri: Option<String>,
    pub working_copy: Option<PathBuf>,
    pub cache_ttl: Option<u64>,
    pub listen: Option<String>,
}

impl RepogateConfig {
    /// Loads defaults, then `file` if it exists, then `REPOGATE_*` environment variables.
    pub fn load(file: &Path, overrides: Overrides) -> anyhow::Result<Self> {
        let raw_config = RawConfig::load(Some(file), overrides, None)?;
        Self::from_raw(raw_config)
    }

    fn from_raw(raw_config: RawConfig) -> anyhow::Result<Self> {
        let Some(origin_uri) = raw_config.repo.uri.filter(|uri| !uri.trim().is_empty()) else {
            bail!("No repository configured, set repo.uri or REPOGATE_REPO_URI");
        };
        Ok(Self {
            origin_uri,
            working_copy: raw_config.repo.path,
            cache_ttl: Duration::from_secs(raw_config.cache.ttl),
            listen: raw_config.server.listen,
        })
    }

    pub fn cache(&self) -> Option<Arc<dyn Cache>> {
        if self.cache_ttl.is_zero() {
            None
        } else {
            Some(Arc::new(MemoryCache::new(self.cache_ttl)))
        }
    }
}

fn default_working_copy() -> PathBuf {
    std::env::temp_dir().join("repogate").join("working-copy")
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
struct RawConfig {
    repo: RepoConfig,
    cache: CacheConfig,
    server: ServerConfig,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
struct RepoConfig {
    uri: Option<String>,
    path: PathBuf,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
struct CacheConfig {
    ttl: u64,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
struct ServerConfig {
    listen: String,
}

impl RawConfig {
    fn load(
        file: Option<&Path>,
        overrides: Overrides,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default(
                "repo.path",
                default_working_copy().to_string_lossy().into_owned(),
            )?
            .set_default("cache.ttl", DEFAULT_CACHE_TTL_SECS)?
            .set_default("server.listen", DEFAULT_LISTEN)?;
        if let Some(file) = file {
            builder = builder.add_source(File::from(file).format(FileFormat::Toml).required(false));
        }
        builder
            .add_source(
                Environment::with_prefix("REPOGATE")
                    .separator("_")
                    .source(env),
            )
            .set_override_option("repo.uri", overrides.origin_uri)?
            .set_override_option(
                "repo.path",
                overrides
                    .working_copy
                    .map(|path| path.to_string_lossy().into_owned()),
            )?
            .set_override_option("cache.ttl", overrides.cache_ttl)?
            .set_override_option("server.listen", overrides.listen)?
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn load_empty() {
        let env = HashMap::from([]);
        let config = RawConfig::load(None, Overrides::default(), Some(env)).unwrap();
        assert_eq!(
            config,
            RawConfig {
                repo: RepoConfig {
                    uri: None,
                    path: default_working_copy(),
                },
                cache: CacheConfig { ttl: 300 },
                server: ServerConfig {
                    listen: "127.0.0.1:3000".to_owned()
                }
            }
        )
    }

    #[test]
    fn load_environment() {
        let env = HashMap::from([
            (
                "REPOGATE_REPO_URI".to_owned(),
                "https://example.com/repo.git".to_owned(),
            ),
            ("REPOGATE_REPO_PATH".to_owned(), "/srv/repo".to_owned()),
            ("REPOGATE_CACHE_TTL".to_owned(), "60".to_owned()),
            ("REPOGATE_SERVER_LISTEN".to_owned(), "0.0.0.0:8080".to_owned()),
        ]);
        let config = RawConfig::load(None, Overrides::default(), Some(env)).unwrap();
        assert_eq!(
            config,
            RawConfig {
                repo: RepoConfig {
                    uri: Some("https://example.com/repo.git".to_owned()),
                    path: "/srv/repo".into(),
                },
                cache: CacheConfig { ttl: 60 },
                server: ServerConfig {
                    listen: "0.0.0.0:8080".to_owned()
                }
            }
        )
    }

    #[test]
    fn load_file_environment_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("repogate.toml");
        std::fs::write(
            &file,
            r#"
[repo]
uri = "https://example.com/from-file.git"
path = "/from/file"

[cache]
ttl = 10
"#,
        )
        .unwrap();
        let env = HashMap::from([("REPOGATE_CACHE_TTL".to_owned(), "20".to_owned())]);
        let overrides = Overrides {
            working_copy: Some("/from/cli".into()),
            ..Default::default()
        };

        let config = RawConfig::load(Some(&file), overrides, Some(env)).unwrap();

        assert_eq!(
            config,
            RawConfig {
                repo: RepoConfig {
                    uri: Some("https://example.com/from-file.git".to_owned()),
                    path: "/from/cli".into(),
                },
                cache: CacheConfig { ttl: 20 },
                server: ServerConfig {
                    listen: "127.0.0.1:3000".to_owned()
                }
            }
        )
    }

    #[test]
    fn missing_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let config = RawConfig::load(
            Some(&dir.path().join("missing.toml")),
            Overrides::default(),
            Some(HashMap::new()),
        )
        .unwrap();
        assert_eq!(config.cache, CacheConfig { ttl: 300 });
    }

    #[test]
    fn origin_is_required() {
        let raw_config = RawConfig::load(None, Overrides::default(), Some(HashMap::new())).unwrap();
        assert!(RepogateConfig::from_raw(raw_config).is_err());
    }

    #[test]
    fn zero_ttl_disables_cache() {
        let overrides = Overrides {
            origin_uri: Some("https://example.com/repo.git".to_owned()),
            cache_ttl: Some(0),
            ..Default::default()
        };
        let raw_config = RawConfig::load(None, overrides, Some(HashMap::new())).unwrap();
        let config = RepogateConfig::from_raw(raw_config).unwrap();
        assert!(config.cache().is_none());
    }
}
