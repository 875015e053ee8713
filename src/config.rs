//! Agent configuration.
//!
//! Backed by an INI file; lists are comma-separated. CLI flags override
//! the file. A missing file at the default location is not an error —
//! the agent then runs entirely on defaults and flags.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ini::{Ini, Properties};

pub const DEFAULT_CONFIG_FILE: &str = "/etc/vigil.ini";
pub const DEFAULT_DATABASE: &str = "/var/lib/vigil.db";
const DEFAULT_BPF_OBJECT: &str = "/usr/lib/vigil/vfs.bpf.o";

const AGENT_SECTION: &str = "vigil";
const CONSUMERS_SECTION: &str = "consumers";

#[derive(Debug, Clone)]
pub struct Config {
    pub level: String,
    pub database: PathBuf,
    pub bpf_object: PathBuf,
    pub keyfile: Option<PathBuf>,
    pub consumers: ConsumerPaths,
}

#[derive(Debug, Clone, Default)]
pub struct ConsumerPaths {
    /// Optional prefix all other consumer paths are interpreted under.
    pub root: Option<PathBuf>,
    pub access: Option<PathBuf>,
    pub passwd: Option<PathBuf>,
    pub shadow: Option<PathBuf>,
    pub generic: Vec<String>,
    pub generic_diff: Vec<String>,
    pub excludes: Vec<String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            level: "info".to_string(),
            database: PathBuf::from(DEFAULT_DATABASE),
            bpf_object: PathBuf::from(DEFAULT_BPF_OBJECT),
            keyfile: None,
            consumers: ConsumerPaths::default(),
        }
    }
}

impl Config {
    /// Load configuration from `path`. The file may be absent only when
    /// it is the default location.
    pub fn load(path: &Path) -> Result<Config> {
        if !path.exists() {
            if path == Path::new(DEFAULT_CONFIG_FILE) {
                return Ok(Config::default());
            }
            anyhow::bail!("configuration file {} not found", path.display());
        }
        let ini = Ini::load_from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?;
        Ok(Config::from_ini(&ini))
    }

    fn from_ini(ini: &Ini) -> Config {
        let defaults = Config::default();
        let agent = Section(ini.section(Some(AGENT_SECTION)));
        let consumers = Section(ini.section(Some(CONSUMERS_SECTION)));
        Config {
            level: agent
                .get("level")
                .unwrap_or(defaults.level.as_str())
                .to_string(),
            database: agent.path("database").unwrap_or(defaults.database),
            bpf_object: agent.path("bpf_object").unwrap_or(defaults.bpf_object),
            keyfile: agent.path("keyfile"),
            consumers: ConsumerPaths {
                root: consumers.path("root"),
                access: consumers.path("access"),
                passwd: consumers.path("passwd"),
                shadow: consumers.path("shadow"),
                generic: consumers.list("generic"),
                generic_diff: consumers.list("generic_diff"),
                excludes: consumers.list("excludes"),
            },
        }
    }
}

/// Typed access over one INI section that may be absent entirely.
struct Section<'a>(Option<&'a Properties>);

impl Section<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .and_then(|p| p.get(key))
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    fn path(&self, key: &str) -> Option<PathBuf> {
        self.get(key).map(PathBuf::from)
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}
