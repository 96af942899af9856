//! Configuration.
//!
//! [`Settings`] are read once from an optional file overlaid by environment
//! variables. [`ClassConfig`] carries the per-entity overrides given at
//! declaration time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::driver::{DialectKind, FlatfileFormat};
use crate::error::Result;

/// Process-wide settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub db: DbSettings,
    /// Base directory of flatfile stores.
    #[serde(default = "default_flatfile_root")]
    pub flatfile_root: PathBuf,
    /// Scratch space; SQLite files live under `scratch_root/sqlite`.
    #[serde(default = "default_scratch_root")]
    pub scratch_root: PathBuf,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub archive: ArchiveSettings,
    /// Only this host may write flatfiles, when set.
    #[serde(default)]
    pub flatfile_master_host: Option<String>,
    /// Name of this host. Detected when absent.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Pause before the single reconnect attempt after a dropped connection.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DbSettings {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
    /// Maintenance database for connectors that need one to log in.
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub sqlite_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheSettings {
    /// Cache endpoints, handed to cache implementations that talk to servers.
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub default_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveSettings {
    #[serde(default = "default_archive_dir")]
    pub dir_name: String,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self { dir_name: default_archive_dir() }
    }
}

fn default_flatfile_root() -> PathBuf {
    PathBuf::from("./data")
}

fn default_scratch_root() -> PathBuf {
    PathBuf::from("./scratch")
}

fn default_archive_dir() -> String {
    "RCS".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    250
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db: DbSettings::default(),
            flatfile_root: default_flatfile_root(),
            scratch_root: default_scratch_root(),
            cache: CacheSettings::default(),
            archive: ArchiveSettings::default(),
            flatfile_master_host: None,
            hostname: None,
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl Settings {
    /// Loads settings from `path`, or from `nodeclad.{toml,yaml,json}` in the
    /// working directory when no path is given. Environment variables
    /// override file values, nested with `__` (e.g. `NODECLAD__DB__HOST`).
    pub fn load(path: Option<&str>) -> Result<Self> {
        let builder = ::config::Config::builder();

        let builder = if let Some(path) = path {
            builder.add_source(::config::File::with_name(path))
        } else {
            builder.add_source(::config::File::with_name("nodeclad").required(false))
        };

        let builder = builder.add_source(
            ::config::Environment::with_prefix("NODECLAD")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Settings rooted in a scratch directory, for tests.
    pub fn for_test(root: &Path) -> Self {
        Self {
            flatfile_root: root.join("data"),
            scratch_root: root.join("scratch"),
            hostname: Some("localhost".to_string()),
            reconnect_delay_ms: 0,
            ..Self::default()
        }
    }

    pub fn sqlite_root(&self) -> PathBuf {
        self.db.sqlite_root.clone().unwrap_or_else(|| self.scratch_root.join("sqlite"))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// The configured host name, else the kernel's, else `$HOSTNAME`.
    pub fn hostname(&self) -> String {
        if let Some(name) = &self.hostname {
            return name.clone();
        }
        std::fs::read_to_string("/proc/sys/kernel/hostname")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// Connection parameters for `database`, with per-entity overrides applied.
    pub fn credentials(&self, database: &str, overrides: &CredentialOverrides) -> Credentials {
        Credentials {
            host: overrides.host.clone().or_else(|| self.db.host.clone()),
            port: overrides.port.or(self.db.port),
            user: overrides.user.clone().or_else(|| self.db.user.clone()),
            pass: overrides.pass.clone().or_else(|| self.db.pass.clone()),
            database: database.to_string(),
        }
    }
}

/// Everything a connector needs to open a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub database: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub pass: Option<String>,
}

/// How a save reaches the row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SaveStrategy {
    /// UPDATE by primary key, INSERT when no row was touched. Two concurrent
    /// first saves of the same key can both reach the INSERT; the loser gets
    /// a key violation.
    #[default]
    UpdateThenInsert,
    /// A single `INSERT ... ON CONFLICT` (or `ON DUPLICATE KEY UPDATE`).
    NativeUpsert,
}

/// Per-entity configuration.
#[derive(Debug, Clone)]
pub struct ClassConfig {
    pub use_db: bool,
    pub dialect: DialectKind,
    pub flatfile: Option<FlatfileFormat>,
    pub use_archive: bool,
    pub cache_ttl: Option<Duration>,
    /// Emit REFERENCES clauses. Defaults per dialect when unset.
    pub foreign_keys: Option<bool>,
    pub primary_key: String,
    pub database: Option<String>,
    pub table: Option<String>,
    pub credentials: CredentialOverrides,
    pub flatfile_root: Option<PathBuf>,
    pub flatfile_master_host: Option<String>,
    pub save_strategy: SaveStrategy,
}

impl Default for ClassConfig {
    fn default() -> Self {
        Self {
            use_db: true,
            dialect: DialectKind::Sqlite,
            flatfile: None,
            use_archive: false,
            cache_ttl: None,
            foreign_keys: None,
            primary_key: "id".to_string(),
            database: None,
            table: None,
            credentials: CredentialOverrides::default(),
            flatfile_root: None,
            flatfile_master_host: None,
            save_strategy: SaveStrategy::default(),
        }
    }
}

impl ClassConfig {
    /// SQL storage in the given dialect.
    pub fn sql(dialect: DialectKind) -> Self {
        Self { dialect, ..Self::default() }
    }
    /// Flatfile storage only.
    pub fn flatfile(format: FlatfileFormat) -> Self {
        Self { use_db: false, flatfile: Some(format), ..Self::default() }
    }
    /// Adds a flatfile copy next to the SQL row.
    pub fn with_flatfile(mut self, format: FlatfileFormat) -> Self {
        self.flatfile = Some(format);
        self
    }
    pub fn with_archive(mut self) -> Self {
        self.use_archive = true;
        self
    }
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }
    pub fn with_foreign_keys(mut self, enabled: bool) -> Self {
        self.foreign_keys = Some(enabled);
        self
    }
    pub fn with_primary_key(mut self, attribute: &str) -> Self {
        self.primary_key = attribute.to_string();
        self
    }
    pub fn with_database(mut self, database: &str) -> Self {
        self.database = Some(database.to_string());
        self
    }
    pub fn with_table(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }
    pub fn with_credentials(mut self, credentials: CredentialOverrides) -> Self {
        self.credentials = credentials;
        self
    }
    pub fn with_flatfile_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.flatfile_root = Some(root.into());
        self
    }
    pub fn with_master_host(mut self, host: &str) -> Self {
        self.flatfile_master_host = Some(host.to_string());
        self
    }
    pub fn with_save_strategy(mut self, strategy: SaveStrategy) -> Self {
        self.save_strategy = strategy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_a_file() {
        let settings = Settings::default();
        assert_eq!(settings.flatfile_root, PathBuf::from("./data"));
        assert_eq!(settings.sqlite_root(), PathBuf::from("./scratch").join("sqlite"));
        assert_eq!(settings.archive.dir_name, "RCS");
        assert_eq!(settings.reconnect_delay(), Duration::from_millis(250));
    }

    #[test]
    fn entity_overrides_win_over_settings() {
        let mut settings = Settings::default();
        settings.db.host = Some("db.internal".into());
        settings.db.user = Some("app".into());
        let overrides = CredentialOverrides { user: Some("reporting".into()), ..Default::default() };
        let credentials = settings.credentials("shop", &overrides);
        assert_eq!(credentials.host.as_deref(), Some("db.internal"));
        assert_eq!(credentials.user.as_deref(), Some("reporting"));
        assert_eq!(credentials.database, "shop");
    }

    #[test]
    fn configured_hostname_is_used_verbatim() {
        let settings = Settings { hostname: Some("master-1".into()), ..Settings::default() };
        assert_eq!(settings.hostname(), "master-1");
    }
}
