//! Configuration management for the node.

use crate::crypto::{FileKeyProvider, KeyProvider, StaticKeyProvider};
use crate::retention::RetentionPolicy;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const DAY_SECS: u64 = 24 * 60 * 60;

/// Field encrypted when no field is named in `TALLY_SENSITIVE`.
pub const DEFAULT_SENSITIVE_FIELD: &str = "payload";

/// A collection whose designated field is encrypted at rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensitiveCollection {
    pub collection: String,
    pub field: String,
}

/// Node configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of all persisted state
    pub data_dir: PathBuf,
    /// Identity of this node; generated and persisted when unset
    pub node_id: Option<String>,
    /// Branch (tenant) opened at startup
    pub branch: String,
    /// Actor recorded on writes that do not name one
    pub actor: String,
    /// Passphrase for encryption at rest
    pub encryption_key: Option<String>,
    /// File holding the passphrase, used when `encryption_key` is unset
    pub encryption_key_file: Option<PathBuf>,
    /// Open sensitive collections without a key, storing them in clear
    pub allow_plaintext_sensitive: bool,
    pub sensitive: Vec<SensitiveCollection>,
    /// Snapshots always kept, newest first (`None` disables the rule)
    pub retention_keep: Option<usize>,
    /// Snapshots younger than this are kept (`None` disables the rule)
    pub retention_max_age: Option<Duration>,
    pub retention_interval: Duration,
    /// Interval of automatic backups; disabled when `None`
    pub auto_backup_interval: Option<Duration>,
    /// Encrypt automatic backups with the store key
    pub backup_encrypt: bool,
    /// Acknowledged change-log entries older than this are purged
    pub changelog_retention: Option<Duration>,
}

impl Config {
    /// Defaults rooted at `data_dir`, for embedding and tests.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            node_id: None,
            branch: "main".to_string(),
            actor: "system".to_string(),
            encryption_key: None,
            encryption_key_file: None,
            allow_plaintext_sensitive: false,
            sensitive: Vec::new(),
            retention_keep: Some(7),
            retention_max_age: Some(Duration::from_secs(30 * DAY_SECS)),
            retention_interval: Duration::from_secs(DAY_SECS),
            auto_backup_interval: None,
            backup_encrypt: false,
            changelog_retention: Some(Duration::from_secs(30 * DAY_SECS)),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = env::var("TALLY_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
        let mut config = Self::new(data_dir);

        config.node_id = non_empty("TALLY_NODE_ID");
        if let Some(branch) = non_empty("TALLY_BRANCH") {
            config.branch = branch;
        }
        if let Some(actor) = non_empty("TALLY_ACTOR") {
            config.actor = actor;
        }
        config.encryption_key = non_empty("TALLY_ENCRYPTION_KEY");
        config.encryption_key_file = non_empty("TALLY_ENCRYPTION_KEY_FILE").map(PathBuf::from);
        config.allow_plaintext_sensitive = parse_bool("TALLY_ALLOW_PLAINTEXT_SENSITIVE")?;
        config.backup_encrypt = parse_bool("TALLY_BACKUP_ENCRYPT")?;

        if let Some(list) = non_empty("TALLY_SENSITIVE") {
            config.sensitive = parse_sensitive(&list)?;
        }

        if let Some(keep) = parse_u64("TALLY_RETENTION_KEEP")? {
            config.retention_keep = (keep > 0).then_some(keep as usize);
        }
        if let Some(days) = parse_u64("TALLY_RETENTION_DAYS")? {
            config.retention_max_age = (days > 0).then(|| Duration::from_secs(days * DAY_SECS));
        }
        if let Some(secs) = parse_u64("TALLY_RETENTION_INTERVAL_SECS")? {
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    var: "TALLY_RETENTION_INTERVAL_SECS",
                    reason: "must be positive".to_string(),
                });
            }
            config.retention_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64("TALLY_AUTO_BACKUP_INTERVAL_SECS")? {
            config.auto_backup_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(days) = parse_u64("TALLY_CHANGELOG_RETENTION_DAYS")? {
            config.changelog_retention = (days > 0).then(|| Duration::from_secs(days * DAY_SECS));
        }

        Ok(config)
    }

    /// The configured key source, if any. An inline key wins over a key file.
    pub fn key_provider(&self) -> Option<Arc<dyn KeyProvider>> {
        if let Some(key) = &self.encryption_key {
            return Some(Arc::new(StaticKeyProvider::new(key.as_bytes().to_vec())));
        }
        self.encryption_key_file
            .as_ref()
            .map(|path| Arc::new(FileKeyProvider::new(path.clone())) as Arc<dyn KeyProvider>)
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            keep_last: self.retention_keep,
            max_age: self.retention_max_age,
        }
    }
}

fn non_empty(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(var: &'static str) -> Result<bool, ConfigError> {
    match non_empty(var).as_deref() {
        None => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            var,
            reason: format!("expected a boolean, got '{other}'"),
        }),
    }
}

fn parse_u64(var: &'static str) -> Result<Option<u64>, ConfigError> {
    non_empty(var)
        .map(|v| {
            v.parse().map_err(|_| ConfigError::Invalid {
                var,
                reason: format!("expected a non-negative integer, got '{v}'"),
            })
        })
        .transpose()
}

/// Parse `collection[:field]` entries separated by commas.
pub fn parse_sensitive(list: &str) -> Result<Vec<SensitiveCollection>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (collection, field) = match entry.split_once(':') {
                Some((c, f)) => (c.trim(), f.trim()),
                None => (entry, DEFAULT_SENSITIVE_FIELD),
            };
            if collection.is_empty() || field.is_empty() {
                return Err(ConfigError::Invalid {
                    var: "TALLY_SENSITIVE",
                    reason: format!("malformed entry '{entry}'"),
                });
            }
            Ok(SensitiveCollection {
                collection: collection.to_string(),
                field: field.to_string(),
            })
        })
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::new("/tmp/tally");
        assert_eq!(config.branch, "main");
        assert_eq!(config.actor, "system");
        assert_eq!(config.retention_keep, Some(7));
        assert_eq!(config.retention_max_age, Some(Duration::from_secs(30 * DAY_SECS)));
        assert_eq!(config.retention_interval, Duration::from_secs(DAY_SECS));
        assert!(config.auto_backup_interval.is_none());
        assert!(config.key_provider().is_none());
    }

    #[test]
    fn sensitive_list() {
        let parsed = parse_sensitive("users, cards:pan ,").unwrap();
        assert_eq!(
            parsed,
            vec![
                SensitiveCollection {
                    collection: "users".into(),
                    field: "payload".into()
                },
                SensitiveCollection {
                    collection: "cards".into(),
                    field: "pan".into()
                },
            ]
        );
        assert!(parse_sensitive("users:").is_err());
        assert!(parse_sensitive(":pan").is_err());
    }

    #[test]
    fn inline_key_wins_over_file() {
        let mut config = Config::new("/tmp/tally");
        config.encryption_key_file = Some("/nonexistent".into());
        assert!(format!("{:?}", config.key_provider().unwrap()).contains("FileKeyProvider"));

        config.encryption_key = Some("k".into());
        assert!(format!("{:?}", config.key_provider().unwrap()).contains("StaticKeyProvider"));
    }

    #[test]
    fn retention_policy_from_config() {
        let mut config = Config::new("/tmp/tally");
        config.retention_keep = Some(5);
        config.retention_max_age = None;
        let policy = config.retention_policy();
        assert_eq!(policy.keep_last, Some(5));
        assert!(policy.max_age.is_none());
    }
}
