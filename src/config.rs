use std::collections::BTreeMap;
use std::fs;

use failure::{bail, Error, ResultExt};
use serde::Deserialize;

use crate::topic::TopicSpec;

/// Engine configuration, loaded from one YAML document. Dotted option
/// names are literal keys. Unrecognized top-level keys are ignored.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Minimum seconds between backups; 0 disables periodic backups.
    #[serde(rename = "backup.time.s", default = "default_backup_time_s")]
    pub backup_time_s: u64,
    /// Minimum seconds between commits; 0 disables periodic commits.
    #[serde(rename = "commit.time.s", default)]
    pub commit_time_s: u64,
    /// Pending-set size that forces an emit pass.
    #[serde(
        rename = "create.records.trigger",
        default = "default_create_records_trigger"
    )]
    pub create_records_trigger: usize,
    /// Total lag at or below which the idle scheduler drains pending work.
    #[serde(rename = "total.lag.trigger", default = "default_total_lag_trigger")]
    pub total_lag_trigger: u64,
    /// Strip the leading `<prefix>.` from external topic names when
    /// matching transaction `data_collections`.
    #[serde(rename = "topics.prefixed", default = "default_true")]
    pub topics_prefixed: bool,
    /// Take a final backup after a clean run.
    #[serde(rename = "backup.on.shutdown", default)]
    pub backup_on_shutdown: bool,
    #[serde(rename = "rocks.db.path", default)]
    pub db_path: Option<String>,
    #[serde(rename = "rocks.db.backup.path", default)]
    pub db_backup_path: Option<String>,
    #[serde(
        rename = "rocks.db.backups.to.keep",
        default = "default_backups_to_keep"
    )]
    pub backups_to_keep: usize,
    /// Per-topic configuration; `default` is merged under each topic.
    #[serde(default)]
    pub topics: BTreeMap<String, BTreeMap<String, serde_yaml::Value>>,
}

fn default_backup_time_s() -> u64 {
    1800
}

fn default_create_records_trigger() -> usize {
    250_000
}

fn default_total_lag_trigger() -> u64 {
    2000
}

fn default_backups_to_keep() -> usize {
    5
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        serde_yaml::from_str("{}").unwrap()
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Config, Error> {
        let path = path.strip_prefix("file://").unwrap_or(path);
        let raw = fs::read_to_string(path)
            .with_context(|_| format!("could not read config file {}", path))?;
        let config: Config = serde_yaml::from_str(&raw)
            .with_context(|_| format!("could not parse config file {}", path))?;
        Ok(config)
    }

    /// The merged configuration view for one topic: `topics.default`
    /// overlaid with `topics.<short name>`.
    pub fn topic_spec(&self, short_name: &str) -> TopicSpec {
        let mut options = self.topics.get("default").cloned().unwrap_or_default();
        if let Some(specific) = self.topics.get(short_name) {
            for (key, value) in specific {
                options.insert(key.clone(), value.clone());
            }
        }
        TopicSpec::new(short_name.to_string(), options)
    }

    /// The state store directory; required for the CLI entry point.
    pub fn db_path(&self) -> Result<&str, Error> {
        match self.db_path {
            Some(ref path) => Ok(path),
            None => bail!("config is missing 'rocks.db.path'"),
        }
    }

    /// The backup directory, defaulting next to the store.
    pub fn db_backup_path(&self) -> Result<String, Error> {
        match self.db_backup_path {
            Some(ref path) => Ok(path.clone()),
            None => Ok(format!("{}-backup", self.db_path()?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.backup_time_s, 1800);
        assert_eq!(config.commit_time_s, 0);
        assert_eq!(config.create_records_trigger, 250_000);
        assert_eq!(config.total_lag_trigger, 2000);
        assert!(config.topics_prefixed);
        assert!(!config.backup_on_shutdown);
        assert_eq!(config.backups_to_keep, 5);
        assert!(config.db_path().is_err());
    }

    #[test]
    fn parses_dotted_keys() {
        let config: Config = serde_yaml::from_str(
            r#"
            backup.time.s: 60
            commit.time.s: 5
            create.records.trigger: 100
            total.lag.trigger: 10
            topics.prefixed: false
            backup.on.shutdown: true
            rocks.db.path: /tmp/braid.db
            unknown.option: ignored
            "#,
        )
        .unwrap();
        assert_eq!(config.backup_time_s, 60);
        assert_eq!(config.commit_time_s, 5);
        assert_eq!(config.create_records_trigger, 100);
        assert_eq!(config.total_lag_trigger, 10);
        assert!(!config.topics_prefixed);
        assert!(config.backup_on_shutdown);
        assert_eq!(config.db_path().unwrap(), "/tmp/braid.db");
        assert_eq!(config.db_backup_path().unwrap(), "/tmp/braid.db-backup");
    }

    #[test]
    fn topic_config_merges_default() {
        let config: Config = serde_yaml::from_str(
            r#"
            topics:
                default:
                    batch.size: 100
                    value.serde: json
                media:
                    batch.size: 7
                    topic.name: dbserver.public.media
            "#,
        )
        .unwrap();

        let media = config.topic_spec("media");
        assert_eq!(media.batch_size(), 7);
        assert_eq!(media.value_serde(), "json");
        assert_eq!(media.topic_name(), "dbserver.public.media");

        let caption = config.topic_spec("caption");
        assert_eq!(caption.batch_size(), 100);
        assert_eq!(caption.topic_name(), "caption");
    }
}
