/*
 *     Copyright 2025 The Dragonfly Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use dfdaemon_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tracing::instrument;
use validator::Validate;

/// default_storage_task_expire_time is the default duration a task keeps
/// unaccessed by any operation before it is garbage collected.
#[inline]
fn default_storage_task_expire_time() -> Duration {
    Duration::from_secs(6 * 60 * 60)
}

/// default_storage_write_buffer_size is the default buffer size for writing piece to disk, default is 128KB.
#[inline]
fn default_storage_write_buffer_size() -> usize {
    128 * 1024
}

/// default_storage_read_buffer_size is the default buffer size for reading piece from disk, default is 128KB.
#[inline]
fn default_storage_read_buffer_size() -> usize {
    128 * 1024
}

/// default_gc_interval is the default interval to do gc.
#[inline]
fn default_gc_interval() -> Duration {
    Duration::from_secs(900)
}

/// StoreStrategy is the placement strategy of the task data file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreStrategy {
    /// Simple places the data file inside the daemon's data directory.
    #[default]
    Simple,

    /// Advance places the data file beside the download destination and links
    /// it into the daemon's data directory, so finalising the download is a
    /// rename instead of a copy.
    Advance,
}

/// StoreStrategy implements the store strategy.
impl StoreStrategy {
    /// as_str returns the string of the store strategy.
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreStrategy::Simple => "simple",
            StoreStrategy::Advance => "advance",
        }
    }
}

/// Storage is the storage configuration for dfdaemon.
#[derive(Debug, Clone, Validate, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Storage {
    /// dir is the directory to store task's metadata and content.
    #[serde(default = "crate::default_storage_dir")]
    pub dir: PathBuf,

    /// task_expire_time is the duration a task keeps unaccessed by any
    /// operation before it is garbage collected, zero never expires by time.
    #[serde(
        default = "default_storage_task_expire_time",
        with = "humantime_serde"
    )]
    pub task_expire_time: Duration,

    /// strategy is the default placement strategy for registered tasks.
    pub strategy: StoreStrategy,

    /// write_buffer_size is the buffer size for writing piece to disk, default is 128KB.
    #[serde(default = "default_storage_write_buffer_size")]
    pub write_buffer_size: usize,

    /// read_buffer_size is the buffer size for reading piece from disk, default is 128KB.
    #[serde(default = "default_storage_read_buffer_size")]
    pub read_buffer_size: usize,
}

/// Storage implements Default.
impl Default for Storage {
    fn default() -> Self {
        Storage {
            dir: crate::default_storage_dir(),
            task_expire_time: default_storage_task_expire_time(),
            strategy: StoreStrategy::default(),
            write_buffer_size: default_storage_write_buffer_size(),
            read_buffer_size: default_storage_read_buffer_size(),
        }
    }
}

/// GC is the gc configuration for dfdaemon.
#[derive(Debug, Clone, Validate, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GC {
    /// interval is the interval to do gc.
    #[serde(default = "default_gc_interval", with = "humantime_serde")]
    pub interval: Duration,
}

/// GC implements Default.
impl Default for GC {
    fn default() -> Self {
        GC {
            interval: default_gc_interval(),
        }
    }
}

/// Config is the configuration for dfdaemon.
#[derive(Debug, Clone, Default, Validate, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// storage is the storage configuration for dfdaemon.
    #[validate]
    pub storage: Storage,

    /// gc is the gc configuration for dfdaemon.
    #[validate]
    pub gc: GC,
}

/// Config implements the config operation of dfdaemon.
impl Config {
    /// load loads configuration from file.
    #[instrument(skip_all)]
    pub async fn load(path: &PathBuf) -> Result<Config> {
        // Load configuration from file.
        let content = fs::read_to_string(path).await?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|err| Error::ValidationError(err.to_string()))?;

        // Validate configuration.
        config
            .validate()
            .map_err(|err| Error::ValidationError(err.to_string()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn should_default_config() {
        let config = Config::default();
        assert_eq!(config.storage.strategy, StoreStrategy::Simple);
        assert_eq!(
            config.storage.task_expire_time,
            Duration::from_secs(6 * 60 * 60)
        );
        assert_eq!(config.storage.write_buffer_size, 128 * 1024);
        assert_eq!(config.gc.interval, Duration::from_secs(900));
    }

    #[tokio::test]
    async fn should_load_config() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            br#"
storage:
  dir: /tmp/dfdaemon
  taskExpireTime: 100ms
  strategy: advance
gc:
  interval: 5s
"#,
        )
        .unwrap();

        let config = Config::load(&file.path().to_path_buf()).await.unwrap();
        assert_eq!(config.storage.dir, PathBuf::from("/tmp/dfdaemon"));
        assert_eq!(config.storage.task_expire_time, Duration::from_millis(100));
        assert_eq!(config.storage.strategy, StoreStrategy::Advance);
        assert_eq!(config.gc.interval, Duration::from_secs(5));

        // Omitted fields fall back to their defaults.
        assert_eq!(config.storage.read_buffer_size, 128 * 1024);
    }

    #[tokio::test]
    async fn should_fail_on_unknown_strategy() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"storage:\n  strategy: fancy\n").unwrap();

        let err = Config::load(&file.path().to_path_buf()).await.unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
    }
}
