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

use dfdaemon_config::dfdaemon::Config;
use dfdaemon_storage::StorageManager;
use dfdaemon_util::shutdown;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// GC is the garbage collector of dfdaemon. It drives the storage manager's
/// mark and sweep collection on a fixed interval until shutdown.
pub struct GC {
    /// config is the configuration of the dfdaemon.
    config: Arc<Config>,

    /// storage is the local storage manager.
    storage: Arc<StorageManager>,

    /// shutdown is used to shutdown the garbage collector.
    shutdown: shutdown::Shutdown,

    /// _shutdown_complete is used to notify the garbage collector is
    /// shutdown.
    _shutdown_complete: mpsc::UnboundedSender<()>,
}

/// GC implements the garbage collector.
impl GC {
    /// new creates a new GC.
    pub fn new(
        config: Arc<Config>,
        storage: Arc<StorageManager>,
        shutdown: shutdown::Shutdown,
        shutdown_complete_tx: mpsc::UnboundedSender<()>,
    ) -> GC {
        GC {
            config,
            storage,
            shutdown,
            _shutdown_complete: shutdown_complete_tx,
        }
    }

    /// run runs the garbage collector.
    pub async fn run(&self) {
        // Clone the shutdown channel.
        let mut shutdown = self.shutdown.clone();

        // Start the collect loop.
        let mut interval = tokio::time::interval(self.config.gc.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.storage.try_gc().await {
                        error!("storage gc failed: {}", err);
                    }
                }
                _ = shutdown.recv() => {
                    // Reclaim all the task storage before exiting.
                    self.storage.clean_up().await;
                    info!("garbage collector shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfdaemon_config::dfdaemon::{Storage, StoreStrategy};
    use dfdaemon_storage::RegisterTaskRequest;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::sleep;

    #[tokio::test]
    async fn should_collect_expired_tasks() {
        let dir = tempdir().unwrap();
        let config = Arc::new(Config {
            storage: Storage {
                dir: dir.path().join("storage"),
                task_expire_time: Duration::from_millis(30),
                strategy: StoreStrategy::Simple,
                ..Storage::default()
            },
            gc: dfdaemon_config::dfdaemon::GC {
                interval: Duration::from_millis(20),
            },
        });

        let storage = Arc::new(
            StorageManager::new(config.clone(), Arc::new(|_, _, _| {}))
                .await
                .unwrap(),
        );
        storage
            .register_task(&RegisterTaskRequest {
                task_id: "task1".to_string(),
                peer_id: "peer1".to_string(),
                content_length: -1,
                total_pieces: -1,
                destination: None,
            })
            .await
            .unwrap();

        let shutdown = shutdown::Shutdown::new();
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::unbounded_channel();
        let gc = Arc::new(GC::new(
            config,
            storage.clone(),
            shutdown.clone(),
            shutdown_complete_tx,
        ));

        let gc_clone = gc.clone();
        let handle = tokio::spawn(async move { gc_clone.run().await });

        // The expired task is marked on one tick and swept on a later one.
        sleep(Duration::from_millis(300)).await;
        assert!(!dir.path().join("storage").join("task1").exists());

        shutdown.trigger();
        handle.await.unwrap();
        drop(gc);
        assert!(shutdown_complete_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn should_clean_up_on_shutdown() {
        let dir = tempdir().unwrap();
        let config = Arc::new(Config {
            storage: Storage {
                dir: dir.path().join("storage"),
                task_expire_time: Duration::from_secs(60),
                strategy: StoreStrategy::Simple,
                ..Storage::default()
            },
            gc: dfdaemon_config::dfdaemon::GC {
                interval: Duration::from_millis(20),
            },
        });

        let storage = Arc::new(
            StorageManager::new(config.clone(), Arc::new(|_, _, _| {}))
                .await
                .unwrap(),
        );
        storage
            .register_task(&RegisterTaskRequest {
                task_id: "task1".to_string(),
                peer_id: "peer1".to_string(),
                content_length: -1,
                total_pieces: -1,
                destination: None,
            })
            .await
            .unwrap();

        let shutdown = shutdown::Shutdown::new();
        let (shutdown_complete_tx, _shutdown_complete_rx) = mpsc::unbounded_channel();
        let gc = GC::new(config, storage.clone(), shutdown.clone(), shutdown_complete_tx);
        let handle = tokio::spawn(async move { gc.run().await });

        sleep(Duration::from_millis(50)).await;
        shutdown.trigger();
        handle.await.unwrap();

        // The unexpired task was reclaimed by the shutdown sweep.
        assert!(!dir.path().join("storage").join("task1").exists());
    }
}
