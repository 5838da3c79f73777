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

use dashmap::DashMap;
use dfdaemon_config::dfdaemon::{Config, StoreStrategy};
use dfdaemon_core::{Error, Result};
use dfdaemon_util::fs::{device_id, symlink};
use dfdaemon_util::keepalive::KeepAlive;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

pub mod metadata;
pub mod task_store;

use metadata::{PersistentMetadata, Piece, PieceStyle};
use task_store::{remove_data_file, TASK_DATA_FILE_NAME, TASK_METADATA_FILE_NAME};

pub use task_store::{LocalTaskStore, PieceReader, CACHE_FILE_INFIX};

/// GCCallback is invoked after a task store is reclaimed, with the task id,
/// the peer id and the last known content length for accounting.
pub type GCCallback = Arc<dyn Fn(&str, &str, i64) + Send + Sync>;

/// PeerTaskId uniquely identifies a peer task on the node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerTaskId {
    /// task_id is the task id.
    pub task_id: String,

    /// peer_id is the peer id.
    pub peer_id: String,
}

/// PeerTaskId implements the peer task id.
impl PeerTaskId {
    /// new creates a new PeerTaskId.
    pub fn new(task_id: &str, peer_id: &str) -> PeerTaskId {
        PeerTaskId {
            task_id: task_id.to_string(),
            peer_id: peer_id.to_string(),
        }
    }
}

/// RegisterTaskRequest is the request of registering a task.
#[derive(Debug, Clone)]
pub struct RegisterTaskRequest {
    /// task_id is the task id.
    pub task_id: String,

    /// peer_id is the peer id.
    pub peer_id: String,

    /// content_length is the length of the task content, -1 when unknown.
    pub content_length: i64,

    /// total_pieces is the number of pieces of the task, -1 when unknown.
    pub total_pieces: i32,

    /// destination is the download destination of the task, None when the
    /// task has no destination, for example when serving proxy traffic.
    pub destination: Option<PathBuf>,
}

/// WritePieceRequest is the request of writing a piece.
#[derive(Debug, Clone)]
pub struct WritePieceRequest {
    /// task_id is the task id.
    pub task_id: String,

    /// peer_id is the peer id.
    pub peer_id: String,

    /// number is the piece number.
    pub number: u32,

    /// offset is the offset of the piece in the task content.
    pub offset: u64,

    /// length is the length of the piece.
    pub length: u32,

    /// style is the wire style of the piece.
    pub style: PieceStyle,

    /// digest is the digest supplied by the caller, stored as is.
    pub digest: Option<String>,
}

/// ReadPieceRequest is the request of reading a piece.
#[derive(Debug, Clone)]
pub struct ReadPieceRequest {
    /// task_id is the task id.
    pub task_id: String,

    /// peer_id is the peer id.
    pub peer_id: String,

    /// number is the piece number.
    pub number: u32,
}

/// GetPiecesRequest is the request of getting contiguous piece refs.
#[derive(Debug, Clone)]
pub struct GetPiecesRequest {
    /// task_id is the task id.
    pub task_id: String,

    /// peer_id is the peer id.
    pub peer_id: String,

    /// start_piece is the first piece number of the response, inclusive.
    pub start_piece: u32,

    /// piece_limit is the maximum number of pieces of the response.
    pub piece_limit: u32,
}

/// UpdateTaskRequest is the request of updating the task descriptor, every
/// field is optional and values only move forward.
#[derive(Debug, Clone, Default)]
pub struct UpdateTaskRequest {
    /// task_id is the task id.
    pub task_id: String,

    /// peer_id is the peer id.
    pub peer_id: String,

    /// content_length is the length of the task content.
    pub content_length: Option<i64>,

    /// total_pieces is the number of pieces of the task.
    pub total_pieces: Option<i32>,

    /// piece_md5_sign is the digest over the piece digests.
    pub piece_md5_sign: Option<String>,

    /// task_meta is the user supplied tags to merge into the task.
    pub task_meta: Option<HashMap<String, String>>,
}

/// StoreRequest is the request of finalising the task data at a destination.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    /// task_id is the task id.
    pub task_id: String,

    /// peer_id is the peer id.
    pub peer_id: String,

    /// destination is the path of the finalised file.
    pub destination: PathBuf,

    /// store_data_only skips the completeness check of the task descriptor.
    pub store_data_only: bool,
}

/// PiecePacket is the response of getting contiguous piece refs.
#[derive(Debug, Clone)]
pub struct PiecePacket {
    /// task_id is the task id.
    pub task_id: String,

    /// peer_id is the peer id.
    pub peer_id: String,

    /// pieces is the contiguous piece refs ascending by number.
    pub pieces: Vec<Piece>,

    /// total_pieces is the number of pieces of the task, -1 when unknown.
    pub total_pieces: i32,

    /// content_length is the length of the task content, -1 when unknown.
    pub content_length: i64,

    /// piece_md5_sign is the digest over the piece digests, None when
    /// unknown.
    pub piece_md5_sign: Option<String>,
}

/// StorageManager owns every local task store on the node. Lookups are lock
/// free, creation is serialized by a manager level lock.
pub struct StorageManager {
    /// config is the configuration of the dfdaemon.
    config: Arc<Config>,

    /// data_root is the absolute directory holding all task directories.
    data_root: PathBuf,

    /// data_root_device is the device id of the data root, used to choose
    /// between hard and symbolic back links, None when unknown.
    data_root_device: Option<u64>,

    /// tasks maps peer task ids to their stores.
    tasks: DashMap<PeerTaskId, Arc<LocalTaskStore>>,

    /// create_mutex serializes task store creation, so concurrent
    /// registrations of the same peer task create exactly one directory.
    create_mutex: Mutex<()>,

    /// reclaim_pending holds the keys marked in the previous gc round. They
    /// are swept one round later, so readers obtained before the mark get a
    /// full gc interval to finish.
    reclaim_pending: Mutex<Vec<PeerTaskId>>,

    /// gc_callback is invoked with the task accounting info on reclaim.
    gc_callback: GCCallback,

    /// keep_alive records the last touch for the daemon's idle probe.
    keep_alive: KeepAlive,
}

/// StorageManager implements the task storage manager.
impl StorageManager {
    /// new creates a storage manager rooted at the configured storage
    /// directory and loads the tasks persisted by an earlier run.
    pub async fn new(config: Arc<Config>, gc_callback: GCCallback) -> Result<StorageManager> {
        let data_root = if config.storage.dir.is_absolute() {
            config.storage.dir.clone()
        } else {
            std::env::current_dir()?.join(&config.storage.dir)
        };
        create_dir_all(&data_root).await?;
        let data_root_device = device_id(&data_root).await?;
        info!("storage manager initialized directory: {:?}", data_root);

        let manager = StorageManager {
            config,
            data_root,
            data_root_device,
            tasks: DashMap::new(),
            create_mutex: Mutex::new(()),
            reclaim_pending: Mutex::new(Vec::new()),
            gc_callback,
            keep_alive: KeepAlive::new(),
        };

        // A partial reload keeps the good tasks, the aggregated error is
        // only logged here. Callers wanting to inspect it run reload
        // themselves.
        if let Err(err) = manager.reload().await {
            warn!("reload tasks failed: {}", err);
        }

        Ok(manager)
    }

    /// register_task creates the task store when it does not exist yet,
    /// idempotent on success.
    #[instrument(skip_all)]
    pub async fn register_task(&self, req: &RegisterTaskRequest) -> Result<()> {
        validate_id("task id", &req.task_id)?;
        validate_id("peer id", &req.peer_id)?;

        let id = PeerTaskId::new(&req.task_id, &req.peer_id);
        if self.load_task(&id).is_some() {
            return Ok(());
        }

        // Double check under the creation lock, a concurrent registration
        // may have created the store in the meantime.
        let _guard = self.create_mutex.lock().await;
        if self.load_task(&id).is_some() {
            return Ok(());
        }

        self.create_task(req).await
    }

    /// write_piece writes a piece of a task to storage.
    #[instrument(skip_all)]
    pub async fn write_piece<R: AsyncRead + Unpin + ?Sized>(
        &self,
        req: &WritePieceRequest,
        reader: &mut R,
    ) -> Result<u64> {
        self.lookup_task(&req.task_id, &req.peer_id)?
            .write_piece(req, reader)
            .await
    }

    /// read_piece returns a reader over the extent of a piece, the reader
    /// releases its resources on drop.
    #[instrument(skip_all)]
    pub async fn read_piece(&self, req: &ReadPieceRequest) -> Result<PieceReader> {
        self.lookup_task(&req.task_id, &req.peer_id)?
            .read_piece(req)
            .await
    }

    /// get_pieces returns the contiguous piece refs of a task.
    #[instrument(skip_all)]
    pub async fn get_pieces(&self, req: &GetPiecesRequest) -> Result<PiecePacket> {
        self.lookup_task(&req.task_id, &req.peer_id)?
            .get_pieces(req)
            .await
    }

    /// update_task applies the forward-only task descriptor mutations.
    #[instrument(skip_all)]
    pub async fn update_task(&self, req: &UpdateTaskRequest) -> Result<()> {
        self.lookup_task(&req.task_id, &req.peer_id)?
            .update_task(req)
            .await
    }

    /// store finalises the task data at the destination.
    #[instrument(skip_all)]
    pub async fn store(&self, req: &StoreRequest) -> Result<()> {
        self.lookup_task(&req.task_id, &req.peer_id)?
            .store(req)
            .await
    }

    /// try_gc runs one mark and sweep round. Newly expired stores are only
    /// marked, the stores marked in the previous round are swept, so a
    /// reader obtained before the mark gets one full interval to finish.
    /// It is driven by a single gc worker and never runs concurrently with
    /// itself.
    #[instrument(skip_all)]
    pub async fn try_gc(&self) -> Result<bool> {
        // Mark phase.
        let mut marked = Vec::new();
        for entry in self.tasks.iter() {
            if entry.value().can_reclaim() {
                entry.value().mark_reclaim();
                marked.push(entry.key().clone());
            } else {
                debug!(
                    "task {}/{} not reach gc time",
                    entry.key().task_id,
                    entry.key().peer_id
                );
            }
        }

        // Sweep phase over the previous round's marked keys.
        let pending = {
            let mut reclaim_pending = self.reclaim_pending.lock().await;
            std::mem::take(&mut *reclaim_pending)
        };

        let mut reclaimed = 0;
        for id in pending.iter() {
            let store = match self.tasks.remove(id) {
                Some((_, store)) => store,
                None => {
                    warn!("task {}/{} marked, but not found", id.task_id, id.peer_id);
                    continue;
                }
            };

            // TODO Queue failed reclaims for a bounded number of retries.
            if let Err(err) = store.reclaim().await {
                error!("gc task {}/{} failed: {}", id.task_id, id.peer_id, err);
                continue;
            }

            info!("task {}/{} reclaimed", id.task_id, id.peer_id);
            reclaimed += 1;
        }

        info!("marked {} task(s), reclaimed {} task(s)", marked.len(), reclaimed);
        *self.reclaim_pending.lock().await = marked;
        Ok(true)
    }

    /// clean_up forcibly reclaims every task store regardless of expiry,
    /// used on shutdown. Errors are logged per task and do not abort the
    /// sweep.
    #[instrument(skip_all)]
    pub async fn clean_up(&self) {
        let ids: Vec<PeerTaskId> = self.tasks.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, store)) = self.tasks.remove(&id) {
                store.mark_reclaim();
                if let Err(err) = store.reclaim().await {
                    error!("clean up task {}/{} failed: {}", id.task_id, id.peer_id, err);
                }
            }
        }
    }

    /// alive returns whether any operation touched the manager within the
    /// given duration, probed by the outer daemon's idle shutdown logic.
    pub fn alive(&self, within: Duration) -> bool {
        self.keep_alive.alive(within)
    }

    /// reload loads every task directory under the data root. Directories
    /// whose metadata is missing or unparseable are removed from disk, the
    /// remaining tasks survive and the collected failures are aggregated
    /// into the returned error.
    pub async fn reload(&self) -> Result<()> {
        let mut task_dirs = match fs::read_dir(&self.data_root).await {
            Ok(task_dirs) => task_dirs,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let mut load_errs: Vec<String> = Vec::new();
        let mut load_err_dirs: Vec<PathBuf> = Vec::new();
        while let Some(task_entry) = task_dirs.next_entry().await? {
            let task_id = task_entry.file_name().to_string_lossy().to_string();
            let mut peer_dirs = match fs::read_dir(task_entry.path()).await {
                Ok(peer_dirs) => peer_dirs,
                Err(_) => continue,
            };

            while let Some(peer_entry) = peer_dirs.next_entry().await? {
                let peer_id = peer_entry.file_name().to_string_lossy().to_string();
                let data_dir = peer_entry.path();
                let metadata_path = data_dir.join(TASK_METADATA_FILE_NAME);

                let metadata = match load_metadata(&metadata_path).await {
                    Ok(metadata) => metadata,
                    Err(err) => {
                        warn!(
                            "load task {}/{} from disk failed: {}",
                            task_id, peer_id, err
                        );
                        load_errs.push(format!("{:?}: {}", data_dir, err));
                        load_err_dirs.push(data_dir);
                        continue;
                    }
                };

                debug!(
                    "load task {}/{} from disk, metadata {:?}",
                    metadata.task_id, metadata.peer_id, metadata_path
                );
                let store = LocalTaskStore::new(
                    metadata,
                    &self.data_root,
                    data_dir,
                    self.config.storage.task_expire_time,
                    self.config.storage.write_buffer_size,
                    self.config.storage.read_buffer_size,
                    self.gc_callback.clone(),
                );
                self.tasks
                    .insert(PeerTaskId::new(&task_id, &peer_id), Arc::new(store));
            }
        }

        // Remove the directories that failed to load, a task without a
        // readable metadata file is unusable.
        for dir in load_err_dirs.iter() {
            let metadata_path = dir.join(TASK_METADATA_FILE_NAME);
            fs::remove_file(&metadata_path).await.unwrap_or_else(|err| {
                warn!("remove {:?} failed: {}", metadata_path, err);
            });

            let data_path = dir.join(TASK_DATA_FILE_NAME);
            remove_data_file(&data_path, &self.data_root)
                .await
                .unwrap_or_else(|err| {
                    warn!("remove {:?} failed: {}", data_path, err);
                });

            fs::remove_dir(dir).await.unwrap_or_else(|err| {
                warn!("remove {:?} failed: {}", dir, err);
            });
            warn!("removed load error directory {:?}", dir);
        }

        if !load_errs.is_empty() {
            return Err(Error::ReloadFailed(load_errs.join("; ")));
        }

        Ok(())
    }

    /// load_task returns the task store, touching the keep alive clock.
    fn load_task(&self, id: &PeerTaskId) -> Option<Arc<LocalTaskStore>> {
        self.keep_alive.keep();
        self.tasks.get(id).map(|entry| entry.value().clone())
    }

    /// lookup_task returns the task store or TaskNotFound.
    fn lookup_task(&self, task_id: &str, peer_id: &str) -> Result<Arc<LocalTaskStore>> {
        self.load_task(&PeerTaskId::new(task_id, peer_id))
            .ok_or_else(|| Error::TaskNotFound(format!("{}/{}", task_id, peer_id)))
    }

    /// create_task creates the task directory, the data file for the chosen
    /// placement strategy and the initial metadata document.
    async fn create_task(&self, req: &RegisterTaskRequest) -> Result<()> {
        self.keep_alive.keep();
        debug!(
            "init local task storage, task {} peer {}",
            req.task_id, req.peer_id
        );

        let data_dir = self.data_root.join(&req.task_id).join(&req.peer_id);
        create_dir_all(&data_dir).await?;
        let data_path = data_dir.join(TASK_DATA_FILE_NAME);

        // Fall back to the simple strategy when no destination is known,
        // for example when serving proxy traffic.
        let strategy = match req.destination {
            Some(_) => self.config.storage.strategy,
            None => StoreStrategy::Simple,
        };

        let data_file_path = match (strategy, req.destination.as_deref()) {
            (StoreStrategy::Advance, Some(destination)) => {
                self.create_advance_data_file(destination, &req.peer_id, &data_path)
                    .await?
            }
            _ => {
                create_file(&data_path).await?;
                data_path.clone()
            }
        };

        let metadata = PersistentMetadata::new(
            strategy,
            &req.task_id,
            &req.peer_id,
            &data_file_path,
            req.content_length,
            req.total_pieces,
        );
        let store = LocalTaskStore::new(
            metadata,
            &self.data_root,
            data_dir,
            self.config.storage.task_expire_time,
            self.config.storage.write_buffer_size,
            self.config.storage.read_buffer_size,
            self.gc_callback.clone(),
        );

        // Persist the initial descriptor, so a restart sees the registered
        // task even before the first piece arrives.
        store.flush().await?;

        self.tasks
            .insert(PeerTaskId::new(&req.task_id, &req.peer_id), Arc::new(store));
        Ok(())
    }

    /// create_advance_data_file creates the hidden cache file beside the
    /// destination and links it into the task directory, a hard link on the
    /// same device and a symbolic link across devices. The destination
    /// directory must already exist.
    async fn create_advance_data_file(
        &self,
        destination: &Path,
        peer_id: &str,
        data_path: &Path,
    ) -> Result<PathBuf> {
        let destination_dir = destination
            .parent()
            .ok_or_else(|| Error::ValidationError(format!("invalid destination {:?}", destination)))?;
        let destination_file = destination
            .file_name()
            .ok_or_else(|| Error::ValidationError(format!("invalid destination {:?}", destination)))?;

        let cache_path = destination_dir.join(format!(
            ".{}.{}.{}",
            destination_file.to_string_lossy(),
            CACHE_FILE_INFIX,
            peer_id
        ));
        create_file(&cache_path).await?;

        let destination_device = device_id(destination_dir).await.map_err(|err| {
            error!("stat {:?} failed: {}", destination_dir, err);
            err
        })?;
        match (destination_device, self.data_root_device) {
            (Some(destination_device), Some(data_root_device))
                if destination_device != data_root_device =>
            {
                debug!("different devices, symbolic link the task data");
                symlink(&cache_path, data_path).await?;
            }
            _ => {
                // Same device or unknown, prefer a hard link and degrade to
                // a symbolic link when the filesystem refuses it.
                if let Err(err) = fs::hard_link(&cache_path, data_path).await {
                    warn!(
                        "hard link {:?} to {:?} failed: {}, fallback to symbolic link",
                        cache_path, data_path, err
                    );
                    symlink(&cache_path, data_path).await?;
                }
            }
        }

        Ok(cache_path)
    }
}

/// load_metadata reads and parses a task metadata document.
async fn load_metadata(path: &Path) -> Result<PersistentMetadata> {
    let content = fs::read(path).await?;
    Ok(serde_json::from_slice(&content)?)
}

/// validate_id rejects identifiers that are empty or would escape the task
/// directory layout.
fn validate_id(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::ValidationError(format!("{} is empty", field)));
    }

    if value.contains('/') || value.contains('\\') || value.contains("..") {
        return Err(Error::ValidationError(format!(
            "{} {} contains path separators",
            field, value
        )));
    }

    Ok(())
}

/// create_dir_all creates a directory and its missing parents with owner
/// only permissions.
async fn create_dir_all(path: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);

    builder.create(path).await.map_err(|err| {
        error!("create {:?} failed: {}", path, err);
        err
    })?;
    Ok(())
}

/// create_file creates an empty file with owner only permissions.
async fn create_file(path: &Path) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.create(true).write(true);
    #[cfg(unix)]
    options.mode(0o600);

    options.open(path).await.map_err(|err| {
        error!("create {:?} failed: {}", path, err);
        err
    })?;
    Ok(())
}
