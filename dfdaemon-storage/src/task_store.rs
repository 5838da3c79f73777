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

use crate::metadata::{PersistentMetadata, Piece};
use crate::{
    GCCallback, GetPiecesRequest, PiecePacket, ReadPieceRequest, StoreRequest, UpdateTaskRequest,
    WritePieceRequest,
};
use dfdaemon_config::dfdaemon::StoreStrategy;
use dfdaemon_core::{Error, Result};
use dfdaemon_util::fs::write_file_atomic;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{self, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, BufWriter, SeekFrom};
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

/// TASK_DATA_FILE_NAME is the name of the task data file inside the task
/// directory. Under the advance strategy it is a link to the primary data
/// file beside the download destination.
pub const TASK_DATA_FILE_NAME: &str = "data";

/// TASK_METADATA_FILE_NAME is the name of the task metadata file inside the
/// task directory.
pub const TASK_METADATA_FILE_NAME: &str = "task.meta";

/// CACHE_FILE_INFIX is the marker inside the hidden cache file names created
/// beside a download destination. Reclaim recognizes files carrying it as
/// daemon owned, so recovered links never delete user files.
pub const CACHE_FILE_INFIX: &str = "dfget.cache";

/// PieceReader is the reader over the extent of a single piece. It owns its
/// file handle, so an in-flight read completes even after the task data file
/// was unlinked by gc.
pub type PieceReader = io::Take<BufReader<File>>;

/// LocalTaskStore persists and serves the piece content of one peer task.
pub struct LocalTaskStore {
    /// task_id is the task id.
    task_id: String,

    /// peer_id is the peer id.
    peer_id: String,

    /// metadata is the durable task descriptor, kept in sync with the
    /// metadata file on every mutation.
    metadata: RwLock<PersistentMetadata>,

    /// data_root is the data directory of the storage manager, used to
    /// decide whether a symbolic link target is daemon owned.
    data_root: PathBuf,

    /// data_dir is the task directory under the data root.
    data_dir: PathBuf,

    /// metadata_path is the path of the metadata file.
    metadata_path: PathBuf,

    /// expire_after is how long the store may stay unaccessed before gc
    /// reclaims it, zero never expires by time.
    expire_after: Duration,

    /// write_buffer_size is the buffer size for writing piece to disk.
    write_buffer_size: usize,

    /// read_buffer_size is the buffer size for reading piece from disk.
    read_buffer_size: usize,

    /// last_access is the instant of the last successful operation.
    last_access: std::sync::RwLock<Instant>,

    /// reclaiming is set once the store is marked for reclaim, operations on
    /// a marked store are rejected.
    reclaiming: AtomicBool,

    /// invalid is set when a metadata flush fails, the next gc round removes
    /// the unusable store.
    invalid: AtomicBool,

    /// gc_callback is invoked with the task accounting info on reclaim.
    gc_callback: GCCallback,
}

/// LocalTaskStore implements the piece storage of one peer task.
impl LocalTaskStore {
    /// new creates a store over an existing task directory.
    pub(crate) fn new(
        metadata: PersistentMetadata,
        data_root: &Path,
        data_dir: PathBuf,
        expire_after: Duration,
        write_buffer_size: usize,
        read_buffer_size: usize,
        gc_callback: GCCallback,
    ) -> LocalTaskStore {
        let metadata_path = data_dir.join(TASK_METADATA_FILE_NAME);
        LocalTaskStore {
            task_id: metadata.task_id.clone(),
            peer_id: metadata.peer_id.clone(),
            metadata: RwLock::new(metadata),
            data_root: data_root.to_path_buf(),
            data_dir,
            metadata_path,
            expire_after,
            write_buffer_size,
            read_buffer_size,
            last_access: std::sync::RwLock::new(Instant::now()),
            reclaiming: AtomicBool::new(false),
            invalid: AtomicBool::new(false),
            gc_callback,
        }
    }

    /// write_piece writes the piece payload at its offset and registers the
    /// piece in the metadata. Writing an already persisted piece is a no-op
    /// success when the digest matches.
    #[instrument(skip_all, fields(task_id = %self.task_id, peer_id = %self.peer_id))]
    pub async fn write_piece<R: tokio::io::AsyncRead + Unpin + ?Sized>(
        &self,
        req: &WritePieceRequest,
        reader: &mut R,
    ) -> Result<u64> {
        self.ensure_serving()?;
        self.touch();

        let data_file_path = {
            let metadata = self.metadata.read().await;
            if let Some(piece) = metadata.pieces.get(&req.number) {
                return self.verify_duplicate_piece(piece, req.digest.as_deref());
            }

            metadata.data_file_path.clone()
        };

        // The payload write happens outside the metadata lock, so writes at
        // non overlapping offsets proceed in parallel.
        let f = OpenOptions::new()
            .write(true)
            .open(&data_file_path)
            .await
            .map_err(|err| {
                error!("open {:?} failed: {}", data_file_path, err);
                err
            })?;

        let mut writer = BufWriter::with_capacity(self.write_buffer_size, f);
        writer.seek(SeekFrom::Start(req.offset)).await?;

        let mut limited_reader = reader.take(req.length as u64);
        let written = io::copy(&mut limited_reader, &mut writer).await?;
        writer.flush().await?;

        if written != req.length as u64 {
            return Err(Error::IO(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("wrote {} of {} bytes", written, req.length),
            )));
        }

        // Register the piece and flush the metadata. Recheck under the write
        // lock, a concurrent writer of the same piece may have won the race.
        let mut metadata = self.metadata.write().await;
        if let Some(piece) = metadata.pieces.get(&req.number) {
            return self.verify_duplicate_piece(piece, req.digest.as_deref());
        }

        metadata.pieces.insert(
            req.number,
            Piece {
                number: req.number,
                offset: req.offset,
                length: req.length,
                style: req.style,
                md5: req.digest.clone().unwrap_or_default(),
            },
        );
        self.flush_metadata(&metadata).await?;

        Ok(written)
    }

    /// read_piece returns a reader over the extent of the piece. Dropping the
    /// reader releases its resources.
    #[instrument(skip_all, fields(task_id = %self.task_id, peer_id = %self.peer_id))]
    pub async fn read_piece(&self, req: &ReadPieceRequest) -> Result<PieceReader> {
        self.ensure_serving()?;
        self.touch();

        let (piece, data_file_path) = {
            let metadata = self.metadata.read().await;
            let piece = metadata
                .pieces
                .get(&req.number)
                .cloned()
                .ok_or_else(|| Error::PieceNotFound(self.piece_id(req.number)))?;
            (piece, metadata.data_file_path.clone())
        };

        let mut f = File::open(&data_file_path).await.map_err(|err| {
            error!("open {:?} failed: {}", data_file_path, err);
            err
        })?;
        f.seek(SeekFrom::Start(piece.offset)).await?;

        Ok(BufReader::with_capacity(self.read_buffer_size, f).take(piece.length as u64))
    }

    /// get_pieces returns the contiguous piece refs starting at the requested
    /// piece, ascending by number. A gap terminates the response, an empty
    /// response is valid.
    #[instrument(skip_all, fields(task_id = %self.task_id, peer_id = %self.peer_id))]
    pub async fn get_pieces(&self, req: &GetPiecesRequest) -> Result<PiecePacket> {
        self.ensure_serving()?;
        self.touch();

        let metadata = self.metadata.read().await;
        Ok(PiecePacket {
            task_id: self.task_id.clone(),
            peer_id: self.peer_id.clone(),
            pieces: metadata.contiguous_pieces(req.start_piece, req.piece_limit),
            total_pieces: metadata.total_pieces,
            content_length: metadata.content_length,
            piece_md5_sign: metadata.piece_md5_sign.clone(),
        })
    }

    /// update_task applies the forward-only metadata mutations and flushes
    /// them durably.
    #[instrument(skip_all, fields(task_id = %self.task_id, peer_id = %self.peer_id))]
    pub async fn update_task(&self, req: &UpdateTaskRequest) -> Result<()> {
        self.ensure_serving()?;
        self.touch();

        let mut metadata = self.metadata.write().await;
        metadata.update(
            req.content_length,
            req.total_pieces,
            req.piece_md5_sign.clone(),
            req.task_meta.clone(),
        )?;
        self.flush_metadata(&metadata).await
    }

    /// store finalises the task data at the destination. Under the simple
    /// strategy the data file is hard linked or copied out, under the advance
    /// strategy the hidden cache file is renamed into place.
    #[instrument(skip_all, fields(task_id = %self.task_id, peer_id = %self.peer_id))]
    pub async fn store(&self, req: &StoreRequest) -> Result<()> {
        self.ensure_serving()?;
        self.touch();

        let mut metadata = self.metadata.write().await;
        if !req.store_data_only && !metadata.is_complete() {
            return Err(Error::TaskNotReady(format!(
                "{}/{}",
                self.task_id, self.peer_id
            )));
        }

        match metadata.store_strategy {
            StoreStrategy::Simple => {
                self.store_simple(&metadata.data_file_path, &req.destination)
                    .await?;
            }
            StoreStrategy::Advance => {
                fs::rename(&metadata.data_file_path, &req.destination)
                    .await
                    .map_err(|err| {
                        error!(
                            "rename {:?} to {:?} failed: {}",
                            metadata.data_file_path, req.destination, err
                        );
                        err
                    })?;

                // The content now lives at the destination, drop the stale
                // link inside the task directory and follow up in the
                // descriptor so reads keep working.
                let link = self.data_dir.join(TASK_DATA_FILE_NAME);
                fs::remove_file(&link).await.unwrap_or_else(|err| {
                    warn!("remove {:?} failed: {}", link, err);
                });

                metadata.data_file_path = req.destination.clone();
                self.flush_metadata(&metadata).await?;
            }
        }

        info!("stored task data to {:?}", req.destination);
        Ok(())
    }

    /// store_simple places a copy of the data file at the destination. The
    /// content is staged as a hidden sibling and renamed, so a crash leaves
    /// either the old destination file or nothing, never a partial file.
    async fn store_simple(&self, data_file_path: &Path, destination: &Path) -> Result<()> {
        let file_name = destination
            .file_name()
            .ok_or_else(|| Error::ValidationError(format!("invalid destination {:?}", destination)))?;

        if let Some(parent) = destination.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).await.map_err(|err| {
                    error!("create {:?} failed: {}", parent, err);
                    err
                })?;
            }
        }

        let staging = destination.with_file_name(format!(
            ".{}.{}.tmp",
            file_name.to_string_lossy(),
            self.peer_id
        ));
        fs::remove_file(&staging).await.unwrap_or_else(|err| {
            if err.kind() != ErrorKind::NotFound {
                warn!("remove {:?} failed: {}", staging, err);
            }
        });

        // Prefer a hard link, fall back to a copy across devices.
        if let Err(err) = fs::hard_link(data_file_path, &staging).await {
            debug!(
                "hard link {:?} to {:?} failed: {}, fallback to copy",
                data_file_path, staging, err
            );
            fs::copy(data_file_path, &staging).await.map_err(|err| {
                error!("copy {:?} to {:?} failed: {}", data_file_path, staging, err);
                err
            })?;
        }

        fs::rename(&staging, destination).await?;
        Ok(())
    }

    /// can_reclaim returns whether the store is expired or unusable.
    pub fn can_reclaim(&self) -> bool {
        if self.invalid.load(Ordering::Relaxed) {
            return true;
        }

        if self.expire_after.is_zero() {
            return false;
        }

        match self.last_access.read() {
            Ok(last_access) => last_access.elapsed() >= self.expire_after,
            Err(_) => false,
        }
    }

    /// mark_reclaim marks the store for reclaim, idempotent. A marked store
    /// rejects new operations while in-flight readers keep their handles.
    pub fn mark_reclaim(&self) {
        self.reclaiming.store(true, Ordering::Relaxed);
    }

    /// is_reclaiming returns whether the store is marked for reclaim.
    pub fn is_reclaiming(&self) -> bool {
        self.reclaiming.load(Ordering::Relaxed)
    }

    /// reclaim removes the on-disk footprint of the task and reports the
    /// accounting info through the gc callback. Filesystem errors are logged
    /// and do not stop the removal sequence, the first fatal one is returned
    /// at the end.
    #[instrument(skip_all, fields(task_id = %self.task_id, peer_id = %self.peer_id))]
    pub async fn reclaim(&self) -> Result<()> {
        info!("reclaim task storage {:?}", self.data_dir);
        let metadata = self.metadata.read().await;
        let mut first_err: Option<Error> = None;

        // Remove the metadata file.
        if let Err(err) = remove_file_ignore_missing(&self.metadata_path).await {
            warn!("remove {:?} failed: {}", self.metadata_path, err);
            first_err.get_or_insert(err);
        }

        // Remove the data path inside the task directory, following a
        // symbolic link to its target when the daemon owns it.
        let data_path = self.data_dir.join(TASK_DATA_FILE_NAME);
        if let Err(err) = remove_data_file(&data_path, &self.data_root).await {
            warn!("remove {:?} failed: {}", data_path, err);
            first_err.get_or_insert(err);
        }

        // Remove the primary data file when it lives outside the task
        // directory and still belongs to the daemon. After a finalised
        // advance store it is the user's destination and must survive.
        if metadata.data_file_path != data_path
            && is_owned_data_file(&metadata.data_file_path, &self.data_root)
        {
            if let Err(err) = remove_file_ignore_missing(&metadata.data_file_path).await {
                warn!("remove {:?} failed: {}", metadata.data_file_path, err);
                first_err.get_or_insert(err);
            }
        }

        // Remove the now empty task directory, and its parent when this was
        // the last peer holding the task.
        if let Err(err) = fs::remove_dir(&self.data_dir).await {
            if err.kind() != ErrorKind::NotFound {
                warn!("remove {:?} failed: {}", self.data_dir, err);
                first_err.get_or_insert(err.into());
            }
        }
        if let Some(parent) = self.data_dir.parent() {
            fs::remove_dir(parent).await.unwrap_or_else(|err| {
                debug!("keep task directory {:?}: {}", parent, err);
            });
        }

        (self.gc_callback)(&self.task_id, &self.peer_id, metadata.content_length);

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// flush writes the current metadata document durably, used right after
    /// the store is created so a restart sees the registered task.
    pub(crate) async fn flush(&self) -> Result<()> {
        let metadata = self.metadata.read().await;
        self.flush_metadata(&metadata).await
    }

    /// flush_metadata persists the metadata document atomically. A failed
    /// flush marks the store invalid so the next gc round removes it.
    async fn flush_metadata(&self, metadata: &PersistentMetadata) -> Result<()> {
        let content = serde_json::to_vec(metadata)?;
        if let Err(err) = write_file_atomic(&self.metadata_path, &content).await {
            self.invalid.store(true, Ordering::Relaxed);
            error!("flush metadata {:?} failed: {}", self.metadata_path, err);
            return Err(err);
        }

        Ok(())
    }

    /// verify_duplicate_piece resolves a rewrite of an already persisted
    /// piece, a no-op success when the digests match.
    fn verify_duplicate_piece(&self, piece: &Piece, digest: Option<&str>) -> Result<u64> {
        if let Some(digest) = digest {
            if !digest.is_empty() && !piece.md5.is_empty() && piece.md5 != digest {
                return Err(Error::DigestMismatch(piece.md5.clone(), digest.to_string()));
            }
        }

        debug!("piece {} already exists, skip writing", self.piece_id(piece.number));
        Ok(piece.length as u64)
    }

    /// ensure_serving rejects operations once the store is marked for
    /// reclaim.
    fn ensure_serving(&self) -> Result<()> {
        if self.is_reclaiming() {
            return Err(Error::TaskReclaimed(format!(
                "{}/{}",
                self.task_id, self.peer_id
            )));
        }

        Ok(())
    }

    /// touch records the current instant as the last access.
    fn touch(&self) {
        if let Ok(mut last_access) = self.last_access.write() {
            *last_access = Instant::now();
        }
    }

    /// piece_id returns the piece id.
    #[inline]
    fn piece_id(&self, number: u32) -> String {
        format!("{}-{}", self.task_id, number)
    }
}

/// remove_data_file removes the task data path. A symbolic link target is
/// removed only when the daemon owns it, so recovered links never delete user
/// files.
pub(crate) async fn remove_data_file(path: &Path, data_root: &Path) -> Result<()> {
    let file_metadata = match fs::symlink_metadata(path).await {
        Ok(file_metadata) => file_metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    if file_metadata.file_type().is_symlink() {
        if let Ok(target) = fs::read_link(path).await {
            if is_owned_data_file(&target, data_root) {
                remove_file_ignore_missing(&target)
                    .await
                    .unwrap_or_else(|err| {
                        warn!("remove link target {:?} failed: {}", target, err);
                    });
            }
        }
    }

    fs::remove_file(path).await?;
    Ok(())
}

/// is_owned_data_file returns whether the daemon owns the file, that is when
/// it lives under the data root or carries the hidden cache file marker.
fn is_owned_data_file(path: &Path, data_root: &Path) -> bool {
    if path.starts_with(data_root) {
        return true;
    }

    path.file_name()
        .map(|name| name.to_string_lossy().contains(CACHE_FILE_INFIX))
        .unwrap_or(false)
}

/// remove_file_ignore_missing removes a file, an already missing file is not
/// an error.
async fn remove_file_ignore_missing(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
