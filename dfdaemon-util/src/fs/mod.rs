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
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// device_id returns the id of the device holding path, used to decide
/// whether two paths can be hard linked. Returns None on platforms without
/// stable device ids, callers should attempt a hard link and fall back to a
/// symbolic link.
pub async fn device_id(path: &Path) -> Result<Option<u64>> {
    let metadata = fs::metadata(path).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        Ok(Some(metadata.dev()))
    }

    #[cfg(not(unix))]
    {
        let _ = metadata;
        Ok(None)
    }
}

/// write_file_atomic replaces the content of path without ever exposing a
/// partially written file. The content goes to a sibling temporary file which
/// is synced and renamed over path, so a crash leaves either the old document
/// or the new one, never a torn one.
pub async fn write_file_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::ValidationError(format!("invalid file path {:?}", path)))?;
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    let mut options = fs::OpenOptions::new();
    options.create(true).truncate(true).write(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut f = options.open(&tmp_path).await?;
    f.write_all(content).await?;
    f.sync_all().await?;
    drop(f);

    fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// symlink creates a symbolic link pointing to original at link.
pub async fn symlink(original: &Path, link: &Path) -> Result<()> {
    #[cfg(unix)]
    fs::symlink(original, link).await?;

    #[cfg(windows)]
    fs::symlink_file(original, link).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn should_write_file_atomic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("task.meta");

        write_file_atomic(&path, b"first").await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"first");

        write_file_atomic(&path, b"second").await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"second");

        // The temporary file never outlives the rename.
        assert!(!dir.path().join(".task.meta.tmp").exists());
    }

    #[tokio::test]
    async fn should_return_same_device_id_for_siblings() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"a").await.unwrap();
        fs::write(&b, b"b").await.unwrap();

        let dev_a = device_id(&a).await.unwrap();
        let dev_b = device_id(&b).await.unwrap();

        #[cfg(unix)]
        {
            assert!(dev_a.is_some());
            assert_eq!(dev_a, dev_b);
        }

        #[cfg(not(unix))]
        {
            assert!(dev_a.is_none());
            assert!(dev_b.is_none());
        }
    }

    #[tokio::test]
    async fn should_symlink() {
        let dir = tempdir().unwrap();
        let original = dir.path().join("original");
        let link = dir.path().join("link");
        fs::write(&original, b"content").await.unwrap();

        symlink(&original, &link).await.unwrap();
        assert_eq!(fs::read(&link).await.unwrap(), b"content");
        assert!(fs::symlink_metadata(&link)
            .await
            .unwrap()
            .file_type()
            .is_symlink());
    }
}
