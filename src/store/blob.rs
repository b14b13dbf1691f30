//! Content-addressed body storage on the filesystem: writes go to a
//! sibling temp file and are renamed into place, so readers never observe
//! a partial body.

use std::io;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Stores render bodies under `base_path/<key[0..2]>/<key>`, one file per
/// cache key. The two-character shard avoids a single directory holding
/// every blob in the store.
#[derive(Clone)]
pub struct BlobStore {
    base_path: PathBuf,
}

impl BlobStore {
    pub fn new(base_path: PathBuf) -> Self {
        BlobStore { base_path }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let shard = &key[..key.len().min(2)];
        self.base_path.join(shard).join(key)
    }

    /// Write `body` for `key`, atomically: write to a sibling temp file,
    /// then rename over the final path so a concurrent reader never
    /// observes a partial write.
    pub async fn put(&self, key: &str, body: &[u8]) -> io::Result<()> {
        let dest = self.path_for(key);
        let dir = dest.parent().expect("path_for always has a shard parent");
        fs::create_dir_all(dir).await?;

        let tmp = dir.join(format!(".{key}.tmp"));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(body).await?;
        file.flush().await?;
        drop(file);

        fs::rename(&tmp, &dest).await
    }

    /// Read the body for `key`, if present.
    pub async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Remove the body for `key`, ignoring a missing file.
    pub async fn delete(&self, key: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Whether a body file exists for `key`.
    pub async fn exists(&self, key: &str) -> bool {
        fs::metadata(self.path_for(key)).await.is_ok()
    }
}
