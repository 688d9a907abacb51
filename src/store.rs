//! Torrent store (C4): persists retrieved `info` dictionaries as
//! `.torrent` files under a configured directory.
use std::path::PathBuf;

use tokio::sync::Mutex;
use tracing::{error, instrument};

use crate::node_id::InfoHash;

pub struct TorrentStore {
    dir: PathBuf,
    // Serializes writes so concurrent completers never interleave bytes
    // into the same file.
    write_lock: Mutex<()>,
}

impl TorrentStore {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, info_hash: &InfoHash) -> PathBuf {
        self.dir.join(format!("{}.torrent", info_hash.to_hex()))
    }

    /// Writes the bencoded `info` dictionary bytes for `info_hash`. An
    /// existing file of the same name is silently overwritten. Errors are
    /// logged and not propagated: a failed save never aborts the fetch that
    /// produced it.
    #[instrument(skip(self, bencoded_info_dict))]
    pub async fn save(&self, info_hash: &InfoHash, bencoded_info_dict: &[u8]) {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(info_hash);
        if let Err(e) = tokio::fs::write(&path, bencoded_info_dict).await {
            error!(path = %path.display(), error = %e, "failed to write torrent file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_writes_expected_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = TorrentStore::new(dir.path()).unwrap();
        let info_hash = InfoHash([1u8; 20]);

        store.save(&info_hash, b"d4:name9:test.ite").await;

        let path = dir.path().join(format!("{}.torrent", info_hash.to_hex()));
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, b"d4:name9:test.ite");
    }

    #[tokio::test]
    async fn save_overwrites_existing_file_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let store = TorrentStore::new(dir.path()).unwrap();
        let info_hash = InfoHash([2u8; 20]);

        store.save(&info_hash, b"first").await;
        store.save(&info_hash, b"first").await;

        let path = dir.path().join(format!("{}.torrent", info_hash.to_hex()));
        assert_eq!(std::fs::read(&path).unwrap(), b"first");
    }
}
