//! Persistent approximate membership set for `info_hash` identifiers
//! already fetched (or in flight), so a restart doesn't redo work.
//!
//! Backed by `bloomfilter::Bloom`, which never false-negatives and bounds
//! the false-positive rate by construction. `Bloom::len()` reports the
//! bitmap's bit count, not the number of elements added, so the element
//! count is tracked separately and persisted alongside the bitmap.
use std::io;
use std::path::Path;

use bloomfilter::Bloom;
use tracing::{info, instrument, warn};

pub struct SeenSet {
    bloom: Bloom<[u8; 20]>,
    count: u64,
}

impl SeenSet {
    pub fn new(capacity: usize, error_rate: f64) -> Self {
        Self {
            bloom: Bloom::new_for_fp_rate(capacity.max(1), error_rate)
                .expect("bloom filter parameters must be valid"),
            count: 0,
        }
    }

    /// Loads the filter from `path` if it exists; otherwise constructs a
    /// fresh one per spec.md §4.2. Any load failure other than a missing
    /// file is fatal (the caller surfaces it as a `CrawlerError`).
    #[instrument(skip(capacity, error_rate))]
    pub fn load_or_new(path: &Path, capacity: usize, error_rate: f64) -> io::Result<Self> {
        match Self::load_from(path) {
            Ok(set) => {
                info!(path = %path.display(), count = set.count, "loaded seen-set snapshot");
                Ok(set)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no seen-set snapshot found, starting fresh");
                Ok(Self::new(capacity, error_rate))
            }
            Err(e) => Err(e),
        }
    }

    pub fn load_from(path: &Path) -> io::Result<Self> {
        let data = std::fs::read(path)?;
        if data.len() < 8 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "snapshot too short"));
        }
        let (count_bytes, bitmap) = data.split_at(8);
        let count = u64::from_le_bytes(count_bytes.try_into().unwrap());
        let bloom = Bloom::from_bytes(bitmap.to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Self { bloom, count })
    }

    /// Writes the filter to `path` atomically: a temp file in the same
    /// directory, then a rename.
    pub fn snapshot_to(&self, path: &Path) -> io::Result<()> {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        {
            use io::Write;
            let mut file = tmp.as_file();
            file.write_all(&self.count.to_le_bytes())?;
            file.write_all(&self.bloom.to_bytes())?;
            file.sync_all()?;
        }
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn contains(&self, id: &[u8; 20]) -> bool {
        self.bloom.check(id)
    }

    pub fn add(&mut self, id: &[u8; 20]) {
        if !self.bloom.check_and_set(id) {
            self.count += 1;
        }
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Saves the filter at shutdown. Failure is logged and non-fatal per
/// spec.md §4.2.
pub fn snapshot_non_fatal(set: &SeenSet, path: &Path) {
    if let Err(e) = set.snapshot_to(path) {
        warn!(path = %path.display(), error = %e, "failed to snapshot seen-set, continuing shutdown");
    } else {
        info!(path = %path.display(), count = set.len(), "seen-set snapshot saved");
    }
}
