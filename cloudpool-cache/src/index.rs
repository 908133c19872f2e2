//! On-disk checkpoint of cache metadata (`index.json`).

use std::io::{self, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::CacheEntry;

const INDEX_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    saved_at: DateTime<Utc>,
    entries: Vec<CacheEntry>,
}

/// Read a checkpoint. A missing file is an empty index.
pub(crate) fn load(path: &Path) -> io::Result<Vec<CacheEntry>> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let index: IndexFile = serde_json::from_slice(&bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if index.version != INDEX_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported cache index version {}", index.version),
        ));
    }
    Ok(index.entries)
}

/// Write a checkpoint via a sibling temp file and rename.
pub(crate) fn save(path: &Path, entries: &[CacheEntry]) -> io::Result<()> {
    let index = IndexFile {
        version: INDEX_VERSION,
        saved_at: Utc::now(),
        entries: entries.to_vec(),
    };
    let json = serde_json::to_vec_pretty(&index)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}
