//! Per-table `.meta` sidecar files. The data file holds only pages; the
//! sidecar persists whatever the index needs to find its way back in:
//! the root page number for a B+-tree, the directory for a hash table.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{KeystoneError, Result};
use crate::PageId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum TableMeta {
    BTree {
        root_pn: PageId,
    },
    Hash {
        global_depth: u64,
        buckets: Vec<PageId>,
    },
}

pub(crate) fn read_meta(path: &Path) -> Result<TableMeta> {
    let bytes = fs::read(path)?;
    bincode::deserialize(&bytes)
        .map_err(|e| KeystoneError::CorruptDb(format!("bad meta file {}: {e}", path.display())))
}

pub(crate) fn write_meta(path: &Path, meta: &TableMeta) -> Result<()> {
    let bytes = bincode::serialize(meta)
        .map_err(|e| KeystoneError::CorruptDb(format!("cannot encode meta: {e}")))?;
    fs::write(path, bytes)?;
    Ok(())
}
