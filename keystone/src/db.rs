//! The table catalog: named indexes living under one data directory.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use log::info;
use parking_lot::RwLock;

use crate::btree::BTreeIndex;
use crate::error::{KeystoneError, Result};
use crate::hash::HashIndex;
use crate::meta::{read_meta, TableMeta};
use crate::pager::Pager;
use crate::Entry;

/// Which on-disk organization a table uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    BTree,
    Hash,
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKind::BTree => write!(f, "btree"),
            IndexKind::Hash => write!(f, "hash"),
        }
    }
}

impl FromStr for IndexKind {
    type Err = KeystoneError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "btree" => Ok(IndexKind::BTree),
            "hash" => Ok(IndexKind::Hash),
            other => Err(KeystoneError::BadLogLine(format!(
                "unknown index kind {other}"
            ))),
        }
    }
}

/// One named table. Keys are unique within a table regardless of the
/// underlying organization.
pub enum Table {
    BTree(BTreeIndex),
    Hash(HashIndex),
}

impl Table {
    pub fn name(&self) -> &str {
        match self {
            Table::BTree(t) => t.name(),
            Table::Hash(t) => t.name(),
        }
    }

    pub fn kind(&self) -> IndexKind {
        match self {
            Table::BTree(_) => IndexKind::BTree,
            Table::Hash(_) => IndexKind::Hash,
        }
    }

    pub(crate) fn pager(&self) -> &Arc<Pager> {
        match self {
            Table::BTree(t) => t.pager(),
            Table::Hash(t) => t.pager(),
        }
    }

    pub fn find(&self, key: i64) -> Result<Option<Entry>> {
        match self {
            Table::BTree(t) => t.find(key),
            Table::Hash(t) => t.find(key),
        }
    }

    pub fn insert(&self, key: i64, value: i64) -> Result<()> {
        match self {
            Table::BTree(t) => t.insert(key, value),
            Table::Hash(t) => {
                // The raw hash table appends blindly; uniqueness is enforced
                // here.
                if t.find(key)?.is_some() {
                    return Err(KeystoneError::Duplicate(key));
                }
                t.insert(key, value)
            }
        }
    }

    pub fn update(&self, key: i64, value: i64) -> Result<()> {
        match self {
            Table::BTree(t) => t.update(key, value),
            Table::Hash(t) => t.update(key, value),
        }
    }

    /// Deleting an absent key is a silent no-op for both organizations.
    pub fn delete(&self, key: i64) -> Result<()> {
        match self {
            Table::BTree(t) => t.delete(key),
            Table::Hash(t) => t.delete(key),
        }
    }

    pub fn select(&self) -> Result<Vec<Entry>> {
        match self {
            Table::BTree(t) => t.select(),
            Table::Hash(t) => t.select(),
        }
    }

    /// Write the meta sidecar and flush every dirty page.
    pub fn sync(&self) -> Result<()> {
        match self {
            Table::BTree(t) => t.close(),
            Table::Hash(t) => t.close(),
        }
    }
}

/// The set of tables under one base directory, plus the directory itself.
pub struct Database {
    base: PathBuf,
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl Database {
    /// Open the data directory, rediscovering any tables from their `.meta`
    /// sidecars.
    pub fn open<P: AsRef<Path>>(base: P) -> Result<Arc<Self>> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base)?;

        let mut tables = HashMap::new();
        for dir_entry in fs::read_dir(&base)? {
            let meta_path = dir_entry?.path();
            if meta_path.extension().and_then(|e| e.to_str()) != Some("meta") {
                continue;
            }
            let Some(name) = meta_path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let data_path = base.join(name);
            let table = match read_meta(&meta_path)? {
                TableMeta::BTree { .. } => {
                    Table::BTree(BTreeIndex::open(name, &data_path, &meta_path)?)
                }
                TableMeta::Hash { .. } => {
                    Table::Hash(HashIndex::open(name, &data_path, &meta_path)?)
                }
            };
            tables.insert(name.to_string(), Arc::new(table));
        }
        info!(
            "opened database at {} with {} tables",
            base.display(),
            tables.len()
        );

        Ok(Arc::new(Self {
            base,
            tables: RwLock::new(tables),
        }))
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    pub fn create_table(&self, kind: IndexKind, name: &str) -> Result<Arc<Table>> {
        let mut tables = self.tables.write();
        if tables.contains_key(name) {
            return Err(KeystoneError::TableExists(name.to_string()));
        }
        let data_path = self.base.join(name);
        let meta_path = self.base.join(format!("{name}.meta"));
        let table = match kind {
            IndexKind::BTree => Table::BTree(BTreeIndex::create(name, &data_path, &meta_path)?),
            IndexKind::Hash => Table::Hash(HashIndex::create(name, &data_path, &meta_path)?),
        };
        let table = Arc::new(table);
        tables.insert(name.to_string(), table.clone());
        Ok(table)
    }

    pub fn get_table(&self, name: &str) -> Result<Arc<Table>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| KeystoneError::NoSuchTable(name.to_string()))
    }

    pub fn tables(&self) -> Vec<Arc<Table>> {
        self.tables.read().values().cloned().collect()
    }

    /// Flush every table and its meta sidecar.
    pub fn close(&self) -> Result<()> {
        for table in self.tables.read().values() {
            table.sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_catalog_create_get_reopen() {
        let dir = tempdir().unwrap();
        {
            let db = Database::open(dir.path()).unwrap();
            let t = db.create_table(IndexKind::BTree, "accounts").unwrap();
            t.insert(1, 100).unwrap();
            assert!(matches!(
                db.create_table(IndexKind::Hash, "accounts"),
                Err(KeystoneError::TableExists(_))
            ));
            db.create_table(IndexKind::Hash, "sessions").unwrap();
            db.close().unwrap();
        }
        let db = Database::open(dir.path()).unwrap();
        let t = db.get_table("accounts").unwrap();
        assert_eq!(t.kind(), IndexKind::BTree);
        assert_eq!(t.find(1).unwrap().unwrap().value, 100);
        assert_eq!(db.get_table("sessions").unwrap().kind(), IndexKind::Hash);
        assert!(matches!(
            db.get_table("nope"),
            Err(KeystoneError::NoSuchTable(_))
        ));
    }

    #[test]
    fn test_hash_table_insert_is_unique_at_catalog_level() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let t = db.create_table(IndexKind::Hash, "h").unwrap();
        t.insert(7, 70).unwrap();
        assert!(matches!(t.insert(7, 71), Err(KeystoneError::Duplicate(7))));
        assert_eq!(t.find(7).unwrap().unwrap().value, 70);
    }
}
