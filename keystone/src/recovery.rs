//! The recovery manager: appends write-ahead records before effects become
//! visible, keeps per-transaction log stacks for fast rollback, takes
//! checkpoints with a `-recovery/` snapshot of the data directory, and
//! replays the log after a crash (redo forward, undo backward).

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::db::{Database, IndexKind, Table};
use crate::error::{KeystoneError, Result};
use crate::lock_manager::LockMode;
use crate::transaction::TransactionManager;
use crate::wal::{Action, LogRecord};
use crate::Entry;

/// Name of the log file inside the data directory.
pub const LOG_FILE_NAME: &str = "db.log";

pub struct RecoveryManager {
    db: Arc<Database>,
    tm: Arc<TransactionManager>,
    // Per-transaction record stacks, newest last, so rollback never has to
    // re-read the log file.
    tx_stack: Mutex<HashMap<Uuid, Vec<LogRecord>>>,
    log_file: Mutex<File>,
    log_path: PathBuf,
}

impl RecoveryManager {
    pub fn new(db: Arc<Database>, tm: Arc<TransactionManager>) -> Result<Self> {
        let log_path = db.base_path().join(LOG_FILE_NAME);
        let log_file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&log_path)?;
        Ok(Self {
            db,
            tm,
            tx_stack: Mutex::new(HashMap::new()),
            log_file: Mutex::new(log_file),
            log_path,
        })
    }

    /// Append one record and fsync. Called before the corresponding page
    /// mutation becomes visible to other transactions.
    fn append(&self, record: &LogRecord) -> Result<()> {
        let mut file = self.log_file.lock();
        writeln!(file, "{record}")?;
        file.sync_all()?;
        Ok(())
    }

    pub fn log_table(&self, kind: IndexKind, name: &str) -> Result<()> {
        self.append(&LogRecord::Table {
            table_type: kind.to_string(),
            name: name.to_string(),
        })
    }

    pub fn log_edit(
        &self,
        client: Uuid,
        table: &str,
        action: Action,
        key: i64,
        old_value: i64,
        new_value: i64,
    ) -> Result<()> {
        let record = LogRecord::Edit {
            client,
            table: table.to_string(),
            action,
            key,
            old_value,
            new_value,
        };
        self.tx_stack
            .lock()
            .entry(client)
            .or_default()
            .push(record.clone());
        self.append(&record)
    }

    pub fn log_start(&self, client: Uuid) -> Result<()> {
        let record = LogRecord::Start { client };
        self.tx_stack.lock().insert(client, vec![record.clone()]);
        self.append(&record)
    }

    pub fn log_commit(&self, client: Uuid) -> Result<()> {
        self.tx_stack.lock().remove(&client);
        self.append(&LogRecord::Commit { client })
    }

    /// Quiesce every table, flush it, snapshot the data directory to the
    /// `-recovery/` sibling, and append a checkpoint record naming the
    /// still-active transactions. The snapshot is taken while the update
    /// latches are held and before the record is appended, so it can never
    /// contain an effect the log tail does not know about.
    pub fn checkpoint(&self) -> Result<()> {
        let tables = self.db.tables();
        // Holding the log file for the whole checkpoint keeps start/commit
        // records from interleaving with the snapshot, so the active set in
        // the record is exact.
        let mut file = self.log_file.lock();
        let guards: Vec<_> = tables.iter().map(|t| t.pager().lock_all_updates()).collect();
        for table in &tables {
            table.sync()?;
        }
        self.delta()?;
        let record = LogRecord::Checkpoint {
            clients: self.tm.active_clients(),
        };
        writeln!(file, "{record}")?;
        file.sync_all()?;
        drop(guards);
        info!("checkpoint complete over {} tables", tables.len());
        Ok(())
    }

    /// Copy the data directory over the `-recovery/` sibling. The log file
    /// is excluded: the snapshot captures pages as of the checkpoint while
    /// the full log keeps driving redo.
    fn delta(&self) -> Result<()> {
        let base = self.db.base_path();
        let recovery = recovery_sibling(base);
        if recovery.exists() {
            fs::remove_dir_all(&recovery)?;
        }
        copy_dir_excluding(base, &recovery, LOG_FILE_NAME)?;
        Ok(())
    }

    /// Undo this transaction's edits newest-to-oldest from its in-memory
    /// stack, then commit it to release locks and retire the stack.
    pub fn rollback(&self, client: Uuid) -> Result<()> {
        let stack = self
            .tx_stack
            .lock()
            .get(&client)
            .cloned()
            .ok_or(KeystoneError::NoSuchTransaction)?;
        if !matches!(stack.first(), Some(LogRecord::Start { .. }) | None) {
            return Err(KeystoneError::CorruptDb(
                "transaction log stack does not begin with start".to_string(),
            ));
        }
        for record in stack.iter().skip(1).rev() {
            self.undo(record)?;
        }
        self.log_commit(client)?;
        self.tm.commit(client)?;
        Ok(())
    }

    /// Apply the inverse of one edit record through the locked statement
    /// path.
    fn undo(&self, record: &LogRecord) -> Result<()> {
        let LogRecord::Edit {
            client,
            table,
            action,
            key,
            old_value,
            ..
        } = record
        else {
            return Err(KeystoneError::CorruptDb(
                "only edits can be undone".to_string(),
            ));
        };
        match action {
            Action::Insert => self.handle_delete(*client, table, *key),
            Action::Update => self.handle_update(*client, table, *key, *old_value),
            Action::Delete => self.handle_insert(*client, table, *key, *old_value),
        }
    }

    /// Re-apply one edit record without locks; used only by the redo pass.
    /// Inserts fall through to updates when the key exists, updates fall
    /// through to inserts when it does not, deletes are idempotent.
    fn redo(&self, record: &LogRecord) -> Result<()> {
        let LogRecord::Edit {
            table,
            action,
            key,
            new_value,
            ..
        } = record
        else {
            return Err(KeystoneError::CorruptDb(
                "only edits can be redone".to_string(),
            ));
        };
        let table = self.db.get_table(table)?;
        match action {
            Action::Insert => match table.insert(*key, *new_value) {
                Err(KeystoneError::Duplicate(_)) => table.update(*key, *new_value),
                other => other,
            },
            Action::Update => match table.update(*key, *new_value) {
                Err(KeystoneError::MissingForUpdate(_)) => table.insert(*key, *new_value),
                other => other,
            },
            Action::Delete => table.delete(*key),
        }
    }

    /// Full crash recovery: parse the whole log, seed the active set from
    /// the last checkpoint, redo forward from there, then undo still-active
    /// transactions from the tail backwards, committing each one at its
    /// start record.
    pub fn recover(&self) -> Result<()> {
        let text = fs::read_to_string(&self.log_path)?;
        let records = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<LogRecord>>>()?;

        let checkpoint_pos = records
            .iter()
            .rposition(|r| matches!(r, LogRecord::Checkpoint { .. }));

        let mut active: HashSet<Uuid> = HashSet::new();
        let redo_from = match checkpoint_pos {
            Some(pos) => {
                if let LogRecord::Checkpoint { clients } = &records[pos] {
                    for &client in clients {
                        active.insert(client);
                        self.tm.begin(client)?;
                    }
                }
                pos + 1
            }
            None => 0,
        };

        for record in &records[redo_from..] {
            match record {
                LogRecord::Start { client } => {
                    active.insert(*client);
                    // The id may already be seeded from the checkpoint set if
                    // its start record raced the checkpoint.
                    match self.tm.begin(*client) {
                        Ok(()) | Err(KeystoneError::AlreadyBegun) => {}
                        Err(e) => return Err(e),
                    }
                }
                LogRecord::Commit { client } => {
                    active.remove(client);
                    self.tm.commit(*client)?;
                }
                LogRecord::Table { table_type, name } => {
                    if self.db.get_table(name).is_err() {
                        self.db.create_table(table_type.parse()?, name)?;
                    }
                }
                LogRecord::Edit { .. } => self.redo(record)?,
                LogRecord::Checkpoint { .. } => {}
            }
        }

        for record in records.iter().rev() {
            if active.is_empty() {
                break;
            }
            match record {
                LogRecord::Edit { client, .. } if active.contains(client) => {
                    self.undo(record)?;
                }
                LogRecord::Start { client } if active.contains(client) => {
                    self.log_commit(*client)?;
                    self.tm.commit(*client)?;
                    active.remove(client);
                }
                _ => {}
            }
        }

        if !active.is_empty() {
            warn!("{} transactions had no start record", active.len());
            for client in active {
                self.log_commit(client)?;
                self.tm.commit(client)?;
            }
        }
        info!("recovery replayed {} records", records.len());
        Ok(())
    }

    // Locked statement execution, shared by clients and the undo path.

    pub fn handle_create_table(&self, kind: IndexKind, name: &str) -> Result<Arc<Table>> {
        let table = self.db.create_table(kind, name)?;
        self.log_table(kind, name)?;
        Ok(table)
    }

    // Each handler validates under the lock, appends its record, then
    // applies, so the record always reaches the disk ahead of the effect.

    pub fn handle_insert(&self, client: Uuid, table_name: &str, key: i64, value: i64) -> Result<()> {
        let table = self.db.get_table(table_name)?;
        self.tm.lock(client, table_name, key, LockMode::Write)?;
        if table.find(key)?.is_some() {
            return Err(KeystoneError::Duplicate(key));
        }
        self.log_edit(client, table_name, Action::Insert, key, 0, value)?;
        table.insert(key, value)
    }

    pub fn handle_update(&self, client: Uuid, table_name: &str, key: i64, value: i64) -> Result<()> {
        let table = self.db.get_table(table_name)?;
        self.tm.lock(client, table_name, key, LockMode::Write)?;
        let old = table
            .find(key)?
            .ok_or(KeystoneError::MissingForUpdate(key))?;
        self.log_edit(client, table_name, Action::Update, key, old.value, value)?;
        table.update(key, value)
    }

    /// Deleting an absent key locks the resource but logs nothing.
    pub fn handle_delete(&self, client: Uuid, table_name: &str, key: i64) -> Result<()> {
        let table = self.db.get_table(table_name)?;
        self.tm.lock(client, table_name, key, LockMode::Write)?;
        let Some(old) = table.find(key)? else {
            return Ok(());
        };
        self.log_edit(client, table_name, Action::Delete, key, old.value, 0)?;
        table.delete(key)
    }

    pub fn handle_find(&self, client: Uuid, table_name: &str, key: i64) -> Result<Entry> {
        let table = self.db.get_table(table_name)?;
        self.tm.lock(client, table_name, key, LockMode::Read)?;
        table.find(key)?.ok_or(KeystoneError::NotFound(key))
    }

    pub fn handle_select(&self, table_name: &str) -> Result<Vec<Entry>> {
        self.db.get_table(table_name)?.select()
    }
}

/// Prepare the data folder on startup: fresh start, plain open, or restore
/// from the `-recovery/` snapshot. The log file survives a restore so the
/// tail written after the last checkpoint still drives redo.
pub fn prime<P: AsRef<Path>>(folder: P) -> Result<Arc<Database>> {
    let folder = folder.as_ref();
    let recovery = recovery_sibling(folder);

    if !folder.exists() {
        fs::create_dir_all(&recovery)?;
        return Database::open(folder);
    }
    if !recovery.exists() {
        return Database::open(folder);
    }

    let log_path = folder.join(LOG_FILE_NAME);
    let saved_log = if log_path.exists() {
        Some(fs::read(&log_path)?)
    } else {
        None
    };
    fs::remove_dir_all(folder)?;
    copy_dir_excluding(&recovery, folder, LOG_FILE_NAME)?;
    if let Some(bytes) = saved_log {
        fs::write(&log_path, bytes)?;
    }
    info!("restored {} from its recovery snapshot", folder.display());
    Database::open(folder)
}

fn recovery_sibling(folder: &Path) -> PathBuf {
    let mut name = folder
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("data"))
        .to_os_string();
    name.push("-recovery");
    folder.with_file_name(name)
}

fn copy_dir_excluding(src: &Path, dst: &Path, skip: &str) -> Result<()> {
    fs::create_dir_all(dst)?;
    for dir_entry in fs::read_dir(src)? {
        let dir_entry = dir_entry?;
        let path = dir_entry.path();
        let name = dir_entry.file_name();
        if name.to_str() == Some(skip) {
            continue;
        }
        let target = dst.join(&name);
        if path.is_dir() {
            copy_dir_excluding(&path, &target, skip)?;
        } else {
            fs::copy(&path, &target)?;
        }
    }
    Ok(())
}
