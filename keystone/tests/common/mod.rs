#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use keystone::db::Database;
use keystone::lock_manager::LockManager;
use keystone::recovery::{prime, RecoveryManager};
use keystone::transaction::TransactionManager;

/// A fully wired engine over the given data folder: primed database,
/// transaction manager and recovery manager.
pub struct Engine {
    pub db: Arc<Database>,
    pub tm: Arc<TransactionManager>,
    pub rm: Arc<RecoveryManager>,
}

/// Boot the engine the way the binary does, without running recovery.
pub fn boot(base: &Path) -> Engine {
    let db = prime(base).unwrap();
    let tm = TransactionManager::new(Arc::new(LockManager::new()));
    let rm = Arc::new(RecoveryManager::new(db.clone(), tm.clone()).unwrap());
    Engine { db, tm, rm }
}

/// Boot and replay the log, as a post-crash restart would.
pub fn boot_and_recover(base: &Path) -> Engine {
    let engine = boot(base);
    engine.rm.recover().unwrap();
    engine
}

impl Engine {
    /// Run one committed single-statement transaction.
    pub fn committed<F>(&self, op: F)
    where
        F: FnOnce(&RecoveryManager, uuid::Uuid) -> keystone::Result<()>,
    {
        let client = uuid::Uuid::new_v4();
        self.tm.begin(client).unwrap();
        self.rm.log_start(client).unwrap();
        op(&self.rm, client).unwrap();
        self.rm.log_commit(client).unwrap();
        self.tm.commit(client).unwrap();
    }
}
