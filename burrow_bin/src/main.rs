//! The main executable for the burrow database.
//!
//! Primes the data directory, replays the write-ahead log, then hands the
//! session to the REPL.

mod repl;

use std::sync::Arc;

use log::info;

use keystone::lock_manager::LockManager;
use keystone::recovery::{prime, RecoveryManager};
use keystone::transaction::TransactionManager;

fn main() -> std::process::ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let data_dir = std::env::var("BURROW_DATA_DIR").unwrap_or_else(|_| "data".to_string());

    match run(&data_dir) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn run(data_dir: &str) -> keystone::Result<()> {
    let db = prime(data_dir)?;
    let tm = TransactionManager::new(Arc::new(LockManager::new()));
    let rm = RecoveryManager::new(db.clone(), tm.clone())?;
    rm.recover()?;
    info!("database ready at {data_dir}");

    repl::run(&db, &tm, &rm)
}
