//! The transaction manager: strict two-phase locking over the lock
//! manager, with wait-for-graph deadlock detection ahead of every
//! potentially blocking acquisition.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{KeystoneError, Result};
use crate::graph::WaitForGraph;
use crate::lock_manager::{LockManager, LockMode, Resource};

/// One client's running transaction and the locks it holds.
pub struct Transaction {
    client_id: Uuid,
    resources: RwLock<HashMap<Resource, LockMode>>,
}

impl Transaction {
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn held(&self) -> HashMap<Resource, LockMode> {
        self.resources.read().clone()
    }
}

pub struct TransactionManager {
    lm: Arc<LockManager>,
    graph: WaitForGraph,
    // Makes edge insertion and cycle detection one atomic step, so of two
    // crossed lock requests exactly one observes the cycle.
    detect_latch: Mutex<()>,
    transactions: RwLock<HashMap<Uuid, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lm: Arc<LockManager>) -> Arc<Self> {
        Arc::new(Self {
            lm,
            graph: WaitForGraph::new(),
            detect_latch: Mutex::new(()),
            transactions: RwLock::new(HashMap::new()),
        })
    }

    pub fn get_transaction(&self, client: Uuid) -> Option<Arc<Transaction>> {
        self.transactions.read().get(&client).cloned()
    }

    /// Clients with a running transaction, for the checkpoint record.
    pub fn active_clients(&self) -> Vec<Uuid> {
        self.transactions.read().keys().copied().collect()
    }

    /// Start a transaction for this client; at most one may run per client.
    pub fn begin(&self, client: Uuid) -> Result<()> {
        let mut transactions = self.transactions.write();
        if transactions.contains_key(&client) {
            return Err(KeystoneError::AlreadyBegun);
        }
        transactions.insert(
            client,
            Arc::new(Transaction {
                client_id: client,
                resources: RwLock::new(HashMap::new()),
            }),
        );
        Ok(())
    }

    /// Acquire `(table, key)` in `mode` for this client's transaction.
    ///
    /// Holding the resource in an equal or stronger mode succeeds without
    /// touching the lock manager; a read-to-write upgrade fails. Before
    /// blocking, a wait-for edge is added towards every conflicting holder
    /// and the graph is checked; a cycle fails with `Deadlock` and the
    /// edges are withdrawn on every exit path.
    pub fn lock(&self, client: Uuid, table: &str, key: i64, mode: LockMode) -> Result<()> {
        let tx = self
            .get_transaction(client)
            .ok_or(KeystoneError::NoSuchTransaction)?;
        let resource = Resource {
            table: table.to_string(),
            key,
        };

        if let Some(&held) = tx.resources.read().get(&resource) {
            return match (held, mode) {
                (LockMode::Write, _) | (LockMode::Read, LockMode::Read) => Ok(()),
                (LockMode::Read, LockMode::Write) => Err(KeystoneError::WrongMode),
            };
        }

        let conflicting = {
            let _detect = self.detect_latch.lock();
            let conflicting = self.discover_conflicts(client, &resource, mode);
            for &other in &conflicting {
                self.graph.add_edge(client, other);
            }
            if self.graph.detect_cycle() {
                debug!("deadlock: {client} waiting on {conflicting:?}");
                for &other in &conflicting {
                    self.graph.remove_edge(client, other);
                }
                return Err(KeystoneError::Deadlock);
            }
            conflicting
        };
        // The edges stay in the graph for as long as the acquisition may
        // block, so a later request can see this one waiting.
        self.lm.lock(&resource, mode);
        for &other in &conflicting {
            self.graph.remove_edge(client, other);
        }

        tx.resources.write().insert(resource, mode);
        Ok(())
    }

    /// Release `(table, key)`; the mode must match the recorded one.
    /// Strict 2PL forbids locking after the first unlock, which is the
    /// caller's responsibility.
    pub fn unlock(&self, client: Uuid, table: &str, key: i64, mode: LockMode) -> Result<()> {
        let tx = self
            .get_transaction(client)
            .ok_or(KeystoneError::NoSuchTransaction)?;
        let resource = Resource {
            table: table.to_string(),
            key,
        };
        match tx.resources.read().get(&resource) {
            None => return Err(KeystoneError::NotHeld),
            Some(&held) if held != mode => return Err(KeystoneError::WrongMode),
            Some(_) => {}
        }
        self.lm.unlock(&resource, mode)?;
        tx.resources.write().remove(&resource);
        Ok(())
    }

    /// Release every lock this transaction holds and retire it.
    pub fn commit(&self, client: Uuid) -> Result<()> {
        let tx = self
            .transactions
            .write()
            .remove(&client)
            .ok_or(KeystoneError::NoSuchTransaction)?;
        for (resource, mode) in tx.resources.read().iter() {
            self.lm.unlock(resource, *mode)?;
        }
        Ok(())
    }

    /// All other transactions holding this resource in a conflicting mode
    /// (a writer on either side conflicts).
    fn discover_conflicts(&self, client: Uuid, resource: &Resource, mode: LockMode) -> Vec<Uuid> {
        self.transactions
            .read()
            .iter()
            .filter(|(id, _)| **id != client)
            .filter(|(_, tx)| {
                tx.resources
                    .read()
                    .get(resource)
                    .is_some_and(|&held| held == LockMode::Write || mode == LockMode::Write)
            })
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn manager() -> Arc<TransactionManager> {
        TransactionManager::new(Arc::new(LockManager::new()))
    }

    #[test]
    fn test_begin_twice_fails() {
        let tm = manager();
        let client = Uuid::new_v4();
        tm.begin(client).unwrap();
        assert!(matches!(tm.begin(client), Err(KeystoneError::AlreadyBegun)));
    }

    #[test]
    fn test_reentrant_lock_and_no_upgrade() {
        let tm = manager();
        let client = Uuid::new_v4();
        tm.begin(client).unwrap();

        tm.lock(client, "t", 1, LockMode::Read).unwrap();
        tm.lock(client, "t", 1, LockMode::Read).unwrap();
        assert!(matches!(
            tm.lock(client, "t", 1, LockMode::Write),
            Err(KeystoneError::WrongMode)
        ));

        tm.lock(client, "t", 2, LockMode::Write).unwrap();
        // Write already held satisfies both modes.
        tm.lock(client, "t", 2, LockMode::Read).unwrap();
        tm.lock(client, "t", 2, LockMode::Write).unwrap();
        tm.commit(client).unwrap();
    }

    #[test]
    fn test_unlock_checks_mode_and_possession() {
        let tm = manager();
        let client = Uuid::new_v4();
        tm.begin(client).unwrap();
        tm.lock(client, "t", 1, LockMode::Read).unwrap();
        assert!(matches!(
            tm.unlock(client, "t", 1, LockMode::Write),
            Err(KeystoneError::WrongMode)
        ));
        assert!(matches!(
            tm.unlock(client, "t", 9, LockMode::Read),
            Err(KeystoneError::NotHeld)
        ));
        tm.unlock(client, "t", 1, LockMode::Read).unwrap();
        tm.commit(client).unwrap();
    }

    #[test]
    fn test_deadlock_aborts_exactly_one() {
        let tm = manager();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        tm.begin(a).unwrap();
        tm.begin(b).unwrap();

        tm.lock(a, "t", 1, LockMode::Write).unwrap();
        tm.lock(b, "t", 2, LockMode::Write).unwrap();

        let tm2 = tm.clone();
        let handle = thread::spawn(move || tm2.lock(a, "t", 2, LockMode::Write));
        // Let A queue up behind B before B closes the cycle.
        thread::sleep(Duration::from_millis(50));
        let b_result = tm.lock(b, "t", 1, LockMode::Write);

        assert!(matches!(b_result, Err(KeystoneError::Deadlock)));
        tm.commit(b).unwrap();
        handle.join().unwrap().unwrap();
        tm.commit(a).unwrap();
    }
}
