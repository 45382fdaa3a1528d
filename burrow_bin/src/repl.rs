//! Line-oriented client REPL.
//!
//! One v4 uuid identifies the session to the transaction manager.
//! Statements issued outside an explicit `begin`/`commit` run in an
//! implicit single-statement transaction. A deadlock, or any other fatal
//! engine error, rolls the current transaction back.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use log::warn;
use uuid::Uuid;

use keystone::db::Database;
use keystone::recovery::RecoveryManager;
use keystone::transaction::TransactionManager;
use keystone::{KeystoneError, Result};

const PROMPT: &str = "burrow> ";

struct Session<'a> {
    client: Uuid,
    in_tx: bool,
    db: &'a Arc<Database>,
    tm: &'a Arc<TransactionManager>,
    rm: &'a RecoveryManager,
}

pub fn run(
    db: &Arc<Database>,
    tm: &Arc<TransactionManager>,
    rm: &RecoveryManager,
) -> Result<()> {
    let mut session = Session {
        client: Uuid::new_v4(),
        in_tx: false,
        db,
        tm,
        rm,
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        write!(stdout, "{PROMPT}")?;
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        if tokens[0] == "quit" {
            break;
        }
        if let Err(e) = session.dispatch(&tokens) {
            println!("error: {e}");
            if e.is_fatal() && session.in_tx {
                match session.rm.rollback(session.client) {
                    Ok(()) => {
                        session.in_tx = false;
                        println!("transaction aborted");
                    }
                    Err(roll) => warn!("rollback failed: {roll}"),
                }
            }
        }
    }

    if session.in_tx {
        session.rm.rollback(session.client)?;
    }
    session.db.close()?;
    Ok(())
}

impl Session<'_> {
    fn dispatch(&mut self, tokens: &[&str]) -> Result<()> {
        match tokens {
            ["begin"] => self.begin(),
            ["commit"] => self.commit(),
            ["abort"] => self.abort(),
            ["checkpoint"] => self.rm.checkpoint(),
            ["create", kind, "table", name] => match kind.parse() {
                Ok(kind) => {
                    self.rm.handle_create_table(kind, name)?;
                    Ok(())
                }
                Err(_) => {
                    println!("expected btree or hash");
                    Ok(())
                }
            },
            ["insert", key, value, "into", name] => {
                let (Some(key), Some(value)) = (parse_int(key), parse_int(value)) else {
                    println!("expected integer arguments");
                    return Ok(());
                };
                self.statement(|s| s.rm.handle_insert(s.client, name, key, value))
            }
            ["update", name, key, value] => {
                let (Some(key), Some(value)) = (parse_int(key), parse_int(value)) else {
                    println!("expected integer arguments");
                    return Ok(());
                };
                self.statement(|s| s.rm.handle_update(s.client, name, key, value))
            }
            ["delete", key, "from", name] => {
                let Some(key) = parse_int(key) else {
                    println!("expected an integer key");
                    return Ok(());
                };
                self.statement(|s| s.rm.handle_delete(s.client, name, key))
            }
            ["find", key, "in", name] => {
                let Some(key) = parse_int(key) else {
                    println!("expected an integer key");
                    return Ok(());
                };
                self.statement(|s| {
                    let entry = s.rm.handle_find(s.client, name, key)?;
                    println!("({}, {})", entry.key, entry.value);
                    Ok(())
                })
            }
            ["select", "from", name] => {
                for entry in self.rm.handle_select(name)? {
                    println!("({}, {})", entry.key, entry.value);
                }
                Ok(())
            }
            _ => {
                println!("unrecognized command");
                Ok(())
            }
        }
    }

    fn begin(&mut self) -> Result<()> {
        self.tm.begin(self.client)?;
        if let Err(e) = self.rm.log_start(self.client) {
            let _ = self.tm.commit(self.client);
            return Err(e);
        }
        self.in_tx = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.in_tx {
            return Err(KeystoneError::NoSuchTransaction);
        }
        self.rm.log_commit(self.client)?;
        self.tm.commit(self.client)?;
        self.in_tx = false;
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        if !self.in_tx {
            return Err(KeystoneError::NoSuchTransaction);
        }
        self.rm.rollback(self.client)?;
        self.in_tx = false;
        Ok(())
    }

    /// Run one statement, wrapping it in an implicit transaction when no
    /// explicit one is open.
    fn statement(&mut self, op: impl FnOnce(&Self) -> Result<()>) -> Result<()> {
        if self.in_tx {
            return op(self);
        }
        self.begin()?;
        let outcome = op(self);
        match outcome {
            Ok(()) => self.commit(),
            Err(e) if !e.is_fatal() => {
                // The statement failed but the transaction is healthy;
                // commit to release the locks it took.
                self.commit()?;
                Err(e)
            }
            Err(e) => {
                self.rm.rollback(self.client)?;
                self.in_tx = false;
                Err(e)
            }
        }
    }
}

fn parse_int(token: &str) -> Option<i64> {
    token.parse().ok()
}
