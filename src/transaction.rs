// src/transaction.rs

//! Deferred multi-statement transaction scope
//!
//! Commands queue while the scope is `Active`; `commit()` and `rollback()`
//! only mark intent. `complete()` performs the work: one connection, one
//! backend transaction, strict FIFO execution, commit at the end. Any
//! failure rolls the transaction back, moves the scope to `Failed`, and
//! propagates the original error. Results land in typed outcome slots;
//! reader commands may additionally stream rows into a sink callback.

use rusqlite::Connection;
use tracing::debug;

use crate::command::SqlCommand;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::value::Value;

/// How a queued command is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    NonQuery,
    Scalar,
    Reader,
}

/// Scope lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Active,
    Committing,
    RollingBack,
    Committed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Commit,
    Rollback,
}

/// Typed result slot for one executed command
#[derive(Debug)]
pub enum CommandOutcome {
    RowsAffected(usize),
    Scalar(Option<Value>),
    /// Number of rows streamed to the sink
    RowsRead(usize),
}

/// Row callback for `ExecMode::Reader` commands
pub type RowSink = Box<dyn FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<()> + Send>;

struct ScopedCommand {
    command: SqlCommand,
    mode: ExecMode,
    sink: Option<RowSink>,
}

/// A queue of commands executed under one backend transaction
pub struct TransactionScope<'s> {
    store: &'s Store,
    operations: Vec<ScopedCommand>,
    state: ScopeState,
    intent: Option<Intent>,
}

impl<'s> TransactionScope<'s> {
    pub(crate) fn new(store: &'s Store) -> Self {
        Self {
            store,
            operations: Vec::new(),
            state: ScopeState::Active,
            intent: None,
        }
    }

    pub fn state(&self) -> ScopeState {
        self.state
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state == ScopeState::Active {
            Ok(())
        } else {
            Err(Error::ValidationFailed(format!(
                "Transaction scope is {:?}; it no longer accepts operations",
                self.state
            )))
        }
    }

    /// Queue a command for deferred execution
    pub fn add_operation(&mut self, command: SqlCommand, mode: ExecMode) -> Result<()> {
        self.ensure_active()?;
        self.operations.push(ScopedCommand {
            command,
            mode,
            sink: None,
        });
        Ok(())
    }

    /// Queue a reader command whose rows stream into `sink`
    pub fn add_read(&mut self, command: SqlCommand, sink: RowSink) -> Result<()> {
        self.ensure_active()?;
        self.operations.push(ScopedCommand {
            command,
            mode: ExecMode::Reader,
            sink: Some(sink),
        });
        Ok(())
    }

    /// Mark the scope for commit; nothing executes yet
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.intent = Some(Intent::Commit);
        Ok(())
    }

    /// Mark the scope for rollback; queued commands will be discarded
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.intent = Some(Intent::Rollback);
        Ok(())
    }

    /// Execute the queued commands according to the marked intent
    ///
    /// With commit intent and a non-empty queue: open one connection,
    /// begin one transaction, run every command FIFO, then commit. On any
    /// error the transaction rolls back and the error propagates. Without
    /// commit intent the queue is discarded untouched.
    pub fn complete(mut self) -> Result<Vec<CommandOutcome>> {
        self.ensure_active()?;

        match self.intent {
            Some(Intent::Commit) if !self.operations.is_empty() => {}
            _ => {
                self.state = ScopeState::RollingBack;
                debug!(
                    operations = self.operations.len(),
                    "transaction scope discarded without execution"
                );
                return Ok(Vec::new());
            }
        }

        self.state = ScopeState::Committing;
        let conn = self.store.connection()?;
        let tx = self.store.begin_write(&conn)?;

        let mut outcomes = Vec::with_capacity(self.operations.len());
        for entry in &mut self.operations {
            match execute_scoped(&tx, entry) {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    // Dropping the transaction rolls it back
                    drop(tx);
                    self.state = ScopeState::Failed;
                    return Err(err);
                }
            }
        }

        tx.commit()?;
        self.state = ScopeState::Committed;
        debug!(commands = outcomes.len(), "transaction scope committed");
        Ok(outcomes)
    }
}

fn execute_scoped(conn: &Connection, entry: &mut ScopedCommand) -> Result<CommandOutcome> {
    match entry.mode {
        ExecMode::NonQuery => Ok(CommandOutcome::RowsAffected(entry.command.execute(conn)?)),
        ExecMode::Scalar => Ok(CommandOutcome::Scalar(entry.command.query_scalar(conn)?)),
        ExecMode::Reader => {
            let mut stmt = conn.prepare(&entry.command.sql)?;
            let mut rows = stmt.query(entry.command.bind_args().as_slice())?;
            let mut count = 0usize;
            while let Some(row) = rows.next()? {
                if let Some(sink) = entry.sink.as_mut() {
                    sink(row).map_err(Error::Database)?;
                }
                count += 1;
            }
            Ok(CommandOutcome::RowsRead(count))
        }
    }
}
