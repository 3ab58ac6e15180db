use async_trait::async_trait;
use parking_lot::Mutex;

use super::traits::{ChannelTransaction, TransactionAction};
use crate::error::BusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
}

struct TxState {
    status: TransactionStatus,
    pending: Vec<TransactionAction>,
    on_rollback: Vec<TransactionAction>,
    post_commit: Vec<TransactionAction>,
}

/// In-process transaction.
///
/// Work enlisted with [`LocalTransaction::enlist`] runs on commit, in order,
/// followed by the actions registered through [`ChannelTransaction::register`].
/// Rollback discards both and runs the rollback actions instead. Actions run
/// outside the internal lock, so they may register on other transactions.
pub struct LocalTransaction {
    state: Mutex<TxState>,
}

impl Default for LocalTransaction {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalTransaction {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TxState {
                status: TransactionStatus::Active,
                pending: Vec::new(),
                on_rollback: Vec::new(),
                post_commit: Vec::new(),
            }),
        }
    }

    #[must_use]
    pub fn status(&self) -> TransactionStatus {
        self.state.lock().status
    }

    /// Defers `work` until commit.
    ///
    /// # Errors
    ///
    /// `BusError::InvalidOperation` once the transaction is finished.
    pub fn enlist(&self, work: TransactionAction) -> Result<(), BusError> {
        let mut state = self.state.lock();
        if state.status != TransactionStatus::Active {
            return Err(BusError::InvalidOperation("transaction already finished"));
        }
        state.pending.push(work);
        Ok(())
    }

    /// Runs `action` if the transaction rolls back.
    ///
    /// # Errors
    ///
    /// `BusError::InvalidOperation` once the transaction is finished.
    pub fn on_rollback(&self, action: TransactionAction) -> Result<(), BusError> {
        let mut state = self.state.lock();
        if state.status != TransactionStatus::Active {
            return Err(BusError::InvalidOperation("transaction already finished"));
        }
        state.on_rollback.push(action);
        Ok(())
    }

    /// Synchronous commit, shared by the async trait method.
    ///
    /// # Errors
    ///
    /// `BusError::InvalidOperation` if already rolled back.
    pub fn commit_now(&self) -> Result<(), BusError> {
        let (pending, post_commit) = {
            let mut state = self.state.lock();
            match state.status {
                TransactionStatus::Committed => return Ok(()),
                TransactionStatus::RolledBack => {
                    return Err(BusError::InvalidOperation("transaction already rolled back"))
                }
                TransactionStatus::Active => {}
            }
            state.status = TransactionStatus::Committed;
            state.on_rollback.clear();
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.post_commit),
            )
        };

        for work in pending {
            work();
        }
        for action in post_commit {
            action();
        }
        Ok(())
    }

    /// Synchronous rollback, shared by the async trait method.
    ///
    /// # Errors
    ///
    /// `BusError::InvalidOperation` if already committed.
    pub fn rollback_now(&self) -> Result<(), BusError> {
        let on_rollback = {
            let mut state = self.state.lock();
            match state.status {
                TransactionStatus::RolledBack => return Ok(()),
                TransactionStatus::Committed => {
                    return Err(BusError::InvalidOperation("transaction already committed"))
                }
                TransactionStatus::Active => {}
            }
            state.status = TransactionStatus::RolledBack;
            state.pending.clear();
            state.post_commit.clear();
            std::mem::take(&mut state.on_rollback)
        };

        for action in on_rollback {
            action();
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelTransaction for LocalTransaction {
    fn register(&self, action: TransactionAction) -> Result<(), BusError> {
        let mut state = self.state.lock();
        if state.status != TransactionStatus::Active {
            return Err(BusError::InvalidOperation("transaction already finished"));
        }
        state.post_commit.push(action);
        Ok(())
    }

    async fn commit(&self) -> Result<(), BusError> {
        self.commit_now()
    }

    async fn rollback(&self) -> Result<(), BusError> {
        self.rollback_now()
    }

    fn is_finished(&self) -> bool {
        self.status() != TransactionStatus::Active
    }
}

impl std::fmt::Debug for LocalTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransaction")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
