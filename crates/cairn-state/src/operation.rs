//! Scoped write operations.
//!
//! A [`WriteOperation`] owns one edit epoch of a [`LocalStateManager`] and,
//! optionally, a lock guard. It either saves or cancels: dropping it
//! without a successful [`save`](WriteOperation::save) cancels every
//! buffered change, and the lock is released only after that.

use std::ops::{Deref, DerefMut};

use tracing::{debug, warn};

use crate::error::StateResult;
use crate::local::LocalStateManager;
use crate::traits::{UpdatableItemStateManager, UpdateSummary};

/// Lifecycle of one write operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationPhase {
    LockAcquired,
    Editing,
    Saved,
    Cancelled,
}

impl OperationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Saved | Self::Cancelled)
    }
}

/// One edit epoch, cancelled on drop unless saved.
///
/// `M` is any owning or borrowing handle to the manager (`&mut`, a
/// `MutexGuard`, ...). `L` is held until the operation is dropped; fields
/// drop in declaration order, so the manager is released before the lock.
pub struct WriteOperation<M, L = ()>
where
    M: DerefMut<Target = LocalStateManager>,
{
    manager: M,
    phase: OperationPhase,
    _lock: L,
}

impl<M> WriteOperation<M, ()>
where
    M: DerefMut<Target = LocalStateManager>,
{
    /// Start an operation without a lock.
    pub fn start(manager: M) -> StateResult<Self> {
        Self::start_locked(manager, ())
    }
}

impl<M, L> WriteOperation<M, L>
where
    M: DerefMut<Target = LocalStateManager>,
{
    /// Start an operation while holding `lock`.
    pub fn start_locked(manager: M, lock: L) -> StateResult<Self> {
        let mut op = Self {
            manager,
            phase: OperationPhase::LockAcquired,
            _lock: lock,
        };
        op.manager.edit()?;
        op.phase = OperationPhase::Editing;
        Ok(op)
    }

    pub fn phase(&self) -> OperationPhase {
        self.phase
    }

    /// Persist the buffered changes. A failed update is cancelled before
    /// the error is returned.
    pub fn save(mut self) -> StateResult<UpdateSummary> {
        match self.manager.update() {
            Ok(summary) => {
                self.phase = OperationPhase::Saved;
                Ok(summary)
            }
            Err(e) => {
                warn!(error = %e, "write operation failed; cancelling");
                self.manager.cancel();
                self.phase = OperationPhase::Cancelled;
                Err(e)
            }
        }
    }

    /// Discard the buffered changes.
    pub fn cancel(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if self.phase == OperationPhase::Editing {
            self.manager.cancel();
            self.phase = OperationPhase::Cancelled;
        }
    }
}

impl<M, L> Deref for WriteOperation<M, L>
where
    M: DerefMut<Target = LocalStateManager>,
{
    type Target = LocalStateManager;

    fn deref(&self) -> &LocalStateManager {
        &self.manager
    }
}

impl<M, L> DerefMut for WriteOperation<M, L>
where
    M: DerefMut<Target = LocalStateManager>,
{
    fn deref_mut(&mut self) -> &mut LocalStateManager {
        &mut self.manager
    }
}

impl<M, L> Drop for WriteOperation<M, L>
where
    M: DerefMut<Target = LocalStateManager>,
{
    fn drop(&mut self) {
        if self.phase == OperationPhase::Editing {
            debug!("write operation dropped unsaved");
            self.abort();
        }
        debug!(phase = ?self.phase, "write operation released");
    }
}

impl<M, L> std::fmt::Debug for WriteOperation<M, L>
where
    M: DerefMut<Target = LocalStateManager>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteOperation")
            .field("phase", &self.phase)
            .finish()
    }
}
