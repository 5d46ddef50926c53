use crate::error::{SyncError, SyncResult};
use crate::models::stage::SignupStage;

/// UI step index for a stage. Total and order-preserving.
pub fn stage_to_step(stage: SignupStage) -> usize {
    stage.position()
}

/// Inverse of [`stage_to_step`], used to restore the screen after a restart.
pub fn step_to_stage(step: usize) -> Option<SignupStage> {
    SignupStage::ALL.get(step).copied()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advanced { from: SignupStage, to: SignupStage },
    Unchanged(SignupStage),
}

/// Forward-only signup progress.
///
/// Tracks the stage the UI currently sees and the last stage the remote
/// store acknowledged, so a failed write can be undone.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProgressStateMachine {
    current: SignupStage,
    persisted: SignupStage,
}

impl ProgressStateMachine {
    pub fn new(stage: SignupStage) -> Self {
        Self {
            current: stage,
            persisted: stage,
        }
    }

    pub fn current(&self) -> SignupStage {
        self.current
    }

    pub fn persisted(&self) -> SignupStage {
        self.persisted
    }

    pub fn step(&self) -> usize {
        stage_to_step(self.current)
    }

    pub fn has_unpersisted_change(&self) -> bool {
        self.current != self.persisted
    }

    /// Moves to `next` if it lies ahead of the current stage.
    ///
    /// Re-advancing to the current stage is a no-op. Skipping forward over
    /// optional screens is allowed; moving backwards is not, and nothing
    /// leaves `Complete` except [`reset`](Self::reset).
    pub fn advance(&mut self, next: SignupStage) -> SyncResult<Transition> {
        if next == self.current {
            return Ok(Transition::Unchanged(next));
        }

        if next < self.current || self.current.is_terminal() {
            return Err(SyncError::InvalidTransition {
                from: self.current.to_string(),
                to: next.to_string(),
            });
        }

        let from = self.current;
        self.current = next;
        Ok(Transition::Advanced { from, to: next })
    }

    /// Marks the current stage as acknowledged by the remote store.
    pub fn confirm(&mut self) {
        self.persisted = self.current;
    }

    /// Drops an unacknowledged advance.
    pub fn rollback(&mut self) -> SignupStage {
        if self.has_unpersisted_change() {
            log::warn!(
                "rolling signup stage back from {} to {}",
                self.current,
                self.persisted
            );
        }
        self.current = self.persisted;
        self.current
    }

    /// Logout / first launch without identity.
    pub fn reset(&mut self) {
        self.current = SignupStage::Initial;
        self.persisted = SignupStage::Initial;
    }
}
