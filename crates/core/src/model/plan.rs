use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ids::PlanId;

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PlanError {
    #[error("fixed programs require a duration of at least one day")]
    MissingDuration,

    #[error("fixed program duration must be > 0")]
    ZeroDuration,

    #[error("subscription programs have no fixed duration")]
    UnexpectedDuration,
}

//
// ─── PROGRAM SELECTION ─────────────────────────────────────────────────────────
//

/// Whether a plan runs for a fixed number of days or indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramType {
    Fixed,
    Subscription,
}

/// The plan a user is currently following.
///
/// Created when the user picks a plan, replaced on plan change, and removed
/// only by an explicit reset or account deletion. Switching plans preserves
/// completion history; the selection carries no progress of its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramSelection {
    plan_id: PlanId,
    program_type: ProgramType,
    duration_days: Option<u32>,
    started_at: DateTime<Utc>,
}

impl ProgramSelection {
    /// Creates a fixed-length program selection.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::ZeroDuration` if `duration_days` is zero.
    pub fn fixed(
        plan_id: PlanId,
        duration_days: u32,
        started_at: DateTime<Utc>,
    ) -> Result<Self, PlanError> {
        if duration_days == 0 {
            return Err(PlanError::ZeroDuration);
        }
        Ok(Self {
            plan_id,
            program_type: ProgramType::Fixed,
            duration_days: Some(duration_days),
            started_at,
        })
    }

    /// Creates an open-ended subscription program selection.
    #[must_use]
    pub fn subscription(plan_id: PlanId, started_at: DateTime<Utc>) -> Self {
        Self {
            plan_id,
            program_type: ProgramType::Subscription,
            duration_days: None,
            started_at,
        }
    }

    /// Rebuilds a selection from persisted fields.
    ///
    /// # Errors
    ///
    /// Returns `PlanError` if the duration is inconsistent with the program
    /// type (fixed without duration, or subscription with one).
    pub fn from_persisted(
        plan_id: PlanId,
        program_type: ProgramType,
        duration_days: Option<u32>,
        started_at: DateTime<Utc>,
    ) -> Result<Self, PlanError> {
        match (program_type, duration_days) {
            (ProgramType::Fixed, None) => Err(PlanError::MissingDuration),
            (ProgramType::Fixed, Some(0)) => Err(PlanError::ZeroDuration),
            (ProgramType::Subscription, Some(_)) => Err(PlanError::UnexpectedDuration),
            _ => Ok(Self {
                plan_id,
                program_type,
                duration_days,
                started_at,
            }),
        }
    }

    #[must_use]
    pub fn plan_id(&self) -> &PlanId {
        &self.plan_id
    }

    #[must_use]
    pub fn program_type(&self) -> ProgramType {
        self.program_type
    }

    #[must_use]
    pub fn duration_days(&self) -> Option<u32> {
        self.duration_days
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;

    fn plan(id: &str) -> PlanId {
        PlanId::new(id).unwrap()
    }

    #[test]
    fn fixed_requires_positive_duration() {
        assert!(matches!(
            ProgramSelection::fixed(plan("kickstart-30"), 0, fixed_now()),
            Err(PlanError::ZeroDuration)
        ));

        let selection = ProgramSelection::fixed(plan("kickstart-30"), 30, fixed_now()).unwrap();
        assert_eq!(selection.program_type(), ProgramType::Fixed);
        assert_eq!(selection.duration_days(), Some(30));
    }

    #[test]
    fn subscription_has_no_duration() {
        let selection = ProgramSelection::subscription(plan("coach-unlimited"), fixed_now());
        assert_eq!(selection.program_type(), ProgramType::Subscription);
        assert_eq!(selection.duration_days(), None);
    }

    #[test]
    fn from_persisted_rejects_inconsistent_duration() {
        assert!(matches!(
            ProgramSelection::from_persisted(
                plan("kickstart-30"),
                ProgramType::Fixed,
                None,
                fixed_now()
            ),
            Err(PlanError::MissingDuration)
        ));
        assert!(matches!(
            ProgramSelection::from_persisted(
                plan("coach-unlimited"),
                ProgramType::Subscription,
                Some(12),
                fixed_now()
            ),
            Err(PlanError::UnexpectedDuration)
        ));
    }
}
