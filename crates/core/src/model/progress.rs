use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ids::ExerciseId;
use crate::model::plan::{ProgramSelection, ProgramType};

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProgressError {
    #[error("day numbers start at 1")]
    InvalidDayNumber,
}

//
// ─── RECORDS ───────────────────────────────────────────────────────────────────
//

/// One completed program day.
///
/// At most one record exists per `day_number`; re-completing a day updates
/// `completed_at` and `routine_name` in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedDay {
    pub day_number: u32,
    pub completed_at: DateTime<Utc>,
    pub routine_name: String,
    pub bonus_completed: bool,
}

/// One completed bonus exercise, independent of the day record set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedBonus {
    pub day_number: u32,
    pub exercise_id: ExerciseId,
    pub completed_at: DateTime<Utc>,
}

/// Derived, never-persisted view of overall program progress.
///
/// `progress_percent` and `days_remaining` are only defined for fixed-length
/// programs; subscription plans have no end to measure against.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub completed_days_count: u32,
    pub completed_bonuses_count: u32,
    pub streak: u32,
    pub progress_percent: Option<f64>,
    pub days_remaining: Option<u32>,
}

//
// ─── PROGRESS LOG ──────────────────────────────────────────────────────────────
//

/// The local source of truth for a user's program-completion timeline.
///
/// Holds the selected plan and both completion record sets, keyed by their
/// natural keys (`day_number`, and `(day_number, exercise_id)`). This is
/// also the payload persisted locally and mirrored to the cloud, so it is
/// fully serializable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "ProgressLogRepr", into = "ProgressLogRepr")]
pub struct ProgressLog {
    selection: Option<ProgramSelection>,
    days: BTreeMap<u32, CompletedDay>,
    bonuses: BTreeMap<(u32, ExerciseId), CompletedBonus>,
}

impl ProgressLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records completion of a program day.
    ///
    /// Idempotent: completing an already-completed day replaces its
    /// `completed_at` and `routine_name` rather than adding a duplicate.
    /// A previously earned bonus flag survives the update.
    ///
    /// # Errors
    ///
    /// Returns `ProgressError::InvalidDayNumber` for day 0.
    pub fn complete_day(
        &mut self,
        day_number: u32,
        routine_name: impl Into<String>,
        completed_at: DateTime<Utc>,
    ) -> Result<(), ProgressError> {
        if day_number == 0 {
            return Err(ProgressError::InvalidDayNumber);
        }
        let bonus_completed = self
            .days
            .get(&day_number)
            .is_some_and(|d| d.bonus_completed);
        self.days.insert(
            day_number,
            CompletedDay {
                day_number,
                completed_at,
                routine_name: routine_name.into(),
                bonus_completed,
            },
        );
        Ok(())
    }

    /// Records completion of a bonus exercise for a day.
    ///
    /// Same idempotency contract as `complete_day`, keyed by
    /// `(day_number, exercise_id)`. Also flips `bonus_completed` on the
    /// matching day record when one exists.
    ///
    /// # Errors
    ///
    /// Returns `ProgressError::InvalidDayNumber` for day 0.
    pub fn complete_bonus(
        &mut self,
        day_number: u32,
        exercise_id: ExerciseId,
        completed_at: DateTime<Utc>,
    ) -> Result<(), ProgressError> {
        if day_number == 0 {
            return Err(ProgressError::InvalidDayNumber);
        }
        self.bonuses.insert(
            (day_number, exercise_id.clone()),
            CompletedBonus {
                day_number,
                exercise_id,
                completed_at,
            },
        );
        if let Some(day) = self.days.get_mut(&day_number) {
            day.bonus_completed = true;
        }
        Ok(())
    }

    /// Replaces the current plan selection, preserving completion history.
    pub fn select_plan(&mut self, selection: ProgramSelection) {
        self.selection = Some(selection);
    }

    /// Clears the selection and both record sets.
    pub fn clear(&mut self) {
        self.selection = None;
        self.days.clear();
        self.bonuses.clear();
    }

    /// Merges another log into this one.
    ///
    /// Union by natural key: a record present on either side survives. When
    /// a key exists on both sides the record with the later `completed_at`
    /// wins (last-write-wins on the timestamp only, not on presence), with
    /// an exact timestamp tie broken lexicographically on `routine_name` so
    /// the merge stays commutative. The plan selection with the later
    /// `started_at` wins, ties broken on `plan_id`; a present selection
    /// beats an absent one. A locally recorded completion is therefore never
    /// lost to a race with the cloud, only ever gained.
    pub fn merge(&mut self, other: &ProgressLog) {
        for (key, theirs) in &other.days {
            match self.days.get_mut(key) {
                Some(ours) => {
                    if day_rank(theirs) > day_rank(ours) {
                        let bonus = ours.bonus_completed || theirs.bonus_completed;
                        *ours = theirs.clone();
                        ours.bonus_completed = bonus;
                    } else {
                        ours.bonus_completed |= theirs.bonus_completed;
                    }
                }
                None => {
                    self.days.insert(*key, theirs.clone());
                }
            }
        }
        for (key, theirs) in &other.bonuses {
            match self.bonuses.get_mut(key) {
                Some(ours) => {
                    // Key and timestamp are the only fields: ties mean the
                    // records are identical, so strict ordering suffices.
                    if theirs.completed_at > ours.completed_at {
                        *ours = theirs.clone();
                    }
                }
                None => {
                    self.bonuses.insert(key.clone(), theirs.clone());
                }
            }
        }
        match (&self.selection, &other.selection) {
            (None, Some(theirs)) => self.selection = Some(theirs.clone()),
            (Some(ours), Some(theirs)) if selection_rank(theirs) > selection_rank(ours) => {
                self.selection = Some(theirs.clone());
            }
            _ => {}
        }
    }

    /// Computes the derived progress view for the given calendar date.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn snapshot(&self, today: NaiveDate) -> ProgressSnapshot {
        let completed_days_count = self.days.len() as u32;
        let completed_bonuses_count = self.bonuses.len() as u32;

        let (progress_percent, days_remaining) = match &self.selection {
            Some(sel) if sel.program_type() == ProgramType::Fixed => {
                // Validated at construction: fixed selections carry a duration.
                let duration = sel.duration_days().unwrap_or(1).max(1);
                let percent = f64::from(completed_days_count) / f64::from(duration) * 100.0;
                let remaining = duration.saturating_sub(completed_days_count);
                (Some(percent), Some(remaining))
            }
            _ => (None, None),
        };

        ProgressSnapshot {
            completed_days_count,
            completed_bonuses_count,
            streak: self.streak(today),
            progress_percent,
            days_remaining,
        }
    }

    /// Length of the trailing run of consecutive calendar days, ending today
    /// or yesterday, each with at least one completed day. A gap of two or
    /// more calendar days breaks the run.
    #[must_use]
    pub fn streak(&self, today: NaiveDate) -> u32 {
        let dates: BTreeSet<NaiveDate> = self
            .days
            .values()
            .map(|d| d.completed_at.date_naive())
            .collect();

        let yesterday = today.pred_opt().unwrap_or(today);
        let mut cursor = if dates.contains(&today) {
            today
        } else if dates.contains(&yesterday) {
            yesterday
        } else {
            return 0;
        };

        let mut run = 1u32;
        while let Some(prev) = cursor.checked_sub_days(Days::new(1)) {
            if !dates.contains(&prev) {
                break;
            }
            run += 1;
            cursor = prev;
        }
        run
    }

    #[must_use]
    pub fn selection(&self) -> Option<&ProgramSelection> {
        self.selection.as_ref()
    }

    #[must_use]
    pub fn completed_days(&self) -> Vec<&CompletedDay> {
        self.days.values().collect()
    }

    #[must_use]
    pub fn completed_bonuses(&self) -> Vec<&CompletedBonus> {
        self.bonuses.values().collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.selection.is_none() && self.days.is_empty() && self.bonuses.is_empty()
    }
}

// Total orderings used to pick a winner when the same natural key exists on
// both sides of a merge. The timestamp dominates; the remaining fields only
// break exact ties, which keeps the merge commutative.
fn day_rank(day: &CompletedDay) -> (DateTime<Utc>, &str) {
    (day.completed_at, day.routine_name.as_str())
}

fn selection_rank(sel: &ProgramSelection) -> (DateTime<Utc>, &str, Option<u32>) {
    (sel.started_at(), sel.plan_id().value(), sel.duration_days())
}

// Wire/persistence shape: flat record lists rather than keyed maps, so the
// JSON payload stays readable and key encoding never leaks into storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ProgressLogRepr {
    selection: Option<ProgramSelection>,
    days: Vec<CompletedDay>,
    bonuses: Vec<CompletedBonus>,
}

impl From<ProgressLogRepr> for ProgressLog {
    fn from(repr: ProgressLogRepr) -> Self {
        let mut log = ProgressLog {
            selection: repr.selection,
            ..ProgressLog::default()
        };
        // Duplicate keys in a hand-edited or corrupt payload collapse via
        // the same last-write-wins rule as merge.
        for day in repr.days {
            match log.days.get(&day.day_number) {
                Some(existing) if day_rank(existing) >= day_rank(&day) => {}
                _ => {
                    log.days.insert(day.day_number, day);
                }
            }
        }
        for bonus in repr.bonuses {
            let key = (bonus.day_number, bonus.exercise_id.clone());
            match log.bonuses.get(&key) {
                Some(existing) if existing.completed_at >= bonus.completed_at => {}
                _ => {
                    log.bonuses.insert(key, bonus);
                }
            }
        }
        log
    }
}

impl From<ProgressLog> for ProgressLogRepr {
    fn from(log: ProgressLog) -> Self {
        Self {
            selection: log.selection,
            days: log.days.into_values().collect(),
            bonuses: log.bonuses.into_values().collect(),
        }
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//
