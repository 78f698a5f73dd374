pub mod entitlement;
mod ids;
mod plan;
pub mod progress;

pub use ids::{ExerciseId, ParseIdError, PlanId, UserId};

pub use entitlement::{
    resolve, AccessSource, EntitlementPolicy, EntitlementState, Platform, PolicyError, Receipt,
    StoredEntitlement, ValidationRecord,
};
pub use plan::{PlanError, ProgramSelection, ProgramType};
pub use progress::{CompletedBonus, CompletedDay, ProgressError, ProgressLog, ProgressSnapshot};
