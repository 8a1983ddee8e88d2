//! The flag and segment data model, matching the JSON representation used by the flag delivery
//! service and by persistent stores.

mod clause;
mod flag;
mod segment;

pub use clause::{Clause, Op};
pub use flag::{
    ClientSideAvailability, ContextTarget, Flag, FlagRule, MigrationSettings, Prerequisite,
    Rollout, RolloutKind, Target, VariationOrRollout, WeightedVariation,
};
pub use segment::{Segment, SegmentRule, SegmentTarget};

/// Weights in rollouts and weighted segment rules are expressed in units of 1/100,000.
pub const WEIGHT_SCALE: f64 = 100_000.0;
