//! The flag evaluation engine.
//!
//! [`Evaluator`] is a pure decision procedure: given a flag and a context it walks the off
//! check, prerequisites, targets, rules, and fallthrough, reading flags and segments through the
//! data store and consulting the Big Segment bridge for unbounded segments. It produces a value,
//! a reason, and any prerequisite evaluations that the event pipeline should record; it never
//! performs I/O of its own and never panics on malformed data.

mod bucketing;
mod operators;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::big_segments::{BigSegmentStoreManager, BigSegmentsStatus, Membership};
use crate::context::{Context, DEFAULT_KIND};
use crate::model::{
    Clause, Flag, FlagRule, Op, Rollout, RolloutKind, Segment, VariationOrRollout, WEIGHT_SCALE,
};
use crate::store::{self, DataStore};

/// Maximum depth of segments referencing other segments through `segmentMatch` clauses. Deeper
/// chains (including cycles) produce a `MALFORMED_FLAG` error.
pub const SEGMENT_RECURSION_DEPTH_LIMIT: usize = 20;

/// Error kinds surfaced in [`Reason::Error`]. These are data, not exceptions: the evaluation
/// still returns the caller's default value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The client has not finished initializing and the store has no data.
    ClientNotReady,
    /// No flag exists with the requested key.
    FlagNotFound,
    /// The flag data is self-inconsistent (bad variation index, prerequisite cycle, over-deep
    /// segment recursion, missing rollout).
    MalformedFlag,
    /// No evaluation context was supplied. Retained for wire compatibility; contexts are
    /// validated at construction in this implementation.
    UserNotSpecified,
    /// The value requested with a typed accessor did not match the served variation.
    WrongType,
    /// An unexpected internal error.
    Exception,
}

/// Why an evaluation produced its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Reason {
    /// The flag was off; the off variation (if any) was served.
    #[serde(rename = "OFF")]
    Off,
    /// No target or rule matched.
    #[serde(rename = "FALLTHROUGH", rename_all = "camelCase")]
    Fallthrough {
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    /// The context key was individually targeted.
    #[serde(rename = "TARGET_MATCH")]
    TargetMatch,
    /// A rule matched.
    #[serde(rename = "RULE_MATCH", rename_all = "camelCase")]
    RuleMatch {
        rule_index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule_id: Option<String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    /// A prerequisite flag failed, so the off variation was served.
    #[serde(rename = "PREREQUISITE_FAILED", rename_all = "camelCase")]
    PrerequisiteFailed { prerequisite_key: String },
    /// The evaluation failed; the default value was served.
    #[serde(rename = "ERROR", rename_all = "camelCase")]
    Error { error_kind: ErrorKind },
}

impl Reason {
    pub fn error(error_kind: ErrorKind) -> Reason {
        Reason::Error { error_kind }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reason::Error { .. })
    }

    pub fn in_experiment(&self) -> bool {
        matches!(
            self,
            Reason::Fallthrough { in_experiment: true }
                | Reason::RuleMatch {
                    in_experiment: true,
                    ..
                }
        )
    }
}

/// The outcome of one evaluation: the value (absent when the caller's default should be used),
/// the index of the served variation, and the reason.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationDetail {
    pub value: Option<Value>,
    pub variation_index: Option<usize>,
    pub reason: Reason,
}

impl EvaluationDetail {
    pub fn error(error_kind: ErrorKind) -> EvaluationDetail {
        EvaluationDetail {
            value: None,
            variation_index: None,
            reason: Reason::error(error_kind),
        }
    }
}

/// A prerequisite flag evaluation performed during another flag's evaluation. The event
/// pipeline records one evaluation event per entry, tagged with the parent flag.
#[derive(Debug, Clone)]
pub struct PrerequisiteEvaluation {
    pub flag: Arc<Flag>,
    pub detail: EvaluationDetail,
    pub prereq_of: String,
}

/// The full result of an evaluation, including side outputs that are not returned to the
/// application.
#[derive(Debug, Clone)]
pub struct EvalResult {
    pub detail: EvaluationDetail,
    pub prerequisite_events: Vec<PrerequisiteEvaluation>,
    /// Present when big segment data was (or should have been) consulted.
    pub big_segments_status: Option<BigSegmentsStatus>,
}

/// Whether this evaluation is part of an experiment, which forces reason inclusion and full
/// event tracking.
pub fn is_experiment(flag: &Flag, reason: &Reason) -> bool {
    if reason.in_experiment() {
        return true;
    }
    match reason {
        Reason::RuleMatch { rule_index, .. } => flag
            .rules
            .get(*rule_index)
            .is_some_and(|rule| rule.track_events),
        Reason::Fallthrough { .. } => flag.track_events_fallthrough,
        _ => false,
    }
}

// Internal error: the flag data was self-inconsistent. Carries a message for the log; the
// caller always surfaces it as MALFORMED_FLAG.
struct Malformed(&'static str);

#[derive(Default)]
struct EvalState {
    prereq_events: Vec<PrerequisiteEvaluation>,
    big_segments_status: Option<BigSegmentsStatus>,
    // Membership lookups are memoized per evaluation call, keyed by context key.
    big_segments_membership: HashMap<String, Arc<Membership>>,
    // Flag keys currently being evaluated, for prerequisite cycle detection.
    prereq_chain: Vec<String>,
    // Segment keys currently being matched, for the recursion depth limit.
    segment_chain: Vec<String>,
}

/// The evaluation engine. Holds read-only handles to the data store and the Big Segment bridge;
/// all mutable state lives on the stack of a single `evaluate` call, so the evaluator is
/// re-entrant and can be shared freely between threads.
pub struct Evaluator<'a> {
    store: &'a dyn DataStore,
    big_segments: Option<&'a BigSegmentStoreManager>,
}

impl<'a> Evaluator<'a> {
    pub fn new(store: &'a dyn DataStore, big_segments: Option<&'a BigSegmentStoreManager>) -> Self {
        Evaluator {
            store,
            big_segments,
        }
    }

    /// Evaluate `flag` for `context`.
    pub fn evaluate(&self, flag: &Arc<Flag>, context: &Context) -> EvalResult {
        let mut state = EvalState::default();
        let detail = match self.eval_flag(flag, context, &mut state) {
            Ok(detail) => detail,
            Err(Malformed(message)) => {
                log::error!(target: "launchdarkly", flag_key = flag.key.as_str(), message;
                    "could not evaluate flag");
                EvaluationDetail::error(ErrorKind::MalformedFlag)
            }
        };
        EvalResult {
            detail,
            prerequisite_events: state.prereq_events,
            big_segments_status: state.big_segments_status,
        }
    }

    fn eval_flag(
        &self,
        flag: &Arc<Flag>,
        context: &Context,
        state: &mut EvalState,
    ) -> Result<EvaluationDetail, Malformed> {
        if state.prereq_chain.iter().any(|key| *key == flag.key) {
            return Err(Malformed("prerequisite relationship to itself detected"));
        }
        state.prereq_chain.push(flag.key.clone());
        let result = self.eval_flag_inner(flag, context, state);
        state.prereq_chain.pop();
        result
    }

    fn eval_flag_inner(
        &self,
        flag: &Arc<Flag>,
        context: &Context,
        state: &mut EvalState,
    ) -> Result<EvaluationDetail, Malformed> {
        if !flag.on {
            return off_value(flag, Reason::Off);
        }

        if let Some(failure) = self.check_prerequisites(flag, context, state)? {
            return off_value(flag, failure);
        }

        if let Some(detail) = check_targets(flag, context)? {
            return Ok(detail);
        }

        for (rule_index, rule) in flag.rules.iter().enumerate() {
            if self.rule_matches_context(rule, context, state)? {
                return value_for_variation_or_rollout(
                    flag,
                    &rule.variation_or_rollout,
                    context,
                    |in_experiment| Reason::RuleMatch {
                        rule_index,
                        rule_id: rule.id.clone(),
                        in_experiment,
                    },
                );
            }
        }

        value_for_variation_or_rollout(flag, &flag.fallthrough, context, |in_experiment| {
            Reason::Fallthrough { in_experiment }
        })
    }

    // Returns the failure reason if any prerequisite was not satisfied. Every prerequisite that
    // exists gets evaluated and recorded, even when the prerequisite flag is off, so that usage
    // is reported for it.
    fn check_prerequisites(
        &self,
        flag: &Arc<Flag>,
        context: &Context,
        state: &mut EvalState,
    ) -> Result<Option<Reason>, Malformed> {
        for prerequisite in &flag.prerequisites {
            let failure = || {
                Some(Reason::PrerequisiteFailed {
                    prerequisite_key: prerequisite.key.clone(),
                })
            };
            let Some(prereq_flag) = store::get_flag(self.store, &prerequisite.key) else {
                log::warn!(target: "launchdarkly",
                    flag_key = flag.key.as_str(), prerequisite_key = prerequisite.key.as_str();
                    "missing prerequisite flag");
                return Ok(failure());
            };
            let detail = self.eval_flag(&prereq_flag, context, state)?;
            // An off prerequisite never satisfies the requirement, regardless of which
            // variation its off variation happens to be.
            let failed =
                !prereq_flag.on || detail.variation_index != Some(prerequisite.variation);
            state.prereq_events.push(PrerequisiteEvaluation {
                flag: Arc::clone(&prereq_flag),
                detail,
                prereq_of: flag.key.clone(),
            });
            if failed {
                return Ok(failure());
            }
        }
        Ok(None)
    }

    fn rule_matches_context(
        &self,
        rule: &FlagRule,
        context: &Context,
        state: &mut EvalState,
    ) -> Result<bool, Malformed> {
        for clause in &rule.clauses {
            if !self.clause_matches_context(clause, context, state)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn clause_matches_context(
        &self,
        clause: &Clause,
        context: &Context,
        state: &mut EvalState,
    ) -> Result<bool, Malformed> {
        if clause.op == Op::SegmentMatch {
            for value in &clause.values {
                let segment = value
                    .as_str()
                    .and_then(|key| store::get_segment(self.store, key));
                if let Some(segment) = segment {
                    if self.segment_matches_context(&segment, context, state)? {
                        return Ok(maybe_negate(clause, true));
                    }
                }
            }
            return Ok(maybe_negate(clause, false));
        }

        if !clause.attribute.is_valid() {
            return Err(Malformed("invalid attribute reference in clause"));
        }
        // "kind" is matched against the kinds of all individual contexts rather than being
        // resolved as an attribute.
        if clause.attribute.is_top_level("kind") {
            let matched = context
                .individual_contexts()
                .any(|c| match_any(clause.op, &Value::String(c.kind().to_string()), &clause.values));
            return Ok(maybe_negate(clause, matched));
        }

        let kind = clause
            .context_kind
            .as_ref()
            .map(crate::Kind::as_str)
            .unwrap_or(DEFAULT_KIND);
        let Some(actual_context) = context.as_kind(kind) else {
            return Ok(false);
        };
        let Some(context_value) = actual_context.get_value(&clause.attribute) else {
            return Ok(false);
        };

        // A list attribute matches if any element matches.
        if let Value::Array(elements) = &context_value {
            let matched = elements
                .iter()
                .any(|element| match_any(clause.op, element, &clause.values));
            return Ok(maybe_negate(clause, matched));
        }
        Ok(maybe_negate(
            clause,
            match_any(clause.op, &context_value, &clause.values),
        ))
    }

    fn segment_matches_context(
        &self,
        segment: &Segment,
        context: &Context,
        state: &mut EvalState,
    ) -> Result<bool, Malformed> {
        if state.segment_chain.iter().any(|key| *key == segment.key)
            || state.segment_chain.len() >= SEGMENT_RECURSION_DEPTH_LIMIT
        {
            return Err(Malformed("segment rule referencing segment exceeded depth limit"));
        }
        state.segment_chain.push(segment.key.clone());
        let result = self.segment_matches_inner(segment, context, state);
        state.segment_chain.pop();
        result
    }

    fn segment_matches_inner(
        &self,
        segment: &Segment,
        context: &Context,
        state: &mut EvalState,
    ) -> Result<bool, Malformed> {
        // Exclusion wins over inclusion.
        if context_key_in_target_list(context, None, &segment.excluded)
            || segment
                .excluded_contexts
                .iter()
                .any(|t| context_key_in_target_list(context, t.context_kind.as_ref(), &t.values))
        {
            return Ok(false);
        }
        if context_key_in_target_list(context, None, &segment.included)
            || segment
                .included_contexts
                .iter()
                .any(|t| context_key_in_target_list(context, t.context_kind.as_ref(), &t.values))
        {
            return Ok(true);
        }
        for rule in &segment.rules {
            let mut clauses_match = true;
            for clause in &rule.clauses {
                if !self.clause_matches_context(clause, context, state)? {
                    clauses_match = false;
                    break;
                }
            }
            if !clauses_match {
                continue;
            }
            let Some(weight) = rule.weight else {
                return Ok(true);
            };
            let bucket = bucketing::bucket_context(
                None,
                context,
                rule.rollout_context_kind.as_ref(),
                &segment.key,
                &segment.salt,
                rule.bucket_by.as_ref(),
            )
            .unwrap_or(-1.0);
            if bucket < f64::from(weight) / WEIGHT_SCALE {
                return Ok(true);
            }
        }
        if segment.unbounded {
            return Ok(self.big_segment_match_context(segment, context, state));
        }
        Ok(false)
    }

    fn big_segment_match_context(
        &self,
        segment: &Segment,
        context: &Context,
        state: &mut EvalState,
    ) -> bool {
        // Queries need the generation to form the segment reference. Data written by an older
        // system that does not know about generations is treated as not configured.
        if segment.generation.is_none() {
            state.big_segments_status = Some(BigSegmentsStatus::NotConfigured);
            return false;
        }
        let kind = segment
            .unbounded_context_kind
            .as_ref()
            .map(crate::Kind::as_str)
            .unwrap_or(DEFAULT_KIND);
        let Some(match_context) = context.as_kind(kind) else {
            return false;
        };
        let key = match_context.key();

        let membership = match state.big_segments_membership.get(key) {
            Some(membership) => Arc::clone(membership),
            None => {
                let Some(manager) = self.big_segments else {
                    state.big_segments_status = Some(BigSegmentsStatus::NotConfigured);
                    return false;
                };
                let (membership, status) = manager.get_context_membership(key);
                state.big_segments_status = Some(status);
                state
                    .big_segments_membership
                    .insert(key.to_owned(), Arc::clone(&membership));
                membership
            }
        };
        membership
            .get(&segment.big_segment_ref())
            .copied()
            .unwrap_or(false)
    }
}

fn get_variation(
    flag: &Flag,
    variation: usize,
    reason: Reason,
) -> Result<EvaluationDetail, Malformed> {
    let Some(value) = flag.variation_value(variation) else {
        return Err(Malformed("variation index out of range"));
    };
    Ok(EvaluationDetail {
        value: Some(value.clone()),
        variation_index: Some(variation),
        reason,
    })
}

fn off_value(flag: &Flag, reason: Reason) -> Result<EvaluationDetail, Malformed> {
    match flag.off_variation {
        Some(variation) => get_variation(flag, variation, reason),
        None => Ok(EvaluationDetail {
            value: None,
            variation_index: None,
            reason,
        }),
    }
}

fn value_for_variation_or_rollout(
    flag: &Flag,
    vr: &VariationOrRollout,
    context: &Context,
    reason: impl FnOnce(bool) -> Reason,
) -> Result<EvaluationDetail, Malformed> {
    let (variation, in_experiment) = variation_index_for_context(flag, vr, context)?;
    get_variation(flag, variation, reason(in_experiment))
}

fn variation_index_for_context(
    flag: &Flag,
    vr: &VariationOrRollout,
    context: &Context,
) -> Result<(usize, bool), Malformed> {
    let rollout: &Rollout = match vr {
        VariationOrRollout::Variation { variation } => return Ok((*variation, false)),
        VariationOrRollout::Rollout { rollout } => rollout,
        VariationOrRollout::Malformed(_) => {
            return Err(Malformed("rule or fallthrough has no variation or rollout"));
        }
    };
    if rollout.variations.is_empty() {
        return Err(Malformed("rollout has no variations"));
    }

    let is_experiment = rollout.kind == RolloutKind::Experiment;
    // Experiments always bucket by key.
    let bucket_by = if is_experiment {
        None
    } else {
        rollout.bucket_by.as_ref()
    };
    let bucket = bucketing::bucket_context(
        rollout.seed,
        context,
        rollout.context_kind.as_ref(),
        &flag.key,
        &flag.salt,
        bucket_by,
    );
    // A missing bucketing context still lands in the first bucket, but is never counted as
    // being in the experiment.
    let (bucket, experiment_eligible) = match bucket {
        Some(bucket) => (bucket, is_experiment),
        None => (-1.0, false),
    };

    let mut sum = 0.0;
    for weighted in &rollout.variations {
        sum += f64::from(weighted.weight) / WEIGHT_SCALE;
        if bucket < sum {
            return Ok((weighted.variation, experiment_eligible && !weighted.untracked));
        }
    }
    // The bucket value landed at or beyond the end of the last bucket, from rounding error or
    // weights that do not add up to 100000. The last bucket absorbs it.
    let last = rollout.variations.last().unwrap();
    Ok((last.variation, experiment_eligible && !last.untracked))
}

fn check_targets(flag: &Flag, context: &Context) -> Result<Option<EvaluationDetail>, Malformed> {
    if flag.context_targets.is_empty() {
        // Old-style data has targets for the default kind only.
        if !flag.targets.is_empty() {
            if let Some(user_context) = context.as_kind(DEFAULT_KIND) {
                for target in &flag.targets {
                    if target.values.iter().any(|v| v == user_context.key()) {
                        return get_variation(flag, target.variation, Reason::TargetMatch)
                            .map(Some);
                    }
                }
            }
        }
        return Ok(None);
    }
    for target in &flag.context_targets {
        let kind = target
            .context_kind
            .as_ref()
            .map(crate::Kind::as_str)
            .unwrap_or(DEFAULT_KIND);
        let Some(actual_context) = context.as_kind(kind) else {
            continue;
        };
        let key = actual_context.key();
        if kind == DEFAULT_KIND {
            // Context targets of the default kind hold no keys of their own; they reference
            // the old-style targets list with the same variation.
            if let Some(user_target) = flag
                .targets
                .iter()
                .find(|t| t.variation == target.variation)
            {
                if user_target.values.iter().any(|v| v == key) {
                    return get_variation(flag, target.variation, Reason::TargetMatch).map(Some);
                }
            }
            continue;
        }
        if target.values.iter().any(|v| v == key) {
            return get_variation(flag, target.variation, Reason::TargetMatch).map(Some);
        }
    }
    Ok(None)
}

fn context_key_in_target_list(
    context: &Context,
    kind: Option<&crate::Kind>,
    keys: &[String],
) -> bool {
    if keys.is_empty() {
        return false;
    }
    let kind = kind.map(crate::Kind::as_str).unwrap_or(DEFAULT_KIND);
    context
        .as_kind(kind)
        .is_some_and(|c| keys.iter().any(|k| k == c.key()))
}

fn match_any(op: Op, context_value: &Value, clause_values: &[Value]) -> bool {
    clause_values
        .iter()
        .any(|clause_value| operators::apply(op, context_value, clause_value))
}

fn maybe_negate(clause: &Clause, matched: bool) -> bool {
    if clause.negate {
        !matched
    } else {
        matched
    }
}
