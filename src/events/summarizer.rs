//! Aggregation of evaluation events into per-interval summary counters.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use super::EvaluationEvent;

// Counter key: (variation index, flag version). Version is None for unknown flags.
pub(crate) type CounterKey = (Option<usize>, Option<u64>);

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SummaryCounter {
    pub count: u64,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SummaryFlag {
    pub context_kinds: HashSet<String>,
    pub default: Value,
    pub counters: HashMap<CounterKey, SummaryCounter>,
}

/// A snapshot of the summary table for one flush interval.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventSummary {
    pub start_date: u64,
    pub end_date: u64,
    pub flags: HashMap<String, SummaryFlag>,
}

impl EventSummary {
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

#[derive(Default)]
pub(crate) struct EventSummarizer {
    summary: EventSummary,
}

impl EventSummarizer {
    pub fn new() -> Self {
        EventSummarizer::default()
    }

    pub fn summarize_event(&mut self, event: &EvaluationEvent) {
        let flag_data = self
            .summary
            .flags
            .entry(event.key.clone())
            .or_insert_with(|| SummaryFlag {
                context_kinds: HashSet::new(),
                default: event.default_value.clone(),
                counters: HashMap::new(),
            });

        for c in event.context.individual_contexts() {
            flag_data.context_kinds.insert(c.kind().to_string());
        }

        let counter_key = (event.variation, event.flag_version());
        flag_data
            .counters
            .entry(counter_key)
            .and_modify(|counter| counter.count += 1)
            .or_insert_with(|| SummaryCounter {
                count: 1,
                value: event.value.clone(),
            });

        if self.summary.start_date == 0 || event.timestamp < self.summary.start_date {
            self.summary.start_date = event.timestamp;
        }
        if event.timestamp > self.summary.end_date {
            self.summary.end_date = event.timestamp;
        }
    }

    /// Take the accumulated summary, leaving the table empty for the next interval.
    pub fn take(&mut self) -> EventSummary {
        std::mem::take(&mut self.summary)
    }

    /// Put back a summary taken by [`EventSummarizer::take`] when the flush could not be handed
    /// off to the delivery thread.
    pub fn restore(&mut self, summary: EventSummary) {
        self.summary = summary;
    }

    pub fn is_empty(&self) -> bool {
        self.summary.is_empty()
    }
}
