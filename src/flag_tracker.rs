//! Change notifications for feature flags.
//!
//! The data source publishes a [`FlagChangeEvent`] for every flag whose evaluation could have
//! changed, directly or through a changed prerequisite or segment. [`FlagTracker`] exposes those
//! events and can additionally re-evaluate a flag against a pinned context, so callers can
//! subscribe to actual value changes.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::listeners::ListenerHandle;
use crate::{Context, Listeners};

/// A flag whose configuration (or transitive dependencies) changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagChangeEvent {
    pub key: String,
}

/// A flag whose evaluated value for a specific context changed.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagValueChangeEvent {
    pub key: String,
    pub old_value: Value,
    pub new_value: Value,
}

type EvalFn = dyn Fn(&str, &Context) -> Value + Send + Sync;

/// Registers listeners for flag changes.
pub struct FlagTracker {
    change_listeners: Arc<Listeners<FlagChangeEvent>>,
    evaluate: Arc<EvalFn>,
}

impl FlagTracker {
    pub(crate) fn new(
        change_listeners: Arc<Listeners<FlagChangeEvent>>,
        evaluate: Arc<EvalFn>,
    ) -> Self {
        FlagTracker {
            change_listeners,
            evaluate,
        }
    }

    /// Be notified whenever any flag's configuration changes. The event does not say whether any
    /// particular evaluation result changed.
    pub fn add_flag_change_listener(
        &self,
        listener: impl Fn(&FlagChangeEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.change_listeners.add(listener)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) {
        self.change_listeners.remove(handle);
    }

    /// Be notified when the value of `flag_key` changes for `context`. The flag is re-evaluated
    /// on every change notification for that key; the listener fires only when the value
    /// actually differs.
    pub fn add_flag_value_change_listener(
        &self,
        flag_key: &str,
        context: Context,
        listener: impl Fn(&FlagValueChangeEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let flag_key = flag_key.to_owned();
        let evaluate = Arc::clone(&self.evaluate);
        let last_value = Mutex::new(evaluate(&flag_key, &context));
        self.change_listeners.add(move |event: &FlagChangeEvent| {
            if event.key != flag_key {
                return;
            }
            let new_value = evaluate(&flag_key, &context);
            let mut last = last_value.lock().unwrap();
            if *last == new_value {
                return;
            }
            let change = FlagValueChangeEvent {
                key: flag_key.clone(),
                old_value: std::mem::replace(&mut *last, new_value.clone()),
                new_value,
            };
            drop(last);
            listener(&change);
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::RwLock;

    use serde_json::json;

    use super::*;

    fn tracker_with_values(
        values: Arc<RwLock<HashMap<String, Value>>>,
    ) -> (FlagTracker, Arc<Listeners<FlagChangeEvent>>) {
        let listeners = Arc::new(Listeners::new());
        let evaluate: Arc<EvalFn> = Arc::new(move |key: &str, _: &Context| {
            values.read().unwrap().get(key).cloned().unwrap_or(Value::Null)
        });
        (FlagTracker::new(Arc::clone(&listeners), evaluate), listeners)
    }

    #[test]
    fn value_change_listener_fires_only_on_changes() {
        let values = Arc::new(RwLock::new(HashMap::from([("f".to_owned(), json!(false))])));
        let (tracker, listeners) = tracker_with_values(Arc::clone(&values));

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            tracker.add_flag_value_change_listener(
                "f",
                Context::new("alice").unwrap(),
                move |event| {
                    seen.lock().unwrap().push(event.clone());
                },
            );
        }

        // Configuration changed but value did not.
        listeners.notify(&FlagChangeEvent { key: "f".to_owned() });
        assert!(seen.lock().unwrap().is_empty());

        values.write().unwrap().insert("f".to_owned(), json!(true));
        listeners.notify(&FlagChangeEvent { key: "f".to_owned() });
        // A change to an unrelated flag is ignored.
        listeners.notify(&FlagChangeEvent { key: "other".to_owned() });

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].old_value, json!(false));
        assert_eq!(events[0].new_value, json!(true));
    }
}
