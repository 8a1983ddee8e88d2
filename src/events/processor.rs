//! The inbound half of the event pipeline: a bounded inbox drained by a single dispatcher
//! thread, plus the timers that drive periodic flushes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::cache::LruKeySet;
use crate::config::Config;
use crate::sampler;

use super::context_formatter::EventContextFormatter;
use super::diagnostics::DiagnosticAccumulator;
use super::output::{EventOutputFormatter, OutputEvent};
use super::sender::{EventSender, SenderMessage};
use super::summarizer::EventSummarizer;
use super::{current_time_millis, EvaluationEvent, EventInput};

const STOP_GRACE_PERIOD: Duration = Duration::from_secs(2);

pub(crate) enum EventProcessorMessage {
    Event(Box<EventInput>),
    Flush,
    FlushContexts,
    Diagnostic,
    Stop(SyncSender<()>),
}

/// The public face of the event pipeline. `send_event` never blocks: when the inbox is full the
/// event is dropped, counted, and a warning is logged once per burst.
pub struct EventProcessor {
    inbox: SyncSender<EventProcessorMessage>,
    dropped_events: Arc<AtomicU64>,
    inbox_full_logged: AtomicBool,
    closed: AtomicBool,
    timers: Mutex<Vec<RepeatingTask>>,
    sender: Mutex<Option<EventSender>>,
    dispatcher_handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventProcessor {
    pub fn new(config: Arc<Config>, diagnostics: Option<Arc<DiagnosticAccumulator>>) -> Self {
        let (inbox_tx, inbox_rx) = sync_channel(config.events_capacity);

        let disabled = Arc::new(AtomicBool::new(false));
        let last_known_server_time = Arc::new(AtomicU64::new(0));
        let dropped_events = Arc::new(AtomicU64::new(0));

        let formatter = EventOutputFormatter::new(EventContextFormatter::new(
            config.all_attributes_private,
            config.private_attributes.clone(),
        ));
        let sender = EventSender::start(
            Arc::clone(&config),
            formatter,
            Arc::clone(&disabled),
            Arc::clone(&last_known_server_time),
        );

        if let Some(diagnostics) = &diagnostics {
            let init_event = diagnostics.create_init_event(&config);
            if sender.tx.send(SenderMessage::Diagnostic(init_event)).is_err() {
                log::warn!(target: "launchdarkly", "failed to enqueue initial diagnostic event");
            }
        }

        let dispatcher = EventDispatcher::new(
            Arc::clone(&config),
            sender.tx.clone(),
            disabled,
            last_known_server_time,
            Arc::clone(&dropped_events),
            diagnostics.clone(),
        );
        let dispatcher_handle = thread::Builder::new()
            .name("launchdarkly-events".to_owned())
            .spawn(move || dispatcher.run(inbox_rx))
            .ok();

        let mut timers = vec![
            RepeatingTask::start("launchdarkly-flush-timer", config.flush_interval, {
                let inbox = inbox_tx.clone();
                move || {
                    let _ = inbox.try_send(EventProcessorMessage::Flush);
                }
            }),
            RepeatingTask::start(
                "launchdarkly-context-keys-timer",
                config.context_keys_flush_interval,
                {
                    let inbox = inbox_tx.clone();
                    move || {
                        let _ = inbox.try_send(EventProcessorMessage::FlushContexts);
                    }
                },
            ),
        ];
        if diagnostics.is_some() {
            timers.push(RepeatingTask::start(
                "launchdarkly-diagnostics-timer",
                config.diagnostic_recording_interval,
                {
                    let inbox = inbox_tx.clone();
                    move || {
                        let _ = inbox.try_send(EventProcessorMessage::Diagnostic);
                    }
                },
            ));
        }

        EventProcessor {
            inbox: inbox_tx,
            dropped_events,
            inbox_full_logged: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            timers: Mutex::new(timers),
            sender: Mutex::new(Some(sender)),
            dispatcher_handle: Mutex::new(dispatcher_handle),
        }
    }

    pub fn send_event(&self, event: EventInput) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        match self
            .inbox
            .try_send(EventProcessorMessage::Event(Box::new(event)))
        {
            Ok(()) => {
                self.inbox_full_logged.store(false, Ordering::SeqCst);
            }
            Err(TrySendError::Full(_)) => {
                self.dropped_events.fetch_add(1, Ordering::SeqCst);
                if !self.inbox_full_logged.swap(true, Ordering::SeqCst) {
                    log::warn!(target: "launchdarkly",
                        "events are being produced faster than they can be processed; some events will be dropped");
                }
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Schedule delivery of everything buffered so far. Best-effort and non-blocking; delivery
    /// happens on the background threads.
    pub fn flush(&self) {
        let _ = self.inbox.try_send(EventProcessorMessage::Flush);
    }

    /// Flush remaining events and stop all pipeline threads, waiting up to a short grace period.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for timer in self.timers.lock().unwrap().iter_mut() {
            timer.stop();
        }
        let (ack_tx, ack_rx) = sync_channel(1);
        // This send is deliberately blocking: shutdown needs the stop message to arrive even if
        // the inbox is momentarily full.
        if self.inbox.send(EventProcessorMessage::Stop(ack_tx)).is_ok()
            && ack_rx.recv_timeout(STOP_GRACE_PERIOD).is_err()
        {
            log::warn!(target: "launchdarkly",
                "event dispatcher did not finish shutting down within the grace period");
        }
        if let Some(mut sender) = self.sender.lock().unwrap().take() {
            sender.stop();
        }
        if let Some(handle) = self.dispatcher_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

pub(crate) struct EventDispatcher {
    config: Arc<Config>,
    sender_tx: SyncSender<SenderMessage>,
    outbox: Vec<OutputEvent>,
    outbox_full_logged: bool,
    summarizer: EventSummarizer,
    context_keys: LruKeySet<String>,
    deduplicated_contexts: u64,
    disabled: Arc<AtomicBool>,
    last_known_server_time: Arc<AtomicU64>,
    dropped_events: Arc<AtomicU64>,
    diagnostics: Option<Arc<DiagnosticAccumulator>>,
}

impl EventDispatcher {
    pub(crate) fn new(
        config: Arc<Config>,
        sender_tx: SyncSender<SenderMessage>,
        disabled: Arc<AtomicBool>,
        last_known_server_time: Arc<AtomicU64>,
        dropped_events: Arc<AtomicU64>,
        diagnostics: Option<Arc<DiagnosticAccumulator>>,
    ) -> Self {
        let context_keys = LruKeySet::new(config.context_keys_capacity);
        EventDispatcher {
            config,
            sender_tx,
            outbox: Vec::new(),
            outbox_full_logged: false,
            summarizer: EventSummarizer::new(),
            context_keys,
            deduplicated_contexts: 0,
            disabled,
            last_known_server_time,
            dropped_events,
            diagnostics,
        }
    }

    pub(crate) fn run(mut self, inbox: Receiver<EventProcessorMessage>) {
        log::info!(target: "launchdarkly", "starting event processor");
        while let Ok(message) = inbox.recv() {
            if self.handle_message(message) {
                return;
            }
        }
    }

    // Returns true when the dispatcher should stop.
    pub(crate) fn handle_message(&mut self, message: EventProcessorMessage) -> bool {
        match message {
            EventProcessorMessage::Event(event) => {
                self.process_event(*event);
                false
            }
            EventProcessorMessage::Flush => {
                self.trigger_flush(false);
                false
            }
            EventProcessorMessage::FlushContexts => {
                self.context_keys.clear();
                false
            }
            EventProcessorMessage::Diagnostic => {
                self.send_diagnostics();
                false
            }
            EventProcessorMessage::Stop(ack) => {
                self.trigger_flush(true);
                let _ = ack.try_send(());
                true
            }
        }
    }

    fn process_event(&mut self, event: EventInput) {
        if self.disabled.load(Ordering::SeqCst) {
            return;
        }
        match event {
            EventInput::Eval(e) => {
                if !e.exclude_from_summaries() {
                    self.summarizer.summarize_event(&e);
                }
                self.note_context_seen(true, &e.context);
                let sampled = sampler::sample(e.sampling_ratio());
                let track = sampled && e.track_events;
                let debug = sampled && self.should_debug_event(&e);
                match (track, debug) {
                    (true, true) => {
                        self.add_to_outbox(OutputEvent::Feature(e.clone()));
                        self.add_to_outbox(OutputEvent::Debug(e));
                    }
                    (true, false) => self.add_to_outbox(OutputEvent::Feature(e)),
                    (false, true) => self.add_to_outbox(OutputEvent::Debug(e)),
                    (false, false) => {}
                }
            }
            EventInput::Identify(e) => {
                // An index event would be redundant next to an identify event, but the context
                // still counts as seen.
                self.note_context_seen(false, &e.context);
                self.add_to_outbox(OutputEvent::Identify(e));
            }
            EventInput::Custom(e) => {
                self.note_context_seen(true, &e.context);
                self.add_to_outbox(OutputEvent::Custom(e));
            }
            EventInput::MigrationOp(e) => {
                if sampler::sample(e.sampling_ratio) {
                    self.add_to_outbox(OutputEvent::MigrationOp(e));
                }
            }
        }
    }

    fn should_debug_event(&self, event: &EvaluationEvent) -> bool {
        let Some(debug_until) = event.debug_events_until_date() else {
            return false;
        };
        let last_past = self.last_known_server_time.load(Ordering::SeqCst);
        debug_until > last_past && debug_until > current_time_millis()
    }

    fn trigger_flush(&mut self, blocking: bool) {
        if self.disabled.load(Ordering::SeqCst) {
            return;
        }
        if self.outbox.is_empty() && self.summarizer.is_empty() {
            return;
        }
        let events = std::mem::take(&mut self.outbox);
        let summary = self.summarizer.take();
        let event_count = events.len() as u64;
        let message = SenderMessage::Flush { events, summary };
        if blocking {
            if self.sender_tx.send(message).is_ok() {
                self.record_batch(event_count);
            }
            return;
        }
        match self.sender_tx.try_send(message) {
            Ok(()) => self.record_batch(event_count),
            Err(TrySendError::Full(SenderMessage::Flush { events, summary })) => {
                // A payload is already queued; keep buffering until the sender catches up.
                self.outbox = events;
                self.summarizer.restore(summary);
            }
            Err(_) => {}
        }
    }

    fn record_batch(&self, event_count: u64) {
        if let Some(diagnostics) = &self.diagnostics {
            diagnostics.record_events_in_batch(event_count);
        }
    }

    fn send_diagnostics(&mut self) {
        let Some(diagnostics) = &self.diagnostics else {
            return;
        };
        let dropped = self.dropped_events.swap(0, Ordering::SeqCst);
        let deduplicated = std::mem::take(&mut self.deduplicated_contexts);
        let event = diagnostics.create_stats_event_and_reset(dropped, deduplicated);
        let _ = self.sender_tx.try_send(SenderMessage::Diagnostic(event));
    }

    fn note_context_seen(&mut self, can_add_index: bool, context: &crate::Context) {
        let already_seen = self
            .context_keys
            .notice(context.fully_qualified_key().to_owned());
        if !can_add_index {
            return;
        }
        if already_seen {
            self.deduplicated_contexts += 1;
        } else if !(self.config.omit_anonymous_contexts && context.all_anonymous()) {
            self.add_to_outbox(OutputEvent::Index {
                timestamp: current_time_millis(),
                context: context.clone(),
            });
        }
    }

    fn add_to_outbox(&mut self, event: OutputEvent) {
        if self.outbox.len() >= self.config.events_capacity {
            self.dropped_events.fetch_add(1, Ordering::SeqCst);
            if !self.outbox_full_logged {
                self.outbox_full_logged = true;
                log::warn!(target: "launchdarkly",
                    "exceeded event queue capacity; increase capacity to avoid dropping events");
            }
            return;
        }
        self.outbox_full_logged = false;
        self.outbox.push(event);
    }

}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::Receiver;

    use serde_json::json;

    use crate::events::EventFactory;
    use crate::eval::{EvaluationDetail, Reason};
    use crate::model::Flag;
    use crate::Context;

    use super::*;

    fn test_dispatcher(
        config: Config,
    ) -> (EventDispatcher, Receiver<SenderMessage>) {
        let (tx, rx) = sync_channel(1);
        let dispatcher = EventDispatcher::new(
            Arc::new(config),
            tx,
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicU64::new(0)),
            None,
        );
        (dispatcher, rx)
    }

    fn flag(track_events: bool) -> Arc<Flag> {
        Arc::new(
            serde_json::from_value(json!({
                "key": "f",
                "version": 3,
                "on": true,
                "variations": [false, true],
                "fallthrough": {"variation": 1},
                "trackEvents": track_events,
                "salt": "s"
            }))
            .unwrap(),
        )
    }

    fn eval_input(flag: &Arc<Flag>, context_key: &str) -> EventInput {
        EventFactory::new(false).new_eval_event(
            flag,
            Context::new(context_key).unwrap(),
            &EvaluationDetail {
                value: Some(json!(true)),
                variation_index: Some(1),
                reason: Reason::Fallthrough {
                    in_experiment: false,
                },
            },
            None,
            json!(false),
            None,
        )
    }

    fn flush(dispatcher: &mut EventDispatcher, rx: &Receiver<SenderMessage>) -> (Vec<OutputEvent>, crate::events::summarizer::EventSummary) {
        dispatcher.handle_message(EventProcessorMessage::Flush);
        match rx.try_recv() {
            Ok(SenderMessage::Flush { events, summary }) => (events, summary),
            _ => panic!("expected a flush payload"),
        }
    }

    #[test]
    fn evaluations_collapse_into_one_summary_counter() {
        let (mut dispatcher, rx) = test_dispatcher(Config::builder("key").build());
        let flag = flag(false);
        for _ in 0..3 {
            for context_key in ["c1", "c2"] {
                dispatcher.handle_message(EventProcessorMessage::Event(Box::new(eval_input(
                    &flag,
                    context_key,
                ))));
            }
        }
        let (events, summary) = flush(&mut dispatcher, &rx);

        // Two index events (one per context), no feature events without trackEvents.
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, OutputEvent::Index { .. })));

        let counters = &summary.flags["f"].counters;
        assert_eq!(counters.len(), 1);
        assert_eq!(counters[&(Some(1), Some(3))].count, 6);
    }

    #[test]
    fn tracked_flag_emits_feature_events() {
        let (mut dispatcher, rx) = test_dispatcher(Config::builder("key").build());
        let flag = flag(true);
        dispatcher.handle_message(EventProcessorMessage::Event(Box::new(eval_input(&flag, "c1"))));
        let (events, _) = flush(&mut dispatcher, &rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], OutputEvent::Index { .. }));
        assert!(matches!(events[1], OutputEvent::Feature(_)));
    }

    #[test]
    fn repeat_contexts_are_deduplicated_within_an_interval() {
        let (mut dispatcher, rx) = test_dispatcher(Config::builder("key").build());
        let flag = flag(false);
        dispatcher.handle_message(EventProcessorMessage::Event(Box::new(eval_input(&flag, "c1"))));
        dispatcher.handle_message(EventProcessorMessage::Event(Box::new(eval_input(&flag, "c1"))));
        let (events, _) = flush(&mut dispatcher, &rx);
        assert_eq!(events.len(), 1);
        assert_eq!(dispatcher.deduplicated_contexts, 1);

        // Clearing the seen-context cache allows a new index event.
        dispatcher.handle_message(EventProcessorMessage::FlushContexts);
        dispatcher.handle_message(EventProcessorMessage::Event(Box::new(eval_input(&flag, "c1"))));
        let (events, _) = flush(&mut dispatcher, &rx);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn identify_suppresses_index_event() {
        let (mut dispatcher, rx) = test_dispatcher(Config::builder("key").build());
        let context = Context::new("c1").unwrap();
        dispatcher.handle_message(EventProcessorMessage::Event(Box::new(
            EventFactory::new(false).new_identify_event(context),
        )));
        let (events, _) = flush(&mut dispatcher, &rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], OutputEvent::Identify(_)));
    }

    #[test]
    fn anonymous_contexts_can_be_omitted_from_index_events() {
        let (mut dispatcher, rx) =
            test_dispatcher(Config::builder("key").omit_anonymous_contexts(true).build());
        let flag = flag(false);
        let factory = EventFactory::new(false);
        let anonymous = Context::builder("c1").anonymous(true).build().unwrap();
        dispatcher.handle_message(EventProcessorMessage::Event(Box::new(
            factory.new_eval_event(
                &flag,
                anonymous,
                &EvaluationDetail {
                    value: Some(json!(true)),
                    variation_index: Some(1),
                    reason: Reason::Fallthrough {
                        in_experiment: false,
                    },
                },
                None,
                json!(false),
                None,
            ),
        )));
        dispatcher.handle_message(EventProcessorMessage::Flush);
        // No index event and nothing else to send except the summary.
        match rx.try_recv() {
            Ok(SenderMessage::Flush { events, summary }) => {
                assert!(events.is_empty());
                assert!(!summary.is_empty());
            }
            _ => panic!("expected a flush payload"),
        }
    }

    #[test]
    fn debug_events_respect_server_time() {
        let (mut dispatcher, rx) = test_dispatcher(Config::builder("key").build());
        let mut flag = flag(false);
        Arc::make_mut(&mut flag).debug_events_until_date = Some(current_time_millis() + 60_000);
        dispatcher.handle_message(EventProcessorMessage::Event(Box::new(eval_input(&flag, "c1"))));
        let (events, _) = flush(&mut dispatcher, &rx);
        assert!(events.iter().any(|e| matches!(e, OutputEvent::Debug(_))));

        // Once the server clock has passed the deadline, debugging stops even if the local
        // clock has not.
        dispatcher
            .last_known_server_time
            .store(current_time_millis() + 120_000, Ordering::SeqCst);
        dispatcher.handle_message(EventProcessorMessage::Event(Box::new(eval_input(&flag, "c2"))));
        let (events, _) = flush(&mut dispatcher, &rx);
        assert!(!events.iter().any(|e| matches!(e, OutputEvent::Debug(_))));
    }

    #[test]
    fn second_flush_is_buffered_while_sender_is_busy() {
        let (mut dispatcher, rx) = test_dispatcher(Config::builder("key").build());
        let flag = flag(false);
        dispatcher.handle_message(EventProcessorMessage::Event(Box::new(eval_input(&flag, "c1"))));
        // First flush fills the sender channel (capacity 1, nothing draining it).
        dispatcher.handle_message(EventProcessorMessage::Flush);
        // Second flush cannot hand off; the payload must remain buffered, not be lost.
        dispatcher.handle_message(EventProcessorMessage::Event(Box::new(eval_input(&flag, "c2"))));
        dispatcher.handle_message(EventProcessorMessage::Flush);
        assert!(!dispatcher.outbox.is_empty() || !dispatcher.summarizer.is_empty());

        // Drain the channel; the buffered payload goes out on the next flush.
        let _ = rx.try_recv();
        let (events, summary) = flush(&mut dispatcher, &rx);
        assert_eq!(events.len(), 1);
        assert_eq!(summary.flags["f"].counters[&(Some(1), Some(3))].count, 1);
    }
}

struct RepeatingTask {
    stop_tx: SyncSender<()>,
    handle: Option<JoinHandle<()>>,
}

impl RepeatingTask {
    fn start(name: &str, interval: Duration, task: impl Fn() + Send + 'static) -> RepeatingTask {
        let (stop_tx, stop_rx) = sync_channel::<()>(1);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => task(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            })
            .ok();
        RepeatingTask { stop_tx, handle }
    }

    fn stop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
