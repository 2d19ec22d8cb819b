//! Provisioning tracker runtime.
//!
//! Feeds policy checks, watched event log records, backfill and timer
//! expiries into [`ProvisioningState`] and carries out the resulting effects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{self, JoinHandle};
use tokio::time::{self, MissedTickBehavior};

use crate::config::TrackerConfig;
use crate::constants::SOURCE_PROVISIONING_TRACKER;
use crate::telemetry::EventEmitter;
use crate::tracker::events::{
    classify, TrackerEvent, DEVICE_REGISTRATION_CHANNEL, DEVICE_REGISTRATION_EVENT_IDS, SHELL_CORE_CHANNEL,
    SHELL_CORE_EVENT_IDS, TERMINAL_HELLO_EVENT_IDS,
};
use crate::tracker::policy::{check_hello_policy, HelloPolicy};
use crate::tracker::state::{Effect, Input, ObservedEvent, Origin, PendingTimer, ProvisioningState, TrackerSignal};
use crate::tracker::watcher::EventLogWatcher;
use crate::windows::{Backends, ConfigStore, EventLogSource, EventQuery, EventRecord};

/// Signals buffered per subscriber
const SIGNAL_CAPACITY: usize = 16;

struct TrackerInner {
    registry: Arc<dyn ConfigStore>,
    event_log: Arc<dyn EventLogSource>,
    emitter: EventEmitter,
    config: TrackerConfig,
    runtime: Handle,
    state: Mutex<ProvisioningState>,
    timer_task: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    signals: broadcast::Sender<TrackerSignal>,
    started: AtomicBool,
    stopped: AtomicBool,
}

/// Tracks Windows Hello and pre-provisioning progress during enrollment.
pub struct ProvisioningTracker {
    inner: Arc<TrackerInner>,
}

impl ProvisioningTracker {
    /// Build a tracker bound to the current tokio runtime.
    ///
    /// Timers and watchers run on that runtime, so the public entry points
    /// may be called from any thread afterwards.
    pub fn new(backends: &Backends, emitter: EventEmitter, config: TrackerConfig) -> Result<Self> {
        let runtime = Handle::try_current().context("Provisioning tracker must be created inside a tokio runtime")?;
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Ok(Self {
            inner: Arc::new(TrackerInner {
                registry: backends.registry.clone(),
                event_log: backends.event_log.clone(),
                emitter,
                config,
                runtime,
                state: Mutex::new(ProvisioningState::default()),
                timer_task: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                signals,
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Lifecycle signals raised from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerSignal> {
        self.inner.signals.subscribe()
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> ProvisioningState {
        self.inner.state.lock().clone()
    }

    /// Check policy, start watchers and replay the latest terminal Hello
    /// outcome. Later calls do nothing.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) || self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        info!("Starting provisioning tracker");

        let policy_resolved = match self.inner.check_policy().await {
            Some(policy) => {
                self.inner.apply(Input::PolicyResolved { enabled: policy.enabled, source: policy.source });
                true
            }
            None => false,
        };
        if !policy_resolved {
            let handle = self.inner.spawn_policy_poll();
            self.inner.tasks.lock().push(handle);
        }

        self.start_watchers().await;
        self.inner.backfill().await;
    }

    async fn start_watchers(&self) {
        let (tx, mut rx) = mpsc::unbounded_channel::<EventRecord>();
        let interval = self.inner.config.watcher_poll_interval();

        let watched = [
            (DEVICE_REGISTRATION_CHANNEL, &DEVICE_REGISTRATION_EVENT_IDS[..]),
            (SHELL_CORE_CHANNEL, &SHELL_CORE_EVENT_IDS[..]),
        ];

        let mut handles = Vec::new();
        for (channel, ids) in watched {
            let mut watcher = EventLogWatcher::new(self.inner.event_log.clone(), channel, ids);
            // Prime before backfill so backfilled history is never redelivered live
            let primed = task::spawn_blocking(move || {
                let result = watcher.prime();
                (watcher, result)
            })
            .await;
            match primed {
                Ok((watcher, result)) => {
                    if let Err(e) = result {
                        info!("Event log {} not available yet: {:#}", watcher.channel(), e);
                    }
                    handles.push(watcher.spawn(&self.inner.runtime, interval, tx.clone()));
                }
                Err(e) => warn!("Failed to prime watcher for {}: {}", channel, e),
            }
        }

        let weak = Arc::downgrade(&self.inner);
        handles.push(self.inner.runtime.spawn(async move {
            while let Some(record) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle_record(&record, Origin::Live);
            }
        }));

        self.inner.tasks.lock().extend(handles);
    }

    /// Arm the short Hello-wait timer. Ignored once the wizard started,
    /// Hello completed, or a timer is already armed.
    pub fn start_hello_wait_timer(&self) {
        debug!("Hello wait timer requested");
        self.inner.apply(Input::ArmHelloWait);
    }

    /// Feed one event log record through the live path.
    pub fn handle_record(&self, record: &EventRecord) {
        self.inner.handle_record(record, Origin::Live);
    }

    /// Cancel timers and watchers. Safe to call more than once.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(timer) = self.inner.timer_task.lock().take() {
            timer.abort();
        }
        for handle in self.inner.tasks.lock().drain(..) {
            handle.abort();
        }
        info!("Provisioning tracker stopped");
    }
}

impl Drop for ProvisioningTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TrackerInner {
    /// Run one transition and carry out its effects.
    ///
    /// Timer effects are applied under the state lock so the armed task
    /// always matches the pending generation.
    fn apply(self: &Arc<Self>, input: Input) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let effects = {
            let mut state = self.state.lock();
            let effects = state.apply(input, &self.config);
            for effect in &effects {
                match effect {
                    Effect::ArmTimer { timer, after } => self.arm_timer(*timer, *after),
                    Effect::CancelTimer => {
                        if let Some(task) = self.timer_task.lock().take() {
                            task.abort();
                        }
                    }
                    _ => {}
                }
            }
            effects
        };

        for effect in effects {
            match effect {
                Effect::Emit { event_type, severity, message, data } => {
                    self.emitter.emit(SOURCE_PROVISIONING_TRACKER, event_type, severity, message, data);
                }
                Effect::Signal(signal) => {
                    info!("Provisioning signal: {:?}", signal);
                    if self.signals.send(signal).is_err() {
                        debug!("No subscribers for provisioning signal");
                    }
                }
                Effect::ArmTimer { .. } | Effect::CancelTimer => {}
            }
        }
    }

    fn arm_timer(self: &Arc<Self>, timer: PendingTimer, after: std::time::Duration) {
        debug!("Arming {:?} timer for {:?}", timer.kind, after);
        let weak: Weak<TrackerInner> = Arc::downgrade(self);
        let task = self.runtime.spawn(async move {
            time::sleep(after).await;
            if let Some(inner) = weak.upgrade() {
                inner.apply(Input::TimerFired(timer));
            }
        });
        if let Some(previous) = self.timer_task.lock().replace(task) {
            previous.abort();
        }
    }

    fn handle_record(self: &Arc<Self>, record: &EventRecord, origin: Origin) {
        let Some(event) = classify(record) else {
            return;
        };
        if event == TrackerEvent::PrerequisitesPassed {
            debug!("Hello prerequisites passed (record {})", record.record_id);
        }
        self.apply(Input::Event(ObservedEvent {
            event,
            event_id: record.event_id,
            record_id: record.record_id,
            time_created: record.time_created,
            origin,
        }));
    }

    async fn check_policy(&self) -> Option<HelloPolicy> {
        let registry = self.registry.clone();
        match task::spawn_blocking(move || check_hello_policy(registry.as_ref())).await {
            Ok(Ok(policy)) => policy,
            Ok(Err(e)) => {
                debug!("Hello policy check failed: {:#}", e);
                None
            }
            Err(e) => {
                warn!("Hello policy check task failed: {}", e);
                None
            }
        }
    }

    /// Poll until the policy resolves or Hello no longer matters.
    fn spawn_policy_poll(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.config.policy_poll_interval();
        self.runtime.spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.state.lock().hello_completed {
                    debug!("Hello completed, stopping policy poll");
                    break;
                }
                if let Some(policy) = inner.check_policy().await {
                    inner.apply(Input::PolicyResolved { enabled: policy.enabled, source: policy.source });
                    break;
                }
            }
        })
    }

    /// Replay the most recent terminal Hello outcome inside the look-back
    /// window.
    async fn backfill(self: &Arc<Self>) {
        let since = Utc::now() - self.config.backfill_lookback();
        let query = EventQuery::new(DEVICE_REGISTRATION_CHANNEL, 1)
            .event_ids(TERMINAL_HELLO_EVENT_IDS)
            .since(since);

        let source = self.event_log.clone();
        let latest = match task::spawn_blocking(move || source.query(&query)).await {
            Ok(Ok(records)) => records.into_iter().next(),
            Ok(Err(e)) => {
                info!("Skipping Hello backfill, event log not readable: {:#}", e);
                return;
            }
            Err(e) => {
                warn!("Hello backfill task failed: {}", e);
                return;
            }
        };

        match latest {
            Some(record) => {
                info!("Backfilling Hello outcome from record {} (event {})", record.record_id, record.event_id);
                self.handle_record(&record, Origin::Backfill);
            }
            None => debug!("No terminal Hello outcome in the backfill window"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemorySink;
    use crate::test_utils::{FakeEventLog, FakeRegistry, FakeWmi};
    use crate::windows::{MockCommandRunner, RegValue};
    use chrono::Duration as ChronoDuration;

    fn backends(registry: FakeRegistry, log: Arc<FakeEventLog>) -> Backends {
        Backends {
            registry: Arc::new(registry),
            wmi: Arc::new(FakeWmi::default()),
            event_log: log,
            commands: Arc::new(MockCommandRunner::new()),
        }
    }

    fn hello_record(record_id: u64, event_id: u32, minutes_ago: i64) -> EventRecord {
        EventRecord {
            channel: DEVICE_REGISTRATION_CHANNEL.to_string(),
            provider: "Microsoft-Windows-User Device Registration".to_string(),
            event_id,
            record_id,
            time_created: Utc::now() - ChronoDuration::minutes(minutes_ago),
            level: Some(4),
            message: String::new(),
        }
    }

    #[tokio::test]
    async fn test_backfill_replays_latest_terminal_outcome() {
        let log = Arc::new(FakeEventLog::default());
        log.records.lock().extend([
            hello_record(1, 301, 90),
            hello_record(2, 360, 20),
            hello_record(3, 300, 10),
        ]);

        let sink = MemorySink::new();
        let tracker = ProvisioningTracker::new(
            &backends(FakeRegistry::default(), log),
            EventEmitter::new(Arc::new(sink.clone())),
            TrackerConfig::default(),
        )
        .unwrap();
        let mut signals = tracker.subscribe();
        tracker.start().await;

        assert!(tracker.snapshot().hello_completed);
        assert_eq!(signals.try_recv().unwrap(), TrackerSignal::HelloCompleted);

        let completed = sink.events_of_type("hello_completed");
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].data_str("origin"), Some("backfill"));
        assert_eq!(completed[0].data_str("outcome"), Some("succeeded"));
        tracker.stop();
    }

    #[tokio::test]
    async fn test_policy_checked_at_start() {
        let registry = FakeRegistry::default().with_key(
            "HKLM\\SOFTWARE\\Policies\\Microsoft\\PassportForWork",
            vec![("Enabled", RegValue::Dword(1))],
        );
        let sink = MemorySink::new();
        let tracker = ProvisioningTracker::new(
            &backends(registry, Arc::new(FakeEventLog::default())),
            EventEmitter::new(Arc::new(sink.clone())),
            TrackerConfig::default(),
        )
        .unwrap();
        tracker.start().await;

        assert!(tracker.snapshot().policy_enabled());
        assert_eq!(sink.count_of_type("hello_policy_detected"), 1);
        assert_eq!(tracker.snapshot().timer, None);
        tracker.stop();
        tracker.stop();
    }

    #[tokio::test]
    async fn test_stopped_tracker_ignores_input() {
        let sink = MemorySink::new();
        let tracker = ProvisioningTracker::new(
            &backends(FakeRegistry::default(), Arc::new(FakeEventLog::default())),
            EventEmitter::new(Arc::new(sink.clone())),
            TrackerConfig::default(),
        )
        .unwrap();
        tracker.stop();
        tracker.handle_record(&hello_record(9, 300, 0));
        assert!(!tracker.snapshot().hello_completed);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_entry_points_work_off_runtime_threads() {
        let make = || {
            ProvisioningTracker::new(
                &backends(FakeRegistry::default(), Arc::new(FakeEventLog::default())),
                EventEmitter::new(Arc::new(MemorySink::new())),
                TrackerConfig::default(),
            )
        };
        assert!(make().is_err());

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let tracker = runtime.block_on(async { make() }).unwrap();

        tracker.start_hello_wait_timer();
        assert!(tracker.snapshot().timer.is_some());

        tracker.handle_record(&hello_record(1, 300, 0));
        assert!(tracker.snapshot().hello_completed);
        assert_eq!(tracker.snapshot().timer, None);
        tracker.stop();
    }
}
