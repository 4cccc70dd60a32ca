//! Poll scheduling and event delivery.
//!
//! A [`Poller`] owns a single background task that drives every poll: the
//! periodic ticker, manual refreshes and control commands are all serialised
//! through it, so at most one tool invocation is ever in flight and emissions
//! reach subscribers in poll-completion order. Control calls
//! ([`start`](Poller::start), [`stop`](Poller::stop),
//! [`set_interval`](Poller::set_interval),
//! [`manual_refresh`](Poller::manual_refresh)) marshal a command into the
//! task and return without blocking on poll completion.
//!
//! # State machine
//!
//! `Idle -> Running` on `start`, `Running -> Stopped` on `stop`. A manual
//! refresh runs in any state and does not reset the periodic schedule. A
//! periodic tick that would land while a poll is in flight is skipped. A poll
//! still in flight when `stop` arrives completes, but its result is discarded
//! instead of delivered.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use nvsmi_metrics::poller::{PollEvent, Poller};
//! use nvsmi_metrics::runner::NvidiaSmi;
//!
//! #[tokio::main]
//! async fn main() -> nvsmi_metrics::Result<()> {
//!     let poller = Poller::new(Arc::new(NvidiaSmi::new()));
//!     let mut events = poller.event_stream();
//!     poller.start(5)?;
//!
//!     while let Some(event) = events.next().await {
//!         match event {
//!             PollEvent::Snapshot(snapshot) => println!("{} device(s)", snapshot.device_count()),
//!             PollEvent::Error(error) => eprintln!("poll failed: {error}"),
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod stream;

pub use stream::EventStream;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::metrics::{MetricSnapshot, PollError};
use crate::parser;
use crate::runner::{CommandRunner, DEFAULT_TIMEOUT};

/// Smallest accepted polling interval, in seconds.
pub const MIN_INTERVAL_SECS: u64 = 1;

/// Largest accepted polling interval, in seconds.
pub const MAX_INTERVAL_SECS: u64 = 60;

/// Lifecycle state of a [`Poller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Running,
    Stopped,
}

/// The outcome of one completed poll, as delivered to subscribers.
#[derive(Debug, Clone)]
pub enum PollEvent {
    Snapshot(MetricSnapshot),
    Error(PollError),
}

/// Receives every emission of the poller it is registered with.
///
/// Callbacks run on the polling task, synchronously with the emission; keep
/// them short and hand heavy work off to the presentation thread.
pub trait Subscriber: Send + Sync {
    fn on_snapshot(&self, snapshot: &MetricSnapshot);
    fn on_error(&self, error: &PollError);
}

enum Command {
    Start { interval: Duration },
    Stop,
    SetInterval { interval: Duration },
    Refresh,
}

struct Shared {
    state: RwLock<PollerState>,
    subscribers: RwLock<Vec<Arc<dyn Subscriber>>>,
    latest: RwLock<Option<MetricSnapshot>>,
    /// Bumped by `stop()`; a poll begun under an older epoch is stale and its
    /// result is dropped instead of delivered.
    epoch: AtomicU64,
}

/// Timer-driven poll loop with a subscriber fan-out.
pub struct Poller {
    command_tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl Poller {
    /// Creates an idle poller around the given runner with the default
    /// per-poll deadline. Must be called from within a tokio runtime.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_timeout(runner, DEFAULT_TIMEOUT)
    }

    /// Creates an idle poller with an explicit per-poll deadline.
    pub fn with_timeout(runner: Arc<dyn CommandRunner>, poll_timeout: Duration) -> Self {
        let shared = Arc::new(Shared {
            state: RwLock::new(PollerState::Idle),
            subscribers: RwLock::new(Vec::new()),
            latest: RwLock::new(None),
            epoch: AtomicU64::new(0),
        });
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_loop(runner, Arc::clone(&shared), command_rx, poll_timeout));

        Self { command_tx, shared, task: Some(task) }
    }

    /// Starts periodic polling: the first poll fires immediately, then every
    /// `interval_secs` seconds. Accepted from any state.
    pub fn start(&self, interval_secs: u64) -> Result<()> {
        let interval = validate_interval(interval_secs)?;
        self.start_with_interval(interval)
    }

    pub(crate) fn start_with_interval(&self, interval: Duration) -> Result<()> {
        self.send(Command::Start { interval })
    }

    /// Stops periodic polling. A poll already in flight completes but its
    /// result is never delivered.
    pub fn stop(&self) -> Result<()> {
        // Bump before enqueueing so a poll already in flight can never win
        // the race and deliver after this call returns.
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        self.send(Command::Stop)
    }

    /// Changes the periodic interval. While running, the ticker is rebuilt so
    /// the next tick fires one new interval after the change.
    pub fn set_interval(&self, interval_secs: u64) -> Result<()> {
        let interval = validate_interval(interval_secs)?;
        self.send(Command::SetInterval { interval })
    }

    /// Triggers a one-shot poll, independent of the periodic schedule.
    /// Delivered in `Running` and `Idle` alike; if a poll is already in
    /// flight the refresh runs right after it, never concurrently.
    pub fn manual_refresh(&self) -> Result<()> {
        self.send(Command::Refresh)
    }

    /// Registers a subscriber; all registered subscribers receive every
    /// subsequent emission.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        self.shared.subscribers.write().push(subscriber);
    }

    /// Returns a stream of poll outcomes, in completion order.
    pub fn event_stream(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(Arc::new(stream::ChannelSubscriber::new(tx)));
        EventStream::new(rx)
    }

    pub fn state(&self) -> PollerState {
        *self.shared.state.read()
    }

    /// The most recent successful snapshot. A failed poll never overwrites it.
    pub fn latest_snapshot(&self) -> Option<MetricSnapshot> {
        self.shared.latest.read().clone()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| Error::channel_closed("polling task has shut down"))
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = self.command_tx.send(Command::Stop);
            task.abort();
        }
    }
}

fn validate_interval(secs: u64) -> Result<Duration> {
    if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&secs) {
        return Err(Error::InvalidInterval(secs));
    }
    Ok(Duration::from_secs(secs))
}

fn new_ticker(interval: Duration, first_tick_immediate: bool) -> tokio::time::Interval {
    let start = if first_tick_immediate {
        tokio::time::Instant::now()
    } else {
        tokio::time::Instant::now() + interval
    };
    let mut ticker = tokio::time::interval_at(start, interval);
    // A tick that lands while a poll is in flight is skipped, not queued.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn run_loop(
    runner: Arc<dyn CommandRunner>,
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    poll_timeout: Duration,
) {
    let mut ticker: Option<tokio::time::Interval> = None;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Start { interval }) => {
                    ticker = Some(new_ticker(interval, true));
                    *shared.state.write() = PollerState::Running;
                    debug!("polling started, interval {interval:?}");
                }
                Some(Command::Stop) => {
                    ticker = None;
                    *shared.state.write() = PollerState::Stopped;
                    debug!("polling stopped");
                }
                Some(Command::SetInterval { interval }) => {
                    if ticker.is_some() {
                        ticker = Some(new_ticker(interval, false));
                        debug!("interval changed to {interval:?}");
                    }
                }
                Some(Command::Refresh) => {
                    debug!("manual refresh");
                    execute_poll(runner.as_ref(), &shared, poll_timeout).await;
                }
                None => break,
            },
            _ = tick(&mut ticker), if ticker.is_some() => {
                execute_poll(runner.as_ref(), &shared, poll_timeout).await;
            }
        }
    }
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        // Guarded out by the `if` on the select arm.
        None => std::future::pending::<()>().await,
    }
}

/// Runs one poll to completion and fans the outcome out to subscribers.
///
/// Polls are awaited inline in the task loop, which is what makes the
/// single-flight guarantee structural rather than lock-based.
async fn execute_poll(runner: &dyn CommandRunner, shared: &Shared, poll_timeout: Duration) {
    let epoch = shared.epoch.load(Ordering::SeqCst);

    let event = match runner.run(poll_timeout).await {
        Ok(raw) => match parser::parse(&raw) {
            Ok(devices) => PollEvent::Snapshot(MetricSnapshot::new(devices, raw)),
            Err(err) => PollEvent::Error(PollError::from_parse(err, raw)),
        },
        Err(err) => PollEvent::Error(PollError::from_run(err)),
    };

    // A stop that arrived while the tool was running wins.
    if shared.epoch.load(Ordering::SeqCst) != epoch {
        debug!("discarding poll result superseded by stop");
        return;
    }

    if let PollEvent::Snapshot(snapshot) = &event {
        *shared.latest.write() = Some(snapshot.clone());
    } else if let PollEvent::Error(error) = &event {
        warn!("poll failed: {error}");
    }

    // Clone the list so a callback registering another subscriber cannot
    // deadlock against the write lock.
    let subscribers: Vec<Arc<dyn Subscriber>> = shared.subscribers.read().clone();
    for subscriber in &subscribers {
        match &event {
            PollEvent::Snapshot(snapshot) => subscriber.on_snapshot(snapshot),
            PollEvent::Error(error) => subscriber.on_error(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    use futures::StreamExt;
    use parking_lot::Mutex;

    use super::*;
    use crate::metrics::PollErrorKind;
    use crate::runner::{MockCommandRunner, RunError};

    const SAMPLE: &str = "0, NVIDIA A100, 45, 12, 1024, 40960, 70.5\n";

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("nvsmi_metrics=debug")
            .with_test_writer()
            .try_init();
    }

    fn snapshot_runner() -> MockCommandRunner {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| Ok(SAMPLE.to_string()));
        runner
    }

    struct Collector {
        events: Mutex<Vec<PollEvent>>,
    }

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Self { events: Mutex::new(Vec::new()) })
        }

        fn events(&self) -> Vec<PollEvent> {
            self.events.lock().clone()
        }

        fn len(&self) -> usize {
            self.events.lock().len()
        }
    }

    impl Subscriber for Collector {
        fn on_snapshot(&self, snapshot: &MetricSnapshot) {
            self.events.lock().push(PollEvent::Snapshot(snapshot.clone()));
        }

        fn on_error(&self, error: &PollError) {
            self.events.lock().push(PollEvent::Error(error.clone()));
        }
    }

    /// Fake runner with a fixed per-call delay and an in-flight gauge.
    struct SlowRunner {
        delay: Duration,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl SlowRunner {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl CommandRunner for SlowRunner {
        async fn run(&self, _timeout: Duration) -> std::result::Result<String, RunError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            let now = self.in_flight.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, AtomicOrdering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, AtomicOrdering::SeqCst);
            Ok(SAMPLE.to_string())
        }

        async fn run_detailed(&self, _timeout: Duration) -> std::result::Result<String, RunError> {
            Ok(String::new())
        }

        async fn probe(&self) -> bool {
            true
        }
    }

    async fn wait_for_events(collector: &Collector, count: usize) {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while collector.len() < count {
            assert!(std::time::Instant::now() < deadline, "timed out waiting for {count} events");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn start_polls_immediately() {
        init_tracing();
        let poller = Poller::new(Arc::new(snapshot_runner()));
        let mut events = poller.event_stream();

        poller.start(1).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.next())
            .await
            .expect("no event before the deadline")
            .expect("stream closed");
        match event {
            PollEvent::Snapshot(snapshot) => {
                assert_eq!(snapshot.device_count(), 1);
                assert_eq!(snapshot.devices[0].name, "NVIDIA A100");
            }
            PollEvent::Error(error) => panic!("unexpected error event: {error}"),
        }
        assert_eq!(poller.state(), PollerState::Running);
        assert!(poller.latest_snapshot().is_some());
    }

    #[tokio::test]
    async fn manual_refresh_works_while_idle() {
        let poller = Poller::new(Arc::new(snapshot_runner()));
        let collector = Collector::new();
        poller.subscribe(collector.clone());

        poller.manual_refresh().unwrap();
        wait_for_events(&collector, 1).await;

        assert_eq!(poller.state(), PollerState::Idle);
        assert!(matches!(collector.events()[0], PollEvent::Snapshot(_)));
    }

    #[tokio::test]
    async fn run_failure_is_delivered_as_poll_error() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| Err(RunError::NotFound));
        let poller = Poller::new(Arc::new(runner));
        let collector = Collector::new();
        poller.subscribe(collector.clone());

        poller.manual_refresh().unwrap();
        wait_for_events(&collector, 1).await;

        match &collector.events()[0] {
            PollEvent::Error(error) => {
                assert_eq!(error.kind, PollErrorKind::ToolNotFound);
                assert!(!error.message.is_empty());
            }
            PollEvent::Snapshot(_) => panic!("expected an error event"),
        }
        assert!(poller.latest_snapshot().is_none());
    }

    #[tokio::test]
    async fn parse_failure_preserves_the_raw_output() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| Ok("garbage output\n".to_string()));
        let poller = Poller::new(Arc::new(runner));
        let collector = Collector::new();
        poller.subscribe(collector.clone());

        poller.manual_refresh().unwrap();
        wait_for_events(&collector, 1).await;

        match &collector.events()[0] {
            PollEvent::Error(error) => {
                assert_eq!(error.kind, PollErrorKind::ParseFailure);
                assert_eq!(error.raw_output, "garbage output\n");
            }
            PollEvent::Snapshot(_) => panic!("expected an error event"),
        }
    }

    #[tokio::test]
    async fn overlapping_polls_are_serialised() {
        let runner = SlowRunner::new(Duration::from_millis(200));
        let poller = Poller::new(runner.clone());
        let collector = Collector::new();
        poller.subscribe(collector.clone());

        // Long interval: only the immediate first poll fires periodically.
        poller.start_with_interval(Duration::from_secs(10)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        poller.manual_refresh().unwrap();

        wait_for_events(&collector, 2).await;

        assert_eq!(runner.calls.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(runner.max_in_flight.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(collector.len(), 2);
    }

    #[tokio::test]
    async fn stop_suppresses_the_in_flight_result() {
        let runner = SlowRunner::new(Duration::from_millis(200));
        let poller = Poller::new(runner.clone());
        let collector = Collector::new();
        poller.subscribe(collector.clone());

        poller.start_with_interval(Duration::from_secs(10)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        poller.stop().unwrap();

        // Give the in-flight poll ample time to complete and be discarded.
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(runner.calls.load(AtomicOrdering::SeqCst), 1);
        assert!(collector.events().is_empty());
        assert_eq!(poller.state(), PollerState::Stopped);
        assert!(poller.latest_snapshot().is_none());
    }

    #[tokio::test]
    async fn failed_poll_keeps_the_last_known_good_snapshot() {
        let mut runner = MockCommandRunner::new();
        let mut seq = mockall::Sequence::new();
        runner
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(SAMPLE.to_string()));
        runner
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(RunError::Timeout { timeout: Duration::from_millis(5) }));

        let poller = Poller::new(Arc::new(runner));
        let collector = Collector::new();
        poller.subscribe(collector.clone());

        poller.manual_refresh().unwrap();
        wait_for_events(&collector, 1).await;
        poller.manual_refresh().unwrap();
        wait_for_events(&collector, 2).await;

        match &collector.events()[1] {
            PollEvent::Error(error) => assert_eq!(error.kind, PollErrorKind::ToolTimeout),
            PollEvent::Snapshot(_) => panic!("expected an error event"),
        }
        let latest = poller.latest_snapshot().expect("good snapshot retained");
        assert_eq!(latest.devices[0].name, "NVIDIA A100");
    }

    #[tokio::test]
    async fn every_subscriber_receives_every_emission() {
        let poller = Poller::new(Arc::new(snapshot_runner()));
        let first = Collector::new();
        let second = Collector::new();
        poller.subscribe(first.clone());
        poller.subscribe(second.clone());

        poller.manual_refresh().unwrap();
        wait_for_events(&first, 1).await;
        wait_for_events(&second, 1).await;

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn interval_bounds_are_enforced() {
        let poller = Poller::new(Arc::new(snapshot_runner()));

        assert!(matches!(poller.start(0), Err(Error::InvalidInterval(0))));
        assert!(matches!(poller.start(61), Err(Error::InvalidInterval(61))));
        assert!(matches!(poller.set_interval(0), Err(Error::InvalidInterval(0))));
        assert!(poller.start(MIN_INTERVAL_SECS).is_ok());
        assert!(poller.set_interval(MAX_INTERVAL_SECS).is_ok());
    }

    #[tokio::test]
    async fn restart_after_stop_is_accepted() {
        let poller = Poller::new(Arc::new(snapshot_runner()));
        let collector = Collector::new();
        poller.subscribe(collector.clone());

        poller.start(1).unwrap();
        wait_for_events(&collector, 1).await;
        poller.stop().unwrap();

        poller.start(1).unwrap();
        let seen = collector.len();
        wait_for_events(&collector, seen + 1).await;
        assert_eq!(poller.state(), PollerState::Running);
    }
}
