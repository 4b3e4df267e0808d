//! Pipeline runner: polls notification logs and drives process applications.
//!
//! A [`Runner`] owns a set of [`Edge`]s, each pairing an upstream
//! [`NotificationLog`] with the [`Follower`] that consumes it. Edges are
//! serviced by background worker threads, one for the whole pipeline under
//! [`Scheduling::SingleThreaded`] or one per edge under
//! [`Scheduling::MultiThreaded`].

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::ProcessError;
use crate::notification::NotificationLog;
use crate::process::{BatchReport, DEFAULT_BATCH_SIZE, Follower};

/// Shortest wait between idle rounds of a worker.
const MIN_IDLE_DELAY: Duration = Duration::from_millis(1);

/// How edges are assigned to worker threads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Scheduling {
    /// One worker services every edge in turn, one batch at a time.
    #[default]
    SingleThreaded,
    /// One worker per edge.
    MultiThreaded,
}

/// Configuration for a [`Runner`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventfold_process::{RunnerConfig, Scheduling};
///
/// let config = RunnerConfig {
///     scheduling: Scheduling::MultiThreaded,
///     ..RunnerConfig::default()
/// };
/// assert_eq!(config.batch_size, 100);
/// assert_eq!(config.idle_delay, Duration::from_millis(10));
/// ```
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Thread assignment of edges.
    ///
    /// Default: [`Scheduling::SingleThreaded`].
    pub scheduling: Scheduling,

    /// Maximum notifications per batch. 0 is treated as 1.
    ///
    /// Default: 100.
    pub batch_size: usize,

    /// Wait after a round that made no progress.
    ///
    /// Doubles on every idle or failing round, up to
    /// [`max_idle_delay`](RunnerConfig::max_idle_delay), and resets when a
    /// round makes progress. Waits shorter than 1 millisecond are raised to
    /// 1 millisecond.
    ///
    /// Default: 10 milliseconds.
    pub idle_delay: Duration,

    /// Upper bound for the idle wait.
    ///
    /// Default: 500 milliseconds.
    pub max_idle_delay: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            scheduling: Scheduling::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            idle_delay: Duration::from_millis(10),
            max_idle_delay: Duration::from_millis(500),
        }
    }
}

impl RunnerConfig {
    /// Wait after the first idle round.
    fn base_delay(&self) -> Duration {
        self.idle_delay.max(MIN_IDLE_DELAY)
    }

    /// Wait after the idle round following one that waited `delay`.
    fn next_delay(&self, delay: Duration) -> Duration {
        (delay * 2).min(self.max_idle_delay).max(MIN_IDLE_DELAY)
    }
}

/// A configured `(upstream, downstream)` relationship.
#[derive(Clone)]
pub struct Edge {
    upstream: NotificationLog,
    follower: Arc<dyn Follower>,
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edge")
            .field("upstream", &self.upstream.name())
            .field("downstream", &self.follower.name())
            .finish()
    }
}

impl Edge {
    /// Have `follower` consume `upstream`.
    pub fn new(upstream: NotificationLog, follower: Arc<dyn Follower>) -> Self {
        Self { upstream, follower }
    }

    /// Name of the consuming application.
    pub fn downstream(&self) -> &str {
        self.follower.name()
    }

    /// Name of the consumed log.
    pub fn upstream(&self) -> &str {
        self.upstream.name()
    }

    fn step(&self, batch_size: usize) -> Result<BatchReport, ProcessError> {
        self.follower.pull_and_process(&self.upstream, batch_size.max(1))
    }
}

/// Drives a set of edges until stopped.
///
/// Dropping a running `Runner` stops it.
pub struct Runner {
    edges: Vec<Edge>,
    config: RunnerConfig,
    shutdown_tx: Option<watch::Sender<bool>>,
    workers: Vec<JoinHandle<()>>,
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("edges", &self.edges)
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Runner {
    /// Create a stopped runner over `edges`.
    ///
    /// # Errors
    ///
    /// Returns `io::ErrorKind::InvalidInput` if two edges share the same
    /// `(downstream, upstream)` pair; they would race on one tracking record.
    pub fn new(edges: Vec<Edge>, config: RunnerConfig) -> io::Result<Self> {
        let mut seen = HashSet::new();
        for edge in &edges {
            if !seen.insert((edge.downstream().to_owned(), edge.upstream().to_owned())) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "duplicate edge: {} already follows {}",
                        edge.downstream(),
                        edge.upstream()
                    ),
                ));
            }
        }
        Ok(Self {
            edges,
            config,
            shutdown_tx: None,
            workers: Vec::new(),
        })
    }

    /// The configured edges.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Returns `true` between [`start`](Runner::start) and
    /// [`stop`](Runner::stop).
    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Launch the worker threads.
    ///
    /// # Errors
    ///
    /// - `io::ErrorKind::AlreadyExists` if the runner is already running.
    /// - Any error from spawning a thread; workers spawned before the
    ///   failure are stopped again.
    pub fn start(&mut self) -> io::Result<()> {
        if self.is_running() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "runner is already running",
            ));
        }

        let groups: Vec<Vec<Edge>> = match self.config.scheduling {
            Scheduling::SingleThreaded => vec![self.edges.clone()],
            Scheduling::MultiThreaded => self.edges.iter().map(|e| vec![e.clone()]).collect(),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);
        for (i, edges) in groups.into_iter().enumerate() {
            let config = self.config.clone();
            let shutdown_rx = shutdown_rx.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("pipeline-worker-{i}"))
                .spawn(move || run_worker(edges, config, shutdown_rx));
            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    let _ = self.stop();
                    return Err(e);
                }
            }
        }

        tracing::info!(
            edges = self.edges.len(),
            workers = self.workers.len(),
            scheduling = ?self.config.scheduling,
            "runner started"
        );
        Ok(())
    }

    /// Signal every worker to stop and wait for them to exit.
    ///
    /// Workers finish the batch they are processing first. Calling `stop`
    /// on a stopped runner is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if a worker thread panicked.
    pub fn stop(&mut self) -> io::Result<()> {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return Ok(());
        };
        // Receivers may already be gone if every worker exited.
        let _ = shutdown_tx.send(true);

        let mut panicked = 0;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                panicked += 1;
            }
        }
        tracing::info!(panicked, "runner stopped");
        if panicked > 0 {
            return Err(io::Error::other(format!(
                "{panicked} pipeline worker(s) panicked"
            )));
        }
        Ok(())
    }

    /// Service every edge on the calling thread until a full round consumes
    /// nothing.
    ///
    /// # Returns
    ///
    /// The total number of notifications consumed.
    ///
    /// # Errors
    ///
    /// Returns the first [`ProcessError`]; batches committed before it stay
    /// committed.
    pub fn run_until_idle(&self) -> Result<usize, ProcessError> {
        let mut total = 0;
        loop {
            let mut round = 0;
            for edge in &self.edges {
                round += edge.step(self.config.batch_size)?.notifications;
            }
            if round == 0 {
                return Ok(total);
            }
            total += round;
        }
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!(error = %e, "runner did not stop cleanly");
        }
    }
}

/// Worker thread body: service `edges` round-robin until shutdown.
fn run_worker(edges: Vec<Edge>, config: RunnerConfig, shutdown_rx: watch::Receiver<bool>) {
    // A dedicated current-thread runtime drives the idle timer and the
    // shutdown channel independently of any runtime the caller has.
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to create worker runtime");
            return;
        }
    };
    rt.block_on(worker_loop(edges, config, shutdown_rx));
}

async fn worker_loop(
    edges: Vec<Edge>,
    config: RunnerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut delay = config.base_delay();

    loop {
        let mut progressed = false;
        let mut failed = false;

        for edge in &edges {
            // Cancellation is only observed between batches.
            if *shutdown_rx.borrow() {
                return;
            }
            match edge.step(config.batch_size) {
                Ok(report) => progressed |= report.made_progress(),
                Err(e) => {
                    failed = true;
                    tracing::warn!(
                        downstream = edge.downstream(),
                        upstream = edge.upstream(),
                        error = %e,
                        "batch failed, will retry"
                    );
                }
            }
        }

        if progressed && !failed {
            delay = config.base_delay();
            continue;
        }
        if progressed {
            delay = config.base_delay();
        }

        tracing::debug!(delay_ms = delay.as_millis() as u64, "pipeline idle");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            // The only value ever sent is `true`, and a closed channel
            // means the runner is gone.
            _ = shutdown_rx.changed() => return,
        }
        delay = config.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use uuid::Uuid;

    use super::*;
    use crate::aggregate::test_fixtures::{Ledger, LedgerCommand};
    use crate::application::Application;
    use crate::command::CommandContext;
    use crate::process::ProcessApplication;
    use crate::process::test_fixtures::Mirror;
    use crate::storage::test_fixtures::FlakyStorage;
    use crate::store::EventStore;

    /// bank -> audit -> archive, each in its own store.
    struct Chain {
        bank: Application<Ledger>,
        audit: Arc<ProcessApplication<Mirror>>,
        archive: Arc<ProcessApplication<Mirror>>,
    }

    impl Chain {
        fn new() -> Self {
            Self::with_audit_store(EventStore::in_memory())
        }

        fn with_audit_store(audit: EventStore) -> Self {
            Self {
                bank: Application::new("bank", EventStore::in_memory()),
                audit: Arc::new(ProcessApplication::new(
                    Application::new("audit", audit),
                    Mirror,
                )),
                archive: Arc::new(ProcessApplication::new(
                    Application::new("archive", EventStore::in_memory()),
                    Mirror,
                )),
            }
        }

        fn edges(&self) -> Vec<Edge> {
            vec![
                Edge::new(self.bank.notification_log(), self.audit.clone()),
                Edge::new(
                    self.audit.application().notification_log(),
                    self.archive.clone(),
                ),
            ]
        }

        fn open_with(&self, amount: u64) -> Uuid {
            let ctx = CommandContext::default();
            let (id, _) = self.bank.create(LedgerCommand::Open, &ctx).unwrap();
            self.bank
                .execute(id, LedgerCommand::Deposit(amount), &ctx)
                .unwrap();
            id
        }

        fn archived_balance(&self, id: Uuid) -> Option<u64> {
            self.archive
                .application()
                .load(id)
                .ok()
                .map(|(ledger, _)| ledger.balance)
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn duplicate_edges_are_rejected() {
        let chain = Chain::new();
        let mut edges = chain.edges();
        edges.push(edges[0].clone());

        let err = Runner::new(edges, RunnerConfig::default()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn run_until_idle_drains_a_chain() {
        let chain = Chain::new();
        let id = chain.open_with(8);
        let runner = Runner::new(chain.edges(), RunnerConfig::default()).unwrap();

        let consumed = runner.run_until_idle().unwrap();

        // Two notifications on each edge.
        assert_eq!(consumed, 4);
        assert_eq!(chain.archived_balance(id), Some(8));
        assert_eq!(runner.run_until_idle().unwrap(), 0);
    }

    #[test]
    fn zero_batch_size_still_drains() {
        let chain = Chain::new();
        let id = chain.open_with(3);
        let runner = Runner::new(
            chain.edges(),
            RunnerConfig {
                batch_size: 0,
                ..RunnerConfig::default()
            },
        )
        .unwrap();

        assert_eq!(runner.run_until_idle().unwrap(), 4);
        assert_eq!(chain.archived_balance(id), Some(3));
    }

    #[test]
    fn idle_backoff_doubles_up_to_the_cap() {
        let config = RunnerConfig::default();
        assert_eq!(config.base_delay(), Duration::from_millis(10));
        assert_eq!(
            config.next_delay(Duration::from_millis(10)),
            Duration::from_millis(20)
        );
        assert_eq!(
            config.next_delay(Duration::from_millis(400)),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn zero_idle_delay_does_not_spin() {
        let config = RunnerConfig {
            idle_delay: Duration::ZERO,
            max_idle_delay: Duration::ZERO,
            ..RunnerConfig::default()
        };
        assert_eq!(config.base_delay(), MIN_IDLE_DELAY);
        assert_eq!(config.next_delay(config.base_delay()), MIN_IDLE_DELAY);
    }

    fn recovers_from_failed_batches(scheduling: Scheduling) {
        let chain = Chain::with_audit_store(EventStore::new(Arc::new(FlakyStorage::failing(2))));
        let mut runner = Runner::new(
            chain.edges(),
            RunnerConfig {
                scheduling,
                idle_delay: Duration::from_millis(1),
                max_idle_delay: Duration::from_millis(10),
                ..RunnerConfig::default()
            },
        )
        .unwrap();
        let id = chain.open_with(6);
        runner.start().unwrap();

        assert!(
            wait_for(|| chain.archived_balance(id) == Some(6)),
            "worker did not recover from failing commits"
        );
        assert!(runner.is_running());
        runner.stop().unwrap();
    }

    #[test]
    fn single_threaded_worker_survives_failing_commits() {
        recovers_from_failed_batches(Scheduling::SingleThreaded);
    }

    #[test]
    fn multi_threaded_worker_survives_failing_commits() {
        recovers_from_failed_batches(Scheduling::MultiThreaded);
    }

    fn runs_in_background(scheduling: Scheduling) {
        let chain = Chain::new();
        let mut runner = Runner::new(
            chain.edges(),
            RunnerConfig {
                scheduling,
                ..RunnerConfig::default()
            },
        )
        .unwrap();
        runner.start().unwrap();
        assert!(runner.is_running());

        let first = chain.open_with(1);
        let second = chain.open_with(2);
        assert!(
            wait_for(|| chain.archived_balance(first) == Some(1)
                && chain.archived_balance(second) == Some(2)),
            "pipeline did not deliver in time"
        );

        runner.stop().unwrap();
        assert!(!runner.is_running());
    }

    #[test]
    fn single_threaded_runner_delivers_through_the_chain() {
        runs_in_background(Scheduling::SingleThreaded);
    }

    #[test]
    fn multi_threaded_runner_delivers_through_the_chain() {
        runs_in_background(Scheduling::MultiThreaded);
    }

    #[test]
    fn start_twice_is_rejected_and_stop_is_idempotent() {
        let chain = Chain::new();
        let mut runner = Runner::new(chain.edges(), RunnerConfig::default()).unwrap();
        runner.start().unwrap();

        let err = runner.start().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);

        runner.stop().unwrap();
        runner.stop().unwrap();
        // Restartable after a stop.
        runner.start().unwrap();
    }

    #[test]
    fn stop_interrupts_a_long_idle_wait() {
        let chain = Chain::new();
        let mut runner = Runner::new(
            chain.edges(),
            RunnerConfig {
                scheduling: Scheduling::MultiThreaded,
                idle_delay: Duration::from_secs(30),
                max_idle_delay: Duration::from_secs(60),
                ..RunnerConfig::default()
            },
        )
        .unwrap();
        runner.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        runner.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
