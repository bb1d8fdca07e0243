//! Teardown registry and the one-shot exit gate

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::{
    error::{BoxError, ExitError, Result},
    signals::ShutdownSignals,
};

/// Default time allowed for teardown
pub const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Ends the process with an exit code
pub type Terminator = Arc<dyn Fn(i32) + Send + Sync>;

type Teardown = Box<dyn FnOnce() -> BoxFuture<'static, std::result::Result<(), BoxError>> + Send>;

/// Options for [`ExitCoordinator::install`]
#[derive(Clone)]
pub struct ExitOptions {
    /// Deadline shared by all teardown callbacks
    pub timeout: Duration,
    /// Called once with the final exit code
    pub terminator: Terminator,
    /// Exit with code 0 on SIGINT/SIGTERM/SIGQUIT
    pub handle_signals: bool,
}

impl Default for ExitOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_EXIT_TIMEOUT,
            terminator: Arc::new(|code| {
                std::process::exit(code);
            }),
            handle_signals: true,
        }
    }
}

impl ExitOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn terminator<F>(mut self, terminator: F) -> Self
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        self.terminator = Arc::new(terminator);
        self
    }

    pub fn handle_signals(mut self, handle: bool) -> Self {
        self.handle_signals = handle;
        self
    }
}

impl std::fmt::Debug for ExitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitOptions")
            .field("timeout", &self.timeout)
            .field("handle_signals", &self.handle_signals)
            .finish()
    }
}

/// Summary of one teardown run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitReport {
    /// Code handed to the terminator
    pub code: i32,
    pub completed: usize,
    pub failed: usize,
    /// Callbacks still running at the deadline
    pub timed_out: usize,
}

/// Entry point for installing exit handling
pub struct ExitCoordinator;

impl ExitCoordinator {
    /// Create the exit context and, if enabled, listen for termination signals
    ///
    /// Must be called from within a tokio runtime.
    pub fn install(options: ExitOptions) -> Result<ExitContext> {
        if options.timeout.is_zero() {
            return Err(ExitError::InvalidTimeout);
        }

        let (report, _) = watch::channel(None);
        let context = ExitContext {
            inner: Arc::new(ExitInner {
                callbacks: Mutex::new(Vec::new()),
                exiting: AtomicBool::new(false),
                timeout: options.timeout,
                terminator: options.terminator,
                report,
            }),
        };

        if options.handle_signals {
            let mut signals = ShutdownSignals::register()?;
            let on_signal = context.clone();
            tokio::spawn(async move {
                let name = signals.recv().await;
                info!(signal = name, "Received shutdown signal");
                on_signal.exit(0).await;
            });
            debug!("Shutdown signal handlers installed");
        }

        Ok(context)
    }
}

/// Handle to the process-wide teardown registry
#[derive(Clone)]
pub struct ExitContext {
    inner: Arc<ExitInner>,
}

struct ExitInner {
    callbacks: Mutex<Vec<Teardown>>,
    exiting: AtomicBool,
    timeout: Duration,
    terminator: Terminator,
    report: watch::Sender<Option<ExitReport>>,
}

impl ExitContext {
    /// Register a teardown callback
    ///
    /// Returns false, and drops the callback, once exit has begun.
    pub fn on_before_exit<F, Fut>(&self, callback: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        if self.is_exiting() {
            warn!("Exit already in progress; teardown callback not registered");
            return false;
        }
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Box::new(move || callback().boxed()));
        true
    }

    pub fn is_exiting(&self) -> bool {
        self.inner.exiting.load(Ordering::SeqCst)
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Run teardown once and terminate
    ///
    /// Only the first call runs the callbacks and invokes the terminator;
    /// later calls wait for that run and return its report.
    pub async fn exit(&self, code: i32) -> ExitReport {
        if self.inner.exiting.swap(true, Ordering::SeqCst) {
            debug!(code, "Exit already in progress");
            let mut report = self.inner.report.subscribe();
            return match report.wait_for(Option::is_some).await {
                Ok(report) => (*report).unwrap_or_default(),
                Err(_) => ExitReport::default(),
            };
        }

        let callbacks = std::mem::take(
            &mut *self
                .inner
                .callbacks
                .lock()
                .unwrap_or_else(|p| p.into_inner()),
        );
        debug!(
            callbacks = callbacks.len(),
            timeout_ms = self.inner.timeout.as_millis() as u64,
            "Running teardown"
        );

        let mut report = run_teardown(callbacks, self.inner.timeout).await;
        report.code = if report.failed > 0 { code.max(1) } else { code };

        if report.timed_out > 0 {
            warn!(
                pending = report.timed_out,
                timeout_ms = self.inner.timeout.as_millis() as u64,
                "Teardown timed out; exiting anyway"
            );
        }
        info!(code = report.code, "Exiting");

        self.inner.report.send_replace(Some(report));
        (self.inner.terminator)(report.code);
        report
    }
}

impl std::fmt::Debug for ExitContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self
            .inner
            .callbacks
            .lock()
            .map(|c| c.len())
            .unwrap_or_default();
        f.debug_struct("ExitContext")
            .field("timeout", &self.inner.timeout)
            .field("exiting", &self.is_exiting())
            .field("pending", &pending)
            .finish()
    }
}

async fn run_teardown(callbacks: Vec<Teardown>, timeout: Duration) -> ExitReport {
    let mut report = ExitReport::default();
    let mut tasks = JoinSet::new();
    for callback in callbacks {
        tasks.spawn(callback());
    }

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                report.timed_out = tasks.len();
                tasks.abort_all();
                break;
            }
            joined = tasks.join_next() => match joined {
                None => break,
                Some(Ok(Ok(()))) => report.completed += 1,
                Some(Ok(Err(e))) => {
                    report.failed += 1;
                    error!(error = %e, "Teardown callback failed");
                }
                Some(Err(e)) => {
                    report.failed += 1;
                    error!(error = %e, "Teardown callback panicked");
                }
            },
        }
    }
    report
}
