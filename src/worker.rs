//! Background worker thread bound to a consumer lifecycle
//!
//! A `WorkerLifecycleController` owns at most one dedicated OS thread with its
//! own message queue. The thread is created lazily on bind and torn down in
//! stages on destroy:
//!
//! ```text
//! purge queue ──▶ Quit (join ≤ quit)
//!             ──▶ ForceQuit (join ≤ force)
//!             ──▶ interrupt (join ≤ final)
//! ```
//!
//! Whatever the outcome, the controller forgets the thread afterwards so a
//! later bind starts from a clean slate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::settings::VisualizerSettings;

/// How often an idle worker re-checks its force-quit flag
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Poll interval while waiting on a join deadline
const JOIN_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker '{0}' has been shut down")]
    ShutDown(String),
    #[error("Failed to spawn worker thread '{name}': {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },
}

/// Lifecycle events of the component that owns the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Create,
    Destroy,
}

/// How a staged shutdown ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// No thread was running
    NotRunning,
    /// Thread exited after the graceful quit request
    Graceful,
    /// Thread exited after the forced quit request
    Forced,
    /// Thread exited after being interrupted
    Interrupted,
    /// Thread was still alive after every stage and has been detached
    Detached,
}

/// Join timeouts for each shutdown stage
#[derive(Debug, Clone, Copy)]
pub struct ShutdownTimeouts {
    pub quit: Duration,
    pub force_quit: Duration,
    pub interrupt: Duration,
}

impl ShutdownTimeouts {
    pub fn from_settings(settings: &VisualizerSettings) -> Self {
        Self {
            quit: Duration::from_millis(settings.quit_timeout_ms),
            force_quit: Duration::from_millis(settings.force_quit_timeout_ms),
            interrupt: Duration::from_millis(settings.interrupt_timeout_ms),
        }
    }
}

impl Default for ShutdownTimeouts {
    fn default() -> Self {
        Self::from_settings(&VisualizerSettings::default())
    }
}

type Job = Box<dyn FnOnce(&WorkerContext) + Send + 'static>;

enum Message {
    Run(Job),
    Quit,
    ForceQuit,
}

/// Passed to every job running on the worker thread
pub struct WorkerContext {
    interrupt: CancellationToken,
}

impl WorkerContext {
    /// Cancelled when the controller gives up on a graceful shutdown.
    /// Long-running jobs should watch it.
    pub fn interrupt_token(&self) -> &CancellationToken {
        &self.interrupt
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }
}

/// Cloneable handle for posting work to a live worker thread
#[derive(Clone)]
pub struct WorkerHandle {
    name: Arc<str>,
    tx: Sender<Message>,
    accepting: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a job on the worker thread.
    ///
    /// Fails once the owning controller has started tearing the worker down.
    pub fn post<F>(&self, job: F) -> Result<(), WorkerError>
    where
        F: FnOnce(&WorkerContext) + Send + 'static,
    {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(WorkerError::ShutDown(self.name.to_string()));
        }
        self.tx
            .send(Message::Run(Box::new(job)))
            .map_err(|_| WorkerError::ShutDown(self.name.to_string()))
    }

    /// Whether the worker still accepts jobs
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

/// A running worker as seen by its controller
struct Worker {
    handle: WorkerHandle,
    /// Kept so teardown can purge the queue
    rx: Receiver<Message>,
    thread: JoinHandle<()>,
    force_quit: Arc<AtomicBool>,
    interrupt: CancellationToken,
}

impl Worker {
    fn spawn(name: &str) -> Result<Self, WorkerError> {
        let (tx, rx) = flume::unbounded::<Message>();
        let accepting = Arc::new(AtomicBool::new(true));
        let force_quit = Arc::new(AtomicBool::new(false));
        let interrupt = CancellationToken::new();

        let thread = {
            let rx = rx.clone();
            let gates = Gates {
                accepting: accepting.clone(),
                force_quit: force_quit.clone(),
            };
            let context = WorkerContext {
                interrupt: interrupt.clone(),
            };
            let thread_name = name.to_string();
            thread::Builder::new()
                .name(name.to_string())
                .spawn(move || run_loop(&thread_name, rx, gates, context))
                .map_err(|source| WorkerError::Spawn {
                    name: name.to_string(),
                    source,
                })?
        };

        log::info!("Worker '{}' started", name);

        Ok(Self {
            handle: WorkerHandle {
                name: Arc::from(name),
                tx,
                accepting,
            },
            rx,
            thread,
            force_quit,
            interrupt,
        })
    }

    fn is_alive(&self) -> bool {
        !self.thread.is_finished()
    }
}

/// Flags shared between a worker thread and its controller
struct Gates {
    accepting: Arc<AtomicBool>,
    force_quit: Arc<AtomicBool>,
}

fn run_loop(name: &str, rx: Receiver<Message>, gates: Gates, context: WorkerContext) {
    loop {
        if gates.force_quit.load(Ordering::SeqCst) {
            log::debug!("Worker '{}': force quit flag set", name);
            break;
        }

        match rx.recv_timeout(IDLE_POLL) {
            // A post that raced the teardown purge still lands here
            Ok(Message::Run(_)) if !gates.accepting.load(Ordering::SeqCst) => {
                log::debug!("Worker '{}': skipping job posted during shutdown", name);
            }
            Ok(Message::Run(job)) => job(&context),
            Ok(Message::Quit) => {
                log::debug!("Worker '{}': quit requested", name);
                break;
            }
            Ok(Message::ForceQuit) => {
                log::debug!("Worker '{}': forced quit requested", name);
                break;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                log::debug!("Worker '{}': queue disconnected", name);
                break;
            }
        }
    }

    log::info!("Worker '{}' exited", name);
}

/// Wait for a thread to finish, giving up at the deadline.
fn join_within(thread: &JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !thread.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(JOIN_POLL);
    }
    true
}

/// Owns the single background worker for one consumer
pub struct WorkerLifecycleController {
    name: String,
    timeouts: ShutdownTimeouts,
    /// Creation and teardown both go through this lock
    slot: Mutex<Option<Worker>>,
}

impl WorkerLifecycleController {
    pub fn new(name: impl Into<String>, timeouts: ShutdownTimeouts) -> Self {
        Self {
            name: name.into(),
            timeouts,
            slot: Mutex::new(None),
        }
    }

    pub fn from_settings(settings: &VisualizerSettings) -> Self {
        Self::new(
            settings.worker_name.clone(),
            ShutdownTimeouts::from_settings(settings),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return a handle to the live worker, creating the thread if needed.
    pub fn bind(&self) -> Result<WorkerHandle, WorkerError> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(worker) = slot.as_ref() {
            if worker.is_alive() {
                return Ok(worker.handle.clone());
            }
            log::warn!("Worker '{}' exited on its own, recreating", self.name);
        }

        if let Some(dead) = slot.take() {
            dead.handle.accepting.store(false, Ordering::SeqCst);
            if dead.thread.join().is_err() {
                log::error!("Worker '{}' had panicked", self.name);
            }
        }

        let worker = Worker::spawn(&self.name)?;
        let handle = worker.handle.clone();
        *slot = Some(worker);
        Ok(handle)
    }

    /// Route a consumer lifecycle event: create binds, destroy tears down.
    pub fn on_lifecycle_event(
        &self,
        event: LifecycleEvent,
    ) -> Result<Option<WorkerHandle>, WorkerError> {
        match event {
            LifecycleEvent::Create => self.bind().map(Some),
            LifecycleEvent::Destroy => {
                self.shutdown();
                Ok(None)
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().is_some_and(Worker::is_alive)
    }

    /// Staged teardown of the worker thread.
    pub fn shutdown(&self) -> ShutdownOutcome {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        let Some(worker) = slot.take() else {
            return ShutdownOutcome::NotRunning;
        };

        let name = &self.name;
        worker.handle.accepting.store(false, Ordering::SeqCst);

        let dropped = worker
            .rx
            .drain()
            .filter(|m| matches!(m, Message::Run(_)))
            .count();
        if dropped > 0 {
            log::info!("Worker '{}': dropped {} pending job(s)", name, dropped);
        }

        log::debug!("Worker '{}': requesting quit", name);
        let _ = worker.handle.tx.send(Message::Quit);
        let outcome = if join_within(&worker.thread, self.timeouts.quit) {
            ShutdownOutcome::Graceful
        } else {
            log::warn!(
                "Worker '{}' still alive after {:?}, forcing quit",
                name,
                self.timeouts.quit
            );
            worker.force_quit.store(true, Ordering::SeqCst);
            let _ = worker.handle.tx.send(Message::ForceQuit);

            if join_within(&worker.thread, self.timeouts.force_quit) {
                ShutdownOutcome::Forced
            } else {
                log::warn!(
                    "Worker '{}' still alive after {:?}, interrupting",
                    name,
                    self.timeouts.force_quit
                );
                worker.interrupt.cancel();
                worker.thread.thread().unpark();

                if join_within(&worker.thread, self.timeouts.interrupt) {
                    ShutdownOutcome::Interrupted
                } else {
                    ShutdownOutcome::Detached
                }
            }
        };

        if outcome == ShutdownOutcome::Detached {
            log::error!(
                "Worker '{}' did not stop after interrupt, detaching thread",
                name
            );
        } else if worker.thread.join().is_err() {
            log::error!("Worker '{}' panicked during shutdown", name);
        } else {
            log::info!("Worker '{}' shut down ({:?})", name, outcome);
        }

        outcome
    }
}

impl Drop for WorkerLifecycleController {
    fn drop(&mut self) {
        self.shutdown();
    }
}
