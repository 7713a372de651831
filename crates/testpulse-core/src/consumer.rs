//! The queue between producers and the single consumer task.
//!
//! Producers hand [`testpulse_types::TelemetryEvent`]s to a cloneable
//! [`TelemetryChannel`]; a spawned task drains the bounded queue in
//! arrival order and feeds the [`EventProcessor`]. One failed event never
//! stops the loop: recoverable errors are logged (with a cap, so a
//! flapping store cannot flood the log) and the most recent failure of a
//! critical event is kept for synchronous callers to pick up.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, warn, Level};

use testpulse_observability::{emit_event, ObservabilityEvent, ProcessKind};
use testpulse_store::PersistenceGateway;
use testpulse_types::{EventKind, EventRequest, TelemetryEvent};

use crate::config::DbLogConfig;
use crate::error::{ProcessingError, ProcessingResult};
use crate::processor::{EventProcessor, LifecycleListener};
use crate::registry::CheckpointRegistry;

/// Events whose failure must reach the caller instead of being absorbed
/// by the loop: without them the rest of the session is meaningless.
const CRITICAL_EVENTS: [EventKind; 5] = [
    EventKind::StartRun,
    EventKind::StartSuite,
    EventKind::StartTestcase,
    EventKind::JoinTestcase,
    EventKind::StartCheckpoint,
];

/// High-volume events whose individual failures are not worth a log line.
const QUIET_EVENTS: [EventKind; 2] = [
    EventKind::RegisterThreadWithLoadQueue,
    EventKind::InsertMessage,
];

const MAX_MINOR_ERRORS_LOGGED: u32 = 5;

enum QueueItem {
    Event(EventRequest),
    Shutdown,
}

type CriticalSlot = Arc<Mutex<Option<ProcessingError>>>;

/// Producer-side handle to the telemetry queue.
#[derive(Clone)]
pub struct TelemetryChannel {
    tx: mpsc::Sender<QueueItem>,
    registry: Arc<CheckpointRegistry>,
    delete_request: Arc<AtomicI64>,
    critical: CriticalSlot,
}

impl TelemetryChannel {
    /// Spawn the consumer task and return the producer handle plus the
    /// task's join handle.
    pub fn spawn(
        config: DbLogConfig,
        gateway: Arc<dyn PersistenceGateway>,
        listener: Option<Arc<dyn LifecycleListener>>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let registry = Arc::new(CheckpointRegistry::new());
        let delete_request = Arc::new(AtomicI64::new(0));
        let critical: CriticalSlot = Arc::new(Mutex::new(None));

        let batch_mode = config.batch_mode;
        let poll_interval = config.poll_interval();
        let processor = EventProcessor::new(
            config,
            gateway,
            Arc::clone(&registry),
            listener,
            Arc::clone(&delete_request),
        );
        let consumer = QueueConsumerLoop {
            rx,
            processor,
            batch_mode,
            poll_interval,
            critical: Arc::clone(&critical),
            minor_errors_logged: 0,
            connect_failure_logged: false,
            shutdown_when_drained: false,
        };
        let handle = tokio::spawn(consumer.run());

        (
            Self {
                tx,
                registry,
                delete_request,
                critical,
            },
            handle,
        )
    }

    /// Queue one event. Applies backpressure when the queue is full and
    /// fails only once the consumer is gone.
    pub async fn log(
        &self,
        event: TelemetryEvent,
        thread_name: impl Into<String>,
    ) -> ProcessingResult<()> {
        self.tx
            .send(QueueItem::Event(EventRequest::new(event, thread_name)))
            .await
            .map_err(|_| ProcessingError::QueueClosed)
    }

    /// Queue an already-stamped request (relay paths that carry the
    /// original producer's timestamp).
    pub async fn log_request(&self, request: EventRequest) -> ProcessingResult<()> {
        self.tx
            .send(QueueItem::Event(request))
            .await
            .map_err(|_| ProcessingError::QueueClosed)
    }

    /// Ask the consumer to delete a testcase before its next event.
    pub fn request_testcase_deletion(&self, testcase_id: i64) {
        self.delete_request.store(testcase_id, Ordering::Release);
    }

    /// Return and clear the most recent critical-event failure.
    pub fn take_critical_error(&self) -> Option<ProcessingError> {
        self.critical
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn registry(&self) -> Arc<CheckpointRegistry> {
        Arc::clone(&self.registry)
    }

    /// Signal the consumer to stop once the queue has drained.
    pub async fn shutdown(&self) -> ProcessingResult<()> {
        self.tx
            .send(QueueItem::Shutdown)
            .await
            .map_err(|_| ProcessingError::QueueClosed)
    }
}

struct QueueConsumerLoop {
    rx: mpsc::Receiver<QueueItem>,
    processor: EventProcessor,
    batch_mode: bool,
    poll_interval: Duration,
    critical: CriticalSlot,
    minor_errors_logged: u32,
    connect_failure_logged: bool,
    shutdown_when_drained: bool,
}

impl QueueConsumerLoop {
    async fn final_flush(&mut self) {
        if let Err(e) = self.processor.flush_caches().await {
            warn!(error = %e, "final cache flush failed");
        }
    }

    async fn run(mut self) {
        debug!(batch_mode = self.batch_mode, "telemetry consumer started");
        loop {
            let item = if self.batch_mode {
                match timeout(self.poll_interval, self.rx.recv()).await {
                    // Idle long enough; push whatever the caches hold.
                    Err(_) => {
                        if let Err(e) = self.processor.process(None).await {
                            self.report_error(None, "", e);
                        }
                        continue;
                    }
                    Ok(Some(item)) => item,
                    Ok(None) => break,
                }
            } else {
                match self.rx.recv().await {
                    Some(item) => item,
                    None => break,
                }
            };

            match item {
                QueueItem::Shutdown => {
                    if self.rx.is_empty() {
                        self.final_flush().await;
                        break;
                    }
                    // Events arrived behind the stop signal; drain them
                    // first, then stop.
                    self.shutdown_when_drained = true;
                }
                QueueItem::Event(request) => {
                    let kind = request.event.kind();
                    let thread = request.thread_name.clone();
                    if let Err(e) = self.processor.process(Some(request)).await {
                        self.report_error(Some(kind), &thread, e);
                    }
                    if self.shutdown_when_drained && self.rx.is_empty() {
                        self.final_flush().await;
                        break;
                    }
                }
            }
        }
        emit_event(
            Level::INFO,
            ProcessKind::Executor,
            ObservabilityEvent {
                event: "consumer.stop",
                component: "consumer",
                run_id: None,
                suite_id: None,
                testcase_id: None,
                queue: None,
                thread: None,
                status: Some("stopped"),
                error_code: None,
                detail: None,
            },
        );
    }

    fn report_error(&mut self, kind: Option<EventKind>, thread: &str, err: ProcessingError) {
        if let Some(kind) = kind {
            if CRITICAL_EVENTS.contains(&kind) {
                error!(event = %kind, thread, error = %err, "critical telemetry event failed");
                emit_event(
                    Level::ERROR,
                    ProcessKind::Executor,
                    ObservabilityEvent {
                        event: "event.failed",
                        component: "consumer",
                        run_id: None,
                        suite_id: None,
                        testcase_id: None,
                        queue: None,
                        thread: Some(thread),
                        status: Some("critical"),
                        error_code: None,
                        detail: Some(&err.to_string()),
                    },
                );
                *self
                    .critical
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(err);
                return;
            }
        }

        if err.is_connection() {
            // A down store fails every event the same way; one line is
            // plenty.
            if !self.connect_failure_logged {
                error!(error = %err, "store unreachable; telemetry events are being dropped");
                self.connect_failure_logged = true;
            }
            return;
        }
        self.connect_failure_logged = false;

        if kind.map(|k| QUIET_EVENTS.contains(&k)).unwrap_or(false) {
            return;
        }

        if self.minor_errors_logged < MAX_MINOR_ERRORS_LOGGED {
            self.minor_errors_logged += 1;
            match kind {
                Some(kind) => warn!(event = %kind, thread, error = %err, "telemetry event failed"),
                None => warn!(error = %err, "idle cache flush failed"),
            }
            if self.minor_errors_logged == MAX_MINOR_ERRORS_LOGGED {
                warn!("further recoverable telemetry errors will not be logged");
            }
        }
    }
}
