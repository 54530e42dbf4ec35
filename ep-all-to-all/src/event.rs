//! Communication stream and completion tracking.
//!
//! A [`Stream`] is a worker thread executing jobs in issuance order. Events
//! recorded on a stream complete once every job issued before them ran.

use std::{
    sync::Arc,
    thread::{JoinHandle, ThreadId},
};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use thread_lib::pin_cpu;
use tracing::{debug, warn};

use crate::error::{EpError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Task {
    Run(Job),
    Stop,
}

/// Enqueue side of a [`Stream`]; cheap to clone.
#[derive(Clone)]
pub struct StreamQueue {
    name: Arc<str>,
    task_tx: Sender<Task>,
}

impl StreamQueue {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        self.task_tx.send(Task::Run(Box::new(job))).map_err(|_| EpError::Disconnected)
    }

    /// Record an event completing after every job submitted so far.
    pub fn record(&self) -> Result<EventHandle> {
        let event = EventHandle::new();
        let guard = event.completion_guard();
        self.submit(move || drop(guard))?;
        Ok(event)
    }

    /// Make jobs submitted after this call wait for `event`.
    pub fn wait_event(&self, event: &EventHandle) -> Result<()> {
        let event = event.clone();
        self.submit(move || event.synchronize())
    }
}

/// A worker thread consuming jobs in order.
pub struct Stream {
    queue: StreamQueue,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl Stream {
    pub fn spawn(name: &str, pin_worker_cpu: Option<u16>) -> Result<Self> {
        let (task_tx, task_rx) = crossbeam_channel::unbounded();
        let (init_tx, init_rx) = oneshot::channel();
        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || stream_worker_thread(pin_worker_cpu, init_tx, task_rx))
            .map_err(|e| {
                EpError::Configuration(format!("Failed to spawn stream worker: {}", e))
            })?;
        let init = init_rx.recv().map_err(|_| EpError::Disconnected)?;
        if let Err(e) = init {
            let _ = worker.join();
            return Err(EpError::Configuration(format!(
                "Failed to pin stream worker {} to CPU {:?}: {}",
                name, pin_worker_cpu, e
            )));
        }
        let worker_id = worker.thread().id();
        debug!("Started stream worker {}", name);
        let queue = StreamQueue { name: name.into(), task_tx };
        Ok(Self { queue, worker: Some(worker), worker_id })
    }

    pub fn queue(&self) -> &StreamQueue {
        &self.queue
    }

    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        self.queue.submit(job)
    }

    pub fn record(&self) -> Result<EventHandle> {
        self.queue.record()
    }

    pub fn wait_event(&self, event: &EventHandle) -> Result<()> {
        self.queue.wait_event(event)
    }

    /// Block until every job submitted so far has run.
    pub fn synchronize(&self) -> Result<()> {
        self.record()?.synchronize();
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Jobs submitted before the stop still run.
        let _ = self.queue.task_tx.send(Task::Stop);
        let Some(worker) = self.worker.take() else {
            return;
        };
        if std::thread::current().id() == self.worker_id {
            return;
        }
        if worker.join().is_err() {
            warn!("Stream worker {} panicked", self.queue.name);
        }
        debug!("Stopped stream worker {}", self.queue.name);
    }
}

fn stream_worker_thread(
    pin_worker_cpu: Option<u16>,
    init_tx: oneshot::Sender<std::result::Result<(), String>>,
    task_rx: Receiver<Task>,
) {
    if let Some(cpu) = pin_worker_cpu
        && let Err(errno) = pin_cpu(cpu as usize)
    {
        let _ = init_tx.send(Err(errno.to_string()));
        return;
    }
    if init_tx.send(Ok(())).is_err() {
        return;
    }
    while let Ok(Task::Run(job)) = task_rx.recv() {
        job();
    }
}

#[derive(Default)]
struct EventState {
    completed: Mutex<bool>,
    cv: Condvar,
}

/// A point recorded on a stream.
#[derive(Clone, Default)]
pub struct EventHandle {
    state: Arc<EventState>,
}

impl EventHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// An event that is already complete.
    pub fn completed() -> Self {
        let event = Self::new();
        event.complete();
        event
    }

    pub fn query(&self) -> bool {
        *self.state.completed.lock()
    }

    pub fn synchronize(&self) {
        let mut completed = self.state.completed.lock();
        while !*completed {
            self.state.cv.wait(&mut completed);
        }
    }

    pub(crate) fn complete(&self) {
        *self.state.completed.lock() = true;
        self.state.cv.notify_all();
    }

    /// Completes the event when dropped, also when the job unwinds.
    fn completion_guard(&self) -> EventCompletion {
        EventCompletion(self.clone())
    }
}

impl std::fmt::Debug for EventHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandle").field("completed", &self.query()).finish()
    }
}

struct EventCompletion(EventHandle);

impl Drop for EventCompletion {
    fn drop(&mut self) {
        self.0.complete();
    }
}

/// Optional event returned by asynchronous operations.
#[derive(Clone, Debug, Default)]
pub struct EventOverlap {
    event: Option<EventHandle>,
}

impl EventOverlap {
    pub fn new(event: Option<EventHandle>) -> Self {
        Self { event }
    }

    pub fn event(&self) -> Option<&EventHandle> {
        self.event.as_ref()
    }

    /// Block the calling thread until the event completed.
    pub fn current_stream_wait(&self) {
        if let Some(event) = &self.event {
            event.synchronize();
        }
    }

    /// Make later jobs of `stream` wait for the event.
    pub fn stream_wait(&self, stream: &Stream) -> Result<()> {
        match &self.event {
            Some(event) => stream.wait_event(event),
            None => Ok(()),
        }
    }
}

type DeferredJob<T> = Box<dyn FnOnce() -> Result<T> + Send + 'static>;

enum PendingState<T> {
    Issued(oneshot::Receiver<Result<T>>),
    Deferred {
        queue: StreamQueue,
        send_rx: oneshot::Receiver<Result<()>>,
        recv_job: Option<DeferredJob<T>>,
    },
    Taken,
}

/// Result of an operation issued on a communication stream.
///
/// A deferred transfer only issued its send phase; the receive phase is
/// submitted by [`PendingTransfer::await_completion`], or on drop.
pub struct PendingTransfer<T: Send + 'static> {
    event: EventOverlap,
    state: PendingState<T>,
}

impl<T: Send + 'static> PendingTransfer<T> {
    pub(crate) fn issued(
        event: EventHandle,
        result_rx: oneshot::Receiver<Result<T>>,
    ) -> Self {
        let state = PendingState::Issued(result_rx);
        Self { event: EventOverlap::new(Some(event)), state }
    }

    pub(crate) fn deferred(
        event: EventHandle,
        queue: StreamQueue,
        send_rx: oneshot::Receiver<Result<()>>,
        recv_job: impl FnOnce() -> Result<T> + Send + 'static,
    ) -> Self {
        let recv_job: DeferredJob<T> = Box::new(recv_job);
        let state = PendingState::Deferred { queue, send_rx, recv_job: Some(recv_job) };
        Self { event: EventOverlap::new(Some(event)), state }
    }

    /// Event of the issued phase.
    pub fn event(&self) -> &EventOverlap {
        &self.event
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self.state, PendingState::Deferred { .. })
    }

    /// Whether the issued phase ran; always `false` while a receive phase
    /// is still deferred.
    pub fn is_complete(&self) -> bool {
        !self.is_deferred() && self.event.event().is_none_or(EventHandle::query)
    }

    /// Wait for the result, first issuing the receive phase if deferred.
    pub fn await_completion(mut self) -> Result<T> {
        match std::mem::replace(&mut self.state, PendingState::Taken) {
            PendingState::Issued(result_rx) => {
                result_rx.recv().map_err(|_| EpError::Disconnected)?
            }
            PendingState::Deferred { queue, send_rx, mut recv_job } => {
                send_rx.recv().map_err(|_| EpError::Disconnected)??;
                let Some(recv_job) = recv_job.take() else {
                    return Err(EpError::Disconnected);
                };
                let (result_tx, result_rx) = oneshot::channel();
                queue.submit(move || {
                    let _ = result_tx.send(recv_job());
                })?;
                result_rx.recv().map_err(|_| EpError::Disconnected)?
            }
            PendingState::Taken => Err(EpError::Disconnected),
        }
    }
}

impl<T: Send + 'static> Drop for PendingTransfer<T> {
    fn drop(&mut self) {
        // An abandoned receive phase still runs so the peers' signals are
        // consumed, unless its send phase failed.
        let PendingState::Deferred { queue, send_rx, recv_job: Some(recv_job) } =
            std::mem::replace(&mut self.state, PendingState::Taken)
        else {
            return;
        };
        let name = queue.name().to_string();
        let submitted = queue.submit(move || {
            if !matches!(send_rx.recv(), Ok(Ok(()))) {
                return;
            }
            if let Err(e) = recv_job() {
                warn!("Dropped receive phase on {} failed: {}", name, e);
            }
        });
        if submitted.is_err() {
            warn!("Dropping receive phase: stream {} is gone", queue.name());
        }
    }
}
