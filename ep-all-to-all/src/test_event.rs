use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    error::{EpError, Result},
    event::{EventHandle, EventOverlap, PendingTransfer, Stream},
};

#[test]
fn test_jobs_run_in_order() {
    let stream = Stream::spawn("test_order", None).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for i in 0..16 {
        let seen = seen.clone();
        stream.submit(move || seen.lock().push(i)).unwrap();
    }
    stream.synchronize().unwrap();
    assert_eq!(*seen.lock(), (0..16).collect::<Vec<_>>());
}

#[test]
fn test_event_completes_after_earlier_jobs() {
    let gate_stream = Stream::spawn("test_gate", None).unwrap();
    let (open_tx, open_rx) = oneshot::channel::<()>();
    gate_stream
        .submit(move || {
            let _ = open_rx.recv();
        })
        .unwrap();
    let gate = gate_stream.record().unwrap();

    let stream = Stream::spawn("test_event", None).unwrap();
    stream.wait_event(&gate).unwrap();
    let event = stream.record().unwrap();
    let overlap = EventOverlap::new(Some(event.clone()));
    let other = Stream::spawn("test_event_other", None).unwrap();
    overlap.stream_wait(&other).unwrap();
    let after = other.record().unwrap();

    std::thread::sleep(Duration::from_millis(20));
    assert!(!gate.query());
    assert!(!event.query());
    assert!(!after.query());

    open_tx.send(()).unwrap();
    after.synchronize();
    assert!(gate.query());
    assert!(event.query());
}

#[test]
fn test_completed_event() {
    let done = EventHandle::completed();
    assert!(done.query());
    let stream = Stream::spawn("test_event_done", None).unwrap();
    stream.wait_event(&done).unwrap();
    stream.synchronize().unwrap();
}

#[test]
fn test_current_stream_wait() {
    let stream = Stream::spawn("test_wait", None).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let job_counter = counter.clone();
    stream
        .submit(move || {
            std::thread::sleep(Duration::from_millis(10));
            job_counter.store(1, Ordering::SeqCst);
        })
        .unwrap();
    let overlap = EventOverlap::new(Some(stream.record().unwrap()));
    overlap.current_stream_wait();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    EventOverlap::default().current_stream_wait();
}

fn issued(stream: &Stream, value: Result<u32>) -> PendingTransfer<u32> {
    let (tx, rx) = oneshot::channel();
    stream
        .submit(move || {
            let _ = tx.send(value);
        })
        .unwrap();
    PendingTransfer::issued(stream.record().unwrap(), rx)
}

#[test]
fn test_issued_transfer() {
    let stream = Stream::spawn("test_issued", None).unwrap();
    let pending = issued(&stream, Ok(7));
    assert!(!pending.is_deferred());
    pending.event().current_stream_wait();
    assert!(pending.is_complete());
    assert_eq!(pending.await_completion().unwrap(), 7);

    let failed = issued(&stream, Err(EpError::Capacity("full".to_string())));
    assert!(matches!(failed.await_completion(), Err(EpError::Capacity(_))));
}

fn deferred(
    stream: &Stream,
    send: Result<()>,
    ran: Arc<AtomicUsize>,
) -> PendingTransfer<usize> {
    let (send_tx, send_rx) = oneshot::channel();
    stream
        .submit(move || {
            let _ = send_tx.send(send);
        })
        .unwrap();
    let event = stream.record().unwrap();
    PendingTransfer::deferred(event, stream.queue().clone(), send_rx, move || {
        Ok(ran.fetch_add(1, Ordering::SeqCst) + 1)
    })
}

#[test]
fn test_deferred_runs_on_await() {
    let stream = Stream::spawn("test_deferred", None).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let pending = deferred(&stream, Ok(()), ran.clone());
    assert!(pending.is_deferred());
    stream.synchronize().unwrap();
    assert!(!pending.is_complete());
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(pending.await_completion().unwrap(), 1);
}

#[test]
fn test_deferred_runs_on_drop() {
    let stream = Stream::spawn("test_deferred_drop", None).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    drop(deferred(&stream, Ok(()), ran.clone()));
    stream.synchronize().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_deferred_skips_receive_after_failed_send() {
    let stream = Stream::spawn("test_deferred_fail", None).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let failed = Err(EpError::Usage("bad".to_string()));
    let pending = deferred(&stream, failed.clone(), ran.clone());
    assert!(matches!(pending.await_completion(), Err(EpError::Usage(_))));

    drop(deferred(&stream, failed, ran.clone()));
    stream.synchronize().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn test_stopped_stream_disconnects() {
    let stream = Stream::spawn("test_stop", None).unwrap();
    let queue = stream.queue().clone();
    drop(stream);
    assert!(matches!(queue.submit(|| ()), Err(EpError::Disconnected)));
}
