use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::coordinator::{DatasetRequest, PipelineCoordinator, TickOutcome};
use super::watcher::TickTrigger;

/// How often an idle worker checks for shutdown
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Running counters of the tick worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub batches: u64,
    pub ticks: u64,
    pub frames: u64,
    pub discarded: u64,
    pub failures: u64,
    pub last_error: Option<String>,
}

impl WorkerStatus {
    fn record_failure(&mut self, error: String) {
        self.failures += 1;
        self.last_error = Some(error);
    }
}

/// Triggers drained from the channel in one go.
///
/// Any number of plain ticks collapse into one. Reopen requests are kept in arrival order
/// and every batch ends with a single tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerBatch {
    pub reopens: Vec<DatasetRequest>,
    pub coalesced: usize,
}

impl TriggerBatch {
    pub fn collect(first: TickTrigger, rx: &Receiver<TickTrigger>) -> Self {
        let mut batch = Self::default();
        batch.push(first);
        while let Ok(trigger) = rx.try_recv() {
            batch.push(trigger);
        }
        batch
    }

    fn push(&mut self, trigger: TickTrigger) {
        self.coalesced += 1;
        if let TickTrigger::Reopen(request) = trigger {
            self.reopens.push(request);
        }
    }
}

/// Apply one batch to the coordinator: open any requested datasets, then tick once
pub fn run_batch(coordinator: &PipelineCoordinator, batch: TriggerBatch, status: &mut WorkerStatus) {
    status.batches += 1;
    if batch.coalesced > 1 {
        log::debug!("Coalesced {} triggers into one tick", batch.coalesced);
    }

    for request in batch.reopens {
        match coordinator.open_session(request.clone()) {
            Ok(opened) => log::info!("Switched to dataset with shape {:?}", opened.shape),
            Err(e) => {
                log::error!("Could not switch to {request:?}: {e}");
                status.record_failure(e.to_string());
            }
        }
    }

    status.ticks += 1;
    match coordinator.tick() {
        Ok(TickOutcome::Processed { fractions, .. }) => status.frames += fractions.len() as u64,
        Ok(TickOutcome::Discarded { .. }) => status.discarded += 1,
        Ok(TickOutcome::Idle) | Ok(TickOutcome::Busy) => (),
        Err(e) => {
            log::error!("Tick failed: {e}");
            status.record_failure(e.to_string());
        }
    }
}

/// Handle to the tick worker thread
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Arc<AtomicBool>,
    status: Arc<Mutex<WorkerStatus>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Start the tick worker. It runs until `shutdown` is called or every sender is dropped.
    pub fn spawn(
        coordinator: Arc<PipelineCoordinator>,
        rx: Receiver<TickTrigger>,
    ) -> Result<Self, std::io::Error> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let status = Arc::new(Mutex::new(WorkerStatus::default()));
        let thread = {
            let shutdown = shutdown.clone();
            let status = status.clone();
            std::thread::Builder::new()
                .name(String::from("tick-worker"))
                .spawn(move || worker_loop(&coordinator, &rx, &shutdown, &status))?
        };
        Ok(Self {
            shutdown,
            status,
            thread: Some(thread),
        })
    }

    pub fn status(&self) -> WorkerStatus {
        match self.status.lock() {
            Ok(status) => status.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the worker after its current batch and wait for it
    pub fn shutdown(mut self) -> WorkerStatus {
        self.stop();
        self.status()
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Tick worker panicked");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    coordinator: &PipelineCoordinator,
    rx: &Receiver<TickTrigger>,
    shutdown: &AtomicBool,
    status: &Mutex<WorkerStatus>,
) {
    log::info!("Tick worker started");
    while !shutdown.load(Ordering::Acquire) {
        let first = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(trigger) => trigger,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let batch = TriggerBatch::collect(first, rx);
        let mut local = match status.lock() {
            Ok(status) => status.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        run_batch(coordinator, batch, &mut local);
        match status.lock() {
            Ok(mut status) => *status = local,
            Err(poisoned) => *poisoned.into_inner() = local,
        }
    }
    log::info!("Tick worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::DatasetDefaults;
    use crate::hub::{Payload, SubscriberHub};
    use crate::source::{MemoryDataset, MemoryOpener};
    use crate::watcher::WatchTarget;
    use std::path::{Path, PathBuf};
    use std::sync::mpsc;
    use tokio::sync::mpsc as async_mpsc;

    fn coordinator() -> (MemoryDataset, MemoryOpener, Arc<PipelineCoordinator>) {
        let dataset = MemoryDataset::new(&[6, 4]);
        let opener = MemoryOpener::new();
        opener
            .insert(Path::new("/data/0.hdf"), "entry/data", dataset.clone())
            .unwrap();
        let coordinator = PipelineCoordinator::new(
            Arc::new(opener.clone()),
            DatasetDefaults {
                filepath: PathBuf::from("/data"),
                filename: String::from("0.hdf"),
                dataset_name: String::from("entry/data"),
            },
            Arc::new(SubscriberHub::new()),
            WatchTarget::new(),
        );
        (dataset, opener, Arc::new(coordinator))
    }

    fn reopen(filename: &str) -> TickTrigger {
        TickTrigger::Reopen(DatasetRequest {
            filename: Some(String::from(filename)),
            ..Default::default()
        })
    }

    #[test]
    fn ticks_collapse_and_reopens_keep_order() {
        let (tx, rx) = mpsc::channel();
        for trigger in [TickTrigger::Tick, reopen("a.hdf"), TickTrigger::Tick, reopen("b.hdf")] {
            tx.send(trigger).unwrap();
        }
        let first = rx.recv().unwrap();
        let batch = TriggerBatch::collect(first, &rx);
        assert_eq!(batch.coalesced, 4);
        let names: Vec<_> = batch
            .reopens
            .iter()
            .map(|r| r.filename.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["a.hdf", "b.hdf"]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn batch_opens_then_ticks() {
        let (dataset, _opener, coordinator) = coordinator();
        dataset.append_filled(1).unwrap();
        dataset.append_filled(2).unwrap();

        let mut status = WorkerStatus::default();
        let batch = TriggerBatch {
            reopens: vec![DatasetRequest::default()],
            coalesced: 3,
        };
        run_batch(&coordinator, batch, &mut status);
        assert_eq!(status.ticks, 1);
        assert_eq!(status.frames, 2);
        assert_eq!(status.failures, 0);

        let bad = TriggerBatch {
            reopens: vec![DatasetRequest {
                filename: Some(String::from("missing.hdf")),
                ..Default::default()
            }],
            coalesced: 1,
        };
        run_batch(&coordinator, bad, &mut status);
        assert_eq!(status.failures, 1);
        assert!(status.last_error.is_some());
        // the failed switch leaves the old session in place
        assert_eq!(coordinator.state().filename, "0.hdf");
    }

    #[test]
    fn worker_thread_processes_triggers_until_shutdown() {
        let (dataset, _opener, coordinator) = coordinator();
        let (sub_tx, mut sub_rx) = async_mpsc::channel::<Payload>(64);
        coordinator.hub().add(Arc::new(sub_tx));
        coordinator.open_session(DatasetRequest::default()).unwrap();

        let (tx, rx) = mpsc::channel();
        let worker = WorkerHandle::spawn(coordinator.clone(), rx).unwrap();
        assert!(worker.is_running());

        dataset.append_filled(3).unwrap();
        tx.send(TickTrigger::Tick).unwrap();
        let fraction = sub_rx.blocking_recv().unwrap();
        assert!(fraction.contains("\"total\""));
        assert_eq!(sub_rx.blocking_recv().unwrap().as_ref(), "[]");

        // a live sender does not keep a shut down worker alive
        let status = worker.shutdown();
        assert_eq!(status.frames, 1);
        drop(tx);
    }

    #[test]
    fn worker_exits_when_senders_drop() {
        let (_dataset, _opener, coordinator) = coordinator();
        let (tx, rx) = mpsc::channel::<TickTrigger>();
        let worker = WorkerHandle::spawn(coordinator, rx).unwrap();
        drop(tx);
        for _ in 0..50 {
            if !worker.is_running() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!worker.is_running());
    }
}
