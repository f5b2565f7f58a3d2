// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dispatch worker: the single consumer of a dispatcher's command queue.
//!
//! ```text
//!  producers ──▶ mpsc (unbounded) ──┐
//!                                   ├──▶ CommandProcessor ──▶ Store / Transport
//!  FlushScheduler (due flushes) ────┘
//! ```
//!
//! The loop waits on whichever comes first: the earliest delayed flush or
//! the next queued command. Commands are processed strictly one at a time.
//!
//! The worker dies on `Kill`, on an unrecoverable processing error, or on a
//! panic inside processing. Death is one-way: the queue is closed, anything
//! still queued is dropped and [`WorkerState::Dead`] is published.

pub mod scheduler;

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::command::Command;
use crate::metrics;
use crate::processor::{CommandProcessor, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Dead,
}

/// Published after every processed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatus {
    pub state: WorkerState,
    /// Commands taken off the queue or the scheduler so far
    pub processed: u64,
}

impl WorkerStatus {
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.state == WorkerState::Dead
    }
}

pub(crate) struct Worker {
    processor: CommandProcessor,
    rx: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<WorkerStatus>,
    processed: u64,
}

impl Worker {
    /// Create a worker and the channels that feed and observe it.
    pub(crate) fn new(
        processor: CommandProcessor,
    ) -> (Self, mpsc::UnboundedSender<Command>, watch::Receiver<WorkerStatus>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(WorkerStatus {
            state: WorkerState::Running,
            processed: 0,
        });
        let worker = Self {
            processor,
            rx,
            status,
            processed: 0,
        };
        (worker, tx, status_rx)
    }

    pub(crate) async fn run(mut self) {
        debug!("Dispatch worker running");

        loop {
            let deadline = self.processor.next_flush_deadline();

            let command = tokio::select! {
                biased;

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    match self.processor.pop_due_flush(Instant::now()) {
                        Some(command) => command,
                        None => continue,
                    }
                }

                received = self.rx.recv() => match received {
                    Some(command) => command,
                    None => {
                        info!("All dispatcher handles dropped, worker exiting");
                        break;
                    }
                },
            };

            let kind = command.kind();
            let result = AssertUnwindSafe(self.processor.process(command))
                .catch_unwind()
                .await;
            self.processed += 1;

            match result {
                Ok(Ok(Step::Continue)) => self.publish(WorkerState::Running),
                Ok(Ok(Step::Stop)) => {
                    info!(command = kind, "Dispatch worker stopped");
                    metrics::record_worker_death("kill");
                    break;
                }
                Ok(Err(e)) => {
                    error!(command = kind, error = %e, "Worker threw an unhandled error, will not send any more data");
                    metrics::record_worker_death("error");
                    break;
                }
                Err(_) => {
                    error!(command = kind, "Worker panicked, will not send any more data");
                    metrics::record_worker_death("panic");
                    break;
                }
            }
        }

        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.rx.close();
        let mut dropped = 0usize;
        while let Ok(command) = self.rx.try_recv() {
            metrics::record_dropped_dead(command.kind());
            dropped += 1;
        }
        if dropped > 0 {
            info!(dropped, "Dropped commands queued behind worker death");
        }
        self.publish(WorkerState::Dead);
    }

    fn publish(&self, state: WorkerState) {
        self.status.send_replace(WorkerStatus {
            state,
            processed: self.processed,
        });
    }
}
