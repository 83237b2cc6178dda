//! Background threads: stage executors, detector loop, sweeper loop, router loop.

mod command_worker;
mod periodic;
mod stage_executor;

pub use command_worker::{CommandStageWorker, DATA_ERROR_EXIT};
pub use periodic::{spawn_detector_loop, spawn_router_loop, spawn_sweeper_loop};
pub use stage_executor::{
    AttemptControl, AttemptOutcome, ExecutorStats, StageExecutor, StageExecutorConfig, StageExecutorHandle,
    StageWorker,
};

use std::sync::mpsc;
use std::thread;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(name: String, shutdown: mpsc::Sender<()>, join: thread::JoinHandle<()>) -> Self {
        Self {
            name,
            shutdown,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}
