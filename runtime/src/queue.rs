use std::collections::{HashMap, HashSet};

use log::debug;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::{
    policy::SelectionPolicy,
    slot::Outcome,
    value::RefId,
    work::{WorkItem, WorkKey, WorkState},
};

/// Counters describing a stage's queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
}

/// Why a work item was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    /// An item with the same key is waiting, ready or running.
    Duplicate,
    /// The queue was shut down.
    Closed,
}

struct Runlists {
    waiting: HashMap<WorkKey, WorkItem>,
    ready: Box<dyn SelectionPolicy>,
    live: HashSet<WorkKey>,
    running: usize,
    completed: usize,
    shutdown: bool,
}

/// A stage's work items on their way from waiting to ready to running.
///
/// Producers submit and deliver dependencies from any thread, the stage's single
/// worker consumes with `next`. A key stays live from `submit` until `finish`.
pub struct WorkQueue {
    runlists: Mutex<Runlists>,
    ready_cv: Condvar,
}

impl WorkQueue {
    /// Creates a new `WorkQueue`.
    ///
    /// # Arguments
    /// * `policy` - Holds the ready set and picks the next item to run.
    pub fn new(policy: Box<dyn SelectionPolicy>) -> Self {
        Self {
            runlists: Mutex::new(Runlists {
                waiting: HashMap::new(),
                ready: policy,
                live: HashSet::new(),
                running: 0,
                completed: 0,
                shutdown: false,
            }),
            ready_cv: Condvar::new(),
        }
    }

    /// Enqueues a new item, straight into the ready set if it has no pending dependencies.
    pub fn submit(&self, mut item: WorkItem) -> Result<(), Rejected> {
        let mut runlists = self.runlists.lock();

        if runlists.shutdown {
            return Err(Rejected::Closed);
        }

        if !runlists.live.insert(item.key) {
            return Err(Rejected::Duplicate);
        }

        if item.unresolved == 0 {
            item.advance(WorkState::Ready);
            runlists.ready.push(item);
            drop(runlists);
            self.ready_cv.notify_one();
        } else {
            runlists.waiting.insert(item.key, item);
        }

        Ok(())
    }

    /// Hands the outcome of dependency `id` to the waiting item `key`, promoting
    /// it to ready once nothing is left unresolved.
    pub fn deliver(&self, key: WorkKey, id: RefId, outcome: Outcome) {
        let mut runlists = self.runlists.lock();

        let Some(item) = runlists.waiting.get_mut(&key) else {
            debug!("dropping dependency {id} for {key}: item is not waiting");
            return;
        };

        if !item.deliver(id, outcome) {
            return;
        }

        if let Some(mut item) = runlists.waiting.remove(&key) {
            item.advance(WorkState::Ready);
            runlists.ready.push(item);
            drop(runlists);
            self.ready_cv.notify_one();
        }
    }

    /// Blocks until an item is ready and hands it out in the `Running` state.
    ///
    /// # Returns
    /// `None` once the queue has been shut down.
    pub fn next(&self) -> Option<WorkItem> {
        let mut runlists = self.runlists.lock();

        loop {
            if runlists.shutdown {
                return None;
            }

            if let Some(mut item) = runlists.ready.pop() {
                item.advance(WorkState::Running);
                runlists.running += 1;
                return Some(item);
            }

            self.ready_cv.wait(&mut runlists);
        }
    }

    /// Retires a running key so it may be submitted again.
    pub fn finish(&self, key: WorkKey) {
        let mut runlists = self.runlists.lock();
        if runlists.live.remove(&key) {
            runlists.running = runlists.running.saturating_sub(1);
            runlists.completed += 1;
        }
    }

    /// Stops handing out items and rejects new submissions.
    ///
    /// # Returns
    /// The items that were still waiting or ready, which will never run.
    pub fn shutdown(&self) -> Vec<WorkItem> {
        let mut runlists = self.runlists.lock();
        runlists.shutdown = true;

        let mut pending: Vec<WorkItem> = runlists.waiting.drain().map(|(_, item)| item).collect();
        while let Some(item) = runlists.ready.pop() {
            pending.push(item);
        }
        for item in &pending {
            runlists.live.remove(&item.key);
        }

        drop(runlists);
        self.ready_cv.notify_all();
        pending
    }

    pub fn stats(&self) -> QueueStats {
        let runlists = self.runlists.lock();
        QueueStats {
            waiting: runlists.waiting.len(),
            ready: runlists.ready.len(),
            running: runlists.running,
            completed: runlists.completed,
        }
    }
}
