use std::{collections::HashMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    slot::{Outcome, ResultSlot},
    value::{Kwargs, RefId, Value},
};

/// The pass a work item belongs to.
///
/// Only forward items are issued by the driver today, `Backward` keeps room in
/// the key space so both passes of one microbatch can coexist on a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Forward,
    Backward,
}

/// Identifies a work item within one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkKey {
    pub microbatch: usize,
    pub phase: Phase,
}

impl WorkKey {
    pub fn forward(microbatch: usize) -> Self {
        Self {
            microbatch,
            phase: Phase::Forward,
        }
    }

    pub fn backward(microbatch: usize) -> Self {
        Self {
            microbatch,
            phase: Phase::Backward,
        }
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self.phase {
            Phase::Forward => "forward",
            Phase::Backward => "backward",
        };
        write!(f, "{}_{phase}", self.microbatch)
    }
}

/// Scheduling state of a work item, only ever moves one step forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkState {
    Waiting,
    Ready,
    Running,
    Done,
}

impl WorkState {
    fn next(self) -> Option<WorkState> {
        match self {
            WorkState::Waiting => Some(WorkState::Ready),
            WorkState::Ready => Some(WorkState::Running),
            WorkState::Running => Some(WorkState::Done),
            WorkState::Done => None,
        }
    }
}

/// One pending invocation on a stage.
pub struct WorkItem {
    pub key: WorkKey,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
    pub ref_id: RefId,
    pub slot: Arc<ResultSlot>,
    pub unresolved: usize,
    pub ready_args: HashMap<RefId, Outcome>,
    state: WorkState,
}

impl WorkItem {
    /// Creates a new `WorkItem` in the `Waiting` state.
    ///
    /// # Arguments
    /// * `key` - The item's key on its stage.
    /// * `args` - Positional arguments, possibly holding deferred references.
    /// * `kwargs` - Keyword arguments, possibly holding deferred references.
    /// * `ref_id` - The reference handed out for this item's result.
    /// * `slot` - The slot the result is written to.
    /// * `unresolved` - How many distinct references must resolve before it is ready.
    pub fn new(
        key: WorkKey,
        args: Vec<Value>,
        kwargs: Kwargs,
        ref_id: RefId,
        slot: Arc<ResultSlot>,
        unresolved: usize,
    ) -> Self {
        Self {
            key,
            args,
            kwargs,
            ref_id,
            slot,
            unresolved,
            ready_args: HashMap::new(),
            state: WorkState::Waiting,
        }
    }

    pub fn state(&self) -> WorkState {
        self.state
    }

    /// Moves the item to `to`, which must be the immediate successor of its state.
    ///
    /// # Panics
    /// If the transition skips or revisits a state.
    pub fn advance(&mut self, to: WorkState) {
        assert_eq!(
            self.state.next(),
            Some(to),
            "illegal work item transition {:?} -> {to:?} for {}",
            self.state,
            self.key
        );
        self.state = to;
    }

    /// Records the outcome of one dependency.
    ///
    /// # Returns
    /// `true` once every dependency has been delivered.
    pub fn deliver(&mut self, id: RefId, outcome: Outcome) -> bool {
        if self.ready_args.insert(id, outcome).is_none() {
            self.unresolved = self.unresolved.saturating_sub(1);
        }
        self.unresolved == 0
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("key", &self.key)
            .field("ref_id", &self.ref_id)
            .field("unresolved", &self.unresolved)
            .field("state", &self.state)
            .finish()
    }
}
