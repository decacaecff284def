use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    error::{ExecError, PipeError, Result},
    slot::{Notify, Outcome, ResultSlot},
    value::{RefId, Value},
};

/// Resolves deferred references, wherever their producer lives.
///
/// Implementations route each reference to the process named by its `rank`.
pub trait Resolver: Send + Sync {
    /// Blocks the calling thread until `id` is produced.
    fn resolve(&self, id: RefId) -> Outcome;

    /// Runs `notify` once `id` is produced, without blocking the caller.
    fn subscribe(&self, id: RefId, notify: Notify);

    /// Creates a reference, owned by the producer of `id`, to element `index` of
    /// the tuple `id` resolves to. The element is extracted where it lives.
    fn project(&self, id: RefId, index: usize) -> Result<RefId>;

    /// Lets the owners reclaim the slots of `ids`.
    fn release(&self, ids: &[RefId]);
}

/// Resolves every reference inside `value`, including references that show
/// up inside already resolved values.
pub fn resolve_value(resolver: &dyn Resolver, mut value: Value) -> Outcome {
    while value.has_refs() {
        value = value.try_map_refs(&mut |id| resolver.resolve(id))?;
    }
    Ok(value)
}

/// The process-local registry of result slots.
///
/// Every reference produced in this process is published here under a fresh
/// sequence number and stays reachable until it is released.
pub struct RefTable {
    rank: usize,
    next_seq: AtomicU64,
    slots: Mutex<HashMap<u64, Arc<ResultSlot>>>,
}

impl RefTable {
    /// Creates a new `RefTable`.
    ///
    /// # Arguments
    /// * `rank` - The rank of the owning process, stamped on every published reference.
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            next_seq: AtomicU64::new(0),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Allocates a pending slot and the reference that names it.
    pub fn publish(&self) -> (RefId, Arc<ResultSlot>) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(ResultSlot::new());
        self.slots.lock().insert(seq, Arc::clone(&slot));
        (RefId::new(self.rank, seq), slot)
    }

    /// Looks up the slot of a reference owned by this process.
    pub fn slot(&self, id: RefId) -> Option<Arc<ResultSlot>> {
        if id.rank != self.rank {
            return None;
        }
        self.slots.lock().get(&id.seq).cloned()
    }

    pub fn remove(&self, id: RefId) -> Option<Arc<ResultSlot>> {
        if id.rank != self.rank {
            return None;
        }
        self.slots.lock().remove(&id.seq)
    }

    /// The amount of live slots.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Projects element `index` out of a locally owned tuple reference.
    ///
    /// # Returns
    /// The new reference or `UnknownRef` if `id` is not owned here.
    pub fn project_local(&self, id: RefId, index: usize) -> Result<RefId> {
        let source = self.slot(id).ok_or(PipeError::UnknownRef(id))?;
        let (projected, slot) = self.publish();

        source.subscribe(Box::new(move |outcome| {
            slot.set(outcome.and_then(|value| select(id, value, index)));
        }));

        Ok(projected)
    }

    fn unknown(&self, id: RefId) -> ExecError {
        ExecError::unresolvable(id, format!("not found on rank {}", self.rank))
    }
}

fn select(id: RefId, value: Value, index: usize) -> Outcome {
    let kind = value.kind();
    match value {
        Value::Tuple(mut items) if index < items.len() => Ok(items.swap_remove(index)),
        _ => Err(ExecError::unresolvable(
            id,
            format!("cannot take element {index} of a {kind} value"),
        )),
    }
}

impl Resolver for RefTable {
    fn resolve(&self, id: RefId) -> Outcome {
        match self.slot(id) {
            Some(slot) => slot.wait(),
            None => Err(self.unknown(id)),
        }
    }

    fn subscribe(&self, id: RefId, notify: Notify) {
        match self.slot(id) {
            Some(slot) => slot.subscribe(notify),
            None => notify(Err(self.unknown(id))),
        }
    }

    fn project(&self, id: RefId, index: usize) -> Result<RefId> {
        self.project_local(id, index)
    }

    fn release(&self, ids: &[RefId]) {
        let mut slots = self.slots.lock();
        for id in ids.iter().filter(|id| id.rank == self.rank) {
            slots.remove(&id.seq);
        }
    }
}
