use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::work::{WorkItem, WorkKey};

/// Owns a stage's ready set and decides which item runs next.
pub trait SelectionPolicy: Send {
    fn push(&mut self, item: WorkItem);

    fn pop(&mut self) -> Option<WorkItem>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs ready items in the order they became ready.
#[derive(Debug, Default)]
pub struct Fifo {
    items: VecDeque<WorkItem>,
}

impl SelectionPolicy for Fifo {
    fn push(&mut self, item: WorkItem) {
        self.items.push_back(item);
    }

    fn pop(&mut self) -> Option<WorkItem> {
        self.items.pop_front()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Runs the ready item with the smallest `(microbatch, phase)` key first.
#[derive(Debug, Default)]
pub struct LowestMicrobatch {
    items: BTreeMap<WorkKey, WorkItem>,
}

impl SelectionPolicy for LowestMicrobatch {
    fn push(&mut self, item: WorkItem) {
        self.items.insert(item.key, item);
    }

    fn pop(&mut self) -> Option<WorkItem> {
        self.items.pop_first().map(|(_, item)| item)
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Selection policy choice for a stage executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    Fifo,
    LowestMicrobatch,
}

impl PolicyKind {
    pub fn build(self) -> Box<dyn SelectionPolicy> {
        match self {
            PolicyKind::Fifo => Box::new(Fifo::default()),
            PolicyKind::LowestMicrobatch => Box::new(LowestMicrobatch::default()),
        }
    }
}
