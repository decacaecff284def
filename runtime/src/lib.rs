//! Pipeline stage execution runtime.
//!
//! A batch is split into microbatches that flow through a graph of stages.
//! Every stage runs on its own worker thread, invocations return deferred
//! references right away and consumers block only when they resolve them.

mod context;
mod driver;
mod error;
mod executor;
mod graph;
mod policy;
mod queue;
mod refs;
mod slot;
mod splitter;
mod value;
mod work;

pub use context::{RuntimeContext, StageHandle};
pub use driver::{IssuedBatch, MicrobatchState, PipelineDriver, RunOptions};
pub use error::{ExecError, PipeError, Result};
pub use executor::{Stage, StageExecutor};
pub use graph::{Arg, LocalFn, Node, NodeId, Schedule, StageGraph, Target};
pub use policy::{Fifo, LowestMicrobatch, PolicyKind, SelectionPolicy};
pub use queue::{QueueStats, Rejected, WorkQueue};
pub use refs::{RefTable, Resolver, resolve_value};
pub use slot::{Notify, Outcome, ResultSlot};
pub use splitter::{MicrobatchSplit, SplitArg, reassemble, split_args, split_offsets, split_sizes};
pub use value::{Kwargs, RefId, Tensor, Value, collect_refs};
pub use work::{Phase, WorkItem, WorkKey, WorkState};
