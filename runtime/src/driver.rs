use std::{collections::HashMap, num::NonZeroUsize, sync::Arc};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
    context::{RuntimeContext, StageHandle},
    error::{ExecError, PipeError, Result},
    graph::{Arg, NodeId, Schedule, StageGraph, Target},
    refs::resolve_value,
    splitter::{reassemble, split_args},
    value::{Kwargs, RefId, Tensor, Value},
    work::WorkKey,
};

/// Options of a single driver run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    chunks: NonZeroUsize,
    #[serde(default)]
    batch_dims: Option<Vec<Option<usize>>>,
    #[serde(default)]
    debug_mask: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::new(NonZeroUsize::MIN)
    }
}

impl RunOptions {
    pub fn new(chunks: NonZeroUsize) -> Self {
        Self {
            chunks,
            batch_dims: None,
            debug_mask: false,
        }
    }

    /// Sets the batch dimension of every input, `None` for inputs that are not split.
    ///
    /// Without it tensors are split along axis 0 and everything else is shared.
    pub fn with_batch_dims(mut self, batch_dims: Vec<Option<usize>>) -> Self {
        self.batch_dims = Some(batch_dims);
        self
    }

    /// Makes the splitter produce full-shape masked slices.
    pub fn with_debug_mask(mut self, debug_mask: bool) -> Self {
        self.debug_mask = debug_mask;
        self
    }

    /// Shorthand for options splitting into `chunks` microbatches.
    ///
    /// # Returns
    /// `Config` if `chunks` is zero.
    pub fn with_chunks(chunks: usize) -> Result<Self> {
        NonZeroUsize::new(chunks)
            .map(Self::new)
            .ok_or_else(|| PipeError::Config("chunks must be at least 1".into()))
    }

    pub fn chunks(&self) -> usize {
        self.chunks.get()
    }

    pub fn batch_dims(&self) -> Option<&[Option<usize>]> {
        self.batch_dims.as_deref()
    }

    pub fn debug_mask(&self) -> bool {
        self.debug_mask
    }
}

/// Progress of one microbatch through a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicrobatchState {
    NotStarted,
    /// Issued, its output is still pending.
    InProgress,
    /// Its output was resolved, successfully or not.
    Complete,
}

/// The references handed out while issuing one batch.
#[derive(Debug)]
pub struct IssuedBatch {
    outputs: Vec<RefId>,
    issued: Vec<RefId>,
    offsets: Option<Vec<(usize, usize)>>,
    states: Vec<MicrobatchState>,
}

impl IssuedBatch {
    /// The final reference of every microbatch, in microbatch order.
    pub fn outputs(&self) -> &[RefId] {
        &self.outputs
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn state(&self, microbatch: usize) -> Option<MicrobatchState> {
        self.states.get(microbatch).copied()
    }
}

/// Drives batches through a stage graph, one microbatch at a time.
///
/// Issuing is strictly sequential in microbatch order, but since stage
/// invocations never block, microbatches overlap on the stages.
pub struct PipelineDriver<'a> {
    ctx: &'a RuntimeContext,
    graph: &'a StageGraph,
    schedule: Schedule,
    stages: HashMap<String, Arc<dyn StageHandle>>,
}

impl<'a> PipelineDriver<'a> {
    /// Creates a new `PipelineDriver`.
    ///
    /// # Arguments
    /// * `ctx` - Provides the stages named by the graph and the resolver.
    /// * `graph` - The graph to drive.
    ///
    /// # Returns
    /// The driver, or an error if the graph is malformed or names an unknown stage.
    pub fn new(ctx: &'a RuntimeContext, graph: &'a StageGraph) -> Result<Self> {
        let schedule = graph.schedule()?;

        let mut stages = HashMap::new();
        for &id in schedule.order() {
            if let Target::Stage(name) = &graph.nodes()[id].target {
                if !stages.contains_key(name) {
                    stages.insert(name.clone(), ctx.stage(name)?);
                }
            }
        }

        Ok(Self {
            ctx,
            graph,
            schedule,
            stages,
        })
    }

    /// Splits `inputs`, pushes every microbatch through the graph and
    /// concatenates the outputs.
    pub fn run(&self, inputs: Vec<Value>, opts: &RunOptions) -> Result<Tensor> {
        let batch = self.issue(inputs, opts)?;
        self.collect(batch)
    }

    /// Validates and splits `inputs`, then issues every microbatch without
    /// waiting for any result.
    ///
    /// # Returns
    /// The issued references, `Config` or `ShapeMismatch` before anything is
    /// dispatched if the inputs do not fit `opts`.
    pub fn issue(&self, inputs: Vec<Value>, opts: &RunOptions) -> Result<IssuedBatch> {
        if inputs.len() != self.graph.inputs() {
            return Err(PipeError::Config(format!(
                "graph takes {} inputs, got {}",
                self.graph.inputs(),
                inputs.len()
            )));
        }

        let batch_dims = match opts.batch_dims() {
            Some(dims) if dims.len() != inputs.len() => {
                return Err(PipeError::Config(format!(
                    "got {} batch dimensions for {} inputs",
                    dims.len(),
                    inputs.len()
                )));
            }
            Some(dims) => dims.to_vec(),
            None => inputs
                .iter()
                .map(|arg| matches!(arg, Value::Tensor(_)).then_some(0))
                .collect(),
        };

        check_batch_sizes(&inputs, &batch_dims)?;

        let chunks = opts.chunks();
        let split = split_args(inputs, chunks, &batch_dims, opts.debug_mask())?;

        let mut batch = IssuedBatch {
            outputs: Vec::with_capacity(chunks),
            issued: Vec::new(),
            offsets: split.offsets().map(<[_]>::to_vec),
            states: vec![MicrobatchState::NotStarted; chunks],
        };

        for microbatch in 0..chunks {
            batch.states[microbatch] = MicrobatchState::InProgress;

            let output = self
                .traverse(microbatch, split.microbatch(microbatch), &mut batch.issued)
                .and_then(|value| {
                    value
                        .as_deferred()
                        .ok_or(PipeError::UnsupportedOutput { microbatch })
                });

            match output {
                Ok(id) => batch.outputs.push(id),
                Err(e) => {
                    self.ctx.resolver().release(&batch.issued);
                    return Err(e);
                }
            }
        }

        info!(
            "rank {} issued {chunks} microbatches, {} references",
            self.ctx.local_rank(),
            batch.issued.len()
        );

        Ok(batch)
    }

    /// Waits for every microbatch's output in microbatch order.
    ///
    /// A failed microbatch only poisons its own entry.
    pub fn resolve_each(&self, batch: &mut IssuedBatch) -> Vec<Result<Value>> {
        let resolver = self.ctx.resolver().as_ref();
        let mut results = Vec::with_capacity(batch.outputs.len());

        for (microbatch, &id) in batch.outputs.iter().enumerate() {
            let value = resolver
                .resolve(id)
                .and_then(|value| resolve_value(resolver, value))
                .map_err(PipeError::Execution);

            batch.states[microbatch] = MicrobatchState::Complete;
            results.push(value);
        }

        results
    }

    /// Resolves every output, releases the batch's references and reassembles
    /// the outputs into a single tensor.
    pub fn collect(&self, mut batch: IssuedBatch) -> Result<Tensor> {
        let results = self.resolve_each(&mut batch);
        self.ctx.resolver().release(&batch.issued);

        let mut outputs = Vec::with_capacity(results.len());
        for (microbatch, result) in results.into_iter().enumerate() {
            let value = result?;
            let kind = value.kind();
            let tensor = value.into_tensor().ok_or_else(|| {
                PipeError::Config(format!(
                    "microbatch {microbatch} produced a {kind} value, expected a tensor"
                ))
            })?;
            outputs.push(tensor);
        }

        reassemble(&outputs, batch.offsets.as_deref())
    }

    fn traverse(
        &self,
        microbatch: usize,
        inputs: Vec<Value>,
        issued: &mut Vec<RefId>,
    ) -> Result<Value> {
        let mut env: HashMap<NodeId, Value> = HashMap::new();

        for (step, &id) in self.schedule.order().iter().enumerate() {
            let node = &self.graph.nodes()[id];
            let args = node
                .args
                .iter()
                .map(|arg| fetch(arg, &inputs, &env))
                .collect::<Result<Vec<_>>>()?;
            let kwargs = node
                .kwargs
                .iter()
                .map(|(key, arg)| Ok((key.clone(), fetch(arg, &inputs, &env)?)))
                .collect::<Result<Kwargs>>()?;

            let value = match &node.target {
                Target::Stage(name) => {
                    let stage = &self.stages[name];
                    let ref_id = stage.invoke(args, kwargs, WorkKey::forward(microbatch))?;
                    debug!(
                        "issued microbatch {microbatch} to stage {name} on rank {} as {ref_id}",
                        stage.rank()
                    );
                    issued.push(ref_id);
                    Value::Deferred(ref_id)
                }
                Target::GetItem(index) => self.get_item(id, args, *index, issued)?,
                Target::Local { name, f } => {
                    debug!(
                        "rank {} running microbatch {microbatch} local node {name}",
                        self.ctx.local_rank()
                    );
                    self.run_local(name, f.as_ref(), microbatch, args, kwargs)?
                }
            };

            env.insert(id, value);
            for dead in self.schedule.drops_after(step) {
                env.remove(dead);
            }
        }

        env.remove(&self.schedule.output())
            .ok_or(PipeError::UnsupportedOutput { microbatch })
    }

    fn get_item(
        &self,
        id: NodeId,
        args: Vec<Value>,
        index: usize,
        issued: &mut Vec<RefId>,
    ) -> Result<Value> {
        match args.into_iter().next() {
            Some(Value::Deferred(source)) => {
                let projected = self.ctx.resolver().project(source, index)?;
                issued.push(projected);
                Ok(Value::Deferred(projected))
            }
            Some(value) => value.get(index).cloned().ok_or_else(|| {
                PipeError::Config(format!(
                    "node {id} cannot take element {index} of a {} value",
                    value.kind()
                ))
            }),
            None => Err(PipeError::Config(format!("node {id} has no argument"))),
        }
    }

    fn run_local(
        &self,
        name: &str,
        f: &(dyn Fn(Vec<Value>, Kwargs) -> anyhow::Result<Value> + Send + Sync),
        microbatch: usize,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value> {
        let resolver = self.ctx.resolver().as_ref();

        let args = args
            .into_iter()
            .map(|arg| resolve_value(resolver, arg))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let kwargs = kwargs
            .into_iter()
            .map(|(key, arg)| Ok((key, resolve_value(resolver, arg)?)))
            .collect::<std::result::Result<Kwargs, ExecError>>()?;

        f(args, kwargs).map_err(|e| ExecError::new(name, microbatch, format!("{e:#}")).into())
    }
}

fn fetch(arg: &Arg, inputs: &[Value], env: &HashMap<NodeId, Value>) -> Result<Value> {
    match arg {
        Arg::Input(i) => inputs
            .get(*i)
            .cloned()
            .ok_or_else(|| PipeError::Config(format!("missing input {i}"))),
        Arg::Node(id) => env
            .get(id)
            .cloned()
            .ok_or_else(|| PipeError::Config(format!("node {id} has no value"))),
        Arg::Const(value) => Ok(value.clone()),
    }
}

/// Checks that every split tensor agrees on the size of its batch dimension.
fn check_batch_sizes(inputs: &[Value], batch_dims: &[Option<usize>]) -> Result<()> {
    let mut expected: Option<usize> = None;

    for (arg, (input, dim)) in inputs.iter().zip(batch_dims).enumerate() {
        let (Value::Tensor(tensor), Some(dim)) = (input, dim) else {
            continue;
        };

        let Some(&got) = tensor.shape().get(*dim) else {
            return Err(PipeError::Config(format!(
                "batch dimension {dim} out of range for arg {arg} with {} dimensions",
                tensor.ndim()
            )));
        };

        match expected {
            None => expected = Some(got),
            Some(expected) if expected != got => {
                return Err(PipeError::ShapeMismatch { arg, expected, got });
            }
            Some(_) => {}
        }
    }

    Ok(())
}
