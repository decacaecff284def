use std::{collections::BTreeMap, sync::Arc};

use log::info;

use crate::{
    error::{PipeError, Result},
    executor::{Stage, StageExecutor},
    policy::PolicyKind,
    queue::QueueStats,
    refs::{RefTable, Resolver},
    value::{Kwargs, RefId, Value},
    work::WorkKey,
};

/// Anything that accepts stage invocations, in this process or on a peer.
pub trait StageHandle: Send + Sync {
    fn name(&self) -> &str;

    /// The rank of the process that owns the stage.
    fn rank(&self) -> usize;

    /// Submits a call and returns the reference to its result without waiting
    /// for it to run.
    fn invoke(&self, args: Vec<Value>, kwargs: Kwargs, key: WorkKey) -> Result<RefId>;

    fn stats(&self) -> Result<QueueStats>;
}

/// Per-process runtime state, created on process start and torn down on shutdown.
///
/// It owns the process's reference table, the resolver used to reach other
/// processes and the registry of every stage this process can invoke.
pub struct RuntimeContext {
    local_rank: usize,
    world_size: usize,
    refs: Arc<RefTable>,
    resolver: Arc<dyn Resolver>,
    policy: PolicyKind,
    stages: BTreeMap<String, Arc<dyn StageHandle>>,
    local: Vec<Arc<StageExecutor>>,
}

impl RuntimeContext {
    /// Creates a context whose references can only be resolved inside this process.
    ///
    /// # Arguments
    /// * `local_rank` - This process's rank.
    /// * `world_size` - The amount of processes taking part.
    pub fn new(local_rank: usize, world_size: usize) -> Self {
        let refs = Arc::new(RefTable::new(local_rank));
        let resolver: Arc<dyn Resolver> = refs.clone();
        Self::with_resolver(local_rank, world_size, refs, resolver)
    }

    /// Creates a context that resolves references through `resolver`.
    ///
    /// # Arguments
    /// * `local_rank` - This process's rank.
    /// * `world_size` - The amount of processes taking part.
    /// * `refs` - This process's reference table.
    /// * `resolver` - Routes references to their owners, including `refs` itself.
    pub fn with_resolver(
        local_rank: usize,
        world_size: usize,
        refs: Arc<RefTable>,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        info!("rank {local_rank} of {world_size} runtime context created");
        Self {
            local_rank,
            world_size,
            refs,
            resolver,
            policy: PolicyKind::default(),
            stages: BTreeMap::new(),
            local: Vec::new(),
        }
    }

    /// Sets the selection policy of stages spawned from now on.
    pub fn with_policy(mut self, policy: PolicyKind) -> Self {
        self.policy = policy;
        self
    }

    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn refs(&self) -> &Arc<RefTable> {
        &self.refs
    }

    pub fn resolver(&self) -> &Arc<dyn Resolver> {
        &self.resolver
    }

    /// Spawns an executor for `stage` in this process and registers it under `name`.
    pub fn spawn_stage<S: Stage>(
        &mut self,
        name: impl Into<String>,
        stage: S,
    ) -> Result<Arc<StageExecutor>> {
        self.spawn_boxed(name, Box::new(stage))
    }

    /// Like `spawn_stage` for an already boxed callable.
    pub fn spawn_boxed(
        &mut self,
        name: impl Into<String>,
        stage: Box<dyn Stage>,
    ) -> Result<Arc<StageExecutor>> {
        let name = name.into();
        self.ensure_free(&name)?;

        let executor = Arc::new(StageExecutor::spawn(
            name.clone(),
            stage,
            Arc::clone(&self.refs),
            Arc::clone(&self.resolver),
            self.policy,
        )?);

        self.stages
            .insert(name, Arc::clone(&executor) as Arc<dyn StageHandle>);
        self.local.push(Arc::clone(&executor));
        Ok(executor)
    }

    /// Registers a stage owned elsewhere, typically a handle to a peer's stage.
    pub fn register_stage(&mut self, handle: Arc<dyn StageHandle>) -> Result<()> {
        self.ensure_free(handle.name())?;
        self.stages.insert(handle.name().to_string(), handle);
        Ok(())
    }

    /// Looks up a stage by name.
    pub fn stage(&self, name: &str) -> Result<Arc<dyn StageHandle>> {
        self.stages
            .get(name)
            .cloned()
            .ok_or_else(|| PipeError::UnknownStage(name.to_string()))
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.keys().map(String::as_str)
    }

    /// Shuts down every locally spawned executor and drops the registry.
    pub fn teardown(mut self) {
        self.shutdown_local();
        info!("rank {} runtime context torn down", self.local_rank);
    }

    fn shutdown_local(&mut self) {
        for executor in self.local.drain(..) {
            executor.shutdown();
        }
        self.stages.clear();
    }

    fn ensure_free(&self, name: &str) -> Result<()> {
        if self.stages.contains_key(name) {
            return Err(PipeError::Config(format!("stage {name} is already registered")));
        }
        Ok(())
    }
}

impl Drop for RuntimeContext {
    fn drop(&mut self) {
        self.shutdown_local();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(args: Vec<Value>, _: Kwargs) -> anyhow::Result<Value> {
        Ok(args.into_iter().next().unwrap_or(Value::None))
    }

    #[test]
    fn stages_are_registered_by_name() {
        let mut ctx = RuntimeContext::new(0, 1);
        ctx.spawn_stage("a", identity).unwrap();
        ctx.spawn_stage("b", identity).unwrap();

        assert_eq!(ctx.stage_names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(ctx.stage("a").unwrap().rank(), 0);
        assert!(matches!(ctx.stage("c"), Err(PipeError::UnknownStage(_))));
        assert!(matches!(
            ctx.spawn_stage("a", identity),
            Err(PipeError::Config(_))
        ));
    }

    #[test]
    fn teardown_closes_local_stages() {
        let mut ctx = RuntimeContext::new(0, 1);
        let exec = ctx.spawn_stage("a", identity).unwrap();
        ctx.teardown();

        let res = exec.invoke(Vec::new(), Kwargs::new(), WorkKey::forward(0));
        assert!(matches!(res, Err(PipeError::StageClosed(_))));
    }
}
