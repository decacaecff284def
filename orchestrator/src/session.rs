use std::sync::Arc;

use comms::{PeerClient, msg::Command, specs::PeerSpec};
use futures::future::try_join_all;
use log::info;
use node::{PeerResolver, Peers, RemoteStage};
use runtime::{
    PipelineDriver, QueueStats, RefTable, Resolver, RunOptions, RuntimeContext, StageGraph,
    Tensor, Value,
};
use tokio::runtime::{Builder, Runtime};

use crate::{config::NodePlan, error::OrchestratorError};

/// A pipeline whose stages are hosted by remote nodes, driven from this process.
///
/// Holds its own tokio runtime for the node connections. Its methods block and
/// must not be called from inside an async context.
pub struct Session {
    ctx: RuntimeContext,
    clients: Vec<Arc<PeerClient>>,
    run: RunOptions,
    runtime: Runtime,
}

impl Session {
    /// Creates a new `Session`.
    ///
    /// # Arguments
    /// * `plans` - The nodes to reach and the stages each one hosts.
    /// * `run` - The options `run` splits batches with.
    ///
    /// # Returns
    /// A session whose stages are all created, or the first error met.
    pub fn new(plans: Vec<NodePlan>, run: RunOptions) -> Result<Self, OrchestratorError> {
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .thread_name("orchestrator-io")
            .build()?;

        let world_size = plans.len() + 1;
        let peers: Vec<PeerSpec> = plans.iter().map(NodePlan::peer).collect();
        let clients = runtime.block_on(Self::create_nodes(&plans, world_size, &peers))?;

        let refs = Arc::new(RefTable::new(0));
        let registry = Arc::new(Peers::new(0, peers, runtime.handle().clone()));
        for (plan, client) in plans.iter().zip(&clients) {
            registry.insert(plan.rank, Arc::clone(client));
        }

        let resolver: Arc<dyn Resolver> =
            Arc::new(PeerResolver::new(Arc::clone(&refs), registry));
        let mut ctx = RuntimeContext::with_resolver(0, world_size, refs, resolver);

        for (plan, client) in plans.iter().zip(&clients) {
            for (name, _) in &plan.stages {
                let stage = RemoteStage::new(
                    name.clone(),
                    plan.rank,
                    Arc::clone(client),
                    runtime.handle().clone(),
                );
                ctx.register_stage(Arc::new(stage))?;
            }
        }

        info!("pipeline ready on {} node(s)", plans.len());

        Ok(Self {
            ctx,
            clients,
            run,
            runtime,
        })
    }

    /// Connects to every node, assigns ranks and creates the stages.
    ///
    /// # Arguments
    /// * `plans` - The nodes to reach and the stages each one hosts.
    /// * `world_size` - The amount of processes, the orchestrator included.
    /// * `peers` - Where every node listens.
    ///
    /// # Returns
    /// One connection per plan, in the same order.
    async fn create_nodes(
        plans: &[NodePlan],
        world_size: usize,
        peers: &[PeerSpec],
    ) -> Result<Vec<Arc<PeerClient>>, OrchestratorError> {
        let nodes = plans.iter().map(|plan| async move {
            let client = PeerClient::connect(plan.addr).await.map_err(|source| {
                OrchestratorError::ConnectionFailed {
                    addr: plan.addr.to_string(),
                    source,
                }
            })?;

            client.join(plan.rank, world_size, peers.to_vec()).await?;
            for (name, spec) in &plan.stages {
                client.create_stage(name, spec.clone()).await?;
            }

            info!(
                "rank {} at {} hosts {} stage(s)",
                plan.rank,
                plan.addr,
                plan.stages.len()
            );
            Ok::<_, OrchestratorError>(Arc::new(client))
        });

        try_join_all(nodes).await
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    /// A driver for `graph` over this session's stages, for callers that want to
    /// issue and resolve microbatches themselves.
    pub fn driver<'a>(&'a self, graph: &'a StageGraph) -> Result<PipelineDriver<'a>, OrchestratorError> {
        Ok(PipelineDriver::new(&self.ctx, graph)?)
    }

    /// Runs `inputs` through `graph` with the session's options.
    pub fn run(&self, graph: &StageGraph, inputs: Vec<Value>) -> Result<Tensor, OrchestratorError> {
        self.run_with(graph, inputs, &self.run)
    }

    pub fn run_with(
        &self,
        graph: &StageGraph,
        inputs: Vec<Value>,
        opts: &RunOptions,
    ) -> Result<Tensor, OrchestratorError> {
        Ok(self.driver(graph)?.run(inputs, opts)?)
    }

    pub fn stats(&self, stage: &str) -> Result<QueueStats, OrchestratorError> {
        Ok(self.ctx.stage(stage)?.stats()?)
    }

    /// Tells every node to tear down its stages and stop serving.
    pub fn shutdown(self) -> Result<(), OrchestratorError> {
        let Self {
            ctx,
            clients,
            runtime,
            ..
        } = self;

        ctx.teardown();
        runtime.block_on(async {
            for client in &clients {
                client.command(Command::Shutdown).await?;
            }
            Ok::<_, OrchestratorError>(())
        })?;

        info!("shut down {} node(s)", clients.len());
        Ok(())
    }
}
