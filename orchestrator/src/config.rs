use std::{
    collections::HashSet,
    fs,
    net::{SocketAddr, ToSocketAddrs},
    path::Path,
};

use comms::specs::{PeerSpec, StageSpec};
use runtime::{Arg, RunOptions, StageGraph};
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

/// A stage and the node that hosts it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub addr: String,
    pub spec: StageSpec,
}

/// The whole pipeline as read from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub run: RunOptions,
}

/// Everything a single node is asked to host.
#[derive(Debug, Clone, PartialEq)]
pub struct NodePlan {
    pub rank: usize,
    pub addr: SocketAddr,
    pub stages: Vec<(String, StageSpec)>,
}

impl NodePlan {
    pub fn peer(&self) -> PeerSpec {
        PeerSpec {
            rank: self.rank,
            addr: self.addr,
        }
    }
}

impl PipelineConfig {
    pub fn new(stages: Vec<StageConfig>, run: RunOptions) -> Self {
        Self { stages, run }
    }

    /// Reads a `PipelineConfig` from the JSON file at `path`.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, OrchestratorError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Validates the config and groups the stages by the node hosting them.
    ///
    /// Nodes are ranked from 1 in the order their address first appears, rank 0
    /// is the orchestrator itself.
    ///
    /// # Returns
    /// One plan per distinct node or an `InvalidConfig` error.
    pub fn placement(&self) -> Result<Vec<NodePlan>, OrchestratorError> {
        if self.stages.is_empty() {
            return Err(OrchestratorError::InvalidConfig(
                "pipeline must have at least one stage".into(),
            ));
        }

        let mut names = HashSet::new();
        let mut plans: Vec<NodePlan> = Vec::new();

        for stage in &self.stages {
            if !names.insert(stage.name.as_str()) {
                return Err(OrchestratorError::InvalidConfig(format!(
                    "stage {} is declared twice",
                    stage.name
                )));
            }

            let addr = resolve(&stage.addr)?;
            let entry = (stage.name.clone(), stage.spec.clone());
            match plans.iter_mut().find(|plan| plan.addr == addr) {
                Some(plan) => plan.stages.push(entry),
                None => plans.push(NodePlan {
                    rank: plans.len() + 1,
                    addr,
                    stages: vec![entry],
                }),
            }
        }

        Ok(plans)
    }

    /// A single input graph feeding the input through every stage in config order.
    pub fn chain(&self) -> StageGraph {
        let mut graph = StageGraph::new(1);
        let mut prev = Arg::Input(0);

        for stage in &self.stages {
            prev = Arg::Node(graph.stage(stage.name.clone(), vec![prev]));
        }

        graph.set_output(prev);
        graph
    }
}

fn resolve(addr: &str) -> Result<SocketAddr, OrchestratorError> {
    addr.to_socket_addrs()
        .map_err(|e| OrchestratorError::InvalidConfig(format!("invalid address {addr}: {e}")))?
        .next()
        .ok_or_else(|| OrchestratorError::InvalidConfig(format!("{addr} resolves to nothing")))
}
