use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Stage callables a node knows how to build.
///
/// Closures cannot cross process boundaries, so remote stages are picked from
/// this catalogue and instantiated on the node that hosts them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageSpec {
    /// `x * scale + shift`, elementwise.
    Affine { scale: f32, shift: f32 },
    Relu,
    /// Sum of every tensor argument.
    Add,
    /// A tuple holding `outputs` copies of the input.
    Fork { outputs: usize },
    /// `x @ weights + bias`, with `weights` laid out row major as `inputs x outputs`.
    Linear {
        inputs: usize,
        outputs: usize,
        weights: Vec<f32>,
        bias: Vec<f32>,
    },
}

/// Where a process taking part in the pipeline can be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    pub rank: usize,
    pub addr: SocketAddr,
}
