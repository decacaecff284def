use std::env;

use comms::specs::StageSpec;
use ndarray::Array;
use runtime::{RunOptions, Value};

use orchestrator::{OrchestratorError, PipelineConfig, StageConfig};

const BATCH_SIZE: usize = 8;

fn demo_config() -> Result<PipelineConfig, OrchestratorError> {
    let stages = vec![
        StageConfig {
            name: "scale".into(),
            addr: "node-0:50000".into(),
            spec: StageSpec::Affine {
                scale: 2.0,
                shift: -3.0,
            },
        },
        StageConfig {
            name: "relu".into(),
            addr: "node-1:50000".into(),
            spec: StageSpec::Relu,
        },
        StageConfig {
            name: "shift".into(),
            addr: "node-0:50000".into(),
            spec: StageSpec::Affine {
                scale: 1.0,
                shift: 0.5,
            },
        },
    ];

    Ok(PipelineConfig::new(stages, RunOptions::with_chunks(4)?))
}

fn main() -> Result<(), OrchestratorError> {
    env_logger::init();

    let config = match env::args().nth(1) {
        Some(path) => PipelineConfig::from_path(path)?,
        None => demo_config()?,
    };

    let session = orchestrator::connect(&config)?;
    let graph = config.chain();

    let input = Array::range(0.0, BATCH_SIZE as f32, 1.0).into_dyn();
    let output = session.run(&graph, vec![Value::Tensor(input)])?;
    println!("pipeline output: {output}");

    for name in graph.stage_names() {
        println!("{name}: {:?}", session.stats(name)?);
    }

    session.shutdown()
}
