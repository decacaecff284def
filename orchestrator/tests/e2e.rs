use std::net::SocketAddr;

use comms::specs::StageSpec;
use ndarray::{Array, ArrayD, IxDyn};
use node::NodeServer;
use orchestrator::{OrchestratorError, PipelineConfig, StageConfig};
use runtime::{Arg, PipeError, RunOptions, StageGraph, Tensor, Value};
use tokio::runtime::Runtime;

/// Nodes listening on ephemeral ports, served by their own runtime.
struct Cluster {
    addrs: Vec<SocketAddr>,
    _runtime: Runtime,
}

impl Cluster {
    fn start(nodes: usize) -> Self {
        let runtime = Runtime::new().unwrap();
        let addrs = (0..nodes)
            .map(|_| {
                let server = runtime
                    .block_on(NodeServer::bind("127.0.0.1:0"))
                    .unwrap();
                let addr = server.local_addr().unwrap();
                runtime.spawn(server.run());
                addr
            })
            .collect();

        Self {
            addrs,
            _runtime: runtime,
        }
    }

    fn stage(&self, name: &str, node: usize, spec: StageSpec) -> StageConfig {
        StageConfig {
            name: name.into(),
            addr: self.addrs[node].to_string(),
            spec,
        }
    }
}

fn range(len: usize) -> Tensor {
    Array::range(0.0, len as f32, 1.0).into_dyn()
}

fn values(t: &Tensor) -> Vec<f32> {
    t.iter().copied().collect()
}

#[test]
fn chain_across_two_nodes() {
    let cluster = Cluster::start(2);
    let affine = |scale, shift| StageSpec::Affine { scale, shift };
    let config = PipelineConfig::new(
        vec![
            cluster.stage("add_one", 0, affine(1.0, 1.0)),
            cluster.stage("double", 1, affine(2.0, 0.0)),
            cluster.stage("sub_two", 0, affine(1.0, -2.0)),
        ],
        RunOptions::with_chunks(3).unwrap(),
    );

    let session = orchestrator::connect(&config).unwrap();
    assert_eq!(session.context().world_size(), 3);

    let graph = config.chain();
    let out = session.run(&graph, vec![Value::Tensor(range(9))]).unwrap();
    let expected: Vec<f32> = (0..9).map(|x| 2.0 * x as f32).collect();
    assert_eq!(values(&out), expected);

    // same result with uneven chunks and the masked splitter
    let opts = RunOptions::with_chunks(4).unwrap().with_debug_mask(true);
    let out = session
        .run_with(&graph, vec![Value::Tensor(range(9))], &opts)
        .unwrap();
    assert_eq!(values(&out), expected);

    for name in ["add_one", "double", "sub_two"] {
        let stats = session.stats(name).unwrap();
        assert_eq!(stats.completed, 7, "stage {name}");
    }

    session.shutdown().unwrap();
}

#[test]
fn projections_and_cross_node_fetches() {
    let cluster = Cluster::start(2);
    let config = PipelineConfig::new(
        vec![
            cluster.stage("fork", 0, StageSpec::Fork { outputs: 2 }),
            cluster.stage("sum", 1, StageSpec::Add),
        ],
        RunOptions::with_chunks(2).unwrap(),
    );
    let session = orchestrator::connect(&config).unwrap();

    let mut graph = StageGraph::new(1);
    let fork = graph.stage("fork", vec![Arg::Input(0)]);
    let left = graph.get_item(fork, 0);
    let right = graph.get_item(fork, 1);
    let scaled = graph.local("scale", vec![Arg::Node(right)], |args, _| {
        let x = args
            .into_iter()
            .next()
            .and_then(Value::into_tensor)
            .ok_or_else(|| anyhow::anyhow!("expected a tensor"))?;
        Ok::<_, anyhow::Error>(Value::Tensor(x * 10.0))
    });
    let sum = graph.stage("sum", vec![Arg::Node(left), Arg::Node(scaled)]);
    graph.set_output(Arg::Node(sum));

    let out = session.run(&graph, vec![Value::Tensor(range(4))]).unwrap();
    assert_eq!(values(&out), [0.0, 11.0, 22.0, 33.0]);

    session.shutdown().unwrap();
}

#[test]
fn failures_stay_in_their_microbatch() {
    let cluster = Cluster::start(1);
    let config = PipelineConfig::new(
        vec![cluster.stage("sum", 0, StageSpec::Add)],
        RunOptions::with_chunks(3).unwrap(),
    );
    let session = orchestrator::connect(&config).unwrap();

    // microbatches of 3, 3 and 4 rows, only the last one disagrees with the constant
    let bias = ArrayD::from_elem(IxDyn(&[3]), 100.0);
    let mut graph = StageGraph::new(1);
    let sum = graph.stage("sum", vec![Arg::Input(0), Arg::Const(Value::Tensor(bias))]);
    graph.set_output(Arg::Node(sum));

    let driver = session.driver(&graph).unwrap();
    let opts = RunOptions::with_chunks(3).unwrap();
    let mut batch = driver.issue(vec![Value::Tensor(range(10))], &opts).unwrap();
    let results = driver.resolve_each(&mut batch);

    assert!(results[0].is_ok());
    assert!(results[1].is_ok());
    match &results[2] {
        Err(PipeError::Execution(e)) => {
            assert_eq!(e.stage, "sum");
            assert_eq!(e.microbatch, Some(2));
        }
        other => panic!("expected an execution error, got {other:?}"),
    }

    let err = session
        .run(&graph, vec![Value::Tensor(range(10))])
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Pipeline(PipeError::Execution(_))
    ));

    drop(driver);
    session.shutdown().unwrap();
}

#[test]
fn unreachable_nodes_fail_to_connect() {
    let cluster = Cluster::start(1);
    let addr = cluster.addrs[0];
    drop(cluster);

    let config = PipelineConfig::new(
        vec![StageConfig {
            name: "relu".into(),
            addr: addr.to_string(),
            spec: StageSpec::Relu,
        }],
        RunOptions::default(),
    );

    assert!(matches!(
        orchestrator::connect(&config),
        Err(OrchestratorError::ConnectionFailed { .. })
    ));
}
