use std::net::SocketAddr;

use comms::{
    PeerClient,
    specs::{PeerSpec, StageSpec},
};
use ndarray::{ArrayD, IxDyn};
use node::NodeServer;
use runtime::{Kwargs, PipeError, RefId, Value, WorkKey};

async fn spawn_node() -> SocketAddr {
    let server = NodeServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

fn tensor(data: Vec<f32>) -> Value {
    let len = data.len();
    Value::Tensor(ArrayD::from_shape_vec(IxDyn(&[len]), data).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invoke_then_fetch() {
    let addr = spawn_node().await;
    let client = PeerClient::connect(addr).await.unwrap();

    client.join(1, 2, Vec::new()).await.unwrap();
    client
        .create_stage(
            "double",
            StageSpec::Affine {
                scale: 2.0,
                shift: 0.0,
            },
        )
        .await
        .unwrap();

    let id = client
        .invoke(
            "double",
            vec![tensor(vec![1., 2., 3.])],
            Kwargs::new(),
            WorkKey::forward(0),
        )
        .await
        .unwrap();
    assert_eq!(id.rank, 1);

    let value = client.fetch(id).await.unwrap().unwrap();
    assert_eq!(value, tensor(vec![2., 4., 6.]));

    let stats = client.stats("double").await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.running + stats.ready + stats.waiting, 0);

    client.release(vec![id]).await.unwrap();
    assert!(matches!(
        client.fetch(id).await,
        Err(PipeError::UnknownRef(gone)) if gone == id
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn requests_are_checked() {
    let addr = spawn_node().await;
    let client = PeerClient::connect(addr).await.unwrap();

    let res = client.create_stage("relu", StageSpec::Relu).await;
    assert!(matches!(res, Err(PipeError::Config(_))));

    client.join(1, 2, Vec::new()).await.unwrap();
    assert!(matches!(
        client.join(1, 2, Vec::new()).await,
        Err(PipeError::Config(_))
    ));

    client.create_stage("relu", StageSpec::Relu).await.unwrap();
    assert!(matches!(
        client.create_stage("relu", StageSpec::Relu).await,
        Err(PipeError::Config(_))
    ));
    assert!(matches!(
        client.create_stage("fork", StageSpec::Fork { outputs: 0 }).await,
        Err(PipeError::Config(_))
    ));

    let res = client
        .invoke("nope", Vec::new(), Kwargs::new(), WorkKey::forward(0))
        .await;
    assert!(matches!(res, Err(PipeError::UnknownStage(name)) if name == "nope"));

    let missing = RefId::new(1, 999);
    assert!(matches!(
        client.fetch(missing).await,
        Err(PipeError::UnknownRef(id)) if id == missing
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stage_failures_reach_the_fetcher() {
    let addr = spawn_node().await;
    let client = PeerClient::connect(addr).await.unwrap();

    client.join(1, 2, Vec::new()).await.unwrap();
    client.create_stage("relu", StageSpec::Relu).await.unwrap();

    let id = client
        .invoke(
            "relu",
            vec![Value::Str("not a tensor".into())],
            Kwargs::new(),
            WorkKey::forward(3),
        )
        .await
        .unwrap();

    let err = client.fetch(id).await.unwrap().unwrap_err();
    assert_eq!(err.stage, "relu");
    assert_eq!(err.microbatch, Some(3));

    // the worker keeps serving after a failure
    let id = client
        .invoke(
            "relu",
            vec![tensor(vec![-1., 1.])],
            Kwargs::new(),
            WorkKey::forward(4),
        )
        .await
        .unwrap();
    assert_eq!(client.fetch(id).await.unwrap().unwrap(), tensor(vec![0., 1.]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nodes_resolve_each_others_references() {
    let first = spawn_node().await;
    let second = spawn_node().await;
    let peers = vec![
        PeerSpec {
            rank: 1,
            addr: first,
        },
        PeerSpec {
            rank: 2,
            addr: second,
        },
    ];

    let one = PeerClient::connect(first).await.unwrap();
    let two = PeerClient::connect(second).await.unwrap();
    one.join(1, 3, peers.clone()).await.unwrap();
    two.join(2, 3, peers).await.unwrap();

    one.create_stage("fork", StageSpec::Fork { outputs: 2 })
        .await
        .unwrap();
    two.create_stage("sum", StageSpec::Add).await.unwrap();

    let forked = one
        .invoke(
            "fork",
            vec![tensor(vec![1., 2.])],
            Kwargs::new(),
            WorkKey::forward(0),
        )
        .await
        .unwrap();
    let left = one.project(forked, 0).await.unwrap();
    let right = one.project(forked, 1).await.unwrap();

    let sum = two
        .invoke(
            "sum",
            vec![Value::Deferred(left), Value::Deferred(right)],
            Kwargs::new(),
            WorkKey::forward(0),
        )
        .await
        .unwrap();
    assert_eq!(sum.rank, 2);
    assert_eq!(two.fetch(sum).await.unwrap().unwrap(), tensor(vec![2., 4.]));

    let bad = one.project(forked, 5).await.unwrap();
    let failed = two
        .invoke(
            "sum",
            vec![Value::Deferred(bad)],
            Kwargs::new(),
            WorkKey::forward(1),
        )
        .await
        .unwrap();
    let direct = one.fetch(bad).await.unwrap().unwrap_err();
    let through = two.fetch(failed).await.unwrap().unwrap_err();
    assert_eq!(direct, through);
}
