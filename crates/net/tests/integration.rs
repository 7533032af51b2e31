//! Integration test: spin up several replicas with real gRPC, then drive
//! them through a round-robin channel and the fan-out dispatcher.

use fibo_lb::channel::{ChannelSpec, LbChannel};
use fibo_lb::dispatcher::{BatchPlan, DispatchError, FanOutDispatcher, PayloadSource};
use fibo_lb::rpc::{CallRequest, CallValue, ReplicaAddr};
use fibo_lb::selector::SelectionPolicy;
use fibo_net::{build_server, serve_with_grace, GrpcTransport};
use fibo_proto::fibonacci::fibonacci_service_client::FibonacciServiceClient;
use fibo_replica::{CounterModel, Replica, ReplicaIdentity};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Duration;

struct TestReplica {
    addr: SocketAddr,
    replica: Arc<Replica>,
    stop: Option<oneshot::Sender<()>>,
    server: tokio::task::JoinHandle<()>,
}

impl TestReplica {
    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = self.server.await;
    }
}

async fn spawn_replica(port: u16, name: &str, model: CounterModel) -> TestReplica {
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let replica = Arc::new(Replica::new(ReplicaIdentity::new(name, "Normal"), model));
    let router = build_server(replica.clone());

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = stop_rx.await;
        };
        serve_with_grace(router, addr, shutdown, Some(Duration::from_secs(1)))
            .await
            .unwrap();
    });

    // Wait for server to be ready
    tokio::time::sleep(Duration::from_millis(100)).await;

    TestReplica {
        addr,
        replica,
        stop: Some(stop_tx),
        server,
    }
}

/// Fixed high ports; each test uses its own range.
fn test_ports(base: u16, count: u16) -> Vec<u16> {
    (base..base + count).collect()
}

fn round_robin_channel(replicas: &[TestReplica]) -> Arc<LbChannel<GrpcTransport>> {
    let addrs = replicas.iter().map(|r| ReplicaAddr::from(r.addr)).collect();
    Arc::new(LbChannel::new(
        ChannelSpec::fixed(addrs, SelectionPolicy::RoundRobin),
        Arc::new(GrpcTransport::new(Duration::from_secs(2))),
    ))
}

#[tokio::test]
async fn test_single_replica_over_grpc() {
    let ports = test_ports(17400, 1);
    let node = spawn_replica(ports[0], "grpc-server-0", CounterModel::Locked).await;

    let mut client = FibonacciServiceClient::connect(format!("http://{}", node.addr))
        .await
        .unwrap();

    let resp = client
        .increment(fibo_proto::fibonacci::IncrementRequest {
            name: "client".into(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(resp.number, 1);
    assert_eq!(resp.server_name, "grpc-server-0");

    let resp = client
        .fibonacci(fibo_proto::fibonacci::FibonacciRequest { n: 10 })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(resp.value, "55");

    let status = client
        .fibonacci(fibo_proto::fibonacci::FibonacciRequest { n: -1 })
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);

    node.stop().await;
}

#[tokio::test]
async fn test_round_robin_visits_every_replica() {
    let ports = test_ports(17410, 3);
    let mut replicas = Vec::new();
    for (i, port) in ports.iter().enumerate() {
        let name = format!("grpc-server-{}", i);
        replicas.push(spawn_replica(*port, &name, CounterModel::Locked).await);
    }

    let channel = round_robin_channel(&replicas);
    let mut seen: HashMap<String, usize> = HashMap::new();
    for _ in 0..9 {
        let reply = channel
            .call(&CallRequest::Increment { name: "c".into() })
            .await
            .unwrap();
        *seen.entry(reply.server_name).or_default() += 1;
    }

    assert_eq!(seen.len(), 3, "every replica should answer: {:?}", seen);
    for r in &replicas {
        assert_eq!(r.replica.count().await.unwrap(), 3);
    }

    channel.close().await;
    for r in replicas {
        r.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_increments_single_replica() {
    let ports = test_ports(17420, 1);
    let node = spawn_replica(ports[0], "grpc-server-0", CounterModel::Serialized).await;

    let dispatcher = FanOutDispatcher::new(round_robin_channel(std::slice::from_ref(&node)));
    let plan = BatchPlan::new(PayloadSource::Increment { name: "c".into() }, 1000)
        .with_concurrency(64);
    let batch = dispatcher.dispatch(plan).await.unwrap();

    assert_eq!(batch.len(), 1000);
    let numbers: HashSet<i64> = batch
        .iter()
        .map(|r| match r.value {
            CallValue::Count(n) => n,
            ref other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(numbers, (1..=1000).collect::<HashSet<_>>());
    assert_eq!(node.replica.count().await.unwrap(), 1000);

    node.stop().await;
}

#[tokio::test]
async fn test_random_fibonacci_batch_over_grpc() {
    let ports = test_ports(17430, 2);
    let mut replicas = Vec::new();
    for (i, port) in ports.iter().enumerate() {
        let name = format!("grpc-server-{}", i);
        replicas.push(spawn_replica(*port, &name, CounterModel::Locked).await);
    }

    let dispatcher = FanOutDispatcher::new(round_robin_channel(&replicas));
    let plan = BatchPlan::new(PayloadSource::RandomFibonacci { start: 1, end: 90 }, 40)
        .with_concurrency(8);
    let batch = dispatcher.dispatch(plan).await.unwrap();

    assert_eq!(batch.len(), 40);
    let mut servers = HashSet::new();
    for r in batch.iter() {
        let n = r.n.unwrap();
        assert!((1..=90).contains(&n));
        assert_eq!(
            r.value,
            CallValue::Fibonacci(fibo_common::fibonacci(n).to_string())
        );
        servers.insert(r.server.clone());
    }
    assert_eq!(servers.len(), 2);

    for r in replicas {
        r.stop().await;
    }
}

#[tokio::test]
async fn test_batch_against_missing_replica_is_connectivity() {
    let ports = test_ports(17440, 1);
    // Nothing listens on this port.
    let addr = ReplicaAddr::new(format!("127.0.0.1:{}", ports[0]));
    let channel = Arc::new(LbChannel::new(
        ChannelSpec::fixed(vec![addr], SelectionPolicy::Direct),
        Arc::new(GrpcTransport::new(Duration::from_millis(500))),
    ));

    let err = FanOutDispatcher::new(channel)
        .dispatch(BatchPlan::new(PayloadSource::Fibonacci { n: 5 }, 3))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Connectivity { .. }), "{:?}", err);
}

#[tokio::test]
async fn test_graceful_shutdown_releases_port() {
    let ports = test_ports(17450, 1);
    let node = spawn_replica(ports[0], "grpc-server-0", CounterModel::Locked).await;
    let addr = node.addr;
    node.stop().await;

    // The listener is gone once the server task has finished.
    let again = spawn_replica(ports[0], "grpc-server-1", CounterModel::Locked).await;
    let mut client = FibonacciServiceClient::connect(format!("http://{}", addr))
        .await
        .unwrap();
    let resp = client
        .increment(fibo_proto::fibonacci::IncrementRequest { name: "c".into() })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(resp.server_name, "grpc-server-1");
    again.stop().await;
}
