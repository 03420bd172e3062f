//! Integration tests for the store client against the development store

use etcd_tour::client::{ClientConfig, StoreClient};
use etcd_tour::devstore::{DevStore, DevStoreConfig};
use etcd_tour::protocol::{
    Compare, CompareOp, EventKind, KeyRange, Txn, TxnOp, TxnOpResponse,
};
use etcd_tour::pb::etcdserverpb::watch_server::{Watch, WatchServer};
use etcd_tour::pb::etcdserverpb::{WatchRequest, WatchResponse};
use etcd_tour::watch::WatchOptions;
use etcd_tour::{scenarios, Deadline, StoreError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

/// Find an available port for testing
fn find_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a development store in the background and connect a client to it
async fn start_store() -> (StoreClient, JoinHandle<()>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("etcd_tour=debug")
        .try_init();

    let port = find_available_port();
    let listen_addr = format!("127.0.0.1:{}", port);

    let store = DevStore::new(DevStoreConfig {
        listen_addr: listen_addr.clone(),
        ..Default::default()
    });
    let (kv, watch) = store.into_services();

    let server_handle = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(kv)
            .add_service(watch)
            .serve(listen_addr.parse().unwrap())
            .await
            .unwrap();
    });

    // Wait for server to start
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = StoreClient::connect(ClientConfig {
        endpoints: vec![format!("127.0.0.1:{}", port)],
        dial_timeout: Duration::from_secs(5),
    })
    .await
    .unwrap();

    (client, server_handle)
}

#[tokio::test]
async fn test_put_get_delete() {
    let (client, server_handle) = start_store().await;

    let put = client
        .put("sample_key", "sample_value", Deadline::after(Duration::from_secs(1)))
        .await
        .unwrap();
    assert!(put.revision > 1);

    let got = client.get("sample_key", Deadline::none()).await.unwrap();
    let values: Vec<&[u8]> = got.values().collect();
    assert_eq!(values, vec![b"sample_value".as_slice()]);
    assert_eq!(got.first().unwrap().mod_revision, put.revision);

    let deleted = client.delete("sample_key", Deadline::none()).await.unwrap();
    assert_eq!(deleted.deleted, 1);

    let got = client.get("sample_key", Deadline::none()).await.unwrap();
    assert!(got.kvs.is_empty());
    assert_eq!(got.count, 0);

    // Deleting again removes nothing and is not an error
    let deleted = client.delete("sample_key", Deadline::none()).await.unwrap();
    assert_eq!(deleted.deleted, 0);

    client.close();
    server_handle.abort();
}

#[tokio::test]
async fn test_absent_key_is_empty_not_error() {
    let (client, server_handle) = start_store().await;

    let got = client.get("nonexistent", Deadline::none()).await.unwrap();
    assert!(got.kvs.is_empty());

    server_handle.abort();
}

#[tokio::test]
async fn test_range_operations() {
    let (client, server_handle) = start_store().await;

    for (key, value) in [("app/a", "1"), ("app/b", "2"), ("other", "3")] {
        client.put(key, value, Deadline::none()).await.unwrap();
    }

    let got = client
        .get_range(KeyRange::prefix("app/"), Deadline::none())
        .await
        .unwrap();
    assert_eq!(got.count, 2);
    assert_eq!(got.kvs[0].key, b"app/a");
    assert_eq!(got.kvs[1].key, b"app/b");

    let deleted = client
        .delete_range(KeyRange::prefix("app/"), Deadline::none())
        .await
        .unwrap();
    assert_eq!(deleted.deleted, 2);

    let got = client
        .get_range(KeyRange::all(), Deadline::none())
        .await
        .unwrap();
    assert_eq!(got.count, 1);
    assert_eq!(got.kvs[0].key, b"other");

    server_handle.abort();
}

#[tokio::test]
async fn test_expired_deadline_never_applies() {
    let (client, server_handle) = start_store().await;

    let expired = Deadline::at(tokio::time::Instant::now() - Duration::from_millis(10));
    let err = client.put("late", "value", expired).await.unwrap_err();
    assert!(matches!(err, StoreError::DeadlineExceeded));

    let got = client.get("late", Deadline::none()).await.unwrap();
    assert!(got.kvs.is_empty());

    server_handle.abort();
}

#[tokio::test]
async fn test_transaction_branches() {
    let (client, server_handle) = start_store().await;

    client.put("k1", "10", Deadline::none()).await.unwrap();
    client.put("k2", "20", Deadline::none()).await.unwrap();

    let txn = |expected_k2: &str| {
        Txn::new()
            .when([
                Compare::value("k1", CompareOp::Equal, "10"),
                Compare::value("k2", CompareOp::Equal, expected_k2),
            ])
            .and_then([TxnOp::put("txn", "success"), TxnOp::get("txn")])
            .or_else([TxnOp::put("txn", "error")])
    };

    // All predicates hold: only the then-branch runs
    let resp = client.transact(txn("20"), Deadline::none()).await.unwrap();
    assert!(resp.succeeded);
    assert_eq!(resp.responses.len(), 2);
    match &resp.responses[1] {
        TxnOpResponse::Get(get) => assert_eq!(get.kvs[0].value, b"success"),
        other => panic!("unexpected response: {other:?}"),
    }

    // One predicate fails: only the else-branch runs
    let resp = client.transact(txn("21"), Deadline::none()).await.unwrap();
    assert!(!resp.succeeded);
    assert_eq!(resp.responses.len(), 1);
    assert!(matches!(resp.responses[0], TxnOpResponse::Put(_)));

    let got = client.get("txn", Deadline::none()).await.unwrap();
    assert_eq!(got.kvs[0].value, b"error");

    server_handle.abort();
}

#[tokio::test]
async fn test_transaction_on_revisions() {
    let (client, server_handle) = start_store().await;

    let put = client.put("versioned", "v1", Deadline::none()).await.unwrap();

    let resp = client
        .transact(
            Txn::new()
                .when([Compare::mod_revision("versioned", CompareOp::Equal, put.revision)])
                .and_then([TxnOp::put("versioned", "v2")]),
            Deadline::none(),
        )
        .await
        .unwrap();
    assert!(resp.succeeded);

    // The revision moved on, so the same guard now fails
    let resp = client
        .transact(
            Txn::new()
                .when([Compare::mod_revision("versioned", CompareOp::Equal, put.revision)])
                .and_then([TxnOp::put("versioned", "v3")]),
            Deadline::none(),
        )
        .await
        .unwrap();
    assert!(!resp.succeeded);

    let got = client.get("versioned", Deadline::none()).await.unwrap();
    assert_eq!(got.kvs[0].value, b"v2");
    assert_eq!(got.kvs[0].version, 2);

    server_handle.abort();
}

#[tokio::test]
async fn test_invalid_request_is_store_error() {
    let (client, server_handle) = start_store().await;

    let err = client.put("", "value", Deadline::none()).await.unwrap_err();
    match err {
        StoreError::Store { code, .. } => assert_eq!(code, tonic::Code::InvalidArgument),
        other => panic!("unexpected error: {other:?}"),
    }

    server_handle.abort();
}

#[tokio::test]
async fn test_watch_delivers_later_put() {
    let (client, server_handle) = start_store().await;

    client.put("watched", "before", Deadline::none()).await.unwrap();

    let mut stream = client
        .watch("watched", Deadline::after(Duration::from_secs(5)))
        .await
        .unwrap();

    let put = client.put("watched", "after", Deadline::none()).await.unwrap();
    client.put("unrelated", "x", Deadline::none()).await.unwrap();

    let events = stream.message().await.unwrap().expect("expected events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Put);
    assert_eq!(events[0].kv.key, b"watched");
    assert_eq!(events[0].kv.value, b"after");
    assert_eq!(events[0].kv.mod_revision, put.revision);

    client.delete("watched", Deadline::none()).await.unwrap();
    let event = stream.next().await.unwrap().expect("expected delete event");
    assert_eq!(event.kind, EventKind::Delete);

    stream.cancel().await;
    server_handle.abort();
}

#[tokio::test]
async fn test_watch_ends_quietly_at_deadline() {
    let (client, server_handle) = start_store().await;

    let mut stream = client
        .watch("quiet", Deadline::after(Duration::from_millis(200)))
        .await
        .unwrap();

    let batch = stream.message().await.unwrap();
    assert!(batch.is_none());
    assert!(stream.is_done());

    server_handle.abort();
}

#[tokio::test]
async fn test_watch_prefix_with_prev_kv_in_order() {
    let (client, server_handle) = start_store().await;

    client.put("cfg/a", "0", Deadline::none()).await.unwrap();

    let mut stream = client
        .watch_with(
            KeyRange::prefix("cfg/"),
            WatchOptions {
                prev_kv: true,
                ..Default::default()
            },
            Deadline::after(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    for value in ["1", "2", "3"] {
        client.put("cfg/a", value, Deadline::none()).await.unwrap();
    }

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let event = stream.next().await.unwrap().expect("expected event");
        seen.push(event);
    }

    let values: Vec<_> = seen.iter().map(|e| e.kv.value_str().into_owned()).collect();
    assert_eq!(values, vec!["1", "2", "3"]);
    assert!(seen.windows(2).all(|w| w[0].kv.mod_revision < w[1].kv.mod_revision));
    assert_eq!(seen[0].prev_kv.as_ref().unwrap().value, b"0");

    server_handle.abort();
}

#[tokio::test]
async fn test_concurrent_clients_share_connection() {
    let (client, server_handle) = start_store().await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let key = format!("client_{}_key", i);
            client.put(key.clone(), format!("value_{}", i), Deadline::none()).await.unwrap();
            client.get(key, Deadline::none()).await.unwrap()
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let got = handle.await.unwrap();
        assert_eq!(got.kvs[0].value_str(), format!("value_{}", i));
    }

    server_handle.abort();
}

#[tokio::test]
async fn test_insert_then_get_scenario() {
    let (client, server_handle) = start_store().await;

    scenarios::insert(&client).await.unwrap();
    let got = scenarios::get(&client).await.unwrap();
    let values: Vec<_> = got.kvs.iter().map(|kv| kv.value_str().into_owned()).collect();
    assert_eq!(values, vec![scenarios::SAMPLE_VALUE]);

    server_handle.abort();
}

#[tokio::test]
async fn test_delete_scenario() {
    let (client, server_handle) = start_store().await;

    let resp = scenarios::delete(&client).await.unwrap();
    assert_eq!(resp.deleted, 1);
    assert!(client.get("del-key", Deadline::none()).await.unwrap().kvs.is_empty());

    server_handle.abort();
}

#[tokio::test]
async fn test_txn_scenario_takes_then_branch() {
    let (client, server_handle) = start_store().await;

    let resp = scenarios::txn(&client).await.unwrap();
    assert!(resp.succeeded);

    let got = client.get("txn", Deadline::none()).await.unwrap();
    assert_eq!(got.kvs[0].value, b"success");

    server_handle.abort();
}

#[tokio::test]
async fn test_watch_scenario() {
    let (client, server_handle) = start_store().await;

    let report = scenarios::watch_with_deadline(&client, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(report.events.len(), 1);
    assert_eq!(report.events[0].kv.value, scenarios::WATCH_VALUE.as_bytes());
    assert_eq!(report.events[0].kv.mod_revision, report.put.revision);

    server_handle.abort();
}

#[tokio::test]
async fn test_context_scenario_exceeds_deadline() {
    let (client, server_handle) = start_store().await;

    let err = scenarios::context(&client).await.unwrap_err();
    let store_err = err.downcast_ref::<StoreError>().expect("store error");
    assert!(store_err.is_deadline_exceeded());

    let got = client.get("context-example", Deadline::none()).await.unwrap();
    assert!(got.kvs.is_empty());

    server_handle.abort();
}

#[tokio::test]
async fn test_connect_skips_unreachable_endpoint() {
    let (client, server_handle) = start_store().await;
    let reachable = client.endpoint().trim_start_matches("http://").to_string();
    let unreachable = format!("127.0.0.1:{}", find_available_port());

    let client = StoreClient::connect(ClientConfig {
        endpoints: vec![unreachable, reachable.clone()],
        dial_timeout: Duration::from_millis(500),
    })
    .await
    .unwrap();
    assert_eq!(client.endpoint(), format!("http://{}", reachable));

    client.put("failover", "ok", Deadline::none()).await.unwrap();
    let got = client.get("failover", Deadline::none()).await.unwrap();
    assert_eq!(got.kvs[0].value, b"ok");

    server_handle.abort();
}

#[tokio::test]
async fn test_transaction_writing_key_twice_is_rejected() {
    let (client, server_handle) = start_store().await;

    let err = client
        .transact(
            Txn::new().and_then([TxnOp::put("twice", "1"), TxnOp::put("twice", "2")]),
            Deadline::none(),
        )
        .await
        .unwrap_err();
    match err {
        StoreError::Store { code, .. } => assert_eq!(code, tonic::Code::InvalidArgument),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(client.get("twice", Deadline::none()).await.unwrap().kvs.is_empty());

    server_handle.abort();
}

/// Watch service that hangs up without acknowledging any watcher
struct HangUpWatch;

#[tonic::async_trait]
impl Watch for HangUpWatch {
    type WatchStream = ReceiverStream<Result<WatchResponse, Status>>;

    async fn watch(
        &self,
        _request: Request<Streaming<WatchRequest>>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[tokio::test]
async fn test_watch_closed_before_creation_is_connection_error() {
    let port = find_available_port();
    let listen_addr = format!("127.0.0.1:{}", port);
    let addr = listen_addr.parse().unwrap();

    let server_handle = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(WatchServer::new(HangUpWatch))
            .serve(addr)
            .await
            .unwrap();
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = StoreClient::connect(ClientConfig::new(listen_addr)).await.unwrap();
    let err = client
        .watch("anything", Deadline::after(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Connection(_)), "unexpected error: {err:?}");

    server_handle.abort();
}
