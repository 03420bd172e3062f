//! Demo scenarios
//!
//! Each function walks through one feature of the store client against a
//! live store and logs what the store answered. Failures are returned to the
//! caller untouched; a scenario never retries.

use crate::client::StoreClient;
use crate::deadline::Deadline;
use crate::protocol::{
    Compare, CompareOp, DeleteResponse, Event, GetResponse, PutResponse, Txn, TxnOp, TxnResponse,
};
use anyhow::{anyhow, Result};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Key shared by the insert, get and watch scenarios
pub const SAMPLE_KEY: &str = "sample_key";
pub const SAMPLE_VALUE: &str = "sample_value";

/// Value written by the watch scenario's mutator task
pub const WATCH_VALUE: &str = "ray";

/// Deadline short enough that the put can never complete
pub const CERTAIN_TIMEOUT: Duration = Duration::from_micros(1);

/// Write the sample key.
pub async fn insert(client: &StoreClient) -> Result<PutResponse> {
    let resp = client
        .put(SAMPLE_KEY, SAMPLE_VALUE, Deadline::after(Duration::from_secs(1)))
        .await?;
    tracing::info!("insert: revision={}", resp.revision);
    Ok(resp)
}

/// Read the sample key back.
pub async fn get(client: &StoreClient) -> Result<GetResponse> {
    let resp = client.get(SAMPLE_KEY, Deadline::none()).await?;
    for kv in &resp.kvs {
        tracing::info!("get: {}", kv);
    }
    if resp.kvs.is_empty() {
        tracing::info!("get: {} is not set", SAMPLE_KEY);
    }
    Ok(resp)
}

/// Write a throwaway key, then delete it.
pub async fn delete(client: &StoreClient) -> Result<DeleteResponse> {
    let put = client.put("del-key", "1", Deadline::none()).await?;
    tracing::info!("insert del-key successfully, revision={}", put.revision);

    let resp = client.delete("del-key", Deadline::none()).await?;
    tracing::info!("delete data: deleted={}, revision={}", resp.deleted, resp.revision);
    Ok(resp)
}

/// Seed `k1` and `k2`, then branch on both of their values in one
/// transaction.
pub async fn txn(client: &StoreClient) -> Result<TxnResponse> {
    // Seeding failures surface through the transaction's predicates.
    if let Err(e) = client.put("k1", "10", Deadline::none()).await {
        tracing::warn!("seeding k1 failed: {}", e);
    }
    if let Err(e) = client.put("k2", "20", Deadline::none()).await {
        tracing::warn!("seeding k2 failed: {}", e);
    }

    let txn = Txn::new()
        .when([
            Compare::value("k1", CompareOp::Equal, "10"),
            Compare::value("k2", CompareOp::Equal, "20"),
        ])
        .and_then([TxnOp::put("txn", "success")])
        .or_else([TxnOp::put("txn", "error")]);

    let resp = client.transact(txn, Deadline::none()).await?;
    tracing::info!("transaction succeeded: {}", resp.succeeded);
    Ok(resp)
}

/// Outcome of the watch scenario
#[derive(Debug)]
pub struct WatchReport {
    /// First batch of events the watcher saw, empty if its deadline passed
    pub events: Vec<Event>,
    /// Acknowledgement of the mutator's put
    pub put: PutResponse,
}

/// Watch the sample key from one task while another task changes it.
///
/// The mutator waits until the watcher is registered. The scenario returns
/// once both tasks have finished, or as soon as either one fails.
pub async fn watch(client: &StoreClient) -> Result<WatchReport> {
    watch_with_deadline(client, Duration::from_secs(60)).await
}

pub async fn watch_with_deadline(client: &StoreClient, timeout: Duration) -> Result<WatchReport> {
    insert(client).await?;

    let (ready_tx, ready_rx) = oneshot::channel();

    let watcher = {
        let client = client.clone();
        tokio::spawn(async move {
            let mut stream = client
                .watch(SAMPLE_KEY, Deadline::after(timeout))
                .await?;
            let _ = ready_tx.send(());

            let events = stream.message().await?.unwrap_or_default();
            for event in &events {
                tracing::info!(
                    "event type: {}, key[{}] value[{}]",
                    event.kind,
                    event.kv.key_str(),
                    event.kv.value_str()
                );
            }
            stream.cancel().await;
            Ok::<_, anyhow::Error>(events)
        })
    };

    let mutator = {
        let client = client.clone();
        tokio::spawn(async move {
            ready_rx
                .await
                .map_err(|_| anyhow!("watcher stopped before it was registered"))?;
            let resp = client.put(SAMPLE_KEY, WATCH_VALUE, Deadline::none()).await?;
            tracing::info!(
                "change {} value to {}, revision={}",
                SAMPLE_KEY,
                WATCH_VALUE,
                resp.revision
            );
            Ok::<_, anyhow::Error>(resp)
        })
    };

    let (events, put) = join_both(watcher, mutator).await?;
    Ok(WatchReport { events, put })
}

/// Wait for both tasks, returning the first failure as soon as it happens.
/// Whichever task is still running at that point is aborted.
async fn join_both<A, B>(
    mut first: JoinHandle<Result<A>>,
    mut second: JoinHandle<Result<B>>,
) -> Result<(A, B)> {
    let joined = tokio::try_join!(async { (&mut first).await? }, async {
        (&mut second).await?
    });
    if joined.is_err() {
        first.abort();
        second.abort();
    }
    joined
}

/// Put with a deadline that has already run out by the time the request
/// could be sent. Always fails with `DeadlineExceeded`.
pub async fn context(client: &StoreClient) -> Result<PutResponse> {
    let resp = client
        .put("context-example", "context", Deadline::after(CERTAIN_TIMEOUT))
        .await?;
    tracing::info!("context: revision={}", resp.revision);
    Ok(resp)
}
