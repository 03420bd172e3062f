//! Store client facade
//!
//! `StoreClient` owns the connection handle to an etcd-compatible store and
//! turns every operation into exactly one RPC. There is no retry, backoff or
//! batching: each call is a single attempt bounded by its [`Deadline`], and
//! failures surface to the caller unchanged.

use crate::deadline::Deadline;
use crate::error::{Result, StoreError};
use crate::pb::etcdserverpb::kv_client::KvClient;
use crate::pb::etcdserverpb::watch_client::WatchClient;
use crate::protocol::{
    delete_request, put_request, range_request, DeleteResponse, GetResponse, KeyRange,
    PutResponse, Txn, TxnResponse,
};
use crate::watch::{WatchOptions, WatchStream};
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};

/// Client configuration
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Store endpoints, tried in order; `host:port` or a full URI
    pub endpoints: Vec<String>,
    /// Time allowed for establishing the connection
    pub dial_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["localhost:2379".to_string()],
            dial_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoints: vec![endpoint.into()],
            ..Default::default()
        }
    }
}

/// Add the `http://` scheme to bare `host:port` endpoints.
pub fn endpoint_uri(endpoint: &str) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    }
}

/// Connection handle plus the store's KV and Watch verbs.
///
/// Cloning is cheap and every clone multiplexes over the same connection,
/// so concurrent tasks can each hold one.
#[derive(Clone, Debug)]
pub struct StoreClient {
    endpoint: String,
    kv: KvClient<Channel>,
    watch: WatchClient<Channel>,
}

impl StoreClient {
    /// Connect to the first reachable endpoint within the dial timeout.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(StoreError::Connection("no endpoints configured".into()));
        }

        let mut last_error = None;
        for endpoint in &config.endpoints {
            let uri = endpoint_uri(endpoint);
            tracing::info!("Connecting to store at {}", uri);

            match dial(&uri, config.dial_timeout).await {
                Ok(channel) => {
                    tracing::info!("Connected to {}", uri);
                    return Ok(Self::from_channel(uri, channel));
                }
                Err(e) => {
                    tracing::warn!("Failed to connect to {}: {}", uri, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| StoreError::Connection("no endpoint reachable".into())))
    }

    /// Wrap an already established channel.
    pub fn from_channel(endpoint: impl Into<String>, channel: Channel) -> Self {
        Self {
            endpoint: endpoint.into(),
            kv: KvClient::new(channel.clone()),
            watch: WatchClient::new(channel),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Store `value` under `key`.
    pub async fn put(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        deadline: Deadline,
    ) -> Result<PutResponse> {
        let key = key.into();
        tracing::debug!("PUT request: key={:?}", String::from_utf8_lossy(&key));

        let request = deadline.request(put_request(key, value.into()))?;
        let mut kv = self.kv.clone();
        let response = deadline
            .run(async move { Ok(kv.put(request).await?.into_inner()) })
            .await?;

        Ok(response.into())
    }

    /// Look up a single key. An absent key yields an empty response.
    pub async fn get(&self, key: impl Into<Vec<u8>>, deadline: Deadline) -> Result<GetResponse> {
        self.get_range(KeyRange::key(key), deadline).await
    }

    pub async fn get_range(&self, range: KeyRange, deadline: Deadline) -> Result<GetResponse> {
        tracing::debug!(
            "GET request: key={:?}",
            String::from_utf8_lossy(range.start())
        );

        let request = deadline.request(range_request(range))?;
        let mut kv = self.kv.clone();
        let response = deadline
            .run(async move { Ok(kv.range(request).await?.into_inner()) })
            .await?;

        Ok(response.into())
    }

    /// Remove a single key, reporting how many records were deleted.
    pub async fn delete(
        &self,
        key: impl Into<Vec<u8>>,
        deadline: Deadline,
    ) -> Result<DeleteResponse> {
        self.delete_range(KeyRange::key(key), deadline).await
    }

    pub async fn delete_range(
        &self,
        range: KeyRange,
        deadline: Deadline,
    ) -> Result<DeleteResponse> {
        tracing::debug!(
            "DELETE request: key={:?}",
            String::from_utf8_lossy(range.start())
        );

        let request = deadline.request(delete_request(range))?;
        let mut kv = self.kv.clone();
        let response = deadline
            .run(async move { Ok(kv.delete_range(request).await?.into_inner()) })
            .await?;

        Ok(response.into())
    }

    /// Commit a compare-and-branch transaction. The store evaluates the
    /// predicates and runs exactly one branch atomically.
    pub async fn transact(&self, txn: Txn, deadline: Deadline) -> Result<TxnResponse> {
        tracing::debug!(
            "TXN request: compares={}, then={}, else={}",
            txn.compares.len(),
            txn.success.len(),
            txn.failure.len()
        );

        let request = deadline.request(crate::pb::etcdserverpb::TxnRequest::from(txn))?;
        let mut kv = self.kv.clone();
        let response = deadline
            .run(async move { Ok(kv.txn(request).await?.into_inner()) })
            .await?;

        Ok(response.into())
    }

    /// Subscribe to changes of a single key until `deadline`.
    pub async fn watch(&self, key: impl Into<Vec<u8>>, deadline: Deadline) -> Result<WatchStream> {
        self.watch_with(KeyRange::key(key), WatchOptions::default(), deadline)
            .await
    }

    pub async fn watch_with(
        &self,
        range: KeyRange,
        options: WatchOptions,
        deadline: Deadline,
    ) -> Result<WatchStream> {
        WatchStream::open(self.watch.clone(), range, options, deadline).await
    }

    /// Release the connection handle.
    pub fn close(self) {
        tracing::info!("Closing connection to {}", self.endpoint);
    }
}

async fn dial(uri: &str, timeout: Duration) -> Result<Channel> {
    let endpoint = Endpoint::from_shared(uri.to_string())
        .map_err(|e| StoreError::Connection(format!("invalid endpoint {}: {}", uri, e)))?
        .connect_timeout(timeout);

    match tokio::time::timeout(timeout, endpoint.connect()).await {
        Ok(Ok(channel)) => Ok(channel),
        Ok(Err(e)) => Err(StoreError::Connection(format!("{}: {}", uri, e))),
        Err(_) => Err(StoreError::Connection(format!(
            "{}: dial timed out after {:?}",
            uri, timeout
        ))),
    }
}
