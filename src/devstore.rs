//! In-memory development store
//!
//! A single-node implementation of the etcd v3 KV and Watch services, used
//! as a local demo target and by the integration tests. It keeps only the
//! latest value of every key: revisions, transactions and watches behave like
//! etcd, but there is no history, no leases, and no replication.

use crate::pb::etcdserverpb::kv_server::{Kv, KvServer};
use crate::pb::etcdserverpb::range_request::{SortOrder, SortTarget};
use crate::pb::etcdserverpb::watch_create_request::FilterType;
use crate::pb::etcdserverpb::watch_request::RequestUnion;
use crate::pb::etcdserverpb::watch_server::{Watch, WatchServer};
use crate::pb::etcdserverpb::{
    compare, request_op, response_op, Compare, DeleteRangeRequest, DeleteRangeResponse,
    PutRequest, PutResponse, RangeRequest, RangeResponse, RequestOp, ResponseHeader, ResponseOp,
    TxnRequest, TxnResponse, WatchCreateRequest, WatchRequest, WatchResponse,
};
use crate::pb::mvccpb::{event::EventType, Event, KeyValue};
use crate::protocol::range_contains;
use anyhow::Result;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

/// Development store configuration
#[derive(Clone, Debug)]
pub struct DevStoreConfig {
    /// gRPC listen address
    pub listen_addr: String,
    /// Revisions buffered for watchers before a slow watcher is cancelled
    pub watch_buffer: usize,
    /// Reported in every response header
    pub cluster_id: u64,
    /// Reported in every response header
    pub member_id: u64,
}

impl Default for DevStoreConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:2379".to_string(),
            watch_buffer: 1024,
            cluster_id: 1,
            member_id: 1,
        }
    }
}

/// All events produced by one revision.
#[derive(Debug)]
struct RevisionEvents {
    revision: i64,
    events: Vec<Event>,
}

/// Latest value per key plus the current revision.
#[derive(Debug)]
struct StoreState {
    revision: i64,
    data: BTreeMap<Vec<u8>, KeyValue>,
}

impl StoreState {
    fn new() -> Self {
        // etcd starts counting at 1 for an empty store
        Self {
            revision: 1,
            data: BTreeMap::new(),
        }
    }

    fn scan<'a>(
        &'a self,
        key: &'a [u8],
        range_end: &'a [u8],
    ) -> Box<dyn Iterator<Item = &'a KeyValue> + 'a> {
        if range_end.is_empty() {
            return Box::new(self.data.get(key).into_iter());
        }
        let upper = if range_end == [0] {
            Bound::Unbounded
        } else if key >= range_end {
            return Box::new(std::iter::empty());
        } else {
            Bound::Excluded(range_end)
        };
        Box::new(
            self.data
                .range::<[u8], _>((Bound::Included(key), upper))
                .map(|(_, kv)| kv),
        )
    }

    fn range(&self, req: &RangeRequest) -> Result<RangeResponse, Status> {
        if req.revision > self.revision {
            return Err(Status::out_of_range(
                "mvcc: required revision is a future revision",
            ));
        }
        if req.revision > 0 && req.revision < self.revision {
            return Err(Status::unimplemented(
                "reads at a past revision are not supported",
            ));
        }

        let mut kvs: Vec<KeyValue> = self
            .scan(&req.key, &req.range_end)
            .filter(|kv| {
                (req.min_mod_revision == 0 || kv.mod_revision >= req.min_mod_revision)
                    && (req.max_mod_revision == 0 || kv.mod_revision <= req.max_mod_revision)
                    && (req.min_create_revision == 0
                        || kv.create_revision >= req.min_create_revision)
                    && (req.max_create_revision == 0
                        || kv.create_revision <= req.max_create_revision)
            })
            .cloned()
            .collect();

        sort_kvs(&mut kvs, req.sort_order, req.sort_target);

        let count = kvs.len() as i64;
        let mut more = false;
        if req.limit > 0 && count > req.limit {
            kvs.truncate(req.limit as usize);
            more = true;
        }
        if req.count_only {
            kvs.clear();
        } else if req.keys_only {
            for kv in &mut kvs {
                kv.value.clear();
            }
        }

        Ok(RangeResponse {
            header: None,
            kvs,
            more,
            count,
        })
    }

    fn put(&mut self, revision: i64, req: &PutRequest, events: &mut Vec<Event>) -> PutResponse {
        let prev = self.data.get(&req.key).cloned();
        let kv = KeyValue {
            key: req.key.clone(),
            create_revision: prev.as_ref().map_or(revision, |p| p.create_revision),
            mod_revision: revision,
            version: prev.as_ref().map_or(1, |p| p.version + 1),
            value: req.value.clone(),
            lease: req.lease,
        };
        self.data.insert(req.key.clone(), kv.clone());

        events.push(Event {
            r#type: EventType::Put as i32,
            kv: Some(kv),
            prev_kv: prev.clone(),
        });

        PutResponse {
            header: None,
            prev_kv: if req.prev_kv { prev } else { None },
        }
    }

    fn delete_range(
        &mut self,
        revision: i64,
        req: &DeleteRangeRequest,
        events: &mut Vec<Event>,
    ) -> DeleteRangeResponse {
        let keys: Vec<Vec<u8>> = self
            .scan(&req.key, &req.range_end)
            .map(|kv| kv.key.clone())
            .collect();

        let mut prev_kvs = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(prev) = self.data.remove(&key) {
                events.push(Event {
                    r#type: EventType::Delete as i32,
                    kv: Some(KeyValue {
                        key,
                        mod_revision: revision,
                        ..Default::default()
                    }),
                    prev_kv: Some(prev.clone()),
                });
                prev_kvs.push(prev);
            }
        }

        DeleteRangeResponse {
            header: None,
            deleted: prev_kvs.len() as i64,
            prev_kvs: if req.prev_kv { prev_kvs } else { Vec::new() },
        }
    }

    /// Revert uncommitted changes. Every event carries the record it
    /// replaced, so replaying them backwards restores the previous data.
    fn undo(&mut self, events: Vec<Event>) {
        for event in events.into_iter().rev() {
            let Some(kv) = event.kv else { continue };
            match event.prev_kv {
                Some(prev) => {
                    self.data.insert(kv.key, prev);
                }
                None => {
                    self.data.remove(&kv.key);
                }
            }
        }
    }

    /// Every key in the compare's range must satisfy it. A missing key
    /// compares as an empty record, except that a value compare fails.
    fn compare(&self, cmp: &Compare) -> bool {
        let mut matched = self.scan(&cmp.key, &cmp.range_end).peekable();
        if matched.peek().is_none() {
            if matches!(cmp.target_union, Some(compare::TargetUnion::Value(_))) {
                return false;
            }
            return compare_kv(cmp, &KeyValue::default());
        }
        matched.all(|kv| compare_kv(cmp, kv))
    }

    fn txn(
        &mut self,
        revision: i64,
        req: &TxnRequest,
        events: &mut Vec<Event>,
    ) -> Result<TxnResponse, Status> {
        let succeeded = req.compare.iter().all(|cmp| self.compare(cmp));
        let branch = if succeeded { &req.success } else { &req.failure };

        let mut responses = Vec::with_capacity(branch.len());
        for op in branch {
            let response = match &op.request {
                Some(request_op::Request::RequestRange(r)) => {
                    response_op::Response::ResponseRange(self.range(r)?)
                }
                Some(request_op::Request::RequestPut(r)) => {
                    response_op::Response::ResponsePut(self.put(revision, r, events))
                }
                Some(request_op::Request::RequestDeleteRange(r)) => {
                    response_op::Response::ResponseDeleteRange(self.delete_range(
                        revision, r, events,
                    ))
                }
                Some(request_op::Request::RequestTxn(r)) => {
                    response_op::Response::ResponseTxn(self.txn(revision, r, events)?)
                }
                None => return Err(Status::invalid_argument("empty transaction operation")),
            };
            responses.push(ResponseOp {
                response: Some(response),
            });
        }

        Ok(TxnResponse {
            header: None,
            succeeded,
            responses,
        })
    }
}

fn compare_kv(cmp: &Compare, kv: &KeyValue) -> bool {
    let ordering = match &cmp.target_union {
        Some(compare::TargetUnion::Version(v)) => kv.version.cmp(v),
        Some(compare::TargetUnion::CreateRevision(r)) => kv.create_revision.cmp(r),
        Some(compare::TargetUnion::ModRevision(r)) => kv.mod_revision.cmp(r),
        Some(compare::TargetUnion::Value(v)) => kv.value.as_slice().cmp(v.as_slice()),
        Some(compare::TargetUnion::Lease(l)) => kv.lease.cmp(l),
        None => return false,
    };
    match compare::CompareResult::try_from(cmp.result) {
        Ok(compare::CompareResult::Equal) => ordering == Ordering::Equal,
        Ok(compare::CompareResult::Greater) => ordering == Ordering::Greater,
        Ok(compare::CompareResult::Less) => ordering == Ordering::Less,
        Ok(compare::CompareResult::NotEqual) => ordering != Ordering::Equal,
        Err(_) => false,
    }
}

fn sort_kvs(kvs: &mut [KeyValue], order: i32, target: i32) {
    let order = SortOrder::try_from(order).unwrap_or(SortOrder::None);
    let target = SortTarget::try_from(target).unwrap_or(SortTarget::Key);

    // Scans already come back in ascending key order.
    if order == SortOrder::None && target == SortTarget::Key {
        return;
    }

    match target {
        SortTarget::Key => kvs.sort_by(|a, b| a.key.cmp(&b.key)),
        SortTarget::Version => kvs.sort_by_key(|kv| kv.version),
        SortTarget::Create => kvs.sort_by_key(|kv| kv.create_revision),
        SortTarget::Mod => kvs.sort_by_key(|kv| kv.mod_revision),
        SortTarget::Value => kvs.sort_by(|a, b| a.value.cmp(&b.value)),
    }
    if order == SortOrder::Descend {
        kvs.reverse();
    }
}

fn check_key(key: &[u8]) -> Result<(), Status> {
    if key.is_empty() {
        return Err(Status::invalid_argument("key is not provided"));
    }
    Ok(())
}

fn check_txn(req: &TxnRequest) -> Result<(), Status> {
    for cmp in &req.compare {
        check_key(&cmp.key)?;
    }
    for branch in [&req.success, &req.failure] {
        for op in branch {
            check_op(op)?;
        }
        branch_puts(branch)?;
    }
    Ok(())
}

fn duplicate_key() -> Status {
    Status::invalid_argument("duplicate key given in txn request")
}

/// Keys written by one branch, nested transactions included. Along any path
/// through the transaction a key is written at most once, and never both put
/// and deleted.
fn branch_puts(ops: &[RequestOp]) -> Result<HashSet<Vec<u8>>, Status> {
    let mut puts = HashSet::new();
    for op in ops {
        if let Some(request_op::Request::RequestPut(r)) = &op.request {
            if !puts.insert(r.key.clone()) {
                return Err(duplicate_key());
            }
        }
    }

    for op in ops {
        if let Some(request_op::Request::RequestTxn(r)) = &op.request {
            let mut nested = HashSet::new();
            for branch in [&r.success, &r.failure] {
                let keys = branch_puts(branch)?;
                if keys.iter().any(|key| puts.contains(key)) {
                    return Err(duplicate_key());
                }
                nested.extend(keys);
            }
            puts.extend(nested);
        }
    }

    for op in ops {
        if let Some(request_op::Request::RequestDeleteRange(r)) = &op.request {
            if puts.iter().any(|key| range_contains(&r.key, &r.range_end, key)) {
                return Err(duplicate_key());
            }
        }
    }

    Ok(puts)
}

fn check_op(op: &RequestOp) -> Result<(), Status> {
    match &op.request {
        Some(request_op::Request::RequestRange(r)) => check_key(&r.key),
        Some(request_op::Request::RequestPut(r)) => check_key(&r.key),
        Some(request_op::Request::RequestDeleteRange(r)) => check_key(&r.key),
        Some(request_op::Request::RequestTxn(r)) => check_txn(r),
        None => Err(Status::invalid_argument("empty transaction operation")),
    }
}

fn stamp_txn(resp: &mut TxnResponse, header: &ResponseHeader) {
    resp.header = Some(header.clone());
    for op in &mut resp.responses {
        match &mut op.response {
            Some(response_op::Response::ResponseRange(r)) => r.header = Some(header.clone()),
            Some(response_op::Response::ResponsePut(r)) => r.header = Some(header.clone()),
            Some(response_op::Response::ResponseDeleteRange(r)) => {
                r.header = Some(header.clone())
            }
            Some(response_op::Response::ResponseTxn(r)) => stamp_txn(r, header),
            None => {}
        }
    }
}

/// In-memory etcd-compatible store
pub struct DevStore {
    config: DevStoreConfig,
    state: Mutex<StoreState>,
    /// Fan-out of committed revisions to watch streams
    events: broadcast::Sender<Arc<RevisionEvents>>,
}

impl DevStore {
    /// Create an empty store
    pub fn new(config: DevStoreConfig) -> Self {
        let (events, _) = broadcast::channel(config.watch_buffer.max(1));
        Self {
            config,
            state: Mutex::new(StoreState::new()),
            events,
        }
    }

    /// Get the gRPC services for this store
    pub fn into_services(self) -> (KvServer<KvService>, WatchServer<WatchService>) {
        let inner = Arc::new(self);
        (
            KvServer::new(KvService {
                inner: inner.clone(),
            }),
            WatchServer::new(WatchService { inner }),
        )
    }

    /// Get the listen address
    pub fn listen_addr(&self) -> &str {
        &self.config.listen_addr
    }

    /// Current store revision
    pub fn revision(&self) -> i64 {
        self.state.lock().revision
    }

    fn header(&self, revision: i64) -> ResponseHeader {
        ResponseHeader {
            cluster_id: self.config.cluster_id,
            member_id: self.config.member_id,
            revision,
            raft_term: 1,
        }
    }

    /// Run a mutation at the next revision. The revision is only consumed
    /// when the mutation produced events; those are published while the
    /// lock is held so watchers see revisions in order. A failed mutation
    /// leaves the store exactly as it found it.
    fn write<T>(
        &self,
        apply: impl FnOnce(&mut StoreState, i64, &mut Vec<Event>) -> Result<T, Status>,
    ) -> Result<(T, i64), Status> {
        let mut state = self.state.lock();
        let next = state.revision + 1;
        let mut events = Vec::new();
        let out = match apply(&mut state, next, &mut events) {
            Ok(out) => out,
            Err(status) => {
                state.undo(events);
                return Err(status);
            }
        };

        if !events.is_empty() {
            state.revision = next;
            // No receivers just means nobody is watching.
            let _ = self.events.send(Arc::new(RevisionEvents {
                revision: next,
                events,
            }));
        }

        Ok((out, state.revision))
    }

    pub fn range(&self, req: &RangeRequest) -> Result<RangeResponse, Status> {
        check_key(&req.key)?;
        let state = self.state.lock();
        let mut resp = state.range(req)?;
        resp.header = Some(self.header(state.revision));
        Ok(resp)
    }

    pub fn put(&self, req: &PutRequest) -> Result<PutResponse, Status> {
        check_key(&req.key)?;
        let (mut resp, revision) =
            self.write(|state, rev, events| Ok(state.put(rev, req, events)))?;
        resp.header = Some(self.header(revision));
        Ok(resp)
    }

    pub fn delete_range(&self, req: &DeleteRangeRequest) -> Result<DeleteRangeResponse, Status> {
        check_key(&req.key)?;
        let (mut resp, revision) =
            self.write(|state, rev, events| Ok(state.delete_range(rev, req, events)))?;
        resp.header = Some(self.header(revision));
        Ok(resp)
    }

    pub fn txn(&self, req: &TxnRequest) -> Result<TxnResponse, Status> {
        check_txn(req)?;
        let (mut resp, revision) = self.write(|state, rev, events| state.txn(rev, req, events))?;
        stamp_txn(&mut resp, &self.header(revision));
        Ok(resp)
    }
}

/// gRPC KV service implementation wrapper
pub struct KvService {
    inner: Arc<DevStore>,
}

#[tonic::async_trait]
impl Kv for KvService {
    async fn range(
        &self,
        request: Request<RangeRequest>,
    ) -> Result<Response<RangeResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!("RANGE request: key={:?}", String::from_utf8_lossy(&req.key));
        self.inner.range(&req).map(Response::new)
    }

    async fn put(&self, request: Request<PutRequest>) -> Result<Response<PutResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!("PUT request: key={:?}", String::from_utf8_lossy(&req.key));
        self.inner.put(&req).map(Response::new)
    }

    async fn delete_range(
        &self,
        request: Request<DeleteRangeRequest>,
    ) -> Result<Response<DeleteRangeResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!("DELETE request: key={:?}", String::from_utf8_lossy(&req.key));
        let resp = self.inner.delete_range(&req)?;
        tracing::debug!("DELETE removed {} keys", resp.deleted);
        Ok(Response::new(resp))
    }

    async fn txn(&self, request: Request<TxnRequest>) -> Result<Response<TxnResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(
            "TXN request: compares={}, success={}, failure={}",
            req.compare.len(),
            req.success.len(),
            req.failure.len()
        );
        let resp = self.inner.txn(&req)?;
        tracing::debug!("TXN succeeded={}", resp.succeeded);
        Ok(Response::new(resp))
    }
}

/// One registered watcher on a stream
struct Watcher {
    key: Vec<u8>,
    range_end: Vec<u8>,
    /// Only revisions after this one are delivered
    after_revision: i64,
    prev_kv: bool,
    no_put: bool,
    no_delete: bool,
}

impl Watcher {
    fn from_request(req: WatchCreateRequest, after_revision: i64) -> Self {
        let filters: Vec<FilterType> = req.filters().collect();
        Self {
            key: req.key,
            range_end: req.range_end,
            after_revision,
            prev_kv: req.prev_kv,
            no_put: filters.contains(&FilterType::Noput),
            no_delete: filters.contains(&FilterType::Nodelete),
        }
    }

    fn select(&self, batch: &RevisionEvents) -> Vec<Event> {
        if batch.revision <= self.after_revision {
            return Vec::new();
        }
        batch
            .events
            .iter()
            .filter(|event| {
                let key = event.kv.as_ref().map(|kv| kv.key.as_slice()).unwrap_or_default();
                if !range_contains(&self.key, &self.range_end, key) {
                    return false;
                }
                match EventType::try_from(event.r#type) {
                    Ok(EventType::Put) => !self.no_put,
                    Ok(EventType::Delete) => !self.no_delete,
                    Err(_) => false,
                }
            })
            .map(|event| {
                let mut event = event.clone();
                if !self.prev_kv {
                    event.prev_kv = None;
                }
                event
            })
            .collect()
    }
}

/// gRPC Watch service implementation wrapper
pub struct WatchService {
    inner: Arc<DevStore>,
}

type WatchSender = mpsc::Sender<Result<WatchResponse, Status>>;

impl WatchService {
    /// Serve one client stream until either side goes away.
    async fn serve_stream(
        inner: Arc<DevStore>,
        mut inbound: Streaming<WatchRequest>,
        mut revisions: broadcast::Receiver<Arc<RevisionEvents>>,
        outbound: WatchSender,
    ) {
        let mut watchers: HashMap<i64, Watcher> = HashMap::new();
        let mut next_watch_id = 0;

        loop {
            let responses = tokio::select! {
                message = inbound.message() => match message {
                    Ok(Some(req)) => Self::handle_request(&inner, req, &mut watchers, &mut next_watch_id),
                    Ok(None) => break,
                    Err(status) => {
                        tracing::debug!("Watch stream error: {}", status);
                        break;
                    }
                },
                batch = revisions.recv() => match batch {
                    Ok(batch) => watchers
                        .iter()
                        .filter_map(|(id, watcher)| {
                            let events = watcher.select(&batch);
                            (!events.is_empty()).then(|| WatchResponse {
                                header: Some(inner.header(batch.revision)),
                                watch_id: *id,
                                events,
                                ..Default::default()
                            })
                        })
                        .collect(),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Watch stream lagged by {} revisions, cancelling watchers", missed);
                        let revision = inner.revision();
                        watchers
                            .drain()
                            .map(|(id, _)| WatchResponse {
                                header: Some(inner.header(revision)),
                                watch_id: id,
                                canceled: true,
                                cancel_reason: format!("watcher fell behind by {} revisions", missed),
                                ..Default::default()
                            })
                            .collect()
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            for response in responses {
                if outbound.send(Ok(response)).await.is_err() {
                    tracing::debug!("Watch client went away");
                    return;
                }
            }
        }

        tracing::debug!("Watch stream closed with {} active watchers", watchers.len());
    }

    fn handle_request(
        inner: &DevStore,
        req: WatchRequest,
        watchers: &mut HashMap<i64, Watcher>,
        next_watch_id: &mut i64,
    ) -> Vec<WatchResponse> {
        let revision = inner.revision();
        let header = Some(inner.header(revision));

        match req.request_union {
            Some(RequestUnion::CreateRequest(create)) => {
                let watch_id = *next_watch_id;
                *next_watch_id += 1;

                if let Err(status) = check_key(&create.key) {
                    return vec![WatchResponse {
                        header,
                        watch_id,
                        created: true,
                        canceled: true,
                        cancel_reason: status.message().to_string(),
                        ..Default::default()
                    }];
                }

                if create.start_revision > 0 && create.start_revision <= revision {
                    return vec![WatchResponse {
                        header,
                        watch_id,
                        created: true,
                        canceled: true,
                        cancel_reason: "watching from a past revision is not supported".into(),
                        ..Default::default()
                    }];
                }

                let after_revision = if create.start_revision > 0 {
                    create.start_revision - 1
                } else {
                    revision
                };

                tracing::debug!(
                    "Watch {} created: key={:?}, after_revision={}",
                    watch_id,
                    String::from_utf8_lossy(&create.key),
                    after_revision
                );
                watchers.insert(watch_id, Watcher::from_request(create, after_revision));

                vec![WatchResponse {
                    header,
                    watch_id,
                    created: true,
                    ..Default::default()
                }]
            }
            Some(RequestUnion::CancelRequest(cancel)) => {
                if watchers.remove(&cancel.watch_id).is_none() {
                    return Vec::new();
                }
                tracing::debug!("Watch {} canceled", cancel.watch_id);
                vec![WatchResponse {
                    header,
                    watch_id: cancel.watch_id,
                    canceled: true,
                    ..Default::default()
                }]
            }
            Some(RequestUnion::ProgressRequest(_)) => vec![WatchResponse {
                header,
                watch_id: -1,
                ..Default::default()
            }],
            None => Vec::new(),
        }
    }
}

#[tonic::async_trait]
impl Watch for WatchService {
    type WatchStream = ReceiverStream<Result<WatchResponse, Status>>;

    async fn watch(
        &self,
        request: Request<Streaming<WatchRequest>>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let inbound = request.into_inner();
        // Subscribe before any create request is read so no revision
        // committed after a watcher's creation can slip past it.
        let revisions = self.inner.events.subscribe();
        let (outbound, rx) = mpsc::channel(64);

        tokio::spawn(Self::serve_stream(
            self.inner.clone(),
            inbound,
            revisions,
            outbound,
        ));

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Run the development store
pub async fn run_devstore(config: DevStoreConfig) -> Result<()> {
    let addr = config.listen_addr.parse()?;
    let (kv, watch) = DevStore::new(config).into_services();

    tracing::info!("Starting development store on {}", addr);

    tonic::transport::Server::builder()
        .add_service(kv)
        .add_service(watch)
        .serve(addr)
        .await?;

    Ok(())
}
