//! Domain types for the store client
//!
//! Owned Rust types for records, responses, key ranges, comparisons,
//! transactions and watch events, plus conversions to and from the etcd
//! wire types in [`crate::pb`].

use crate::pb::etcdserverpb::{self as rpc, compare, request_op, response_op};
use crate::pb::mvccpb::{self, event};
use std::borrow::Cow;
use std::fmt;

/// A key and the range of keys it covers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRange {
    key: Vec<u8>,
    range_end: Vec<u8>,
}

impl KeyRange {
    /// Exactly one key.
    pub fn key(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            range_end: Vec::new(),
        }
    }

    /// Every key starting with `prefix`.
    pub fn prefix(prefix: impl Into<Vec<u8>>) -> Self {
        let key = prefix.into();
        let range_end = prefix_end(&key);
        Self { key, range_end }
    }

    /// Every key in the keyspace.
    pub fn all() -> Self {
        Self {
            key: vec![0],
            range_end: vec![0],
        }
    }

    /// Half-open interval `[start, end)`.
    pub fn between(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            key: start.into(),
            range_end: end.into(),
        }
    }

    pub fn start(&self) -> &[u8] {
        &self.key
    }

    pub fn range_end(&self) -> &[u8] {
        &self.range_end
    }

    /// Whether `candidate` falls inside this range, using etcd's rules for
    /// an empty `range_end` (single key) and `"\0"` (open-ended).
    pub fn contains(&self, candidate: &[u8]) -> bool {
        range_contains(&self.key, &self.range_end, candidate)
    }

    pub(crate) fn into_parts(self) -> (Vec<u8>, Vec<u8>) {
        (self.key, self.range_end)
    }
}

impl From<&str> for KeyRange {
    fn from(key: &str) -> Self {
        Self::key(key)
    }
}

impl From<&[u8]> for KeyRange {
    fn from(key: &[u8]) -> Self {
        Self::key(key)
    }
}

/// Smallest key greater than every key with the given prefix.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // Prefix was empty or all 0xff: no upper bound.
    vec![0]
}

pub(crate) fn range_contains(key: &[u8], range_end: &[u8], candidate: &[u8]) -> bool {
    if range_end.is_empty() {
        candidate == key
    } else if range_end == [0] {
        candidate >= key
    } else {
        candidate >= key && candidate < range_end
    }
}

/// A record as stored, with store-assigned metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Revision of the first write since the key was last created.
    pub create_revision: i64,
    /// Revision of the most recent write.
    pub mod_revision: i64,
    /// Number of writes since creation.
    pub version: i64,
    pub lease: i64,
}

impl KeyValue {
    pub fn key_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }

    pub fn value_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "key:\"{}\" create_revision:{} mod_revision:{} version:{} value:\"{}\"",
            self.key_str(),
            self.create_revision,
            self.mod_revision,
            self.version,
            self.value_str()
        )
    }
}

/// Acknowledgement of a put.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PutResponse {
    /// Store revision after the put was applied.
    pub revision: i64,
    pub prev_kv: Option<KeyValue>,
}

/// Result of a range read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GetResponse {
    pub revision: i64,
    pub kvs: Vec<KeyValue>,
    /// Total number of keys in the range, ignoring any limit.
    pub count: i64,
    pub more: bool,
}

impl GetResponse {
    pub fn first(&self) -> Option<&KeyValue> {
        self.kvs.first()
    }

    pub fn values(&self) -> impl Iterator<Item = &[u8]> {
        self.kvs.iter().map(|kv| kv.value.as_slice())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteResponse {
    pub revision: i64,
    pub deleted: i64,
    pub prev_kvs: Vec<KeyValue>,
}

/// Operator of a transaction predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    Greater,
    Less,
    NotEqual,
}

impl CompareOp {
    /// Parse the operator strings accepted by etcd's client libraries.
    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "=" | "==" => Some(CompareOp::Equal),
            ">" => Some(CompareOp::Greater),
            "<" => Some(CompareOp::Less),
            "!=" => Some(CompareOp::NotEqual),
            _ => None,
        }
    }
}

/// Record field a predicate inspects, with the expected value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompareTarget {
    Version(i64),
    CreateRevision(i64),
    ModRevision(i64),
    Value(Vec<u8>),
    Lease(i64),
}

/// One transaction predicate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Compare {
    pub key: Vec<u8>,
    pub op: CompareOp,
    pub target: CompareTarget,
}

impl Compare {
    pub fn new(key: impl Into<Vec<u8>>, op: CompareOp, target: CompareTarget) -> Self {
        Self {
            key: key.into(),
            op,
            target,
        }
    }

    pub fn value(key: impl Into<Vec<u8>>, op: CompareOp, value: impl Into<Vec<u8>>) -> Self {
        Self::new(key, op, CompareTarget::Value(value.into()))
    }

    pub fn version(key: impl Into<Vec<u8>>, op: CompareOp, version: i64) -> Self {
        Self::new(key, op, CompareTarget::Version(version))
    }

    pub fn create_revision(key: impl Into<Vec<u8>>, op: CompareOp, revision: i64) -> Self {
        Self::new(key, op, CompareTarget::CreateRevision(revision))
    }

    pub fn mod_revision(key: impl Into<Vec<u8>>, op: CompareOp, revision: i64) -> Self {
        Self::new(key, op, CompareTarget::ModRevision(revision))
    }
}

/// Operation executed inside a transaction branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxnOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Get(KeyRange),
    Delete(KeyRange),
    Txn(Txn),
}

impl TxnOp {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn get(range: impl Into<KeyRange>) -> Self {
        TxnOp::Get(range.into())
    }

    pub fn delete(range: impl Into<KeyRange>) -> Self {
        TxnOp::Delete(range.into())
    }
}

/// Compare-and-branch request evaluated atomically by the store.
///
/// ```
/// use etcd_tour::{Compare, CompareOp, Txn, TxnOp};
///
/// let txn = Txn::new()
///     .when([Compare::value("k1", CompareOp::Equal, "10")])
///     .and_then([TxnOp::put("txn", "success")])
///     .or_else([TxnOp::put("txn", "error")]);
/// assert_eq!(txn.compares.len(), 1);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compares: impl IntoIterator<Item = Compare>) -> Self {
        self.compares.extend(compares);
        self
    }

    pub fn and_then(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.success.extend(ops);
        self
    }

    pub fn or_else(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.failure.extend(ops);
        self
    }
}

/// Per-operation result of the executed branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxnOpResponse {
    Put(PutResponse),
    Get(GetResponse),
    Delete(DeleteResponse),
    Txn(TxnResponse),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxnResponse {
    pub revision: i64,
    /// `true` when every predicate held and the "then" branch ran.
    pub succeeded: bool,
    pub responses: Vec<TxnOpResponse>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Put => f.write_str("PUT"),
            EventKind::Delete => f.write_str("DELETE"),
        }
    }
}

/// A single mutation observed by a watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

// Conversion helpers between our types and protobuf types

fn revision_of(header: &Option<rpc::ResponseHeader>) -> i64 {
    header.as_ref().map(|h| h.revision).unwrap_or_default()
}

impl From<mvccpb::KeyValue> for KeyValue {
    fn from(pb: mvccpb::KeyValue) -> Self {
        Self {
            key: pb.key,
            value: pb.value,
            create_revision: pb.create_revision,
            mod_revision: pb.mod_revision,
            version: pb.version,
            lease: pb.lease,
        }
    }
}

impl From<KeyValue> for mvccpb::KeyValue {
    fn from(kv: KeyValue) -> Self {
        Self {
            key: kv.key,
            create_revision: kv.create_revision,
            mod_revision: kv.mod_revision,
            version: kv.version,
            value: kv.value,
            lease: kv.lease,
        }
    }
}

impl From<rpc::PutResponse> for PutResponse {
    fn from(pb: rpc::PutResponse) -> Self {
        Self {
            revision: revision_of(&pb.header),
            prev_kv: pb.prev_kv.map(Into::into),
        }
    }
}

impl From<rpc::RangeResponse> for GetResponse {
    fn from(pb: rpc::RangeResponse) -> Self {
        Self {
            revision: revision_of(&pb.header),
            kvs: pb.kvs.into_iter().map(Into::into).collect(),
            count: pb.count,
            more: pb.more,
        }
    }
}

impl From<rpc::DeleteRangeResponse> for DeleteResponse {
    fn from(pb: rpc::DeleteRangeResponse) -> Self {
        Self {
            revision: revision_of(&pb.header),
            deleted: pb.deleted,
            prev_kvs: pb.prev_kvs.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<rpc::TxnResponse> for TxnResponse {
    fn from(pb: rpc::TxnResponse) -> Self {
        Self {
            revision: revision_of(&pb.header),
            succeeded: pb.succeeded,
            responses: pb
                .responses
                .into_iter()
                .filter_map(|op| op.response)
                .map(|response| match response {
                    response_op::Response::ResponsePut(r) => TxnOpResponse::Put(r.into()),
                    response_op::Response::ResponseRange(r) => TxnOpResponse::Get(r.into()),
                    response_op::Response::ResponseDeleteRange(r) => {
                        TxnOpResponse::Delete(r.into())
                    }
                    response_op::Response::ResponseTxn(r) => TxnOpResponse::Txn(r.into()),
                })
                .collect(),
        }
    }
}

impl From<mvccpb::Event> for Event {
    fn from(pb: mvccpb::Event) -> Self {
        let kind = match event::EventType::try_from(pb.r#type) {
            Ok(event::EventType::Delete) => EventKind::Delete,
            _ => EventKind::Put,
        };
        Self {
            kind,
            kv: pb.kv.map(Into::into).unwrap_or_default(),
            prev_kv: pb.prev_kv.map(Into::into),
        }
    }
}

impl From<CompareOp> for compare::CompareResult {
    fn from(op: CompareOp) -> Self {
        match op {
            CompareOp::Equal => compare::CompareResult::Equal,
            CompareOp::Greater => compare::CompareResult::Greater,
            CompareOp::Less => compare::CompareResult::Less,
            CompareOp::NotEqual => compare::CompareResult::NotEqual,
        }
    }
}

impl From<Compare> for rpc::Compare {
    fn from(cmp: Compare) -> Self {
        let (target, union) = match cmp.target {
            CompareTarget::Version(v) => (
                compare::CompareTarget::Version,
                compare::TargetUnion::Version(v),
            ),
            CompareTarget::CreateRevision(r) => (
                compare::CompareTarget::Create,
                compare::TargetUnion::CreateRevision(r),
            ),
            CompareTarget::ModRevision(r) => (
                compare::CompareTarget::Mod,
                compare::TargetUnion::ModRevision(r),
            ),
            CompareTarget::Value(v) => (
                compare::CompareTarget::Value,
                compare::TargetUnion::Value(v),
            ),
            CompareTarget::Lease(l) => (
                compare::CompareTarget::Lease,
                compare::TargetUnion::Lease(l),
            ),
        };
        Self {
            result: compare::CompareResult::from(cmp.op) as i32,
            target: target as i32,
            key: cmp.key,
            target_union: Some(union),
            range_end: Vec::new(),
        }
    }
}

pub(crate) fn range_request(range: KeyRange) -> rpc::RangeRequest {
    let (key, range_end) = range.into_parts();
    rpc::RangeRequest {
        key,
        range_end,
        ..Default::default()
    }
}

pub(crate) fn put_request(key: Vec<u8>, value: Vec<u8>) -> rpc::PutRequest {
    rpc::PutRequest {
        key,
        value,
        ..Default::default()
    }
}

pub(crate) fn delete_request(range: KeyRange) -> rpc::DeleteRangeRequest {
    let (key, range_end) = range.into_parts();
    rpc::DeleteRangeRequest {
        key,
        range_end,
        prev_kv: false,
    }
}

impl From<TxnOp> for rpc::RequestOp {
    fn from(op: TxnOp) -> Self {
        let request = match op {
            TxnOp::Put { key, value } => request_op::Request::RequestPut(put_request(key, value)),
            TxnOp::Get(range) => request_op::Request::RequestRange(range_request(range)),
            TxnOp::Delete(range) => {
                request_op::Request::RequestDeleteRange(delete_request(range))
            }
            TxnOp::Txn(txn) => request_op::Request::RequestTxn(txn.into()),
        };
        Self {
            request: Some(request),
        }
    }
}

impl From<Txn> for rpc::TxnRequest {
    fn from(txn: Txn) -> Self {
        Self {
            compare: txn.compares.into_iter().map(Into::into).collect(),
            success: txn.success.into_iter().map(Into::into).collect(),
            failure: txn.failure.into_iter().map(Into::into).collect(),
        }
    }
}
