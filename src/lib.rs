//! etcd client tour
//!
//! A thin facade over the etcd v3 gRPC API plus the demo scenarios that walk
//! through it: put/get/delete, a conditional transaction, a watch, and a
//! deadline that cannot be met.
//!
//! ## Usage
//!
//! Start a local development store (or point at a real etcd):
//! ```bash
//! cargo run --bin etcd-devstore -- --listen-addr 127.0.0.1:2379
//! ```
//!
//! Run a scenario:
//! ```bash
//! cargo run --bin etcd-tour -- --addr localhost:2379 --scenario txn
//! ```

pub mod client;
pub mod deadline;
pub mod devstore;
pub mod error;
pub mod protocol;
pub mod scenarios;
pub mod watch;

// Re-export generated protobuf types
pub mod pb {
    pub mod mvccpb {
        tonic::include_proto!("mvccpb");
    }

    pub mod etcdserverpb {
        tonic::include_proto!("etcdserverpb");
    }
}

pub use client::{ClientConfig, StoreClient};
pub use deadline::Deadline;
pub use devstore::{DevStore, DevStoreConfig};
pub use error::{Result, StoreError};
pub use protocol::{
    Compare, CompareOp, CompareTarget, DeleteResponse, Event, EventKind, GetResponse, KeyRange,
    KeyValue, PutResponse, Txn, TxnOp, TxnOpResponse, TxnResponse,
};
pub use watch::{WatchOptions, WatchStream};
