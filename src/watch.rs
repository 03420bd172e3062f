//! Client side of the Watch RPC
//!
//! A [`WatchStream`] wraps one bidirectional watch stream carrying a single
//! watcher. Events arrive in the store's revision order. The stream ends
//! without error when its deadline passes; dropping it or calling
//! [`WatchStream::cancel`] stops it early.

use crate::deadline::Deadline;
use crate::error::{Result, StoreError};
use crate::pb::etcdserverpb::watch_client::WatchClient;
use crate::pb::etcdserverpb::watch_create_request::FilterType;
use crate::pb::etcdserverpb::watch_request::RequestUnion;
use crate::pb::etcdserverpb::{
    WatchCancelRequest, WatchCreateRequest, WatchRequest, WatchResponse,
};
use crate::protocol::{Event, KeyRange};
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::{Code, Streaming};

/// Optional watch behavior
#[derive(Clone, Copy, Debug, Default)]
pub struct WatchOptions {
    /// Include the previous record in each event
    pub prev_kv: bool,
    /// Drop put events
    pub no_put: bool,
    /// Drop delete events
    pub no_delete: bool,
}

/// Live sequence of change events for one key range.
pub struct WatchStream {
    watch_id: i64,
    requests: mpsc::Sender<WatchRequest>,
    inbound: Streaming<WatchResponse>,
    deadline: Deadline,
    pending: VecDeque<Event>,
    done: bool,
}

impl WatchStream {
    /// Open the stream and wait until the store confirms the watcher.
    pub(crate) async fn open(
        mut client: WatchClient<Channel>,
        range: KeyRange,
        options: WatchOptions,
        deadline: Deadline,
    ) -> Result<Self> {
        if deadline.is_expired() {
            return Err(StoreError::DeadlineExceeded);
        }

        let (key, range_end) = range.into_parts();
        tracing::debug!("WATCH request: key={:?}", String::from_utf8_lossy(&key));

        let mut filters = Vec::new();
        if options.no_put {
            filters.push(FilterType::Noput as i32);
        }
        if options.no_delete {
            filters.push(FilterType::Nodelete as i32);
        }

        let (requests, rx) = mpsc::channel(8);
        requests
            .send(WatchRequest {
                request_union: Some(RequestUnion::CreateRequest(WatchCreateRequest {
                    key,
                    range_end,
                    filters,
                    prev_kv: options.prev_kv,
                    ..Default::default()
                })),
            })
            .await
            .map_err(|_| StoreError::Connection("watch request channel closed".into()))?;

        let mut inbound = deadline
            .run(async move { Ok(client.watch(ReceiverStream::new(rx)).await?.into_inner()) })
            .await?;

        let created = deadline
            .run(async {
                inbound.message().await?.ok_or_else(|| {
                    StoreError::Connection("watch stream closed before creation".into())
                })
            })
            .await?;

        if !created.created || created.canceled {
            return Err(StoreError::store(
                Code::FailedPrecondition,
                format!("watch not created: {}", created.cancel_reason),
            ));
        }

        tracing::debug!("Watch {} created", created.watch_id);

        Ok(Self {
            watch_id: created.watch_id,
            requests,
            inbound,
            deadline,
            pending: VecDeque::new(),
            done: false,
        })
    }

    pub fn watch_id(&self) -> i64 {
        self.watch_id
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Next batch of events, all from one store revision.
    ///
    /// Returns `Ok(None)` once the deadline has passed or the store has
    /// closed the watcher.
    pub async fn message(&mut self) -> Result<Option<Vec<Event>>> {
        if !self.pending.is_empty() {
            return Ok(Some(self.pending.drain(..).collect()));
        }

        while !self.done {
            let next = match self.deadline.instant() {
                None => self.inbound.message().await,
                Some(at) => match tokio::time::timeout_at(at, self.inbound.message()).await {
                    Ok(next) => next,
                    Err(_) => {
                        tracing::debug!("Watch {} reached its deadline", self.watch_id);
                        self.done = true;
                        break;
                    }
                },
            };

            let response = match next {
                Ok(Some(response)) => response,
                Ok(None) => {
                    self.done = true;
                    break;
                }
                Err(status) => {
                    self.done = true;
                    return Err(status.into());
                }
            };

            if response.watch_id != self.watch_id {
                continue;
            }

            if response.canceled {
                self.done = true;
                if response.cancel_reason.is_empty() {
                    break;
                }
                return Err(StoreError::store(Code::Cancelled, response.cancel_reason));
            }

            if response.events.is_empty() {
                continue;
            }

            return Ok(Some(response.events.into_iter().map(Into::into).collect()));
        }

        Ok(None)
    }

    /// Next single event.
    pub async fn next(&mut self) -> Result<Option<Event>> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }
        match self.message().await? {
            Some(batch) => {
                self.pending.extend(batch);
                Ok(self.pending.pop_front())
            }
            None => Ok(None),
        }
    }

    /// Ask the store to drop the watcher, then close the stream.
    pub async fn cancel(self) {
        tracing::debug!("Cancelling watch {}", self.watch_id);
        let _ = self
            .requests
            .send(WatchRequest {
                request_union: Some(RequestUnion::CancelRequest(WatchCancelRequest {
                    watch_id: self.watch_id,
                })),
            })
            .await;
    }
}

impl fmt::Debug for WatchStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchStream")
            .field("watch_id", &self.watch_id)
            .field("deadline", &self.deadline)
            .field("pending", &self.pending.len())
            .field("done", &self.done)
            .finish()
    }
}
