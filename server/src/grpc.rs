use crate::auth::Authenticator;
use crate::models::{self, WatchItem};
use crate::storage::{Storage, StorageError};
use confwatch_types::kv::kv_store_server::{KvStore, KvStoreServer};
use confwatch_types::kv::{
    CompactRequest, CompactResponse, DeleteRequest, DeleteResponse, Event, EventKind, KeyValue,
    PutRequest, PutResponse, RangeRequest, RangeResponse, StatusRequest, StatusResponse,
    WatchRequest, WatchResponse,
};
use futures_util::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tonic::service::interceptor::InterceptedService;
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct KvServiceImpl {
    storage: Arc<Storage>,
}

impl KvServiceImpl {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchResponse, Status>> + Send>>;

#[tonic::async_trait]
impl KvStore for KvServiceImpl {
    type WatchStream = WatchStream;

    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let (revision, compact_revision) = self.storage.status().await.map_err(to_status)?;
        Ok(Response::new(StatusResponse {
            revision,
            compact_revision,
        }))
    }

    async fn range(
        &self,
        request: Request<RangeRequest>,
    ) -> Result<Response<RangeResponse>, Status> {
        let req = request.into_inner();
        let (kvs, revision) = self.storage.range(&req.prefix).await.map_err(to_status)?;

        Ok(Response::new(RangeResponse {
            kvs: kvs.into_iter().map(to_proto_kv).collect(),
            revision,
        }))
    }

    async fn put(&self, request: Request<PutRequest>) -> Result<Response<PutResponse>, Status> {
        let req = request.into_inner();
        if req.key.is_empty() {
            return Err(Status::invalid_argument("key must not be empty"));
        }

        let revision = self
            .storage
            .put(req.key, req.value)
            .await
            .map_err(to_status)?;
        Ok(Response::new(PutResponse { revision }))
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        let req = request.into_inner();
        let (deleted, revision) = self
            .storage
            .delete(&req.key, req.prefix)
            .await
            .map_err(to_status)?;
        Ok(Response::new(DeleteResponse { deleted, revision }))
    }

    async fn compact(
        &self,
        request: Request<CompactRequest>,
    ) -> Result<Response<CompactResponse>, Status> {
        let req = request.into_inner();
        let compact_revision = self
            .storage
            .compact(req.revision)
            .await
            .map_err(to_status)?;
        Ok(Response::new(CompactResponse { compact_revision }))
    }

    async fn watch(
        &self,
        request: Request<WatchRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let req = request.into_inner();
        debug!(prefix = %req.prefix, start_revision = req.start_revision, "watch opened");

        let mut items = self.storage.watch(req.prefix, req.start_revision);

        let output = async_stream::stream! {
            while let Some(item) = items.next().await {
                match item {
                    Ok(WatchItem::Events { revision, records }) => {
                        yield Ok(WatchResponse {
                            events: records.into_iter().map(to_proto_event).collect(),
                            revision,
                            compact_revision: 0,
                        });
                    }
                    Ok(WatchItem::Compacted(compact_revision)) => {
                        yield Ok(WatchResponse {
                            events: Vec::new(),
                            revision: 0,
                            compact_revision,
                        });
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "watch stream failed");
                        yield Err(to_status(e));
                        break;
                    }
                }
            }
        };

        Ok(Response::new(Box::pin(output)))
    }
}

fn to_proto_kv(kv: models::KeyValue) -> KeyValue {
    KeyValue {
        key: kv.key,
        value: kv.value,
        mod_revision: kv.mod_revision,
    }
}

fn to_proto_event(record: models::Record) -> Event {
    let kind = match record.kind {
        models::EventKind::Put => EventKind::Put,
        models::EventKind::Delete => EventKind::Delete,
    };

    Event {
        kind: kind as i32,
        kv: Some(KeyValue {
            key: record.key,
            value: record.value,
            mod_revision: record.revision,
        }),
    }
}

fn to_status(err: StorageError) -> Status {
    match err {
        StorageError::FutureRevision { .. } => Status::out_of_range(err.to_string()),
        StorageError::Sql(e) => Status::internal(format!("Database error: {}", e)),
    }
}

pub type KvServer = InterceptedService<KvStoreServer<KvServiceImpl>, Authenticator>;

pub fn create_server(storage: Arc<Storage>, authenticator: Authenticator) -> KvServer {
    KvStoreServer::with_interceptor(KvServiceImpl::new(storage), authenticator)
}
