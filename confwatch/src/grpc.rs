//! [`ConfigStore`] over the confwatch gRPC protocol.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use confwatch_types::kv::kv_store_client::KvStoreClient;
use confwatch_types::kv::{
    self as pb, CompactRequest, DeleteRequest, PutRequest, RangeRequest, StatusRequest,
    WatchRequest, WatchResponse,
};
use futures_util::StreamExt;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::store::{
    ConfigStore, Entry, EventKind, Revision, Snapshot, WatchBatch, WatchEvent, WatchStream,
};
use crate::Error;

const USERNAME_HEADER: &str = "username";
const PASSWORD_HEADER: &str = "password";

/// Attaches the configured credentials to every request.
#[derive(Clone, Default)]
pub struct Credentials {
    pair: Option<(MetadataValue<Ascii>, MetadataValue<Ascii>)>,
}

impl Credentials {
    fn from_config(config: &StoreConfig) -> Result<Self, Error> {
        let (username, password) = match (&config.username, &config.password) {
            (Some(username), Some(password)) => (username, password),
            (None, None) => return Ok(Self::default()),
            _ => {
                return Err(Error::Connection(
                    "username and password must be given together".into(),
                ))
            }
        };

        let parse = |value: &str| {
            value
                .parse::<MetadataValue<Ascii>>()
                .map_err(|_| Error::Connection("credentials must be printable ASCII".into()))
        };
        Ok(Self {
            pair: Some((parse(username)?, parse(password)?)),
        })
    }
}

impl Interceptor for Credentials {
    fn call(
        &mut self,
        mut request: tonic::Request<()>,
    ) -> Result<tonic::Request<()>, tonic::Status> {
        if let Some((username, password)) = &self.pair {
            let metadata = request.metadata_mut();
            metadata.insert(USERNAME_HEADER, username.clone());
            metadata.insert(PASSWORD_HEADER, password.clone());
        }
        Ok(request)
    }
}

type Client = KvStoreClient<InterceptedService<Channel, Credentials>>;

/// A connected confwatch server (or a balanced set of them).
///
/// Cloning is cheap and clones share the underlying channel.
///
/// # Example
///
/// ```no_run
/// use confwatch::{GrpcStore, KeySpace, StoreConfig, Writer};
///
/// #[tokio::main]
/// async fn main() -> Result<(), confwatch::Error> {
///     let store = GrpcStore::connect(&StoreConfig::from_endpoint_list("127.0.0.1:2379")).await?;
///     let writer = Writer::new(store, KeySpace::default());
///     writer.write("srv1", "timeout", "30").await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct GrpcStore {
    client: Client,
    request_timeout: Duration,
}

impl GrpcStore {
    /// Connects to the configured endpoints and checks that the credentials
    /// are accepted. Both steps are bounded by the dial timeout.
    pub async fn connect(config: &StoreConfig) -> Result<Self, Error> {
        let credentials = Credentials::from_config(config)?;

        let mut endpoints = Vec::with_capacity(config.endpoints.len());
        for address in &config.endpoints {
            let endpoint =
                Endpoint::from_shared(address.clone())?.connect_timeout(config.dial_timeout);
            endpoints.push(endpoint);
        }

        let channel = match endpoints.len() {
            0 => return Err(Error::Connection("no endpoints configured".into())),
            1 => {
                let endpoint = endpoints.remove(0);
                let connect = endpoint.connect();
                match tokio::time::timeout(config.dial_timeout, connect).await {
                    Ok(Ok(channel)) => channel,
                    Ok(Err(e)) => {
                        warn!(endpoint = %config.endpoints[0], error = %e, "cannot connect");
                        return Err(e.into());
                    }
                    Err(_) => {
                        return Err(Error::Connection(format!(
                            "{}: no connection within {:?}",
                            config.endpoints[0], config.dial_timeout
                        )))
                    }
                }
            }
            _ => Channel::balance_list(endpoints.into_iter()),
        };

        let store = Self {
            client: KvStoreClient::with_interceptor(channel, credentials),
            request_timeout: config.request_timeout,
        };

        let mut client = store.client.clone();
        let probe = client.status(StatusRequest {});
        let status = match tokio::time::timeout(config.dial_timeout, probe).await {
            Ok(Ok(response)) => response.into_inner(),
            Ok(Err(status)) => {
                warn!(code = ?status.code(), "store rejected the connection");
                return Err(Error::Connection(status.message().to_string()));
            }
            Err(_) => {
                return Err(Error::Connection(format!(
                    "no response within {:?}",
                    config.dial_timeout
                )))
            }
        };

        info!(
            endpoints = ?config.endpoints,
            revision = status.revision,
            "connected to store"
        );
        Ok(store)
    }

    async fn unary<T, F>(&self, call: F) -> Result<T, Error>
    where
        F: Future<Output = Result<tonic::Response<T>, tonic::Status>>,
    {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(response) => Ok(response?.into_inner()),
            Err(_) => Err(Error::Timeout(self.request_timeout)),
        }
    }

    /// Current head revision and compaction point.
    pub async fn status(&self) -> Result<(Revision, Revision), Error> {
        let mut client = self.client.clone();
        let status = self.unary(client.status(StatusRequest {})).await?;
        Ok((Revision(status.revision), Revision(status.compact_revision)))
    }

    /// Deletes every key under `prefix` in one revision. Returns the number of
    /// keys removed and the store revision after the call.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<(u64, Revision), Error> {
        let mut client = self.client.clone();
        let response = self
            .unary(client.delete(DeleteRequest {
                key: prefix.to_string(),
                prefix: true,
            }))
            .await?;
        Ok((response.deleted, Revision(response.revision)))
    }

    /// Discards history at or below `revision` on the server.
    pub async fn compact(&self, revision: Revision) -> Result<Revision, Error> {
        let mut client = self.client.clone();
        let response = self
            .unary(client.compact(CompactRequest {
                revision: revision.get(),
            }))
            .await?;
        Ok(Revision(response.compact_revision))
    }
}

fn decode_value(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(value) => value,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

fn decode_event(event: pb::Event) -> WatchEvent {
    let kind = match pb::EventKind::try_from(event.kind) {
        Ok(pb::EventKind::Put) => EventKind::Put,
        Ok(pb::EventKind::Delete) => EventKind::Delete,
        Err(_) => EventKind::Unknown(event.kind),
    };
    let kv = event.kv.unwrap_or_default();

    WatchEvent {
        kind,
        key: kv.key,
        value: decode_value(kv.value),
        revision: Revision(kv.mod_revision),
    }
}

fn decode_watch(response: WatchResponse, requested: Revision) -> Result<WatchBatch, Error> {
    if response.compact_revision > 0 {
        return Err(Error::Compacted {
            requested,
            compacted: Revision(response.compact_revision),
        });
    }

    Ok(WatchBatch {
        events: response.events.into_iter().map(decode_event).collect(),
        revision: Revision(response.revision),
    })
}

#[async_trait]
impl ConfigStore for GrpcStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot, Error> {
        let mut client = self.client.clone();
        let response = self
            .unary(client.range(RangeRequest {
                prefix: prefix.to_string(),
            }))
            .await?;

        let entries = response
            .kvs
            .into_iter()
            .map(|kv| Entry::new(kv.key, decode_value(kv.value)))
            .collect();
        Ok(Snapshot {
            entries,
            revision: Revision(response.revision),
        })
    }

    async fn put(&self, key: &str, value: &str) -> Result<Revision, Error> {
        let mut client = self.client.clone();
        let response = self
            .unary(client.put(PutRequest {
                key: key.to_string(),
                value: value.as_bytes().to_vec(),
            }))
            .await?;
        Ok(Revision(response.revision))
    }

    async fn delete(&self, key: &str) -> Result<Option<Revision>, Error> {
        let mut client = self.client.clone();
        let response = self
            .unary(client.delete(DeleteRequest {
                key: key.to_string(),
                prefix: false,
            }))
            .await?;
        Ok((response.deleted > 0).then_some(Revision(response.revision)))
    }

    async fn watch_prefix(&self, prefix: &str, after: Revision) -> Result<WatchStream, Error> {
        let requested = after.next();
        let mut client = self.client.clone();
        let responses = self
            .unary(client.watch(WatchRequest {
                prefix: prefix.to_string(),
                start_revision: requested.get(),
            }))
            .await?;
        debug!(prefix, %requested, "watch opened");

        Ok(responses
            .map(move |item| match item {
                Ok(response) => decode_watch(response, requested),
                Err(status) => Err(Error::Status(status)),
            })
            .boxed())
    }
}
