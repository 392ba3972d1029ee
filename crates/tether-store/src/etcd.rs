//! etcd v3 gateway over the JSON/HTTP API
//!
//! Keys and values travel base64 encoded and int64 fields as decimal strings.
//! Requests go to the current endpoint; on a connect or timeout error the
//! gateway fails over to the next endpoint in the list.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, PickFirst, serde_as};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::gateway::{KeepAliveStream, StoreGateway, WatchStream};
use crate::model::{
    EventType, GetResponse, KeepAliveResponse, KeyValue, LeaseGrant, LeaseId, Revision,
    WatchEvent, WatchOptions, WatchResponse,
};
use crate::txn::{Compare, CompareResult, CompareTarget, Txn, TxnOp, TxnOpResponse, TxnResponse};

const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);

/// gRPC NOT_FOUND, which etcd returns for an unknown lease
const GRPC_NOT_FOUND: i32 = 5;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResponseHeader {
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    revision: i64,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KeyValueJson {
    key: String,
    value: String,
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    create_revision: i64,
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    mod_revision: i64,
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    version: i64,
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    lease: i64,
}

impl KeyValueJson {
    fn decode(self) -> Result<KeyValue> {
        Ok(KeyValue {
            key: decode_text(&self.key)?,
            value: decode_text(&self.value)?,
            create_revision: self.create_revision,
            mod_revision: self.mod_revision,
            version: self.version,
            lease: self.lease,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GatewayError {
    #[serde(alias = "grpc_code")]
    code: i32,
    message: String,
}

#[serde_as]
#[derive(Debug, Serialize)]
struct PutRequest {
    key: String,
    value: String,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(skip_serializing_if = "is_zero")]
    lease: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PutResponse {
    header: ResponseHeader,
}

#[derive(Debug, Serialize)]
struct RangeRequest {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    range_end: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RangeResponse {
    header: ResponseHeader,
    kvs: Vec<KeyValueJson>,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DeleteRangeResponse {
    header: ResponseHeader,
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    deleted: i64,
}

#[serde_as]
#[derive(Debug, Serialize)]
struct LeaseGrantRequest {
    #[serde(rename = "TTL")]
    #[serde_as(as = "DisplayFromStr")]
    ttl: i64,
    #[serde(rename = "ID")]
    #[serde_as(as = "DisplayFromStr")]
    id: i64,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LeaseGrantResponse {
    #[serde(rename = "ID")]
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    id: i64,
    #[serde(rename = "TTL")]
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    ttl: i64,
    error: String,
}

#[serde_as]
#[derive(Debug, Serialize)]
struct LeaseIdRequest {
    #[serde(rename = "ID")]
    #[serde_as(as = "DisplayFromStr")]
    id: i64,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LeaseKeepAliveResult {
    #[serde(rename = "ID")]
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    id: i64,
    #[serde(rename = "TTL")]
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    ttl: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StreamEnvelope<T> {
    result: Option<T>,
    error: Option<GatewayError>,
}

#[derive(Debug, Serialize)]
struct CompareJson {
    key: String,
    result: &'static str,
    target: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    create_revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mod_revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

#[derive(Debug, Default, Serialize)]
struct RequestOpJson {
    #[serde(skip_serializing_if = "Option::is_none")]
    request_put: Option<PutRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_range: Option<RangeRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_delete_range: Option<RangeRequest>,
}

#[derive(Debug, Serialize)]
struct TxnRequest {
    compare: Vec<CompareJson>,
    success: Vec<RequestOpJson>,
    failure: Vec<RequestOpJson>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResponseOpJson {
    response_put: Option<PutResponse>,
    response_range: Option<RangeResponse>,
    response_delete_range: Option<DeleteRangeResponse>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TxnResponseJson {
    header: ResponseHeader,
    succeeded: bool,
    responses: Vec<ResponseOpJson>,
}

#[derive(Debug, Serialize)]
struct WatchCreateRequest {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    range_end: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_revision: Option<String>,
}

#[derive(Debug, Serialize)]
struct WatchRequest {
    create_request: WatchCreateRequest,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EventJson {
    #[serde(rename = "type")]
    event_type: Option<String>,
    kv: KeyValueJson,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WatchResultJson {
    header: ResponseHeader,
    created: bool,
    canceled: bool,
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    compact_revision: i64,
    cancel_reason: String,
    events: Vec<EventJson>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

fn decode_text(encoded: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| StoreError::Decode(format!("invalid base64: {}", e)))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Smallest key greater than every key starting with `prefix`.
///
/// The empty prefix (and a prefix made only of `0xff` bytes) maps to `"\0"`,
/// which the store reads as "to the end of the keyspace".
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0]
}

fn range_request(key: &str, prefix: bool) -> RangeRequest {
    RangeRequest {
        key: encode(key.as_bytes()),
        range_end: prefix.then(|| encode(&prefix_range_end(key.as_bytes()))),
    }
}

fn encode_compare(cmp: &Compare) -> CompareJson {
    let result = match cmp.result {
        CompareResult::Equal => "EQUAL",
        CompareResult::NotEqual => "NOT_EQUAL",
        CompareResult::Greater => "GREATER",
        CompareResult::Less => "LESS",
    };
    let mut json = CompareJson {
        key: encode(cmp.key.as_bytes()),
        result,
        target: "CREATE",
        create_revision: None,
        mod_revision: None,
        version: None,
        value: None,
    };
    match &cmp.target {
        CompareTarget::CreateRevision(rev) => {
            json.create_revision = Some(rev.to_string());
        }
        CompareTarget::ModRevision(rev) => {
            json.target = "MOD";
            json.mod_revision = Some(rev.to_string());
        }
        CompareTarget::Version(version) => {
            json.target = "VERSION";
            json.version = Some(version.to_string());
        }
        CompareTarget::Value(value) => {
            json.target = "VALUE";
            json.value = Some(encode(value.as_bytes()));
        }
    }
    json
}

fn encode_op(op: &TxnOp) -> RequestOpJson {
    match op {
        TxnOp::Put { key, value, lease } => RequestOpJson {
            request_put: Some(PutRequest {
                key: encode(key.as_bytes()),
                value: encode(value.as_bytes()),
                lease: lease.unwrap_or(0),
            }),
            ..Default::default()
        },
        TxnOp::Get { key, prefix } => RequestOpJson {
            request_range: Some(range_request(key, *prefix)),
            ..Default::default()
        },
        TxnOp::Delete { key, prefix } => RequestOpJson {
            request_delete_range: Some(range_request(key, *prefix)),
            ..Default::default()
        },
    }
}

fn encode_txn(txn: &Txn) -> TxnRequest {
    TxnRequest {
        compare: txn.compare.iter().map(encode_compare).collect(),
        success: txn.success.iter().map(encode_op).collect(),
        failure: txn.failure.iter().map(encode_op).collect(),
    }
}

fn decode_txn(resp: TxnResponseJson) -> Result<TxnResponse> {
    let revision = resp.header.revision;
    let mut responses = Vec::with_capacity(resp.responses.len());
    for op in resp.responses {
        let decoded = if let Some(range) = op.response_range {
            TxnOpResponse::Range(
                range
                    .kvs
                    .into_iter()
                    .map(KeyValueJson::decode)
                    .collect::<Result<Vec<_>>>()?,
            )
        } else if let Some(deleted) = op.response_delete_range {
            TxnOpResponse::Delete {
                deleted: deleted.deleted,
            }
        } else if op.response_put.is_some() {
            TxnOpResponse::Put { revision }
        } else {
            return Err(StoreError::Decode("unknown txn response op".to_string()));
        };
        responses.push(decoded);
    }

    Ok(TxnResponse {
        succeeded: resp.succeeded,
        revision,
        responses,
    })
}

/// Decode one newline-delimited watch message. Creation acks and progress
/// notifications carry no events and yield `None`.
fn decode_watch_line(line: &[u8], requested: Revision) -> Result<Option<WatchResponse>> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(None);
    }

    let envelope: StreamEnvelope<WatchResultJson> = serde_json::from_slice(line)?;
    if let Some(error) = envelope.error {
        return Err(StoreError::Status {
            code: error.code,
            message: error.message,
        });
    }
    let Some(result) = envelope.result else {
        return Ok(None);
    };

    if result.canceled {
        if result.compact_revision > 0 {
            return Err(StoreError::Compacted {
                requested,
                compacted: result.compact_revision,
            });
        }
        return Err(StoreError::Unavailable(format!(
            "watch canceled: {}",
            result.cancel_reason
        )));
    }
    if result.events.is_empty() {
        return Ok(None);
    }

    let events = result
        .events
        .into_iter()
        .map(|event| {
            let event_type = match event.event_type.as_deref() {
                Some("DELETE") => EventType::Delete,
                _ => EventType::Put,
            };
            Ok(WatchEvent {
                event_type,
                kv: event.kv.decode()?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Some(WatchResponse {
        revision: result.header.revision,
        events,
    }))
}

struct WatchDecoder {
    body: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buf: Vec<u8>,
    requested: Revision,
    failed: bool,
}

impl WatchDecoder {
    async fn next_response(&mut self) -> Option<Result<WatchResponse>> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                match decode_watch_line(&line, self.requested) {
                    Ok(Some(resp)) => return Some(Ok(resp)),
                    Ok(None) => continue,
                    Err(e) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                }
            }

            match self.body.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    self.failed = true;
                    return Some(Err(e.into()));
                }
                None => {
                    let rest = std::mem::take(&mut self.buf);
                    self.failed = true;
                    return match decode_watch_line(&rest, self.requested) {
                        Ok(Some(resp)) => Some(Ok(resp)),
                        Ok(None) => None,
                        Err(e) => Some(Err(e)),
                    };
                }
            }
        }
    }
}

async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let parsed: Option<GatewayError> = serde_json::from_str(&body).ok();
    Err(match parsed {
        Some(err) if !err.message.is_empty() => StoreError::Status {
            code: err.code,
            message: err.message,
        },
        _ => StoreError::Status {
            code: i32::from(status.as_u16()),
            message: body,
        },
    })
}

/// Turn etcd's "requested lease not found" status into
/// [`StoreError::LeaseNotFound`] for lease `id`.
fn lease_error(err: StoreError, id: LeaseId) -> StoreError {
    match err {
        StoreError::Status {
            code: GRPC_NOT_FOUND,
            ref message,
        } if message.contains("lease not found") => StoreError::LeaseNotFound(id),
        other => other,
    }
}

/// Lease attached by the first put in either branch of `txn`.
fn txn_lease(txn: &Txn) -> Option<LeaseId> {
    txn.success
        .iter()
        .chain(&txn.failure)
        .find_map(|op| match op {
            TxnOp::Put {
                lease: Some(lease), ..
            } if *lease != 0 => Some(*lease),
            _ => None,
        })
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

struct Inner {
    /// Client for unary calls, bounded by the request timeout
    client: Client,
    /// Client for watch streams, no overall timeout
    stream_client: Client,
    endpoints: Vec<String>,
    current_endpoint_index: RwLock<usize>,
}

impl Inner {
    fn current_endpoint(&self) -> &str {
        let index = *self.current_endpoint_index.read();
        &self.endpoints[index]
    }

    fn switch_to_next_endpoint(&self) {
        let mut index = self.current_endpoint_index.write();
        *index = (*index + 1) % self.endpoints.len();
        debug!("Switched to endpoint index: {}", *index);
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        client: &Client,
        path: &str,
        body: &B,
    ) -> Result<Response> {
        let mut last_error = None;
        for _ in 0..self.endpoints.len() {
            let url = format!("{}{}", self.current_endpoint(), path);
            match client.post(&url).json(body).send().await {
                Ok(resp) => return check_status(resp).await,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    warn!("Request to {} failed: {}", url, e);
                    self.switch_to_next_endpoint();
                    last_error = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(match last_error {
            Some(e) => StoreError::Unavailable(format!("all endpoints failed, last error: {}", e)),
            None => StoreError::Unavailable("no endpoints configured".to_string()),
        })
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R> {
        let resp = self.send(&self.client, path, body).await?;
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn keep_alive_once(&self, id: LeaseId) -> Result<KeepAliveResponse> {
        let envelope: StreamEnvelope<LeaseKeepAliveResult> = self
            .post("/v3/lease/keepalive", &LeaseIdRequest { id })
            .await
            .map_err(|e| lease_error(e, id))?;
        if let Some(error) = envelope.error {
            return Err(lease_error(
                StoreError::Status {
                    code: error.code,
                    message: error.message,
                },
                id,
            ));
        }
        let ttl = envelope.result.map_or(0, |r| r.ttl);
        Ok(KeepAliveResponse { id, ttl })
    }
}

/// [`StoreGateway`] backed by an etcd cluster's v3 JSON gateway.
#[derive(Clone)]
pub struct EtcdGateway {
    inner: Arc<Inner>,
}

impl EtcdGateway {
    /// Build a gateway for `endpoints` (e.g. `http://127.0.0.1:2379`).
    pub fn new(
        endpoints: Vec<String>,
        dial_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(StoreError::Unavailable(
                "no endpoints configured".to_string(),
            ));
        }

        let client = Client::builder()
            .connect_timeout(dial_timeout)
            .timeout(request_timeout)
            .build()?;
        let stream_client = Client::builder().connect_timeout(dial_timeout).build()?;

        info!("Using store endpoints: {:?}", endpoints);

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                stream_client,
                endpoints,
                current_endpoint_index: RwLock::new(0),
            }),
        })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.inner.endpoints
    }
}

#[async_trait]
impl StoreGateway for EtcdGateway {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<Revision> {
        let req = PutRequest {
            key: encode(key.as_bytes()),
            value: encode(value.as_bytes()),
            lease: lease.unwrap_or(0),
        };
        let resp: PutResponse = self
            .inner
            .post("/v3/kv/put", &req)
            .await
            .map_err(|e| match lease {
                Some(id) => lease_error(e, id),
                None => e,
            })?;
        Ok(resp.header.revision)
    }

    async fn delete(&self, key: &str, prefix: bool) -> Result<i64> {
        let resp: DeleteRangeResponse = self
            .inner
            .post("/v3/kv/deleterange", &range_request(key, prefix))
            .await?;
        Ok(resp.deleted)
    }

    async fn get(&self, key: &str, prefix: bool) -> Result<GetResponse> {
        let resp: RangeResponse = self
            .inner
            .post("/v3/kv/range", &range_request(key, prefix))
            .await?;
        Ok(GetResponse {
            revision: resp.header.revision,
            kvs: resp
                .kvs
                .into_iter()
                .map(KeyValueJson::decode)
                .collect::<Result<Vec<_>>>()?,
        })
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        let resp: TxnResponseJson = self
            .inner
            .post("/v3/kv/txn", &encode_txn(&txn))
            .await
            .map_err(|e| match txn_lease(&txn) {
                Some(id) => lease_error(e, id),
                None => e,
            })?;
        decode_txn(resp)
    }

    async fn lease_grant(&self, ttl: i64) -> Result<LeaseGrant> {
        if ttl <= 0 {
            return Err(StoreError::InvalidTtl(ttl));
        }
        let resp: LeaseGrantResponse = self
            .inner
            .post("/v3/lease/grant", &LeaseGrantRequest { ttl, id: 0 })
            .await?;
        if !resp.error.is_empty() {
            return Err(StoreError::Status {
                code: 0,
                message: resp.error,
            });
        }
        Ok(LeaseGrant {
            id: resp.id,
            ttl: resp.ttl,
        })
    }

    async fn lease_keep_alive(&self, id: LeaseId) -> Result<KeepAliveStream> {
        let first = self.inner.keep_alive_once(id).await?;
        if first.is_expired() {
            return Err(StoreError::LeaseNotFound(id));
        }

        let (tx, rx) = mpsc::channel(16);
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let mut ttl = first.ttl;
            let mut deadline = Instant::now() + Duration::from_secs(ttl as u64);
            if tx.send(first).await.is_err() {
                return;
            }

            loop {
                let period = (Duration::from_secs(ttl.max(1) as u64) / 3).max(MIN_KEEPALIVE_INTERVAL);
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = tx.closed() => break,
                }

                match inner.keep_alive_once(id).await {
                    Ok(resp) if !resp.is_expired() => {
                        ttl = resp.ttl;
                        deadline = Instant::now() + Duration::from_secs(ttl as u64);
                        if tx.send(resp).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {
                        warn!(lease = %format_args!("{:x}", id), "Lease no longer exists");
                        break;
                    }
                    Err(e) if Instant::now() >= deadline => {
                        warn!(
                            lease = %format_args!("{:x}", id),
                            "Keep-alive failed past the lease deadline: {}", e
                        );
                        break;
                    }
                    Err(e) => {
                        debug!(lease = %format_args!("{:x}", id), "Keep-alive failed, retrying: {}", e);
                    }
                }
            }
            debug!(lease = %format_args!("{:x}", id), "Keep-alive loop stopped");
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn lease_revoke(&self, id: LeaseId) -> Result<()> {
        let _: serde_json::Value = self
            .inner
            .post("/v3/lease/revoke", &LeaseIdRequest { id })
            .await
            .map_err(|e| lease_error(e, id))?;
        Ok(())
    }

    async fn watch(&self, key: &str, options: WatchOptions) -> Result<WatchStream> {
        let range = range_request(key, options.prefix);
        let requested = options.start_revision.unwrap_or(0);
        let req = WatchRequest {
            create_request: WatchCreateRequest {
                key: range.key,
                range_end: range.range_end,
                start_revision: options
                    .start_revision
                    .filter(|rev| *rev > 0)
                    .map(|rev| rev.to_string()),
            },
        };

        let resp = self
            .inner
            .send(&self.inner.stream_client, "/v3/watch", &req)
            .await?;
        let decoder = WatchDecoder {
            body: Box::pin(resp.bytes_stream()),
            buf: Vec::new(),
            requested,
            failed: false,
        };

        let stream = futures::stream::unfold(decoder, |mut decoder| async move {
            decoder
                .next_response()
                .await
                .map(|item| (item, decoder))
        });
        Ok(stream.boxed())
    }
}
