use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use shared::{
    domain::FileId,
    error::ErrorBody,
    protocol::{IndexDocument, MessageResponse},
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::TransportError,
    transport::{message_from, QueryParams, RequestOptions, Transport},
};

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub method: &'static str,
    pub path: String,
    pub params: QueryParams,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
}

impl RecordedCall {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

pub(crate) struct Reply {
    pub delay: Duration,
    pub result: Result<Value, TransportError>,
}

impl Reply {
    pub fn ok(value: Value) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Ok(value),
        }
    }

    pub fn status(status: u16, code: &str, message: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Err(TransportError::from_body(status, ErrorBody::new(code, message))),
        }
    }

    pub fn message(message: &str) -> Self {
        Self::ok(json!({ "message": message }))
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Responder = dyn Fn(&RecordedCall) -> Reply + Send + Sync;

/// In-memory transport answering from a closure and recording every call.
pub(crate) struct ScriptedTransport {
    responder: Box<Responder>,
    calls: Mutex<Vec<RecordedCall>>,
    honor_cancel: bool,
}

impl ScriptedTransport {
    pub fn new(responder: impl Fn(&RecordedCall) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
            honor_cancel: true,
        })
    }

    /// Behaves like a transport that cannot abort a request once sent.
    pub fn ignoring_cancellation(
        responder: impl Fn(&RecordedCall) -> Reply + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
            honor_cancel: false,
        })
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, method: &str, path: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.method == method && call.path == path)
            .count()
    }

    async fn respond(
        &self,
        call: RecordedCall,
        cancel: Option<CancellationToken>,
    ) -> Result<Value, TransportError> {
        let reply = (self.responder)(&call);
        self.calls.lock().push(call);

        match cancel.filter(|_| self.honor_cancel) {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(TransportError::Cancelled),
                    _ = tokio::time::sleep(reply.delay) => reply.result,
                }
            }
            None => {
                if !reply.delay.is_zero() {
                    tokio::time::sleep(reply.delay).await;
                }
                reply.result
            }
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(
        &self,
        path: &str,
        params: &QueryParams,
        options: RequestOptions,
    ) -> Result<Value, TransportError> {
        let call = RecordedCall {
            method: "GET",
            path: path.to_string(),
            params: params.clone(),
            body: None,
            headers: options.headers.clone(),
        };
        self.respond(call, options.cancel).await
    }

    async fn post(
        &self,
        path: &str,
        body: Value,
        options: RequestOptions,
    ) -> Result<MessageResponse, TransportError> {
        let call = RecordedCall {
            method: "POST",
            path: path.to_string(),
            params: QueryParams::new(),
            body: Some(body),
            headers: options.headers.clone(),
        };
        let value = self.respond(call, options.cancel).await?;
        message_from(value)
    }

    async fn delete(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<MessageResponse, TransportError> {
        let call = RecordedCall {
            method: "DELETE",
            path: path.to_string(),
            params: QueryParams::new(),
            body: None,
            headers: options.headers.clone(),
        };
        let value = self.respond(call, options.cancel).await?;
        message_from(value)
    }
}

pub(crate) fn document(id: i64) -> IndexDocument {
    IndexDocument {
        doc_id: format!("file_{id}"),
        source_id: FileId(id),
        kind: shared::domain::DocumentKind::File,
        name: format!("file-{id}.pdf"),
        path_text: format!("/docs/file-{id}.pdf"),
        parent_id: 1,
        modified_at: 1_700_000_000,
        created_at: 1_600_000_000,
        size: 1024,
        sha1: format!("sha-{id}"),
        in_trash: false,
        is_deleted: false,
        highlighted_name: String::new(),
    }
}

pub(crate) fn search_page(ids: &[i64], total: u64) -> Value {
    let items: Vec<IndexDocument> = ids.iter().copied().map(document).collect();
    json!({ "items": items, "total": total })
}

/// Lets spawned tasks run without moving the paused clock far.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
