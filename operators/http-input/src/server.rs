//! Handling of the HTTP requests.
use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use hyper::{
    Body, Method, Request, Response, StatusCode,
    body::HttpBody,
    header::{CONTENT_LENGTH, HOST},
};
use logsreceiver::{entry::Entry, operator::EntrySender};

use crate::{
    auth::Auth,
    labels::{add_host_labels, add_peer_labels, add_proto_labels},
};

/// Network information about a request, used to label the entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    /// Address of the client, `ip:port`.
    pub remote_addr: String,
    /// Value of the `Host` header.
    pub host: String,
    /// Protocol and version, for instance `HTTP/1.1`.
    pub proto: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("payload and http request must be set")]
    MissingInput,
}

/// Creates an entry from a decoded payload.
///
/// The body of the entry is the payload. The network attributes are derived from the
/// request when possible, an address that cannot be split is skipped.
pub fn parse(
    payload: Option<serde_json::Map<String, serde_json::Value>>,
    request: Option<&RequestInfo>,
) -> Result<Entry, ParseError> {
    let (Some(payload), Some(request)) = (payload, request) else {
        return Err(ParseError::MissingInput);
    };
    let mut entry = Entry::with_body(payload);
    if let Err(e) = add_peer_labels(&request.remote_addr, &mut entry) {
        log::debug!("peer attributes not set: {e}");
    }
    if let Err(e) = add_host_labels(&request.host, &mut entry) {
        log::debug!("host attributes not set: {e}");
    }
    if let Err(e) = add_proto_labels(&request.proto, &mut entry) {
        log::debug!("protocol attributes not set: {e}");
    }
    Ok(entry)
}

/// State shared by the connections of a server.
pub(crate) struct Handler {
    pub operator_id: String,
    pub auth: Auth,
    pub max_body_size: u64,
    pub output: EntrySender,
}

enum BodyError {
    TooLarge,
    Read(hyper::Error),
}

impl Handler {
    pub(crate) async fn handle(
        self: Arc<Self>,
        req: Request<Body>,
        remote_addr: SocketAddr,
    ) -> Result<Response<Body>, Infallible> {
        let response = match req.uri().path() {
            "/health" => respond(StatusCode::OK, ""),
            "/" => self.ingest(req, remote_addr).await,
            _ => respond(StatusCode::NOT_FOUND, "not found"),
        };
        Ok(response)
    }

    async fn ingest(&self, req: Request<Body>, remote_addr: SocketAddr) -> Response<Body> {
        // liveness check on the root path
        if req.method() == Method::GET && req.body().is_end_stream() {
            return respond(StatusCode::OK, "");
        }
        if !self.auth.check(req.headers()) {
            log::debug!("[{}] request from {remote_addr} rejected: unauthorized", self.operator_id);
            return respond(StatusCode::FORBIDDEN, "forbidden");
        }
        if req.method() != Method::POST {
            return respond(StatusCode::NOT_FOUND, "not found");
        }

        let declared_len = req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if declared_len.is_some_and(|len| len > self.max_body_size) {
            return self.too_large(remote_addr);
        }

        let info = RequestInfo {
            remote_addr: remote_addr.to_string(),
            host: req
                .headers()
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_owned)
                .or_else(|| req.uri().authority().map(|a| a.to_string()))
                .unwrap_or_default(),
            proto: format!("{:?}", req.version()),
        };

        let body = match read_body(req.into_body(), self.max_body_size).await {
            Ok(body) => body,
            Err(BodyError::TooLarge) => return self.too_large(remote_addr),
            Err(BodyError::Read(e)) => {
                log::debug!("[{}] failed to read the request body: {e}", self.operator_id);
                return respond(StatusCode::BAD_REQUEST, "failed to read the request body");
            }
        };

        let payload = match serde_json::from_slice::<serde_json::Value>(&body) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(other) => {
                let msg = format!("expected a JSON object, got {}", json_type(&other));
                log::debug!("[{}] invalid request from {remote_addr}: {msg}", self.operator_id);
                return respond(StatusCode::BAD_REQUEST, msg);
            }
            Err(e) => {
                let msg = format!("failed to decode the body as JSON: {e}");
                log::debug!("[{}] invalid request from {remote_addr}: {msg}", self.operator_id);
                return respond(StatusCode::BAD_REQUEST, msg);
            }
        };
        let entry = match parse(Some(payload), Some(&info)) {
            Ok(entry) => entry,
            Err(e) => return respond(StatusCode::BAD_REQUEST, e.to_string()),
        };

        match self.output.send(entry).await {
            Ok(()) => respond(StatusCode::CREATED, ""),
            Err(_) => {
                log::warn!("[{}] entry dropped: the pipeline is closed", self.operator_id);
                respond(StatusCode::SERVICE_UNAVAILABLE, "the pipeline is closed")
            }
        }
    }

    fn too_large(&self, remote_addr: SocketAddr) -> Response<Body> {
        log::debug!(
            "[{}] request from {remote_addr} rejected: body larger than {} bytes",
            self.operator_id,
            self.max_body_size
        );
        respond(StatusCode::PAYLOAD_TOO_LARGE, "request body too large")
    }
}

/// Reads the whole body, up to `limit` bytes.
async fn read_body(mut body: Body, limit: u64) -> Result<Vec<u8>, BodyError> {
    let mut buf = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(BodyError::Read)?;
        if (buf.len() + chunk.len()) as u64 > limit {
            return Err(BodyError::TooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

fn respond(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
