//! Synchronous CouchDB client.
//!
//! # Design
//! `CouchClient` owns one `Transport` and the parsed `Endpoint`. Every
//! operation is a blocking request/response exchange built on `request`;
//! only `delete` makes two round trips (read the revision, then delete it).
//! The client keeps two observational fields, the last server error and the
//! last find count, which callers read back through accessors after an
//! operation. Operations take `&mut self` because they update those fields.

use serde_json::{Map, Value};

use crate::config::{ClientConfig, Endpoint};
use crate::error::{CouchError, ServerError};
use crate::http::{HttpMethod, HttpRequest, HttpResponse};
use crate::query::QueryOptions;
use crate::transport::Transport;

/// Outcome of `find`: either a single document or a list of view rows.
#[derive(Debug, Clone, PartialEq)]
pub enum FindResult {
    Document(Map<String, Value>),
    Rows(Vec<Value>),
}

impl FindResult {
    pub fn into_rows(self) -> Option<Vec<Value>> {
        match self {
            FindResult::Rows(rows) => Some(rows),
            FindResult::Document(_) => None,
        }
    }

    pub fn into_document(self) -> Option<Map<String, Value>> {
        match self {
            FindResult::Document(doc) => Some(doc),
            FindResult::Rows(_) => None,
        }
    }
}

pub struct CouchClient {
    endpoint: Endpoint,
    transport: Option<Box<dyn Transport>>,
    last_error: Option<ServerError>,
    find_count: u64,
}

impl std::fmt::Debug for CouchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CouchClient")
            .field("base_url", &self.endpoint.base_url())
            .field("has_transport", &self.transport.is_some())
            .field("last_error", &self.last_error)
            .field("find_count", &self.find_count)
            .finish()
    }
}

impl CouchClient {
    /// Builds a client with the default HTTP transport.
    ///
    /// Without the `ureq` feature there is no transport to build; the client
    /// is still returned but every request fails with
    /// `CouchError::TransportUnavailable`.
    pub fn new(config: ClientConfig) -> Result<Self, CouchError> {
        #[cfg(feature = "ureq")]
        {
            Self::with_transport(config, crate::transport::UreqTransport::new())
        }
        #[cfg(not(feature = "ureq"))]
        {
            tracing::warn!("built without an HTTP transport; requests will fail");
            Self::offline(config)
        }
    }

    pub fn with_transport(
        config: ClientConfig,
        transport: impl Transport + 'static,
    ) -> Result<Self, CouchError> {
        Ok(Self {
            endpoint: Endpoint::parse(&config.host)?,
            transport: Some(Box::new(transport)),
            last_error: None,
            find_count: 0,
        })
    }

    /// A client with no transport. Every request short-circuits with
    /// `CouchError::TransportUnavailable`.
    pub fn offline(config: ClientConfig) -> Result<Self, CouchError> {
        Ok(Self {
            endpoint: Endpoint::parse(&config.host)?,
            transport: None,
            last_error: None,
            find_count: 0,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The most recent error envelope any request received, if any.
    pub fn last_error(&self) -> Option<&ServerError> {
        self.last_error.as_ref()
    }

    /// Document or row count recorded by the last successful `find`.
    pub fn last_find_count(&self) -> u64 {
        self.find_count
    }

    /// Describes a request without sending it.
    ///
    /// The body is attached only for POST and PUT, and only when it is not
    /// empty (`null`, `false`, `""`, `[]` or `{}`).
    pub fn build_request(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<&Value>,
    ) -> Result<HttpRequest, CouchError> {
        let mut headers = Vec::new();
        if let Some(auth) = self.endpoint.authorization() {
            headers.push(("authorization".to_string(), auth.to_string()));
        }

        let body = match body {
            Some(value) if method.allows_body() && !is_empty_value(value) => {
                let json = serde_json::to_string(value)
                    .map_err(|e| CouchError::Serialization(e.to_string()))?;
                headers.push(("content-type".to_string(), "application/json".to_string()));
                Some(json)
            }
            _ => None,
        };

        Ok(HttpRequest {
            method,
            url: self.endpoint.url_for(path),
            headers,
            body,
        })
    }

    /// Sends one request and decodes the JSON response.
    ///
    /// A body that is not JSON decodes to `Value::Null`. An error envelope in
    /// the response is recorded as the last error but still returned as
    /// `Ok`; only a missing transport, a bad method or a failed round trip
    /// produce `Err`.
    pub fn request(
        &mut self,
        method: &str,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, CouchError> {
        self.exchange(method, path, body).map(|(_, decoded)| decoded)
    }

    /// Like `request`, but an error envelope becomes `CouchError::Server`.
    fn call(&mut self, method: &str, path: &str, body: Option<&Value>) -> Result<Value, CouchError> {
        let (status, decoded) = self.exchange(method, path, body)?;
        match ServerError::from_body(status, &decoded) {
            Some(err) => Err(CouchError::Server(err)),
            None => Ok(decoded),
        }
    }

    fn exchange(
        &mut self,
        method: &str,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(u16, Value), CouchError> {
        if self.transport.is_none() {
            return Err(CouchError::TransportUnavailable);
        }
        let method: HttpMethod = method.parse()?;
        let request = self.build_request(method, path, body)?;
        let response = self.send(&request)?;

        let decoded = decode_body(&response.body);
        if let Some(err) = ServerError::from_body(response.status, &decoded) {
            tracing::debug!(
                url = %request.url,
                status = err.status,
                error = %err.error,
                "couchdb reported an error"
            );
            self.last_error = Some(err);
        }
        Ok((response.status, decoded))
    }

    fn send(&mut self, request: &HttpRequest) -> Result<HttpResponse, CouchError> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(CouchError::TransportUnavailable)?;

        tracing::debug!(method = %request.method, url = %request.url, "couchdb request");
        match transport.execute(request) {
            Ok(response) => {
                tracing::debug!(status = response.status, url = %request.url, "couchdb response");
                Ok(response)
            }
            Err(e) => {
                tracing::warn!(method = %request.method, url = %request.url, error = %e, "couchdb transport failed");
                Err(CouchError::Transport(e.message))
            }
        }
    }

    pub fn get(&mut self, path: &str) -> Result<Value, CouchError> {
        self.request("GET", path, None)
    }

    /// Returns the server's raw answer, including `file_exists` envelopes.
    pub fn create_database(&mut self, name: &str) -> Result<Value, CouchError> {
        self.request("PUT", &format!("/{name}"), None)
    }

    pub fn get_uuid(&mut self) -> Result<String, CouchError> {
        let response = self.call("GET", "/_uuids", None)?;
        response
            .get("uuids")
            .and_then(|uuids| uuids.get(0))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CouchError::UnexpectedResponse("no uuids in response".to_string()))
    }

    /// True when the round trip succeeded and the server did not answer
    /// with an error envelope.
    pub fn exists(&mut self, path: &str) -> bool {
        self.call("GET", path, None).is_ok()
    }

    /// Fetches `path` with `options` appended as a query string.
    ///
    /// A response with `_id` is a single document (find count 1); a response
    /// with `rows` is a view result (find count is `total_rows` when
    /// present, otherwise the number of rows returned).
    pub fn find(&mut self, path: &str, options: &QueryOptions) -> Result<FindResult, CouchError> {
        let response = self.call("GET", &options.apply(path), None)?;
        let Value::Object(mut body) = response else {
            return Err(CouchError::UnexpectedResponse(
                "find response is not an object".to_string(),
            ));
        };

        if body.contains_key("_id") {
            self.find_count = 1;
            return Ok(FindResult::Document(body));
        }

        match body.remove("rows") {
            Some(Value::Array(rows)) => {
                self.find_count = body
                    .get("total_rows")
                    .and_then(Value::as_u64)
                    .unwrap_or(rows.len() as u64);
                Ok(FindResult::Rows(rows))
            }
            _ => Err(CouchError::UnexpectedResponse(
                "find response has neither _id nor rows".to_string(),
            )),
        }
    }

    /// Stores `doc`, assigning a server-generated UUID when it has no `_id`.
    /// Returns the id the server acknowledged.
    pub fn insert_document(
        &mut self,
        database: &str,
        mut doc: Map<String, Value>,
    ) -> Result<String, CouchError> {
        let id = match doc.get("_id") {
            Some(Value::String(id)) => id.clone(),
            Some(other) => other.to_string(),
            None => {
                let uuid = self.get_uuid()?;
                doc.insert("_id".to_string(), Value::String(uuid.clone()));
                uuid
            }
        };

        let body = Value::Object(doc);
        let response = self.call("PUT", &document_path(database, &id), Some(&body))?;

        if !is_truthy(response.get("ok")) {
            return Err(CouchError::UnexpectedResponse(
                "document write was not acknowledged".to_string(),
            ));
        }
        Ok(response
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(id))
    }

    /// Stores the design document `_design/<name>` holding `views`.
    pub fn insert_view(
        &mut self,
        database: &str,
        name: &str,
        views: Value,
    ) -> Result<String, CouchError> {
        let mut doc = Map::new();
        doc.insert("_id".to_string(), Value::String(format!("_design/{name}")));
        doc.insert("views".to_string(), views);
        self.insert_document(database, doc)
    }

    /// Deletes the current revision of a document.
    ///
    /// The document is read first to learn its `_rev`; if that read fails no
    /// DELETE is sent.
    pub fn delete(&mut self, database: &str, id: &str) -> Result<(), CouchError> {
        let path = document_path(database, id);
        let current = self.call("GET", &path, None)?;
        let rev = match current.get("_rev") {
            Some(Value::String(rev)) => rev.clone(),
            _ => {
                return Err(CouchError::UnexpectedResponse(format!(
                    "{path} has no _rev"
                )))
            }
        };

        self.call(
            "DELETE",
            &format!("{path}?rev={}", urlencoding::encode(&rev)),
            None,
        )?;
        Ok(())
    }

    /// True when the root resource answers with the `"Welcome"` banner.
    pub fn is_connected(&mut self) -> bool {
        match self.get("") {
            Ok(body) => body.get("couchdb").and_then(Value::as_str) == Some("Welcome"),
            Err(_) => false,
        }
    }

    /// Queries a view and folds its rows into a `key -> value` map.
    ///
    /// Accumulation stops at the first row whose key is an array or object;
    /// rows before it are kept. Any failure yields an empty map.
    pub fn find_reduce(
        &mut self,
        database: &str,
        design_doc: &str,
        view: &str,
        options: &QueryOptions,
    ) -> Map<String, Value> {
        let path = format!(
            "/{}/_design/{}/_view/{}",
            encode_segments(database),
            encode_segments(design_doc),
            encode_segments(view)
        );
        let rows = match self.find(&path, options) {
            Ok(FindResult::Rows(rows)) => rows,
            Ok(FindResult::Document(_)) | Err(_) => return Map::new(),
        };
        reduce_rows(rows)
    }
}

/// Folds view rows into a map keyed by each row's scalar key.
pub fn reduce_rows(rows: Vec<Value>) -> Map<String, Value> {
    let mut reduced = Map::new();
    for mut row in rows {
        let key = match row.get("key") {
            Some(Value::Array(_)) | Some(Value::Object(_)) => break,
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => Value::Null.to_string(),
        };
        let value = row
            .as_object_mut()
            .and_then(|r| r.remove("value"))
            .unwrap_or(Value::Null);
        reduced.insert(key, value);
    }
    reduced
}

fn document_path(database: &str, id: &str) -> String {
    format!("/{}/{}", encode_segments(database), encode_segments(id))
}

/// Percent-encodes each `/`-separated segment, so `_design/<name>` ids keep
/// their slash while `?`, `#` and spaces cannot break the URL.
fn encode_segments(raw: &str) -> String {
    raw.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn decode_body(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or(Value::Null)
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(true) | Value::Number(_) => false,
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::Number(n)) => n.as_f64() != Some(0.0),
        Some(other) => !is_empty_value(other),
    }
}
