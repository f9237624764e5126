//! In-memory stand-in for the subset of the CouchDB REST API the client uses.
//!
//! Databases hold JSON documents keyed by id. Every write mints a revision
//! token `N-<hex>`; updates and deletes must quote the current one. Design
//! documents are stored like any other document, and view queries return
//! all-docs style rows (`key` = document id) without evaluating map functions.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde_json::{json, Map, Value};
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

pub const VERSION: &str = "3.3.3";
const MAX_UUIDS: usize = 1000;

pub type Document = Map<String, Value>;

#[derive(Debug, Default)]
pub struct Database {
    pub docs: BTreeMap<String, Document>,
}

impl Database {
    /// Documents that are not design documents.
    fn regular_docs(&self) -> impl DoubleEndedIterator<Item = (&String, &Document)> {
        self.docs.iter().filter(|(id, _)| !id.starts_with("_design/"))
    }
}

#[derive(Debug, Default)]
pub struct Couch {
    pub databases: HashMap<String, Database>,
}

pub type Db = Arc<RwLock<Couch>>;

type Reply = (StatusCode, Json<Value>);

pub fn app() -> Router {
    let db: Db = Arc::new(RwLock::new(Couch::default()));
    Router::new()
        .route("/", get(welcome))
        .route("/_uuids", get(uuids))
        .route("/{db}", get(database_info).put(create_database).delete(delete_database))
        .route("/{db}/_all_docs", get(all_docs))
        .route("/{db}/{id}", get(get_doc).put(put_doc).delete(delete_doc))
        .route(
            "/{db}/_design/{ddoc}",
            get(get_design).put(put_design).delete(delete_design),
        )
        .route("/{db}/_design/{ddoc}/_view/{view}", get(query_view))
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

fn error(status: StatusCode, error: &str, reason: &str) -> Reply {
    (status, Json(json!({ "error": error, "reason": reason })))
}

fn missing_database() -> Reply {
    error(StatusCode::NOT_FOUND, "not_found", "Database does not exist.")
}

fn missing_doc() -> Reply {
    error(StatusCode::NOT_FOUND, "not_found", "missing")
}

fn conflict() -> Reply {
    error(StatusCode::CONFLICT, "conflict", "Document update conflict.")
}

/// Lowercase letter first, then lowercase letters, digits or `_$()+-/`.
pub fn valid_db_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || "_$()+-/".contains(c)
        })
}

/// The revision that follows `current`: generation plus one, fresh suffix.
pub fn next_rev(current: Option<&str>) -> String {
    let generation = current
        .and_then(|rev| rev.split_once('-'))
        .and_then(|(n, _)| n.parse::<u64>().ok())
        .unwrap_or(0);
    format!("{}-{}", generation + 1, Uuid::new_v4().simple())
}

fn rev_of(doc: &Document) -> Option<&str> {
    doc.get("_rev").and_then(Value::as_str)
}

async fn welcome() -> Json<Value> {
    Json(json!({
        "couchdb": "Welcome",
        "version": VERSION,
        "vendor": { "name": "mock-server" }
    }))
}

async fn uuids(Query(params): Query<HashMap<String, String>>) -> Reply {
    let count = match params.get("count").map(|c| c.parse::<usize>()) {
        None => 1,
        Some(Ok(n)) if n <= MAX_UUIDS => n,
        Some(_) => return error(StatusCode::BAD_REQUEST, "bad_request", "invalid count"),
    };
    let uuids: Vec<String> = (0..count)
        .map(|_| Uuid::new_v4().simple().to_string())
        .collect();
    (StatusCode::OK, Json(json!({ "uuids": uuids })))
}

async fn database_info(State(db): State<Db>, Path(name): Path<String>) -> Reply {
    let couch = db.read().await;
    match couch.databases.get(&name) {
        Some(database) => (
            StatusCode::OK,
            Json(json!({ "db_name": name, "doc_count": database.docs.len() })),
        ),
        None => missing_database(),
    }
}

async fn create_database(State(db): State<Db>, Path(name): Path<String>) -> Reply {
    if !valid_db_name(&name) {
        return error(
            StatusCode::BAD_REQUEST,
            "illegal_database_name",
            "Name must begin with a lowercase letter.",
        );
    }
    let mut couch = db.write().await;
    if couch.databases.contains_key(&name) {
        return error(
            StatusCode::PRECONDITION_FAILED,
            "file_exists",
            "The database could not be created, the file already exists.",
        );
    }
    tracing::debug!(database = %name, "created database");
    couch.databases.insert(name, Database::default());
    (StatusCode::CREATED, Json(json!({ "ok": true })))
}

async fn delete_database(State(db): State<Db>, Path(name): Path<String>) -> Reply {
    let mut couch = db.write().await;
    match couch.databases.remove(&name) {
        Some(_) => {
            tracing::debug!(database = %name, "deleted database");
            (StatusCode::OK, Json(json!({ "ok": true })))
        }
        None => missing_database(),
    }
}

async fn read_doc(db: &Db, name: &str, id: &str) -> Reply {
    let couch = db.read().await;
    let Some(database) = couch.databases.get(name) else {
        return missing_database();
    };
    match database.docs.get(id) {
        Some(doc) => (StatusCode::OK, Json(Value::Object(doc.clone()))),
        None => missing_doc(),
    }
}

async fn write_doc(db: &Db, name: &str, id: String, body: &[u8]) -> Reply {
    let Ok(Value::Object(mut doc)) = serde_json::from_slice::<Value>(body) else {
        return error(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "Document must be a JSON object",
        );
    };

    let mut couch = db.write().await;
    let Some(database) = couch.databases.get_mut(name) else {
        return missing_database();
    };

    let current = database.docs.get(&id).and_then(rev_of).map(str::to_string);
    if current.as_deref() != doc.get("_rev").and_then(Value::as_str) {
        return conflict();
    }

    let rev = next_rev(current.as_deref());
    doc.insert("_id".to_string(), Value::String(id.clone()));
    doc.insert("_rev".to_string(), Value::String(rev.clone()));
    tracing::debug!(database = %name, id = %id, rev = %rev, "stored document");
    database.docs.insert(id.clone(), doc);
    (
        StatusCode::CREATED,
        Json(json!({ "ok": true, "id": id, "rev": rev })),
    )
}

async fn remove_doc(db: &Db, name: &str, id: &str, params: &HashMap<String, String>) -> Reply {
    let mut couch = db.write().await;
    let Some(database) = couch.databases.get_mut(name) else {
        return missing_database();
    };
    let Some(doc) = database.docs.get(id) else {
        return missing_doc();
    };
    let current = rev_of(doc).map(str::to_string);
    if current.as_deref() != params.get("rev").map(String::as_str) {
        return conflict();
    }

    database.docs.remove(id);
    let rev = next_rev(current.as_deref());
    tracing::debug!(database = %name, id = %id, "deleted document");
    (
        StatusCode::OK,
        Json(json!({ "ok": true, "id": id, "rev": rev })),
    )
}

async fn get_doc(State(db): State<Db>, Path((name, id)): Path<(String, String)>) -> Reply {
    read_doc(&db, &name, &id).await
}

async fn put_doc(
    State(db): State<Db>,
    Path((name, id)): Path<(String, String)>,
    body: Bytes,
) -> Reply {
    write_doc(&db, &name, id, &body).await
}

async fn delete_doc(
    State(db): State<Db>,
    Path((name, id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Reply {
    remove_doc(&db, &name, &id, &params).await
}

async fn get_design(State(db): State<Db>, Path((name, ddoc)): Path<(String, String)>) -> Reply {
    read_doc(&db, &name, &format!("_design/{ddoc}")).await
}

async fn put_design(
    State(db): State<Db>,
    Path((name, ddoc)): Path<(String, String)>,
    body: Bytes,
) -> Reply {
    write_doc(&db, &name, format!("_design/{ddoc}"), &body).await
}

async fn delete_design(
    State(db): State<Db>,
    Path((name, ddoc)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Reply {
    remove_doc(&db, &name, &format!("_design/{ddoc}"), &params).await
}

async fn all_docs(
    State(db): State<Db>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Reply {
    let couch = db.read().await;
    match couch.databases.get(&name) {
        Some(database) => list_rows(database, &params),
        None => missing_database(),
    }
}

async fn query_view(
    State(db): State<Db>,
    Path((name, ddoc, view)): Path<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Reply {
    let couch = db.read().await;
    let Some(database) = couch.databases.get(&name) else {
        return missing_database();
    };
    let Some(design) = database.docs.get(&format!("_design/{ddoc}")) else {
        return missing_doc();
    };
    if design.get("views").and_then(|v| v.get(&view)).is_none() {
        return error(StatusCode::NOT_FOUND, "not_found", "missing_named_view");
    }
    list_rows(database, &params)
}

/// Every regular document in id order as `{id, key, value: {rev}}` rows,
/// honoring `descending`, `skip` and `limit`.
fn list_rows(database: &Database, params: &HashMap<String, String>) -> Reply {
    let parse = |key: &str| params.get(key).map(|v| v.parse::<usize>());
    let skip = match parse("skip") {
        None => 0,
        Some(Ok(n)) => n,
        Some(Err(_)) => return error(StatusCode::BAD_REQUEST, "query_parse_error", "Invalid skip"),
    };
    let limit = match parse("limit") {
        None => usize::MAX,
        Some(Ok(n)) => n,
        Some(Err(_)) => return error(StatusCode::BAD_REQUEST, "query_parse_error", "Invalid limit"),
    };
    let descending = params.get("descending").is_some_and(|v| v == "true");

    let to_row = |(id, doc): (&String, &Document)| {
        json!({ "id": id, "key": id, "value": { "rev": rev_of(doc) } })
    };
    let rows: Vec<Value> = if descending {
        database.regular_docs().rev().skip(skip).take(limit).map(to_row).collect()
    } else {
        database.regular_docs().skip(skip).take(limit).map(to_row).collect()
    };

    (
        StatusCode::OK,
        Json(json!({
            "total_rows": database.regular_docs().count(),
            "offset": skip,
            "rows": rows
        })),
    )
}
