//! Verify `find` and `find_reduce` against JSON test vectors stored in `test-vectors/`.
//!
//! Each `find` vector describes the call inputs, the request the client is
//! expected to send, a simulated server response, and the expected result.
//! A replaying transport stands in for the network. Comparing parsed JSON
//! (not raw strings) avoids false negatives from field ordering.

use std::cell::RefCell;
use std::rc::Rc;

use couch_core::{
    ClientConfig, CouchClient, CouchError, FindResult, HttpMethod, HttpRequest, HttpResponse,
    QueryOptions, Transport, TransportError,
};
use serde_json::Value;

const BASE_URL: &str = "http://localhost:5984";

/// Answers every request with one fixed response and remembers the requests.
#[derive(Clone)]
struct Replay {
    response: HttpResponse,
    seen: Rc<RefCell<Vec<HttpRequest>>>,
}

impl Transport for Replay {
    fn execute(&mut self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.seen.borrow_mut().push(request.clone());
        Ok(self.response.clone())
    }
}

fn replay(sim: &Value) -> Replay {
    Replay {
        response: HttpResponse {
            status: sim["status"].as_u64().unwrap() as u16,
            headers: Vec::new(),
            body: sim["body"].as_str().unwrap().to_string(),
        },
        seen: Rc::default(),
    }
}

/// Parse the method string from test vectors into `HttpMethod`.
fn parse_method(s: &str) -> HttpMethod {
    s.parse().unwrap_or_else(|_| panic!("unknown method: {s}"))
}

fn parse_options(raw: &Value) -> QueryOptions {
    raw.as_array()
        .unwrap()
        .iter()
        .map(|pair| {
            let pair = pair.as_array().unwrap();
            (pair[0].as_str().unwrap().to_string(), pair[1].clone())
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Find
// ---------------------------------------------------------------------------

#[test]
fn find_test_vectors() {
    let raw = include_str!("../../test-vectors/find.json");
    let vectors: Value = serde_json::from_str(raw).unwrap();

    for case in vectors["cases"].as_array().unwrap() {
        let name = case["name"].as_str().unwrap();
        let transport = replay(&case["simulated_response"]);
        let mut client =
            CouchClient::with_transport(ClientConfig::new(BASE_URL), transport.clone()).unwrap();

        let options = parse_options(&case["options"]);
        let result = client.find(case["path"].as_str().unwrap(), &options);

        // Verify request
        let seen = transport.seen.borrow();
        assert_eq!(seen.len(), 1, "{name}: one round trip");
        let expected_req = &case["expected_request"];
        assert_eq!(
            seen[0].method,
            parse_method(expected_req["method"].as_str().unwrap()),
            "{name}: method"
        );
        assert_eq!(
            seen[0].url,
            format!("{BASE_URL}{}", expected_req["path"].as_str().unwrap()),
            "{name}: url"
        );
        assert!(seen[0].body.is_none(), "{name}: body should be None");

        // Verify interpretation
        if let Some(expected_error) = case.get("expected_error") {
            let err = result.unwrap_err();
            match expected_error.as_str().unwrap() {
                "Server" => assert!(matches!(err, CouchError::Server(_)), "{name}: expected Server"),
                "UnexpectedResponse" => assert!(
                    matches!(err, CouchError::UnexpectedResponse(_)),
                    "{name}: expected UnexpectedResponse"
                ),
                other => panic!("{name}: unknown expected_error: {other}"),
            }
            continue;
        }

        let expected = &case["expected_result"];
        match result.unwrap() {
            FindResult::Document(doc) => {
                assert_eq!(Value::Object(doc), expected["document"], "{name}: document");
            }
            FindResult::Rows(rows) => {
                assert_eq!(Value::Array(rows), expected["rows"], "{name}: rows");
            }
        }
        assert_eq!(
            client.last_find_count(),
            expected["find_count"].as_u64().unwrap(),
            "{name}: find count"
        );
    }
}

// ---------------------------------------------------------------------------
// Find reduce
// ---------------------------------------------------------------------------

#[test]
fn find_reduce_test_vectors() {
    let raw = include_str!("../../test-vectors/find_reduce.json");
    let vectors: Value = serde_json::from_str(raw).unwrap();

    for case in vectors["cases"].as_array().unwrap() {
        let name = case["name"].as_str().unwrap();
        let body = serde_json::json!({ "rows": case["rows"] }).to_string();
        let transport = Replay {
            response: HttpResponse {
                status: 200,
                headers: Vec::new(),
                body,
            },
            seen: Rc::default(),
        };
        let mut client =
            CouchClient::with_transport(ClientConfig::new(BASE_URL), transport.clone()).unwrap();

        let reduced = client.find_reduce("db", "stats", "by_key", &QueryOptions::new());
        assert_eq!(Value::Object(reduced), case["expected_result"], "{name}: reduced map");
        assert_eq!(
            transport.seen.borrow()[0].url,
            format!("{BASE_URL}/db/_design/stats/_view/by_key"),
            "{name}: url"
        );
    }
}
