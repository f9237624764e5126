//! HTTP transport types shared by the client and its transports.
//!
//! # Design
//! Requests and responses are plain data. `CouchClient` builds an
//! `HttpRequest`, hands it to a `Transport`, and interprets the returned
//! `HttpResponse`. Keeping the values owned (`String`, `Vec`) lets any
//! transport, including the scripted ones used in tests, stand in for the
//! network.

use std::fmt;
use std::str::FromStr;

use crate::error::CouchError;

/// HTTP method accepted by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Only POST and PUT carry a JSON payload.
    pub fn allows_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put)
    }
}

impl FromStr for HttpMethod {
    type Err = CouchError;

    /// Case-insensitive; anything outside GET/POST/PUT/DELETE is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            _ => Err(CouchError::UnsupportedMethod(s.to_string())),
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An HTTP request described as plain data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// An HTTP response described as plain data. Non-2xx statuses are still
/// responses; the body carries the server's error envelope.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_parsing_ignores_case() {
        assert_eq!("get".parse::<HttpMethod>().unwrap(), HttpMethod::Get);
        assert_eq!("GET".parse::<HttpMethod>().unwrap(), HttpMethod::Get);
        assert_eq!("Put".parse::<HttpMethod>().unwrap(), HttpMethod::Put);
        assert_eq!("delete".parse::<HttpMethod>().unwrap(), HttpMethod::Delete);
        assert_eq!("pOsT".parse::<HttpMethod>().unwrap(), HttpMethod::Post);
    }

    #[test]
    fn method_parsing_rejects_other_verbs() {
        for verb in ["PATCH", "HEAD", "OPTIONS", "", "GETX"] {
            let err = verb.parse::<HttpMethod>().unwrap_err();
            assert!(matches!(err, CouchError::UnsupportedMethod(ref m) if m == verb));
        }
    }

    #[test]
    fn only_post_and_put_allow_body() {
        assert!(HttpMethod::Post.allows_body());
        assert!(HttpMethod::Put.allows_body());
        assert!(!HttpMethod::Get.allows_body());
        assert!(!HttpMethod::Delete.allows_body());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let req = HttpRequest {
            method: HttpMethod::Put,
            url: "http://localhost:5984/db".to_string(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: None,
        };
        assert_eq!(req.header("Content-Type"), Some("application/json"));
        assert_eq!(req.header("authorization"), None);
    }
}
