use bytes::Bytes;

/// Decode a raw query string into key/value pairs, preserving order.
pub fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    match query {
        Some(q) => form_urlencoded::parse(q.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect(),
        None => Vec::new(),
    }
}

/// The values that cross into a script. Built once per request-phase by the
/// gateway and shared read-only across the middleware chain.
#[derive(Debug, Clone, Default)]
pub struct ScriptRequest {
    pub method: String,
    pub path: String,
    /// Path plus query string, as received
    pub url: String,
    pub host: String,
    pub remote_addr: String,
    /// Request id assigned by the native middleware, for log correlation
    pub request_id: String,
    /// Header names in canonical HTTP form (`Content-Type`)
    pub headers: Vec<(String, String)>,
    /// Route pattern captures, in path order
    pub params: Vec<(String, String)>,
    /// Decoded query parameters
    pub query: Vec<(String, String)>,
    /// Bounded request body; empty when the request carried none
    pub body: Bytes,
}

/// The values a script hands back.
#[derive(Debug, Clone)]
pub struct ScriptResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ScriptResponse {
    /// Safe generic failure response. Never carries script internals.
    pub fn internal_error() -> Self {
        Self {
            status: 500,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: br#"{"error":"script execution failed","status":500}"#.to_vec(),
        }
    }

    /// Short-circuit response for middleware that neither returned a table
    /// nor yielded to the rest of the chain.
    pub fn no_content() -> Self {
        Self {
            status: 204,
            headers: vec![],
            body: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_error_is_json() {
        let resp = ScriptResponse::internal_error();
        assert_eq!(resp.status, 500);
        assert!(std::str::from_utf8(&resp.body).unwrap().contains("500"));
    }

    #[test]
    fn test_no_content_is_empty() {
        let resp = ScriptResponse::no_content();
        assert_eq!(resp.status, 204);
        assert!(resp.body.is_empty());
    }

    #[test]
    fn test_parse_query() {
        assert!(parse_query(None).is_empty());
        assert_eq!(
            parse_query(Some("a=1&b=two%20words")),
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "two words".to_string()),
            ]
        );
    }
}
