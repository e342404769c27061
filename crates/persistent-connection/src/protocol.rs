//! Wire-level frame types, action constants, and request body builders.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::types::AuthOverride;

// ---------------------------------------------------------------------------
// Action constants
// ---------------------------------------------------------------------------

/// Outbound request actions.
pub mod action {
    pub const GET: &str = "g";
    pub const LISTEN: &str = "q";
    pub const UNLISTEN: &str = "n";
    pub const PUT: &str = "p";
    pub const MERGE: &str = "m";
    pub const ON_DISCONNECT_PUT: &str = "o";
    pub const ON_DISCONNECT_MERGE: &str = "om";
    pub const ON_DISCONNECT_CANCEL: &str = "oc";
    pub const AUTH: &str = "auth";
    pub const GAUTH: &str = "gauth";
    pub const UNAUTH: &str = "unauth";
    pub const APP_CHECK: &str = "appcheck";
    pub const UNAPP_CHECK: &str = "unappcheck";
    pub const STATS: &str = "s";
}

/// Server push actions.
pub mod push {
    pub const DATA: &str = "d";
    pub const MERGE: &str = "m";
    pub const LISTEN_REVOKED: &str = "c";
    pub const AUTH_REVOKED: &str = "ac";
    pub const APP_CHECK_REVOKED: &str = "apc";
    pub const SECURITY_DEBUG: &str = "sd";
}

/// Response status strings.
pub mod status {
    pub const OK: &str = "ok";
    pub const DISCONNECT: &str = "disconnect";
    pub const PERMISSION_DENIED: &str = "permission_denied";
    pub const INVALID_TOKEN: &str = "invalid_token";
}

/// Query id used for listens on the default (load-everything) query.
pub const DEFAULT_QUERY_ID: &str = "default";

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// An outbound request frame: `{r: id, a: action, b: body}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "r")]
    pub id: u64,
    #[serde(rename = "a")]
    pub action: String,
    #[serde(rename = "b")]
    pub body: Value,
}

/// Body of a response frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseBody {
    #[serde(rename = "s")]
    pub status: String,
    #[serde(rename = "d")]
    pub data: Value,
}

impl ResponseBody {
    pub fn is_ok(&self) -> bool {
        self.status == status::OK
    }
}

/// A decoded inbound data frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response { id: u64, body: ResponseBody },
    Push { action: String, body: Value },
    ServerError(Value),
    Unrecognized(Value),
}

#[derive(Deserialize)]
struct RawFrame {
    r: Option<u64>,
    a: Option<String>,
    #[serde(default)]
    b: Value,
    error: Option<Value>,
}

/// Classify an inbound frame. Never fails: frames that do not match a known
/// shape come back as [`Incoming::Unrecognized`].
pub fn decode_incoming(frame: Value) -> Incoming {
    let raw: RawFrame = match serde_json::from_value(frame.clone()) {
        Ok(raw) => raw,
        Err(_) => return Incoming::Unrecognized(frame),
    };
    if let Some(id) = raw.r {
        let body = serde_json::from_value(raw.b).unwrap_or_default();
        return Incoming::Response { id, body };
    }
    if let Some(err) = raw.error {
        return Incoming::ServerError(err);
    }
    if let Some(action) = raw.a {
        return Incoming::Push {
            action,
            body: raw.b,
        };
    }
    Incoming::Unrecognized(frame)
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

pub fn listen_body(path: &str, query: &Value, tag: Option<u64>, hash: String) -> Value {
    let mut body = Map::new();
    body.insert("p".into(), Value::String(path.to_string()));
    // Default queries carry no tag and the server does not need the query.
    if let Some(tag) = tag {
        body.insert("q".into(), query.clone());
        body.insert("t".into(), Value::from(tag));
    }
    body.insert("h".into(), Value::String(hash));
    Value::Object(body)
}

pub fn unlisten_body(path: &str, query: &Value, tag: Option<u64>) -> Value {
    let mut body = Map::new();
    body.insert("p".into(), Value::String(path.to_string()));
    if let Some(tag) = tag {
        body.insert("q".into(), query.clone());
        body.insert("t".into(), Value::from(tag));
    }
    Value::Object(body)
}

pub fn write_body(path: &str, data: &Value, hash: Option<&str>) -> Value {
    let mut body = Map::new();
    body.insert("p".into(), Value::String(path.to_string()));
    body.insert("d".into(), data.clone());
    if let Some(hash) = hash {
        body.insert("h".into(), Value::String(hash.to_string()));
    }
    Value::Object(body)
}

pub fn on_disconnect_body(path: &str, data: &Value) -> Value {
    json!({ "p": path, "d": data })
}

pub fn get_body(path: &str, query: &Value) -> Value {
    json!({ "p": path, "q": query })
}

pub fn stats_body(counters: &Map<String, Value>) -> Value {
    json!({ "c": counters })
}

pub fn app_check_body(token: &str) -> Value {
    json!({ "token": token })
}

// ---------------------------------------------------------------------------
// Paths and query ids
// ---------------------------------------------------------------------------

/// Collapse empty segments so `a//b/` and `/a/b` address the same location.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// Derive the query id named by a listen-revocation push.
///
/// Each query element is keyed by its canonical JSON (object keys sorted),
/// joined with `$`. A missing query means the default query.
pub fn query_id_from_revocation(query: Option<&Value>) -> String {
    match query {
        None | Some(Value::Null) => DEFAULT_QUERY_ID.to_string(),
        Some(Value::Array(items)) => items
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join("$"),
        Some(other) => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Credential classification
// ---------------------------------------------------------------------------

/// Length of a legacy database secret.
const LEGACY_SECRET_LEN: usize = 40;

fn decode_jwt_claims(token: &str) -> Option<Map<String, Value>> {
    let mut parts = token.split('.');
    let (_header, claims, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(claims.trim_end_matches('='))
        .ok()?;
    match serde_json::from_slice(&bytes).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// A JWT whose claims carry an `iat` is sent with `auth`; anything else uses `gauth`.
pub fn is_jwt_credential(token: &str) -> bool {
    decode_jwt_claims(token).is_some_and(|claims| claims.contains_key("iat"))
}

/// Heuristic for administrative credentials: a legacy secret, or a JWT with
/// an `admin: true` claim.
pub fn is_admin_credential(token: &str) -> bool {
    if token.len() == LEGACY_SECRET_LEN {
        return true;
    }
    decode_jwt_claims(token)
        .is_some_and(|claims| claims.get("admin").and_then(Value::as_bool) == Some(true))
}

/// The auth request action and body for a credential.
pub fn auth_request(token: &str, auth_override: Option<&AuthOverride>) -> (&'static str, Value) {
    let action = if is_jwt_credential(token) {
        action::AUTH
    } else {
        action::GAUTH
    };
    let mut body = Map::new();
    body.insert("cred".into(), Value::String(token.to_string()));
    match auth_override {
        Some(AuthOverride::Anonymous) => {
            body.insert("noauth".into(), Value::Bool(true));
        }
        Some(AuthOverride::Claims(claims)) => {
            body.insert("authvar".into(), claims.clone());
        }
        None => {}
    }
    (action, Value::Object(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt(claims: Value) -> String {
        let enc = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        format!(
            "{}.{}.sig",
            enc.encode(br#"{"alg":"HS256"}"#),
            enc.encode(claims.to_string())
        )
    }

    #[test]
    fn request_serializes_with_short_keys() {
        let req = Request {
            id: 7,
            action: action::PUT.to_string(),
            body: json!({"p": "/a"}),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v, json!({"r": 7, "a": "p", "b": {"p": "/a"}}));
    }

    #[test]
    fn decode_response_frame() {
        let frame = json!({"r": 3, "b": {"s": "ok", "d": {"x": 1}}});
        match decode_incoming(frame) {
            Incoming::Response { id, body } => {
                assert_eq!(id, 3);
                assert!(body.is_ok());
                assert_eq!(body.data, json!({"x": 1}));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn decode_response_with_missing_body_is_not_ok() {
        match decode_incoming(json!({"r": 1})) {
            Incoming::Response { body, .. } => {
                assert!(!body.is_ok());
                assert_eq!(body.data, Value::Null);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn decode_push_and_error_frames() {
        assert_eq!(
            decode_incoming(json!({"a": "d", "b": {"p": "/a", "d": 1}})),
            Incoming::Push {
                action: "d".into(),
                body: json!({"p": "/a", "d": 1})
            }
        );
        assert_eq!(
            decode_incoming(json!({"error": "boom"})),
            Incoming::ServerError(json!("boom"))
        );
        assert!(matches!(
            decode_incoming(json!("text")),
            Incoming::Unrecognized(_)
        ));
    }

    #[test]
    fn listen_body_omits_query_for_default() {
        let body = listen_body("/a", &json!({"l": 5}), None, "h1".into());
        assert_eq!(body, json!({"p": "/a", "h": "h1"}));

        let body = listen_body("/a", &json!({"l": 5}), Some(2), "h1".into());
        assert_eq!(body, json!({"p": "/a", "q": {"l": 5}, "t": 2, "h": "h1"}));
    }

    #[test]
    fn write_body_hash_is_optional() {
        assert_eq!(
            write_body("/x", &json!({"v": 1}), None),
            json!({"p": "/x", "d": {"v": 1}})
        );
        assert_eq!(
            write_body("/x", &json!(1), Some("abc")),
            json!({"p": "/x", "d": 1, "h": "abc"})
        );
    }

    #[test]
    fn normalize_path_collapses_slashes() {
        assert_eq!(normalize_path("a//b/"), "/a/b");
        assert_eq!(normalize_path("/a/b"), "/a/b");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("///"), "/");
    }

    #[test]
    fn revocation_query_id() {
        assert_eq!(query_id_from_revocation(None), "default");
        assert_eq!(
            query_id_from_revocation(Some(&json!([{"sp": 1, "ep": 2}, "x"]))),
            r#"{"ep":2,"sp":1}$"x""#
        );
    }

    #[test]
    fn admin_detection() {
        assert!(is_admin_credential(&"s".repeat(40)));
        assert!(!is_admin_credential(&"s".repeat(39)));
        assert!(is_admin_credential(&jwt(json!({"admin": true, "iat": 1}))));
        assert!(!is_admin_credential(&jwt(json!({"admin": false, "iat": 1}))));
        assert!(!is_admin_credential("not-a-jwt"));
    }

    #[test]
    fn auth_action_depends_on_token_shape() {
        let (a, body) = auth_request(&jwt(json!({"iat": 1})), None);
        assert_eq!(a, action::AUTH);
        assert!(body.get("noauth").is_none());

        let (a, _) = auth_request("opaque-oauth-token", None);
        assert_eq!(a, action::GAUTH);

        let (_, body) = auth_request("t", Some(&AuthOverride::Anonymous));
        assert_eq!(body, json!({"cred": "t", "noauth": true}));

        let claims = json!({"uid": "svc"});
        let (_, body) = auth_request("t", Some(&AuthOverride::Claims(claims.clone())));
        assert_eq!(body["authvar"], claims);
    }
}
