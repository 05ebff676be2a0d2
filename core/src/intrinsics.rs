/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the W++ Runtime.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 */

use crate::runtime::{Future, NativeFn, RuntimeError, Scope, Value};

use indexmap::IndexMap;
use std::sync::OnceLock;
use tokio::runtime::Runtime;
use tracing::{debug, warn};

static HTTP_RUNTIME: OnceLock<Option<Runtime>> = OnceLock::new();

fn http_runtime() -> Result<&'static Runtime, RuntimeError> {
    HTTP_RUNTIME
        .get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .map_err(|e| warn!(error = %e, "failed to start http runtime"))
                .ok()
        })
        .as_ref()
        .ok_or_else(|| RuntimeError::Host("HTTP runtime unavailable".into()))
}

/// Seeds the `http` and `json` builtin objects into the global frame.
pub fn install(scope: &mut Scope) {
    scope.bind(
        "http",
        builtin_object(&[
            ("get", http_get),
            ("post", http_post),
            ("put", http_put),
            ("patch", http_patch),
            ("delete", http_delete),
        ]),
    );
    scope.bind(
        "json",
        builtin_object(&[("parse", json_parse), ("stringify", json_stringify)]),
    );
}

fn builtin_object(entries: &[(&str, NativeFn)]) -> Value {
    Value::Object(
        entries
            .iter()
            .map(|(name, f)| (name.to_string(), Value::Native(*f)))
            .collect(),
    )
}

// ============================================================================
// HTTP
// ============================================================================

/// Plain-data response so it can cross back from the worker thread.
struct HttpResponse {
    status: u16,
    body: String,
    headers: Vec<(String, String)>,
}

impl HttpResponse {
    fn into_value(self) -> Value {
        let headers = self
            .headers
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        let mut resp = IndexMap::new();
        resp.insert("status".to_string(), Value::Number(self.status as f64));
        resp.insert("body".to_string(), Value::String(self.body));
        resp.insert("headers".to_string(), Value::Object(headers));
        Value::Object(resp)
    }
}

fn http_get(args: &[Value]) -> Result<Value, RuntimeError> {
    http_request("GET", args, false)
}

fn http_delete(args: &[Value]) -> Result<Value, RuntimeError> {
    http_request("DELETE", args, false)
}

fn http_post(args: &[Value]) -> Result<Value, RuntimeError> {
    http_request("POST", args, true)
}

fn http_put(args: &[Value]) -> Result<Value, RuntimeError> {
    http_request("PUT", args, true)
}

fn http_patch(args: &[Value]) -> Result<Value, RuntimeError> {
    http_request("PATCH", args, true)
}

/// `(url, body?, headers?)` for verbs with a body, `(url, headers?)` otherwise.
/// Returns a pending future; the request runs on a blocking worker.
fn http_request(method: &'static str, args: &[Value], with_body: bool) -> Result<Value, RuntimeError> {
    let url = match args.first() {
        Some(Value::String(s)) => s.clone(),
        Some(other) => return Err(RuntimeError::type_mismatch("string url", other)),
        None => return Err(RuntimeError::Host(format!("http.{} expects a url", method.to_lowercase()))),
    };

    let (body, headers_arg) = if with_body {
        let body = match args.get(1) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(to_json(other).to_string()),
        };
        (body, args.get(2))
    } else {
        (None, args.get(1))
    };

    let headers = match headers_arg {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.to_string())).collect(),
        Some(other) => return Err(RuntimeError::type_mismatch("headers object", other)),
    };

    debug!(method, url = %url, "http request queued");
    let rt = http_runtime()?;
    let handle = rt.spawn_blocking(move || perform(method, &url, body, headers));
    Ok(Value::Future(Future::pending(move || {
        let outcome = rt
            .block_on(handle)
            .map_err(|e| RuntimeError::Host(format!("HTTP worker failed: {}", e)))?;
        outcome.map(HttpResponse::into_value).map_err(RuntimeError::Host)
    })))
}

fn perform(
    method: &str,
    url: &str,
    body: Option<String>,
    headers: Vec<(String, String)>,
) -> Result<HttpResponse, String> {
    let mut request = ureq::request(method, url);
    for (name, value) in &headers {
        request = request.set(name, value);
    }

    let result = match body {
        Some(body) => request.send_string(&body),
        None => request.call(),
    };

    let response = match result {
        Ok(response) => response,
        // Error statuses still resolve with their response.
        Err(ureq::Error::Status(_code, response)) => response,
        Err(e) => return Err(format!("HTTP Error: {}", e)),
    };

    let status = response.status();
    let headers = response
        .headers_names()
        .into_iter()
        .filter_map(|name| {
            let value = response.header(&name)?.to_string();
            Some((name, value))
        })
        .collect();
    let body = response
        .into_string()
        .map_err(|e| format!("HTTP body error: {}", e))?;
    Ok(HttpResponse {
        status,
        body,
        headers,
    })
}

// ============================================================================
// JSON
// ============================================================================

fn json_parse(args: &[Value]) -> Result<Value, RuntimeError> {
    let text = match args.first() {
        Some(Value::String(s)) => s,
        Some(other) => return Err(RuntimeError::type_mismatch("string", other)),
        None => return Err(RuntimeError::Host("json.parse expects 1 argument".into())),
    };
    let parsed: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| RuntimeError::Host(format!("JSON Parse Error: {}", e)))?;
    Ok(from_json(parsed))
}

fn json_stringify(args: &[Value]) -> Result<Value, RuntimeError> {
    let value = args.first().unwrap_or(&Value::Null);
    Ok(Value::String(to_json(value).to_string()))
}

pub fn from_json(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::bool(b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => Value::List(items.into_iter().map(from_json).collect()),
        serde_json::Value::Object(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k, from_json(v))).collect())
        }
    }
}

/// Integral numbers are written without a fraction. Values with no JSON
/// form (functions, futures, handles) become `null`.
pub fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Number(n) => {
            if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
                serde_json::Value::from(*n as i64)
            } else {
                serde_json::Number::from_f64(*n)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null)
            }
        }
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::List(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        Value::Object(map) => serde_json::Value::Object(
            map.iter().map(|(k, v)| (k.clone(), to_json(v))).collect(),
        ),
        Value::Instance(inst) => serde_json::Value::Object(
            inst.borrow()
                .fields
                .iter()
                .filter(|(_, v)| !matches!(v, Value::Method(_)))
                .map(|(k, v)| (k.clone(), to_json(v)))
                .collect(),
        ),
        _ => serde_json::Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_parse_maps_into_values() {
        let parsed = json_parse(&[Value::String(
            r#"{"ok": true, "n": 3, "xs": [1.5, null, "s"]}"#.into(),
        )])
        .unwrap();
        insta::assert_snapshot!(parsed.to_string(), @r#"{ok: 1, n: 3, xs: [1.5, null, "s"]}"#);
    }

    #[test]
    fn test_json_stringify_keeps_integers() {
        let mut map = IndexMap::new();
        map.insert("a".to_string(), Value::Number(2.0));
        map.insert("b".to_string(), Value::Number(0.5));
        map.insert("c".to_string(), Value::List(vec![Value::Null, Value::String("x".into())]));
        let out = json_stringify(&[Value::Object(map)]).unwrap();
        insta::assert_snapshot!(out.to_string(), @r#"{"a":2,"b":0.5,"c":[null,"x"]}"#);
    }

    #[test]
    fn test_json_parse_rejects_garbage() {
        assert!(matches!(
            json_parse(&[Value::String("{".into())]),
            Err(RuntimeError::Host(_))
        ));
        assert!(matches!(
            json_parse(&[Value::Number(1.0)]),
            Err(RuntimeError::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_http_transport_failure_surfaces_on_wait() {
        let value = http_get(&[Value::String("not a url".into())]).unwrap();
        let Value::Future(fut) = value else {
            panic!("http.get should return a future");
        };
        assert!(matches!(fut.wait(), Err(RuntimeError::Host(_))));
    }

    #[test]
    fn test_install_seeds_builtins() {
        let mut scope = Scope::new();
        install(&mut scope);
        assert!(matches!(scope.get("http"), Some(Value::Object(_))));
        assert!(matches!(scope.get("json"), Some(Value::Object(_))));
    }
}
