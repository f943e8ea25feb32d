// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Filtering applied before a transaction leaves the host thread.

use std::collections::HashMap;

use serde_json::{Map, Value};

pub const FILTERED: &str = "[FILTERED]";

pub const MAX_TAG_LENGTH: usize = 100;

/// Request environment keys that are kept; everything else is dropped.
pub const ENV_WHITELIST: &[&str] = &[
    "CONTENT_LENGTH",
    "AUTH_TYPE",
    "GATEWAY_INTERFACE",
    "PATH_TRANSLATED",
    "REMOTE_HOST",
    "REMOTE_IDENT",
    "REMOTE_USER",
    "REMOTE_ADDR",
    "REQUEST_METHOD",
    "SERVER_NAME",
    "SERVER_PORT",
    "SERVER_PROTOCOL",
    "REQUEST_URI",
    "PATH_INFO",
    "HTTP_X_REQUEST_START",
    "HTTP_X_MIDDLEWARE_START",
    "HTTP_X_QUEUE_START",
    "HTTP_X_QUEUE_TIME",
    "HTTP_X_HEROKU_QUEUE_WAIT_TIME",
    "HTTP_X_APPLICATION_START",
    "HTTP_ACCEPT",
    "HTTP_ACCEPT_CHARSET",
    "HTTP_ACCEPT_ENCODING",
    "HTTP_ACCEPT_LANGUAGE",
    "HTTP_CACHE_CONTROL",
    "HTTP_CONNECTION",
    "HTTP_USER_AGENT",
    "HTTP_FROM",
    "HTTP_NEGOTIATE",
    "HTTP_PRAGMA",
    "HTTP_REFERER",
    "HTTP_X_FORWARDED_FOR",
    "HTTP_CLIENT_IP",
];

/// Keeps tags whose key is at most 100 characters and whose value is either
/// a string of at most 100 characters or an integer.
#[must_use]
pub fn sanitize_tags(tags: Map<String, Value>) -> Map<String, Value> {
    tags.into_iter()
        .filter(|(key, value)| {
            key.chars().count() <= MAX_TAG_LENGTH
                && match value {
                    Value::String(s) => s.chars().count() <= MAX_TAG_LENGTH,
                    Value::Number(n) => n.is_i64() || n.is_u64(),
                    _ => false,
                }
        })
        .collect()
}

/// Replaces the value of every key listed in `filter` with `[FILTERED]`,
/// descending into nested objects and arrays.
pub fn sanitize_value(value: &mut Value, filter: &[String]) {
    match value {
        Value::Object(map) => sanitize_map(map, filter),
        Value::Array(items) => {
            for item in items {
                sanitize_value(item, filter);
            }
        }
        _ => {}
    }
}

pub fn sanitize_map(map: &mut Map<String, Value>, filter: &[String]) {
    for (key, value) in map.iter_mut() {
        if filter.iter().any(|filtered| filtered == key) {
            *value = Value::String(FILTERED.to_string());
        } else {
            sanitize_value(value, filter);
        }
    }
}

#[must_use]
pub fn sanitize_environment(env: &HashMap<String, String>) -> Map<String, Value> {
    ENV_WHITELIST
        .iter()
        .filter_map(|key| {
            env.get(*key)
                .map(|value| ((*key).to_string(), Value::String(value.clone())))
        })
        .collect()
}

/// `REQUEST_URI` when present, else `PATH_INFO` with `?QUERY_STRING` appended
/// when there is a query string.
#[must_use]
pub fn request_path(env: &HashMap<String, String>) -> Option<String> {
    if let Some(uri) = env.get("REQUEST_URI") {
        return Some(uri.clone());
    }
    let path = env.get("PATH_INFO")?;
    match env.get("QUERY_STRING") {
        Some(query) if !query.is_empty() => Some(format!("{path}?{query}")),
        _ => Some(path.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::tests::{env, object};
    use serde_json::json;

    #[test]
    fn test_sanitize_tags() {
        let long = "x".repeat(101);
        let mut tags = object(json!({
            "user_id": 123,
            "plan": "pro",
            "ratio": 0.5,
            "admin": true,
            "list": [1],
            "nested": {"a": 1},
            "none": null,
        }));
        tags.insert("long_value".to_string(), Value::String(long.clone()));
        tags.insert(long, Value::String("value".to_string()));
        assert_eq!(
            sanitize_tags(tags),
            object(json!({"user_id": 123, "plan": "pro"}))
        );
    }

    #[test]
    fn test_tag_length_boundary() {
        let exact = "y".repeat(100);
        let mut tags = Map::new();
        tags.insert(exact.clone(), Value::String(exact));
        assert_eq!(sanitize_tags(tags.clone()), tags);
    }

    #[test]
    fn test_sanitize_map_filters_nested_keys() {
        let mut params = object(json!({
            "user": {"name": "bob", "password": "a"},
            "items": [{"password": "b"}, "plain"],
            "password": {"nested": true},
        }));
        sanitize_map(&mut params, &["password".to_string()]);
        assert_eq!(
            params,
            object(json!({
                "user": {"name": "bob", "password": "[FILTERED]"},
                "items": [{"password": "[FILTERED]"}, "plain"],
                "password": "[FILTERED]",
            }))
        );
    }

    #[test]
    fn test_sanitize_environment_keeps_whitelist_only() {
        let headers = env(&[
            ("REQUEST_METHOD", "GET"),
            ("HTTP_COOKIE", "session=1"),
            ("HTTP_USER_AGENT", "curl"),
        ]);
        assert_eq!(
            sanitize_environment(&headers),
            object(json!({"REQUEST_METHOD": "GET", "HTTP_USER_AGENT": "curl"}))
        );
    }

    #[test]
    fn test_request_path() {
        assert_eq!(
            request_path(&env(&[("REQUEST_URI", "/a?b=1"), ("PATH_INFO", "/z")])),
            Some("/a?b=1".to_string())
        );
        assert_eq!(
            request_path(&env(&[("PATH_INFO", "/blog"), ("QUERY_STRING", "page=2")])),
            Some("/blog?page=2".to_string())
        );
        assert_eq!(
            request_path(&env(&[("PATH_INFO", "/blog"), ("QUERY_STRING", "")])),
            Some("/blog".to_string())
        );
        assert_eq!(request_path(&env(&[])), None);
    }
}
