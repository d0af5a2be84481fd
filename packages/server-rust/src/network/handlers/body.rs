//! Request body and query decoding for request/reply calls.
//!
//! Read-style methods take their input from the query string. Write-style
//! methods decode the body by content type; anything unrecognised is logged
//! and left as `null`.

use axum::extract::{FromRequest, Multipart, Query, Request};
use axum::http::header::CONTENT_TYPE;
use axum::http::{Method, StatusCode, Uri};
use axum::Form;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde_json::{json, Map, Value};
use switchyard_core::ProcedureError;
use tracing::warn;

/// Decodes the call input from `request`.
///
/// # Errors
///
/// Returns a 400 `ProcedureError` for bodies that claim a known content type
/// but fail to decode.
pub async fn parse_input(request: Request) -> Result<Value, ProcedureError> {
    if matches!(*request.method(), Method::GET | Method::HEAD) {
        return query_input(request.uri());
    }

    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(';').next().unwrap_or_default().trim().to_ascii_lowercase());

    match content_type.as_deref() {
        None => Ok(Value::Null),
        Some(ct) if ct == "application/json" || ct.ends_with("+json") => json_input(request).await,
        Some("text/plain") => text_input(request).await,
        Some("application/x-www-form-urlencoded") => form_input(request).await,
        Some("multipart/form-data") => multipart_input(request).await,
        Some(other) => {
            warn!(content_type = other, "unsupported content type, input left unparsed");
            Ok(Value::Null)
        }
    }
}

fn query_input(uri: &Uri) -> Result<Value, ProcedureError> {
    let Query(pairs) = Query::<Vec<(String, String)>>::try_from_uri(uri)
        .map_err(|rejection| ProcedureError::bad_request(rejection.body_text()))?;
    Ok(pairs_to_object(pairs))
}

async fn read_body(request: Request) -> Result<Bytes, ProcedureError> {
    Bytes::from_request(request, &())
        .await
        .map_err(|rejection| rejected(rejection.status(), rejection.body_text()))
}

/// Keeps the extractor's status, so an oversized body stays a 413.
fn rejected(status: StatusCode, message: String) -> ProcedureError {
    let name: String = status
        .canonical_reason()
        .unwrap_or("BadRequest")
        .split_whitespace()
        .collect();
    ProcedureError::custom(status, name, message)
}

async fn json_input(request: Request) -> Result<Value, ProcedureError> {
    let body = read_body(request).await?;
    if body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&body)
        .map_err(|error| ProcedureError::bad_request(format!("invalid JSON body: {error}")))
}

async fn text_input(request: Request) -> Result<Value, ProcedureError> {
    let body = read_body(request).await?;
    String::from_utf8(body.to_vec())
        .map(Value::String)
        .map_err(|_| ProcedureError::bad_request("body is not valid UTF-8"))
}

async fn form_input(request: Request) -> Result<Value, ProcedureError> {
    let Form(pairs) = Form::<Vec<(String, String)>>::from_request(request, &())
        .await
        .map_err(|rejection| rejected(rejection.status(), rejection.body_text()))?;
    Ok(pairs_to_object(pairs))
}

/// Text fields become strings; file parts become
/// `{filename, contentType, size, data}` with base64 data.
async fn multipart_input(request: Request) -> Result<Value, ProcedureError> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|rejection| rejected(rejection.status(), rejection.body_text()))?;

    let bad_part = |error: axum::extract::multipart::MultipartError| {
        ProcedureError::bad_request(format!("invalid multipart body: {error}"))
    };

    let mut fields = Map::new();
    while let Some(field) = multipart.next_field().await.map_err(bad_part)? {
        let name = field.name().unwrap_or_default().to_owned();
        let value = match field.file_name().map(str::to_owned) {
            Some(filename) => {
                let content_type = field.content_type().map(str::to_owned);
                let data = field.bytes().await.map_err(bad_part)?;
                json!({
                    "filename": filename,
                    "contentType": content_type,
                    "size": data.len(),
                    "data": STANDARD.encode(&data),
                })
            }
            None => Value::String(field.text().await.map_err(bad_part)?),
        };
        insert_repeated(&mut fields, name, value);
    }
    Ok(Value::Object(fields))
}

/// Repeated keys collect into an array in arrival order.
fn pairs_to_object(pairs: Vec<(String, String)>) -> Value {
    let mut map = Map::new();
    for (key, value) in pairs {
        insert_repeated(&mut map, key, Value::String(value));
    }
    Value::Object(map)
}

fn insert_repeated(map: &mut Map<String, Value>, key: String, value: Value) {
    match map.get_mut(&key) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            map.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request as HttpRequest;

    use super::*;

    fn post(content_type: &str, body: impl Into<Body>) -> Request {
        HttpRequest::builder()
            .method(Method::POST)
            .uri("/op")
            .header(CONTENT_TYPE, content_type)
            .body(body.into())
            .unwrap()
    }

    #[tokio::test]
    async fn get_reads_query_and_groups_repeats() {
        let request = HttpRequest::builder()
            .uri("/op?name=ada&tag=a&tag=b&tag=c")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            parse_input(request).await.unwrap(),
            json!({"name": "ada", "tag": ["a", "b", "c"]})
        );
    }

    #[tokio::test]
    async fn json_bodies_decode() {
        let input = parse_input(post("application/json; charset=utf-8", r#"{"a":[1,2]}"#))
            .await
            .unwrap();
        assert_eq!(input, json!({"a": [1, 2]}));
        assert_eq!(parse_input(post("application/json", "")).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn invalid_json_is_bad_request() {
        let err = parse_input(post("application/json", "{nope")).await.unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn text_and_form_bodies_decode() {
        assert_eq!(
            parse_input(post("text/plain", "hello")).await.unwrap(),
            json!("hello")
        );
        assert_eq!(
            parse_input(post("application/x-www-form-urlencoded", "a=1&b=two&a=3"))
                .await
                .unwrap(),
            json!({"a": ["1", "3"], "b": "two"})
        );
    }

    #[tokio::test]
    async fn multipart_files_are_described() {
        let body = concat!(
            "--XYZ\r\n",
            "Content-Disposition: form-data; name=\"title\"\r\n\r\n",
            "hello\r\n",
            "--XYZ\r\n",
            "Content-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n",
            "Content-Type: text/plain\r\n\r\n",
            "abc\r\n",
            "--XYZ--\r\n",
        );
        let input = parse_input(post("multipart/form-data; boundary=XYZ", body))
            .await
            .unwrap();
        assert_eq!(
            input,
            json!({
                "title": "hello",
                "doc": {"filename": "a.txt", "contentType": "text/plain", "size": 3, "data": "YWJj"},
            })
        );
    }

    #[tokio::test]
    async fn oversized_body_keeps_payload_too_large() {
        let oversized = vec![b' '; 3 * 1024 * 1024];
        let err = parse_input(post("application/json", oversized)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(err.name(), "PayloadTooLarge");
    }

    #[tokio::test]
    async fn unknown_content_type_is_left_unparsed() {
        assert_eq!(
            parse_input(post("application/octet-stream", vec![1_u8, 2, 3]))
                .await
                .unwrap(),
            Value::Null
        );
    }

    proptest::proptest! {
        #[test]
        fn repeated_keys_keep_every_value_in_order(
            pairs in proptest::collection::vec(("[a-c]", "[a-z0-9]{0,4}"), 0..16)
        ) {
            let object = pairs_to_object(pairs.clone());
            for key in ["a", "b", "c"] {
                let expected: Vec<Value> = pairs
                    .iter()
                    .filter(|(k, _)| k == key)
                    .map(|(_, v)| Value::String(v.clone()))
                    .collect();
                let actual = match object.get(key) {
                    None => Vec::new(),
                    Some(Value::Array(items)) => items.clone(),
                    Some(single) => vec![single.clone()],
                };
                proptest::prop_assert_eq!(actual, expected);
            }
        }
    }
}
