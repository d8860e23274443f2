//! Admin routes: token issuance, endpoint registration and deletion,
//! metrics.

use crate::Reply;
use apy_core::{ApyError, ApyResult, EndpointForm, Registry, normalize_path};
use apy_crypto::TokenAuthority;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, StatusCode, Uri};
use serde_json::json;
use tracing::info;

pub(crate) fn issue_token(tokens: &dyn TokenAuthority) -> ApyResult<Reply> {
    let issued = tokens
        .issue()
        .map_err(|e| ApyError::Internal(format!("issuing token: {e}")))?;
    let body = serde_json::to_value(&issued)
        .map_err(|e| ApyError::Internal(format!("encoding token: {e}")))?;
    Ok(Reply::ok(body))
}

/// `POST /add`. Query-string fields are read first; body fields override.
pub(crate) async fn add_endpoint(
    registry: &Registry,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> ApyResult<Reply> {
    let mut pairs: Vec<(String, String)> = uri
        .query()
        .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type.to_ascii_lowercase().starts_with("multipart/form-data") {
        pairs.extend(multipart_pairs(content_type, body).await?);
    } else {
        pairs.extend(form_urlencoded::parse(&body).into_owned());
    }

    let endpoint = EndpointForm::from_pairs(pairs)
        .into_endpoint()
        .map_err(ApyError::Validation)?;
    let path = endpoint.path.clone();
    let route = registry.register(endpoint).await;
    info!(route = %route, "endpoint added");

    Ok(Reply::new(
        StatusCode::CREATED,
        json!({ "message": "endpoint created", "path": path }),
    ))
}

async fn multipart_pairs(content_type: &str, body: Bytes) -> ApyResult<Vec<(String, String)>> {
    let boundary = multer::parse_boundary(content_type).map_err(bad_form)?;
    let stream = futures_util::stream::once(async move { Ok::<Bytes, std::io::Error>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut pairs = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(bad_form)? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let value = field.text().await.map_err(bad_form)?;
        pairs.push((name, value));
    }
    Ok(pairs)
}

fn bad_form(e: multer::Error) -> ApyError {
    ApyError::BadForm(e.to_string())
}

/// `DELETE /delete/{path}[?method=GET]`. Without a method every endpoint
/// registered under the path goes.
pub(crate) async fn delete_endpoint(
    registry: &Registry,
    path: &str,
    query: Option<&str>,
) -> ApyResult<Reply> {
    let method = query
        .and_then(|q| {
            form_urlencoded::parse(q.as_bytes())
                .find(|(k, _)| k == "method")
                .map(|(_, v)| v.trim().to_ascii_uppercase())
        })
        .filter(|m| !m.is_empty());
    let path = normalize_path(path);

    match method {
        Some(method) => {
            registry.delete(&path, &method).await?;
        }
        None => {
            registry.delete_path(&path).await?;
        }
    }

    Ok(Reply::ok(json!({ "message": "endpoint deleted", "path": path })))
}

pub(crate) fn metrics(registry: &Registry) -> ApyResult<Reply> {
    let body = serde_json::to_value(registry.metrics())
        .map_err(|e| ApyError::Internal(format!("encoding metrics: {e}")))?;
    Ok(Reply::ok(body))
}
