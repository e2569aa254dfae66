use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::handlers::ApiError;
use crate::server::AppState;
use crate::signing::{self, SIGNATURE_HEADER};

/// Largest request or response body the signature check will buffer.
const MAX_SIGNED_BODY: usize = 4 * 1024 * 1024;

/// Checks `HashSHA256` on POST bodies and signs JSON responses.
///
/// A mismatch is logged and the request proceeds, unless the server runs
/// with strict signatures, in which case it is rejected with 400.
pub async fn signature_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(key) = state.signing_key.clone() else {
        return next.run(req).await;
    };

    let req = if req.method() == Method::POST {
        let (parts, body) = req.into_parts();
        let bytes = match to_bytes(body, MAX_SIGNED_BODY).await {
            Ok(b) => b,
            Err(e) => return ApiError::BadRequest(e.to_string()).into_response(),
        };

        let header = parts
            .headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());
        let verified = header.is_some_and(|sig| signing::verify(&key, &bytes, sig));
        if !verified {
            tracing::warn!(
                path = %parts.uri.path(),
                present = header.is_some(),
                "request signature mismatch"
            );
            if state.strict_signature {
                return ApiError::BadRequest("signature mismatch".into()).into_response();
            }
        }
        Request::from_parts(parts, Body::from(bytes))
    } else {
        req
    };

    let response = next.run(req).await;
    sign_response(&key, response).await
}

async fn sign_response(key: &str, response: Response) -> Response {
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    if !is_json {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match to_bytes(body, MAX_SIGNED_BODY).await {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "failed to buffer response for signing");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    if let Ok(val) = HeaderValue::from_str(&signing::sign(key, &bytes)) {
        parts.headers.insert(SIGNATURE_HEADER, val);
    }
    Response::from_parts(parts, Body::from(bytes))
}
