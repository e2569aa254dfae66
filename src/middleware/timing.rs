use axum::{
    extract::Request,
    http::{header, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

/// Response header carrying handler wall time in microseconds.
pub const RESPONSE_TIME_HEADER: &str = "X-Response-Time-Us";

/// Access log for the collector: one `tracing` event per request with
/// method, path, status, payload size and latency. Level follows the status
/// class so rejected pushes stand out from routine traffic.
pub async fn timing_middleware(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let encoding = req
        .headers()
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("identity")
        .to_owned();
    let bytes_in = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    let start = Instant::now();
    let mut response = next.run(req).await;
    let elapsed_us = start.elapsed().as_micros() as u64;

    let headers = response.headers_mut();
    headers.insert(RESPONSE_TIME_HEADER, HeaderValue::from(elapsed_us));
    let server_timing = format!("handler;dur={}.{:03}", elapsed_us / 1000, elapsed_us % 1000);
    if let Ok(val) = HeaderValue::from_str(&server_timing) {
        headers.insert("Server-Timing", val);
    }

    let status = response.status().as_u16();
    match status {
        500..=599 => tracing::error!(%method, %path, status, bytes_in, %encoding, elapsed_us, "request"),
        400..=499 => tracing::warn!(%method, %path, status, bytes_in, %encoding, elapsed_us, "request"),
        _ => tracing::debug!(%method, %path, status, bytes_in, %encoding, elapsed_us, "request"),
    }

    response
}
