//! Reply encoding for the HTTP transport.
//!
//! Success is `200` with the JSON reply. Failure carries the RPC code three
//! ways: the mapped HTTP status, the `grpc-status`/`grpc-message` headers, and
//! a small JSON body. Status detail is never written.

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::StatusCode;
use http_body_util::Full;

use crate::call::Reply;
use crate::code::Code;

pub(crate) type HttpResponse = http::Response<Full<Bytes>>;

pub(crate) fn encode(reply: Reply) -> HttpResponse {
    match reply {
        Ok(payload) => build(Code::Ok, None, &payload),
        Err(status) => {
            let body = serde_json::json!({
                "code": status.code().as_str(),
                "message": status.message(),
            });
            build(status.code(), Some(status.message()), &body)
        }
    }
}

fn build(code: Code, message: Option<&str>, body: &serde_json::Value) -> HttpResponse {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    let mut response = http::Response::new(Full::new(Bytes::from(bytes)));
    *response.status_mut() =
        StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert("grpc-status", HeaderValue::from(u16::from(code.value())));
    if let Some(value) = message.and_then(|m| HeaderValue::from_str(m).ok()) {
        headers.insert("grpc-message", value);
    }
    response
}
