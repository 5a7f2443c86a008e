//! Byte-level passthrough to the Anthropic API.
//!
//! Every path other than `POST /v1/messages` is forwarded verbatim, and so
//! are `/v1/messages` bodies whose model carries no provider prefix when no
//! Anthropic driver is registered. Request and response bodies are streamed
//! in both directions; headers and status pass through untouched apart from
//! hop-by-hop fields.

use axum::{
    body::Bytes,
    response::{IntoResponse, Response},
};
use http::{HeaderMap, StatusCode, header};
use reqwest::Url;

use crate::provider::http_client;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/";

pub(crate) struct Passthrough {
    client: reqwest::Client,
    base_url: Url,
}

impl Passthrough {
    pub fn new() -> Self {
        Self::with_base_url(ANTHROPIC_API_URL)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            client: http_client(),
            base_url: Url::parse(base_url).expect("passthrough base URL must parse"),
        }
    }

    /// Forward an arbitrary request, streaming its body upstream.
    pub async fn forward(&self, request: axum::extract::Request) -> Response {
        let path = request.uri().path().trim_start_matches('/');

        let mut url = match self.base_url.join(path) {
            Ok(url) => url,
            Err(_) => return bad_gateway("invalid upstream path"),
        };
        url.set_query(request.uri().query());

        let method = request.method().clone();
        let headers = proxied_headers(request.headers());
        let body = reqwest::Body::wrap_stream(request.into_body().into_data_stream());

        let result = self
            .client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await;

        into_proxied_response(result)
    }

    /// Forward an already-read `/v1/messages` body byte for byte.
    pub async fn forward_messages(&self, headers: &HeaderMap, body: Bytes) -> Response {
        let url = match self.base_url.join("v1/messages") {
            Ok(url) => url,
            Err(_) => return bad_gateway("invalid upstream path"),
        };

        let result = self
            .client
            .post(url)
            .headers(proxied_headers(headers))
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_LENGTH, body.len())
            .body(body)
            .send()
            .await;

        into_proxied_response(result)
    }
}

fn into_proxied_response(result: reqwest::Result<reqwest::Response>) -> Response {
    match result {
        // Status, headers and the streamed body all pass through.
        Ok(response) => http::Response::from(response).into_response(),
        Err(error) => {
            log::error!("failed to reach the Anthropic API: {error}");
            bad_gateway("could not connect to the Anthropic API")
        }
    }
}

/// Copy request headers minus `Host` (reqwest derives it from the URL) and
/// the other hop-by-hop fields a proxy must not replay.
fn proxied_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());

    for (name, value) in headers {
        let skip = name == header::HOST
            || name == header::CONNECTION
            || name == header::TRANSFER_ENCODING
            || name == header::UPGRADE
            || name == header::TE
            || name.as_str().starts_with("proxy-");

        if !skip {
            out.append(name.clone(), value.clone());
        }
    }

    out
}

fn bad_gateway(message: &str) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        axum::Json(crate::messages::anthropic::ErrorResponse::new(
            "api_error", message,
        )),
    )
        .into_response()
}
