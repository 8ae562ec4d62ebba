//! Audited outbound client
//!
//! [`AuditedClient`] wraps a [`reqwest::Client`] and records every call made
//! through it under a client name. The client name selects the sink and the
//! enablement (`[audit_logs.client.<name>]`, falling back to
//! `[audit_logs.clients]`) and is stored in the `rest-client` custom field.
//!
//! Each call also carries a route id, looked up in the policy table like a
//! server route. When the table declares no group for it, the route is put
//! in a group named after the client, so disabling that group mutes the
//! whole client.
//!
//! # Example
//!
//! ```rust,ignore
//! let client = AuditedClient::new(reqwest::Client::new(), audit.capture().clone());
//! let response = client
//!     .send("billing", "list-invoices", client.get("http://billing/invoices"))
//!     .await?;
//! ```

use bytes::Bytes;
use futures::{future, stream, StreamExt};
use http::header::CONTENT_TYPE;
use reqwest::{Body, IntoUrl, Method, Request, RequestBuilder, Response};

use crate::audit::{payload_from_bytes, CaptureService, RequestInfo};
use crate::config::Endpoint;
use crate::ids::ExchangeId;

/// `reqwest` client recording its exchanges
#[derive(Debug, Clone)]
pub struct AuditedClient {
    http: reqwest::Client,
    capture: CaptureService,
}

impl AuditedClient {
    /// Wrap a client
    pub fn new(http: reqwest::Client, capture: CaptureService) -> Self {
        Self { http, capture }
    }

    /// The wrapped client
    pub fn inner(&self) -> &reqwest::Client {
        &self.http
    }

    /// Start building a request
    pub fn request<U: IntoUrl>(&self, method: Method, url: U) -> RequestBuilder {
        self.http.request(method, url)
    }

    /// Start building a GET request
    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.http.get(url)
    }

    /// Start building a POST request
    pub fn post<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.http.post(url)
    }

    /// Build and execute a request
    pub async fn send(
        &self,
        client_name: &str,
        route_id: &str,
        builder: RequestBuilder,
    ) -> reqwest::Result<Response> {
        self.execute(client_name, route_id, builder.build()?).await
    }

    /// Execute a request, recording the exchange
    ///
    /// The outcome seen by the caller is the one of the wrapped client. A
    /// transport error discards the exchange, since there is no response
    /// to record. Bodies that were read for capture are handed back in a
    /// rebuilt response, which no longer carries the request URL. A body
    /// that fails while being read is recorded without payload, and its
    /// error surfaces when the caller reads the rebuilt body.
    ///
    /// Error answers without `Content-Length` are read up to
    /// `max_body_bytes`; past that, capture stops and the remainder is
    /// streamed to the caller.
    pub async fn execute(
        &self,
        client_name: &str,
        route_id: &str,
        request: Request,
    ) -> reqwest::Result<Response> {
        let Some(id) = self.begin(client_name, route_id, &request) else {
            return self.http.execute(request).await;
        };

        let response = match self.http.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                self.capture.discard(&id);
                return Err(e);
            }
        };

        self.capture
            .set_response(&id, response.status().as_u16(), response.headers());
        self.capture_response_body(id, response).await
    }

    fn begin(&self, client_name: &str, route_id: &str, request: &Request) -> Option<ExchangeId> {
        let mut uri = request.url().clone();
        uri.set_query(None);
        let info = RequestInfo::new(request.method().as_str(), uri.as_str())
            .with_query(request.url().query())
            .with_headers(request.headers().clone());

        let id = self.capture.begin(Endpoint::client(client_name), info)?;

        let mut route = self.capture.descriptor(route_id);
        if route.group.is_none() {
            route = route.in_group(client_name);
        }
        self.capture.attach(&id, Some(&route));
        if !self.capture.is_tracked(&id) {
            return None;
        }

        // streamed request bodies are not captured
        let payload = request.body().and_then(|body| body.as_bytes()).and_then(|bytes| {
            let content_type = request
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok());
            payload_from_bytes(bytes, content_type)
        });
        if let Some(payload) = payload {
            self.capture.set_request_body(&id, payload);
        }
        Some(id)
    }

    async fn capture_response_body(
        &self,
        id: ExchangeId,
        mut response: Response,
    ) -> reqwest::Result<Response> {
        let status = response.status();
        let max = self.capture.config().max_body_bytes;
        match response.content_length() {
            // streaming answers keep their body unless they failed
            None if status.is_success() => {
                self.capture.complete(&id);
                return Ok(response);
            }
            Some(0) => {
                self.capture.complete(&id);
                return Ok(response);
            }
            Some(length) if length > max as u64 => {
                self.capture.complete(&id);
                return Ok(response);
            }
            _ => {}
        }

        let version = response.version();
        let headers = response.headers().clone();
        let mut chunks: Vec<Bytes> = Vec::new();
        let mut size = 0;
        let outcome = loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    size += chunk.len();
                    chunks.push(chunk);
                    if size > max {
                        break Some(Ok(()));
                    }
                }
                Ok(None) => break None,
                Err(e) => break Some(Err(e)),
            }
        };

        let body = match outcome {
            None => {
                let bytes = Bytes::from(chunks.concat());
                let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
                if let Some(payload) = payload_from_bytes(&bytes, content_type) {
                    self.capture.set_response_body(&id, payload);
                }
                Body::from(bytes)
            }
            // too large: the caller gets what was read, then the rest
            Some(Ok(())) => {
                let read = stream::iter(chunks.into_iter().map(Ok));
                Body::wrap_stream(read.chain(response.bytes_stream()))
            }
            Some(Err(e)) => {
                tracing::warn!(
                    exchange_id = %id,
                    error = %e,
                    "Response body could not be read for audit"
                );
                let read = stream::iter(chunks.into_iter().map(Ok));
                let failed = stream::once(future::ready(Err::<Bytes, _>(e)));
                Body::wrap_stream(read.chain(failed))
            }
        };
        self.capture.complete(&id);

        let mut rebuilt = http::Response::new(body);
        *rebuilt.status_mut() = status;
        *rebuilt.version_mut() = version;
        *rebuilt.headers_mut() = headers;
        Ok(Response::from(rebuilt))
    }
}
