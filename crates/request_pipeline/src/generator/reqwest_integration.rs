use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use http::{Request as HttpRequest, StatusCode};
use tower::Service;

use super::http::HttpError;

/// Longest slice of an error response body kept for diagnostics.
const MAX_ERROR_BODY_CHARS: usize = 256;

/// Exposes the status of an outbound response so a burst can judge success.
pub trait ResponseStatus {
    fn status(&self) -> StatusCode;

    fn is_success(&self) -> bool {
        self.status().is_success()
    }
}

impl ResponseStatus for reqwest::Response {
    fn status(&self) -> StatusCode {
        reqwest::Response::status(self)
    }
}

impl<B> ResponseStatus for http::Response<B> {
    fn status(&self) -> StatusCode {
        http::Response::status(self)
    }
}

/// A `tower::Service` wrapper for `reqwest::Client`.
/// Accepts `http::Request<Option<reqwest::Body>>`; any non-2xx answer is an
/// [`HttpError::ServerError`].
#[derive(Clone)]
pub struct ReqwestService {
    client: reqwest::Client,
}

impl ReqwestService {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn new_with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Builds a client with a connect timeout; the per-call timeout is applied by the generator.
    pub fn with_connect_timeout(connect_timeout: Duration) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| HttpError::ClientError {
                source: Box::new(e),
            })?;
        Ok(Self::new_with_client(client))
    }
}

impl Default for ReqwestService {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<HttpRequest<Option<reqwest::Body>>> for ReqwestService {
    type Response = reqwest::Response;
    type Error = HttpError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: HttpRequest<Option<reqwest::Body>>) -> Self::Future {
        let client = self.client.clone();
        Box::pin(async move {
            let outbound = outbound_request(request)?;
            let response = client.execute(outbound).await.map_err(classify)?;
            reject_unsuccessful(response).await
        })
    }
}

fn outbound_request(request: HttpRequest<Option<reqwest::Body>>) -> Result<reqwest::Request, HttpError> {
    let (parts, body) = request.into_parts();
    let url = reqwest::Url::parse(&parts.uri.to_string()).map_err(|error| {
        HttpError::InvalidRequest {
            details: format!("invalid target '{}': {}", parts.uri, error),
        }
    })?;

    let mut outbound = reqwest::Request::new(parts.method, url);
    *outbound.headers_mut() = parts.headers;
    *outbound.body_mut() = body;
    Ok(outbound)
}

fn classify(error: reqwest::Error) -> HttpError {
    if error.is_timeout() {
        HttpError::Timeout
    } else if error.is_connect() {
        HttpError::Transport {
            source: Box::new(error),
        }
    } else {
        HttpError::ClientError {
            source: Box::new(error),
        }
    }
}

async fn reject_unsuccessful(response: reqwest::Response) -> Result<reqwest::Response, HttpError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body: String = response
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(MAX_ERROR_BODY_CHARS)
        .collect();
    debug!(
        target: "request_pipeline::generator",
        %status,
        "Target answered with a non-success status"
    );
    Err(HttpError::ServerError {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::*;

    #[test]
    fn http_response_status_drives_success() {
        let ok = http::Response::builder().status(204).body(()).unwrap();
        let bad = http::Response::builder().status(502).body(()).unwrap();

        assert!(ResponseStatus::is_success(&ok));
        assert!(!ResponseStatus::is_success(&bad));
    }

    #[tokio::test]
    async fn unparsable_target_is_an_invalid_request() {
        let request = HttpRequest::builder()
            .uri("/relative/only")
            .body(None)
            .unwrap();

        let result = ReqwestService::new().oneshot(request).await;

        assert!(matches!(result, Err(HttpError::InvalidRequest { .. })));
    }

    #[test]
    fn outbound_request_keeps_method_and_headers() {
        let request = HttpRequest::post("http://processor-api:9002/process")
            .header("x-burst", "3")
            .body(None)
            .unwrap();

        let outbound = outbound_request(request).unwrap();

        assert_eq!(outbound.method(), http::Method::POST);
        assert_eq!(outbound.url().as_str(), "http://processor-api:9002/process");
        assert_eq!(outbound.headers()["x-burst"], "3");
        assert!(outbound.body().is_none());
    }
}
