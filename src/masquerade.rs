//! Responders for every request that is not a successful authentication.
//!
//! A request with a wrong secret, a foreign path, or a rejected bandwidth
//! declaration gets exactly the masquerade response, so the server looks like an
//! ordinary HTTP/3 site. Handlers see the request body and stream their response
//! through an [`HttpExchange`].

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_TYPE, HeaderValue, X_CONTENT_TYPE_OPTIONS};
use http::{Request, Response, StatusCode};

use crate::error_util::closed_error;

/// The body and response side of one HTTP request.
#[async_trait]
pub trait HttpExchange: Send {
    /// Next chunk of the request body, `None` once the body is complete.
    async fn recv_data(&mut self) -> std::io::Result<Option<Bytes>>;

    /// Sends the status and headers. Must come before any [`send_data`].
    ///
    /// [`send_data`]: HttpExchange::send_data
    async fn send_response(&mut self, response: Response<()>) -> std::io::Result<()>;

    async fn send_data(&mut self, data: Bytes) -> std::io::Result<()>;
}

#[async_trait]
pub trait MasqueradeHandler: Send + Sync + std::fmt::Debug {
    async fn serve(
        &self,
        request: &Request<()>,
        exchange: &mut dyn HttpExchange,
    ) -> std::io::Result<()>;
}

/// Sends `response` and its body, if any.
pub async fn send_full_response(
    exchange: &mut dyn HttpExchange,
    response: Response<Bytes>,
) -> std::io::Result<()> {
    let (parts, body) = response.into_parts();
    exchange.send_response(Response::from_parts(parts, ())).await?;
    if !body.is_empty() {
        exchange.send_data(body).await?;
    }
    Ok(())
}

/// An exchange held in memory: the request body is given up front and the
/// response is collected.
#[derive(Debug, Default)]
pub struct BufferedExchange {
    request_body: VecDeque<Bytes>,
    response: Option<Response<()>>,
    response_body: BytesMut,
}

impl BufferedExchange {
    pub fn new(request_body: impl Into<Bytes>) -> Self {
        let request_body = request_body.into();
        let mut exchange = Self::default();
        if !request_body.is_empty() {
            exchange.request_body.push_back(request_body);
        }
        exchange
    }

    /// The response with everything sent as its body, or `None` if no response
    /// was sent.
    pub fn into_response(self) -> Option<Response<Bytes>> {
        let body = self.response_body.freeze();
        self.response.map(|response| response.map(|_| body))
    }
}

#[async_trait]
impl HttpExchange for BufferedExchange {
    async fn recv_data(&mut self) -> std::io::Result<Option<Bytes>> {
        Ok(self.request_body.pop_front())
    }

    async fn send_response(&mut self, response: Response<()>) -> std::io::Result<()> {
        if self.response.is_some() {
            return Err(closed_error("response already sent"));
        }
        self.response = Some(response);
        Ok(())
    }

    async fn send_data(&mut self, data: Bytes) -> std::io::Result<()> {
        if self.response.is_none() {
            return Err(std::io::Error::other("body sent before response"));
        }
        self.response_body.extend_from_slice(&data);
        Ok(())
    }
}

/// Plain 404, as served by a stock Go `net/http` server.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotFoundHandler;

const NOT_FOUND_BODY: &str = "404 page not found\n";

#[async_trait]
impl MasqueradeHandler for NotFoundHandler {
    async fn serve(
        &self,
        _request: &Request<()>,
        exchange: &mut dyn HttpExchange,
    ) -> std::io::Result<()> {
        let response = Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .header(X_CONTENT_TYPE_OPTIONS, "nosniff")
            .body(Bytes::from_static(NOT_FOUND_BODY.as_bytes()))
            .map_err(std::io::Error::other)?;
        send_full_response(exchange, response).await
    }
}

/// Fixed status, content type and body for every request.
#[derive(Debug, Clone)]
pub struct StringHandler {
    status: StatusCode,
    content_type: HeaderValue,
    body: Bytes,
}

impl StringHandler {
    pub fn new(status: u16, content_type: &str, body: impl Into<Bytes>) -> std::io::Result<Self> {
        let status = StatusCode::from_u16(status).map_err(|err| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid masquerade status code {status}: {err}"),
            )
        })?;
        let content_type = HeaderValue::from_str(content_type).map_err(|err| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid masquerade content type: {err}"),
            )
        })?;
        Ok(Self {
            status,
            content_type,
            body: body.into(),
        })
    }
}

#[async_trait]
impl MasqueradeHandler for StringHandler {
    async fn serve(
        &self,
        _request: &Request<()>,
        exchange: &mut dyn HttpExchange,
    ) -> std::io::Result<()> {
        let response = Response::builder()
            .status(self.status)
            .header(CONTENT_TYPE, self.content_type.clone())
            .body(self.body.clone())
            .map_err(std::io::Error::other)?;
        send_full_response(exchange, response).await
    }
}
