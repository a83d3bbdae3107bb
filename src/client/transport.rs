use std::future::Future;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request to {server} failed: {message}")]
    Unreachable { server: String, message: String },

    #[error("{server} answered with status {status}")]
    Status { server: String, status: u16 },

    #[error("malformed response from {server}: {message}")]
    Decode { server: String, message: String },
}

impl TransportError {
    /// A fatal error means the batch may have committed but its result is
    /// unknown. Failover must stop there.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Decode { .. })
    }
}

/// One batch request to one server.
pub trait BatchTransport: Send + Sync {
    /// Asks `server` for `num` numbers, resolving to the high-water mark
    /// after the batch.
    fn request_batch(
        &self,
        server: &str,
        num: i32,
    ) -> impl Future<Output = Result<i64, TransportError>> + Send;
}

/// `POST http://{server}/doracle` with the batch size as a decimal body.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(request_timeout: Option<Duration>) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = request_timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            http: builder.build()?,
        })
    }
}

impl BatchTransport for HttpTransport {
    async fn request_batch(&self, server: &str, num: i32) -> Result<i64, TransportError> {
        let response = self
            .http
            .post(format!("http://{}/doracle", server))
            .header(CONTENT_TYPE, "text/plain")
            .body(num.to_string())
            .send()
            .await
            .map_err(|e| TransportError::Unreachable {
                server: server.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(TransportError::Status {
                server: server.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(|e| TransportError::Decode {
            server: server.to_string(),
            message: e.to_string(),
        })?;
        body.trim().parse().map_err(|_| TransportError::Decode {
            server: server.to_string(),
            message: format!("not an integer: {:?}", body),
        })
    }
}
