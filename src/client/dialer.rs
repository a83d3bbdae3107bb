use std::time::{Duration, Instant};

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use thiserror::Error;
use tracing::{debug, warn};

use super::transport::{BatchTransport, TransportError};

#[derive(Error, Debug)]
pub enum DialError {
    #[error("no server address configured")]
    NoServer,

    #[error("unrecoverable failure talking to {server}: {source}")]
    Fatal {
        server: String,
        #[source]
        source: TransportError,
    },

    #[error("every server failed for {elapsed:?}")]
    Exhausted { elapsed: Duration },
}

/// Pause between full passes over the server list.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Give up after this long. `None` retries until a server answers.
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            max_elapsed: None,
        }
    }
}

impl RetryPolicy {
    /// Creates an exponential backoff with jitter that never runs out.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_jitter()
            .without_max_times()
            .build()
    }
}

/// Sends a batch request to the last server that answered, falling back
/// to the whole list, in order, until one succeeds.
pub struct FailoverDialer<T> {
    servers: Vec<String>,
    cached: String,
    transport: T,
    retry: RetryPolicy,
}

impl<T: BatchTransport> FailoverDialer<T> {
    pub fn new(servers: Vec<String>, transport: T, retry: RetryPolicy) -> Result<Self, DialError> {
        let cached = servers.first().cloned().ok_or(DialError::NoServer)?;
        Ok(Self {
            servers,
            cached,
            transport,
            retry,
        })
    }

    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// Server tried first on the next request.
    pub fn cached_server(&self) -> &str {
        &self.cached
    }

    /// Requests `num` numbers, returning the high-water mark after them.
    ///
    /// Retryable errors move on to the next server; a fatal one ends the
    /// call. Without `max_elapsed` this only returns once a server answers.
    pub async fn request(&mut self, num: i32) -> Result<i64, DialError> {
        let started = Instant::now();

        match self.transport.request_batch(&self.cached, num).await {
            Ok(high_water_mark) => return Ok(high_water_mark),
            Err(err) if err.is_fatal() => {
                return Err(DialError::Fatal {
                    server: self.cached.clone(),
                    source: err,
                })
            }
            Err(err) => warn!(server = %self.cached, error = %err, "cached server failed"),
        }

        let mut backoff = self.retry.backoff();
        loop {
            for server in &self.servers {
                debug!(server = %server, num, "tried");
                match self.transport.request_batch(server, num).await {
                    Ok(high_water_mark) => {
                        self.cached = server.clone();
                        return Ok(high_water_mark);
                    }
                    Err(err) if err.is_fatal() => {
                        return Err(DialError::Fatal {
                            server: server.clone(),
                            source: err,
                        })
                    }
                    Err(err) => warn!(server = %server, error = %err, "server failed"),
                }
            }

            let elapsed = started.elapsed();
            if let Some(limit) = self.retry.max_elapsed {
                if elapsed >= limit {
                    return Err(DialError::Exhausted { elapsed });
                }
            }
            let delay = backoff.next().unwrap_or(self.retry.max_delay);
            debug!(retry_in = ?delay, "all servers failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}
