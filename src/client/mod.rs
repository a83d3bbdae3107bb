//! Batching timestamp client.
//!
//! Every [`Client::ts`] call parks a one-shot slot on an unbounded queue.
//! A single dispatcher task owns the network: it pulls one slot, counts the
//! `L` slots queued behind it at that instant and asks a server for
//! `L + 1` numbers in one request. The answer `H` is the last number of the
//! batch; the first slot gets `H`, the `i`-th slot pulled after it gets
//! `H - i`.
//!
//! There is no per-call timeout or cancellation. A caller waits until its
//! slot is filled or the client shuts down. A dispatcher that cannot get a
//! batch (fatal transport error, or the opt-in retry bound runs out)
//! closes the client for good: every waiting and future call fails with
//! [`ClientError::Closed`].

mod dialer;
mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, warn};

pub use dialer::{DialError, FailoverDialer, RetryPolicy};
pub use transport::{BatchTransport, HttpTransport, TransportError};

type Slot = oneshot::Sender<i64>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("no server address configured")]
    NoServer,

    #[error("client closed")]
    Closed,

    #[error("invalid timestamp {0}")]
    InvalidTimestamp(i64),

    #[error("failed to build http transport: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound on the numbers requested in one batch.
    pub max_batch: i32,
    pub retry: RetryPolicy,
    /// Bound on a single HTTP request. Firing counts as a failed server.
    pub request_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_batch: i32::MAX,
            retry: RetryPolicy::default(),
            request_timeout: None,
        }
    }
}

struct Shared {
    closed: AtomicBool,
    shutdown: Notify,
}

/// Handle to a dispatcher. Clones share it; the dispatcher stops once
/// every clone is dropped or [`Client::close`] is called.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
    requests: mpsc::UnboundedSender<Slot>,
}

impl Client {
    /// Must be called inside a tokio runtime; the dispatcher is spawned on it.
    pub fn new(addresses: Vec<String>) -> Result<Client, ClientError> {
        Self::with_config(addresses, ClientConfig::default())
    }

    pub fn with_config(addresses: Vec<String>, config: ClientConfig) -> Result<Client, ClientError> {
        if addresses.is_empty() {
            return Err(ClientError::NoServer);
        }
        let transport = HttpTransport::new(config.request_timeout)?;
        Self::with_transport(addresses, transport, config)
    }

    pub fn with_transport<T>(
        addresses: Vec<String>,
        transport: T,
        config: ClientConfig,
    ) -> Result<Client, ClientError>
    where
        T: BatchTransport + 'static,
    {
        let dialer = FailoverDialer::new(addresses, transport, config.retry)
            .map_err(|_| ClientError::NoServer)?;
        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        let (requests, rx) = mpsc::unbounded_channel();

        tokio::spawn(dispatch(rx, dialer, Arc::clone(&shared), config.max_batch.max(1)));

        Ok(Client { shared, requests })
    }

    /// Returns one globally unique number.
    pub async fn ts(&self) -> Result<i64, ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        let (slot, result) = oneshot::channel();
        self.requests.send(slot).map_err(|_| ClientError::Closed)?;

        let ts = result.await.map_err(|_| ClientError::Closed)?;
        if ts < 0 {
            return Err(ClientError::InvalidTimestamp(ts));
        }
        Ok(ts)
    }

    /// Stops accepting calls. Calls already queued are still served.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.shutdown.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

async fn dispatch<T: BatchTransport>(
    mut requests: mpsc::UnboundedReceiver<Slot>,
    mut dialer: FailoverDialer<T>,
    shared: Arc<Shared>,
    max_batch: i32,
) {
    loop {
        if shared.closed.load(Ordering::SeqCst) && requests.is_empty() {
            break;
        }
        // queued slots win over a pending close, so close() drains first
        let first = tokio::select! {
            biased;
            slot = requests.recv() => match slot {
                Some(slot) => slot,
                None => break,
            },
            _ = shared.shutdown.notified() => break,
        };

        // this task is the only consumer, so every slot counted here is
        // still there when it is pulled below
        let queued = requests.len().min(max_batch as usize - 1);
        let num = queued as i32 + 1;

        match dialer.request(num).await {
            Ok(high_water_mark) => {
                debug!(num, high_water_mark, "batch committed");
                let _ = first.send(high_water_mark);
                for i in 1..=queued {
                    let Ok(slot) = requests.try_recv() else {
                        break;
                    };
                    match high_water_mark.checked_sub(i as i64) {
                        // a dropped caller leaves its number unused
                        Some(ts) => {
                            let _ = slot.send(ts);
                        }
                        // dropping the slot fails that caller with Closed
                        None => warn!(high_water_mark, i, "batch slice underflows"),
                    }
                }
            }
            Err(err) => {
                error!(error = %err, num, "get ts error, closing client");
                break;
            }
        }
    }

    shared.closed.store(true, Ordering::SeqCst);
    requests.close();
    // dropping the receiver drops the queued slots, failing their callers
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use futures::future::join_all;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::raft::sm::CounterStateMachine;

    /// A single simulated replica: every request is one committed increment.
    #[derive(Clone, Default)]
    struct SimulatedCluster {
        counter: Arc<Mutex<CounterStateMachine>>,
        batches: Arc<Mutex<Vec<i32>>>,
    }

    impl BatchTransport for SimulatedCluster {
        async fn request_batch(&self, _server: &str, num: i32) -> Result<i64, TransportError> {
            self.batches.lock().unwrap().push(num);
            Ok(self.counter.lock().unwrap().apply(num))
        }
    }

    /// Answers every request with the same high-water mark.
    #[derive(Clone)]
    struct FixedMark {
        high_water_mark: i64,
        batches: Arc<Mutex<Vec<i32>>>,
    }

    impl BatchTransport for FixedMark {
        async fn request_batch(&self, _server: &str, num: i32) -> Result<i64, TransportError> {
            self.batches.lock().unwrap().push(num);
            Ok(self.high_water_mark)
        }
    }

    /// 200 with an unreadable body, the one failure that closes the client.
    #[derive(Clone, Default)]
    struct Garbled {
        calls: Arc<AtomicUsize>,
    }

    impl BatchTransport for Garbled {
        async fn request_batch(&self, server: &str, _num: i32) -> Result<i64, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Decode {
                server: server.to_string(),
                message: "truncated body".into(),
            })
        }
    }

    fn one_server() -> Vec<String> {
        vec!["127.0.0.1:4001".to_string()]
    }

    #[test]
    fn empty_address_list_is_a_config_error() {
        let err = Client::with_config(vec![], ClientConfig::default()).err().unwrap();
        assert!(matches!(err, ClientError::NoServer));
    }

    // The current-thread runtime does not run the dispatcher until the test
    // yields, so every call below is queued before the first batch is cut.
    #[tokio::test]
    async fn five_waiters_share_one_batch() {
        let cluster = SimulatedCluster::default();
        let client =
            Client::with_transport(one_server(), cluster.clone(), ClientConfig::default()).unwrap();

        let results = join_all((0..5).map(|_| client.ts())).await;
        let numbers: Vec<i64> = results.into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(numbers, vec![4, 3, 2, 1, 0]);
        assert_eq!(*cluster.batches.lock().unwrap(), vec![5]);
    }

    #[tokio::test]
    async fn batch_is_sliced_downwards_in_pull_order() {
        let transport = FixedMark {
            high_water_mark: 10,
            batches: Arc::default(),
        };
        let client =
            Client::with_transport(one_server(), transport.clone(), ClientConfig::default())
                .unwrap();

        let results = join_all((0..4).map(|_| client.ts())).await;
        let numbers: Vec<i64> = results.into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(numbers, vec![10, 9, 8, 7]);
        assert_eq!(*transport.batches.lock().unwrap(), vec![4]);
    }

    #[tokio::test]
    async fn max_batch_splits_the_queue() {
        let cluster = SimulatedCluster::default();
        let config = ClientConfig {
            max_batch: 3,
            ..ClientConfig::default()
        };
        let client = Client::with_transport(one_server(), cluster.clone(), config).unwrap();

        let results = join_all((0..7).map(|_| client.ts())).await;
        let numbers: Vec<i64> = results.into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(*cluster.batches.lock().unwrap(), vec![3, 3, 1]);
        assert_eq!(numbers, vec![2, 1, 0, 5, 4, 3, 6]);
    }

    #[tokio::test]
    async fn negative_numbers_are_rejected() {
        let transport = FixedMark {
            high_water_mark: 0,
            batches: Arc::default(),
        };
        let client = Client::with_transport(one_server(), transport, ClientConfig::default()).unwrap();

        let results = join_all((0..2).map(|_| client.ts())).await;
        assert_eq!(results[0].as_ref().unwrap(), &0);
        assert!(matches!(results[1], Err(ClientError::InvalidTimestamp(-1))));
    }

    #[tokio::test]
    async fn bogus_mark_near_the_bottom_never_wraps() {
        let transport = FixedMark {
            high_water_mark: i64::MIN + 1,
            batches: Arc::default(),
        };
        let client = Client::with_transport(one_server(), transport, ClientConfig::default()).unwrap();

        let results = join_all((0..3).map(|_| client.ts())).await;
        assert!(matches!(results[0], Err(ClientError::InvalidTimestamp(v)) if v == i64::MIN + 1));
        assert!(matches!(results[1], Err(ClientError::InvalidTimestamp(i64::MIN))));
        assert!(matches!(results[2], Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn fatal_failure_closes_the_client() {
        let transport = Garbled::default();
        let client =
            Client::with_transport(one_server(), transport.clone(), ClientConfig::default())
                .unwrap();

        let results = join_all((0..3).map(|_| client.ts())).await;
        for result in results {
            assert!(matches!(result, Err(ClientError::Closed)));
        }
        assert!(client.is_closed());

        assert!(matches!(client.ts().await, Err(ClientError::Closed)));
        tokio::task::yield_now().await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retry_bound_closes_the_client() {
        #[derive(Clone)]
        struct Down;

        impl BatchTransport for Down {
            async fn request_batch(&self, server: &str, _num: i32) -> Result<i64, TransportError> {
                Err(TransportError::Status {
                    server: server.to_string(),
                    status: 503,
                })
            }
        }

        let config = ClientConfig {
            retry: RetryPolicy {
                min_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                max_elapsed: Some(Duration::from_millis(10)),
            },
            ..ClientConfig::default()
        };
        let client = Client::with_transport(one_server(), Down, config).unwrap();

        assert!(matches!(client.ts().await, Err(ClientError::Closed)));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn close_serves_queued_callers_then_refuses() {
        /// Holds every request until a permit is added.
        #[derive(Clone)]
        struct Gated {
            gate: Arc<Semaphore>,
            cluster: SimulatedCluster,
        }

        impl BatchTransport for Gated {
            async fn request_batch(&self, server: &str, num: i32) -> Result<i64, TransportError> {
                if let Ok(permit) = self.gate.acquire().await {
                    permit.forget();
                }
                self.cluster.request_batch(server, num).await
            }
        }

        let transport = Gated {
            gate: Arc::new(Semaphore::new(0)),
            cluster: SimulatedCluster::default(),
        };
        let client =
            Client::with_transport(one_server(), transport.clone(), ClientConfig::default())
                .unwrap();

        let spawn_caller = |client: Client| tokio::spawn(async move { client.ts().await });

        // the first caller is in flight, the second one queued behind it
        let in_flight = spawn_caller(client.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let queued = spawn_caller(client.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        client.close();
        assert!(matches!(client.ts().await, Err(ClientError::Closed)));
        transport.gate.add_permits(2);

        assert_eq!(in_flight.await.unwrap().unwrap(), 0);
        assert_eq!(queued.await.unwrap().unwrap(), 1);
        assert_eq!(*transport.cluster.batches.lock().unwrap(), vec![1, 1]);
        assert!(matches!(client.ts().await, Err(ClientError::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_share_a_number() {
        let cluster = SimulatedCluster::default();
        let client =
            Client::with_transport(one_server(), cluster.clone(), ClientConfig::default()).unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move {
                    let mut numbers = Vec::with_capacity(200);
                    for _ in 0..200 {
                        numbers.push(client.ts().await.unwrap());
                    }
                    numbers
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }

        let unique: HashSet<i64> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len(), "found duplicate numbers");
        assert_eq!(all.len(), 16 * 200);

        // every number handed out was allocated, none beyond the counter
        let high_water_mark = cluster.counter.lock().unwrap().high_water_mark();
        assert_eq!(high_water_mark, all.len() as i64 - 1);
        assert!(all.iter().all(|&n| (0..=high_water_mark).contains(&n)));
    }
}
