//
// TCP layer for replica-to-replica calls: tarpc over JSON frames.
//
use std::future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use futures::StreamExt;
use tarpc::client;
use tarpc::server::{self, incoming::Incoming, Channel};
use tarpc::tokio_serde::formats::Json;
use thiserror::Error;
use tracing::{debug, info};

use super::raft::Raft;
use super::rpc::{Replica, ReplicaClient, ReplicaServer};

type ConnErrResult<T> = Result<T, ConnErrors>;

const MAX_CHANNELS_PER_PEER: u32 = 16;
const MAX_CONCURRENT_CHANNELS: usize = 64;

#[derive(Error, Debug)]
pub enum ConnErrors {
    #[error("tcp error: {0}")]
    TCPTokioError(#[from] io::Error),
    #[error("rpc error: {0}")]
    RpcError(#[from] tarpc::client::RpcError),
}

#[derive(Debug, Clone)]
pub struct ConnectionLayer {
    pub local_addr: SocketAddr,
}

impl ConnectionLayer {
    /// Starts serving the `Replica` service for `raft` on `addr`.
    pub async fn init_layer(addr: &SocketAddr, raft: Raft) -> ConnErrResult<ConnectionLayer> {
        let mut listener = tarpc::serde_transport::tcp::listen(addr, Json::default).await?;
        listener.config_mut().max_frame_length(usize::MAX);
        let local_addr = listener.local_addr();
        info!(addr = %local_addr, "peer rpc listening");

        tokio::spawn(async move {
            listener
                .filter_map(|r| future::ready(r.ok()))
                .map(server::BaseChannel::with_defaults)
                .max_channels_per_key(MAX_CHANNELS_PER_PEER, |t| {
                    t.transport()
                        .peer_addr()
                        .map(|a| a.ip())
                        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
                })
                .map(|channel| {
                    let server = ReplicaServer { raft: raft.clone() };
                    channel.execute(server.serve())
                })
                .buffer_unordered(MAX_CONCURRENT_CHANNELS)
                .for_each(|_| async {})
                .await;
        });

        Ok(ConnectionLayer { local_addr })
    }

    pub async fn connect(addr: &str) -> ConnErrResult<ReplicaClient> {
        let mut transport = tarpc::serde_transport::tcp::connect(addr, Json::default);
        transport.config_mut().max_frame_length(usize::MAX);
        let trans = transport.await?;
        Ok(ReplicaClient::new(client::Config::default(), trans).spawn())
    }

    /// Pings `addr`, returning the remote node name.
    pub async fn ping_node_wrapper(addr: &str, from: String) -> Option<String> {
        match Self::ping_node(addr, from).await {
            Ok(name) => Some(name),
            Err(err) => {
                debug!(peer = %addr, error = %err, "ping failed");
                None
            }
        }
    }

    async fn ping_node(addr: &str, from: String) -> ConnErrResult<String> {
        let client = Self::connect(addr).await?;
        Ok(client.ping(tarpc::context::current(), from).await?)
    }
}
