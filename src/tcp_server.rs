use crate::prelude::*;
use crate::bridge::{ChannelData, ClientHandle, ClientRequest, ClientSink, SharedStatus};
use crate::client::FrameDecoder;

use bytes::{Bytes, BytesMut};
use net2::TcpStreamExt;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;

#[derive(Clone, Debug, Default, Serialize)]
pub struct ServerStats {
    pub connections_total: u64,
    pub active_clients: usize,
    pub rejected_clients: u64,
    pub idle_timeouts: u64,
    pub frames_in: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[derive(Clone, Debug)]
pub struct ServerSettings {
    pub listen: String,
    pub port: u16,
    pub max_clients: usize,
    pub client_timeout: Duration,
    pub keepalive: Duration,
}

impl From<&config::Tcp> for ServerSettings {
    fn from(config: &config::Tcp) -> Self {
        Self {
            listen: config.listen().to_string(),
            port: config.port(),
            max_clients: config.max_clients(),
            client_timeout: Duration::from_millis(config.client_timeout_ms()),
            keepalive: Duration::from_secs(config.keepalive_secs()),
        }
    }
}

fn update(status: &SharedStatus, f: impl FnOnce(&mut ServerStats)) {
    let mut status = status.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut status.server);
}

// {{{ Connection
#[derive(Debug)]
enum Outbound {
    Frame(Bytes),
    Close,
}

/// The bridge's handle on one client socket; writes go through the
/// connection task that owns the socket.
struct Connection {
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ClientSink for Connection {
    fn peer(&self) -> String {
        self.peer.to_string()
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        self.tx
            .send(Outbound::Frame(Bytes::copy_from_slice(data)))
            .map_err(|_| anyhow!("connection to {} closed", self.peer))
    }

    fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}
// }}}

// {{{ TcpServer
/// Accepts dongle-protocol clients and feeds their frames to the bridge.
#[derive(Clone)]
pub struct TcpServer {
    settings: ServerSettings,
    channels: Channels,
    status: SharedStatus,
}

impl TcpServer {
    pub fn new(settings: ServerSettings, channels: Channels, status: SharedStatus) -> Self {
        Self {
            settings,
            channels,
            status,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let addr = format!("{}:{}", self.settings.listen, self.settings.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|err| file_error_with_source!(err, "cannot listen on {}", addr))?;
        info!("listening for clients on {}", addr);

        self.serve(listener).await
    }

    /// Accept loop on an already bound listener, until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown = self.channels.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept(stream, peer),
                    Err(err) => warn!("accept failed: {}", err),
                },
                _ = shutdown.recv() => break,
            }
        }

        info!("tcp server exiting");
        Ok(())
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        let active = {
            let status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            status.server.active_clients
        };
        if active >= self.settings.max_clients {
            warn!(
                "rejecting {}: {} clients already connected (max {})",
                peer, active, self.settings.max_clients
            );
            update(&self.status, |s| s.rejected_clients += 1);
            return;
        }

        let stream = match self.configure(stream) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("{}: {}", peer, err);
                return;
            }
        };

        update(&self.status, |s| {
            s.connections_total += 1;
            s.active_clients += 1;
        });
        info!("client {} connected ({} active)", peer, active + 1);

        let server = self.clone();
        tokio::spawn(async move {
            if let Err(err) = server.connection(stream, peer).await {
                warn!("client {}: {}", peer, err);
            }
            update(&server.status, |s| s.active_clients = s.active_clients.saturating_sub(1));
            info!("client {} disconnected", peer);
        });
    }

    fn configure(&self, stream: TcpStream) -> Result<TcpStream> {
        let std_stream = stream
            .into_std()
            .map_err(|err| file_error_with_source!(err, "into_std failed"))?;
        if let Err(err) = std_stream.set_keepalive(Some(self.settings.keepalive)) {
            warn!("failed to set TCP keepalive: {}", err);
        }
        let stream = TcpStream::from_std(std_stream)
            .map_err(|err| file_error_with_source!(err, "from_std failed"))?;
        if let Err(err) = stream.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY: {}", err);
        }
        Ok(stream)
    }

    async fn connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut outbound) = mpsc::unbounded_channel();
        let client: ClientHandle = Arc::new(Connection { peer, tx });

        let mut shutdown = self.channels.shutdown.subscribe();
        let mut buf = BytesMut::with_capacity(crate::client::decoder::MAX_FRAME_LEN);
        let mut decoder = FrameDecoder::new();

        loop {
            tokio::select! {
                read = tokio::time::timeout(self.settings.client_timeout, reader.read_buf(&mut buf)) => {
                    let n = match read {
                        Err(_) => {
                            info!(
                                "client {} idle for {}ms, closing",
                                peer,
                                self.settings.client_timeout.as_millis()
                            );
                            update(&self.status, |s| s.idle_timeouts += 1);
                            break;
                        }
                        Ok(Err(err)) => bail!("read error: {}", err),
                        Ok(Ok(0)) => break,
                        Ok(Ok(n)) => n,
                    };
                    update(&self.status, |s| s.bytes_in += n as u64);

                    while let Some(frame) = decoder.decode(&mut buf)? {
                        update(&self.status, |s| s.frames_in += 1);
                        let request = ClientRequest {
                            bytes: frame.freeze(),
                            client: Arc::clone(&client),
                        };
                        if let Err(err) = self.channels.to_bridge.send(ChannelData::Request(request)) {
                            warn!("bridge not listening, dropping frame from {}: {}", peer, err);
                        }
                    }
                }
                out = outbound.recv() => match out {
                    Some(Outbound::Frame(bytes)) => {
                        writer
                            .write_all(&bytes)
                            .await
                            .map_err(|err| file_error_with_source!(err, "write to {} failed", peer))?;
                        update(&self.status, |s| s.bytes_out += bytes.len() as u64);
                    }
                    Some(Outbound::Close) | None => {
                        debug!("closing {} on request", peer);
                        break;
                    }
                },
                _ = shutdown.recv() => break,
            }
        }

        if decoder.skipped() > 0 {
            debug!("client {}: {} stray bytes skipped", peer, decoder.skipped());
        }
        let _ = writer.shutdown().await;
        Ok(())
    }
}
// }}}
