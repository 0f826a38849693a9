pub mod protocol;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::{Downlink, TransportKind};
use crate::config::ForwarderConfig;
use crate::error::{BridgeError, ConfigError, Result};
use crate::radio::RadioUplinkMetadata;
use protocol::{GatewayMac, InboundDatagram};

/// Largest datagram the listener accepts
const MAX_DATAGRAM_LEN: usize = 65535;

/// Validated forwarder settings, copied out of the config at connect time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderSettings {
    /// Network server address
    pub server: IpAddr,
    /// Network server UDP port (PUSH_DATA destination)
    pub server_port: u16,
    /// Local UDP port the PULL_RESP listener binds on `0.0.0.0`
    pub bind_port: u16,
}

impl ForwarderSettings {
    pub fn from_config(config: &ForwarderConfig) -> std::result::Result<Self, ConfigError> {
        let server_port = parse_port(&config.port)?;
        let bind_port = match &config.bind_port {
            Some(port) => parse_port(port)?,
            None => server_port,
        };
        let server = config
            .server
            .trim()
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::InvalidServerAddress(config.server.clone()))?;

        Ok(Self {
            server,
            server_port,
            bind_port,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server, self.server_port)
    }
}

fn parse_port(port: &str) -> std::result::Result<u16, ConfigError> {
    port.trim()
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidPort(port.to_string()))
}

/// Running PULL_RESP listener
struct Listener {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Semtech packet forwarder client: PUSH_DATA out, PULL_RESP in
pub struct UdpForwarderClient {
    settings: ForwarderSettings,
    gateway_mac: GatewayMac,
    listener: Option<Listener>,
}

impl UdpForwarderClient {
    pub fn new(settings: ForwarderSettings, gateway_mac: GatewayMac) -> Self {
        Self {
            settings,
            gateway_mac,
            listener: None,
        }
    }

    /// Bind the listener and start the receive loop
    ///
    /// Every decoded PULL_RESP payload is pushed onto `downlinks`. The loop
    /// never waits on the queue: when it is full the downlink is dropped.
    pub async fn connect(&mut self, downlinks: mpsc::Sender<Downlink>) -> Result<()> {
        self.disconnect().await;

        let bindpoint = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.settings.bind_port);
        let socket = UdpSocket::bind(bindpoint)
            .await
            .map_err(|e| BridgeError::Connect(format!("UDP bind {} failed: {}", bindpoint, e)))?;
        let local_addr = socket.local_addr()?;
        info!("UDP listening bindpoint={}", local_addr);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_listener(socket, downlinks, cancel.clone()));

        self.listener = Some(Listener {
            local_addr,
            cancel,
            task,
        });
        info!(
            "UDP forwarder started for gateway {} -> {}",
            self.gateway_mac,
            self.settings.server_addr()
        );
        Ok(())
    }

    /// Stop the listener and release its socket; safe to call repeatedly
    pub async fn disconnect(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };

        listener.cancel.cancel();
        if let Err(e) = listener.task.await {
            error!("UDP listener task failed: {}", e);
        }
        info!("UDP listener on {} stopped", listener.local_addr);
    }

    /// Whether the listener task is alive; says nothing about sends
    pub fn is_connected(&self) -> bool {
        self.listener
            .as_ref()
            .is_some_and(|listener| !listener.task.is_finished())
    }

    /// Address the listener is bound to, if connected
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|listener| listener.local_addr)
    }

    /// Send one uplink as a PUSH_DATA datagram
    ///
    /// Fire-and-forget: a fresh socket per call, no retry and no wait for
    /// PUSH_ACK.
    pub async fn send_uplink(&self, payload: &[u8], meta: &RadioUplinkMetadata) -> Result<()> {
        let datagram = protocol::encode_uplink_frame(payload, &self.gateway_mac, meta)?;

        let server = self.settings.server_addr();
        let local = match server {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;
        socket.send(&datagram).await?;

        debug!(
            "PUSH_DATA sent to {}: {} bytes ({} byte payload)",
            server,
            datagram.len(),
            payload.len()
        );
        Ok(())
    }
}

impl Drop for UdpForwarderClient {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.cancel.cancel();
            listener.task.abort();
        }
    }
}

async fn run_listener(
    socket: UdpSocket,
    downlinks: mpsc::Sender<Downlink>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, src)) => {
                    debug!("Received {} bytes from {}", len, src);
                    handle_datagram(&buf[..len], src, &downlinks);
                }
                Err(e) => warn!("UDP receive error: {}", e),
            },
        }
    }
}

fn handle_datagram(data: &[u8], src: SocketAddr, downlinks: &mpsc::Sender<Downlink>) {
    match protocol::decode_inbound_datagram(data) {
        Ok(InboundDatagram::Downlink {
            random_token,
            payload,
            ..
        }) => {
            info!(
                "PULL_RESP from {} (token: 0x{:04x}): {} byte payload",
                src,
                random_token,
                payload.len()
            );
            let downlink = Downlink {
                transport: TransportKind::UdpForwarder,
                payload,
            };
            match downlinks.try_send(downlink) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Downlink queue full, dropping PULL_RESP from {}", src)
                }
                Err(TrySendError::Closed(_)) => {
                    warn!("Downlink queue closed, dropping PULL_RESP from {}", src)
                }
            }
        }
        Ok(InboundDatagram::Other {
            random_token,
            identifier,
        }) => {
            debug!(
                "Ignoring datagram 0x{:02x} from {} (token: 0x{:04x})",
                identifier, src, random_token
            );
        }
        Err(e) => {
            warn!("Failed to decode datagram from {}: {}", src, e);
        }
    }
}
