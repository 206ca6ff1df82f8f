//! The SFU's connection to the Hub: one WebSocket on the internal channel,
//! re-dialed forever until shutdown.

use crate::error::{SfuError, SfuResult};
use crate::sfu::Sfu;
use futures_util::{SinkExt, StreamExt};
use huddle_common::config::SfuConfig;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Full URL of the Hub's internal SFU channel.
    pub hub_url: String,
    pub reconnect_interval: Duration,
    pub heartbeat_interval: Duration,
    pub write_wait: Duration,
    /// No frame at all for this long means the link is dead.
    pub read_timeout: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self::from(&SfuConfig::default())
    }
}

impl From<&SfuConfig> for LinkSettings {
    fn from(config: &SfuConfig) -> Self {
        Self {
            hub_url: config.hub_url.clone(),
            reconnect_interval: config.reconnect_interval(),
            heartbeat_interval: config.heartbeat_interval(),
            write_wait: config.write_wait(),
            read_timeout: config.read_timeout(),
        }
    }
}

pub struct HubLink {
    settings: LinkSettings,
}

impl HubLink {
    pub fn new(settings: LinkSettings) -> Self {
        Self { settings }
    }

    /// Keep a session with the Hub open until `shutdown` fires.
    ///
    /// Frames queued on `outbound` while disconnected wait for the next
    /// session; peer state in `sfu` is left alone across reconnects.
    pub async fn run(
        &self,
        sfu: Sfu,
        mut outbound: mpsc::Receiver<String>,
        shutdown: CancellationToken,
    ) {
        let url = self.settings.hub_url.as_str();
        loop {
            let connected = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = connect_async(url) => result,
            };

            match connected {
                Ok((ws, _)) => {
                    info!(url = %url, "Connected to hub");
                    match self.session(ws, &sfu, &mut outbound, &shutdown).await {
                        Ok(()) => info!("Hub session ended"),
                        Err(e) => warn!(error = %e, "Hub session failed"),
                    }
                }
                Err(e) => error!(url = %url, error = %e, "Failed to connect to hub"),
            }

            if shutdown.is_cancelled() {
                break;
            }
            debug!(delay = ?self.settings.reconnect_interval, "Reconnecting to hub");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.settings.reconnect_interval) => {}
            }
        }
        info!("Hub link stopped");
    }

    async fn session(
        &self,
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
        sfu: &Sfu,
        outbound: &mut mpsc::Receiver<String>,
        shutdown: &CancellationToken,
    ) -> SfuResult<()> {
        let (mut sink, mut stream) = ws.split();
        let write_wait = self.settings.write_wait;
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.settings.heartbeat_interval,
            self.settings.heartbeat_interval,
        );
        let idle = sleep(self.settings.read_timeout);
        tokio::pin!(idle);

        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = timeout(write_wait, sink.send(Message::Close(None))).await;
                    return Ok(());
                }
                _ = &mut idle => return Err(SfuError::Timeout("read")),
                frame = stream.next() => {
                    idle.as_mut().reset(Instant::now() + self.settings.read_timeout);
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(e) = sfu.handle_message(text.as_str()).await {
                                warn!(error = %e, "Failed to handle hub message");
                            }
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
                Some(frame) = outbound.recv() => Message::Text(frame.into()),
                _ = heartbeat.tick() => Message::Ping(Default::default()),
            };

            match timeout(write_wait, sink.send(message)).await {
                Ok(result) => result?,
                Err(_) => return Err(SfuError::Timeout("write")),
            }
        }
    }
}
