use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::fs;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::registry::Pbx;
use crate::session;

pub const DEFAULT_PORT: u16 = 3000;
/// Ports below this are reserved and refused at boot.
pub const MIN_PORT: u16 = 1024;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Listen port; the CLI flag wins over this.
    pub port: Option<u16>,
    /// Tracing filter directive, e.g. "crossbar_pbx=debug".
    pub log: Option<String>,
}

impl Config {
    /// Load the config file. A missing file is an empty config; a file
    /// that exists but does not parse is a boot failure.
    pub async fn load(path: &Path) -> Result<Config> {
        let contents = match fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Config::default())
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read {}", path.display()))
            }
        };
        toml::from_str(&contents)
            .with_context(|| format!("parse {}", path.display()))
    }
}

/// The listening exchange: accepts connections and hands each one to a
/// session task until told to shut down, then drains the registry.
pub struct Server {
    pbx: Arc<Pbx>,
    listener: TcpListener,
    shutdown: CancellationToken,
}

impl Server {
    pub async fn bind(port: u16) -> Result<Server> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        info!(addr = %listener.local_addr()?, "exchange listening");
        Ok(Server {
            pbx: Arc::new(Pbx::new()),
            listener,
            shutdown: CancellationToken::new(),
        })
    }

    /// Token that stops the accept loop and begins the orderly shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let pbx = self.pbx.clone();
                        tokio::spawn(async move {
                            session::serve_client(pbx, stream, peer_addr).await;
                        });
                    }
                    Err(err) => warn!("accept failed: {err}"),
                },
            }
        }
        self.pbx.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio::time::{timeout, Duration};

    struct Client {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Client {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read_half, write_half) = stream.into_split();
            Client {
                reader: BufReader::new(read_half),
                writer: write_half,
            }
        }

        async fn send(&mut self, request: &str) {
            self.writer.write_all(request.as_bytes()).await.unwrap();
        }

        async fn expect(&mut self, want: &str) {
            let mut line = String::new();
            timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"))
                .unwrap();
            assert_eq!(line.trim_end_matches(['\r', '\n']), want);
        }

        /// Read to EOF, allowing only the given final-state line on the
        /// way out (the draining hangups may emit it once or twice,
        /// depending on which session tears the call down first).
        async fn drain_to_eof(&mut self, allowed: &str) {
            loop {
                let mut line = String::new();
                let read = timeout(
                    Duration::from_secs(5),
                    self.reader.read_line(&mut line),
                )
                .await
                .expect("timed out waiting for EOF")
                .unwrap();
                if read == 0 {
                    return;
                }
                assert_eq!(line.trim_end_matches(['\r', '\n']), allowed);
            }
        }
    }

    async fn start() -> (SocketAddr, CancellationToken, JoinHandle<Result<()>>) {
        let server = Server::bind(0).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_token();
        let handle = tokio::spawn(server.run());
        (addr, shutdown, handle)
    }

    #[tokio::test]
    async fn two_party_call_from_pickup_to_hangup() {
        let (addr, _shutdown, _handle) = start().await;

        let mut c1 = Client::connect(addr).await;
        c1.expect("ON HOOK 0").await;
        let mut c2 = Client::connect(addr).await;
        c2.expect("ON HOOK 1").await;

        c1.send("pickup\r\n").await;
        c1.expect("DIAL TONE").await;

        c1.send("dial 1\r\n").await;
        c1.expect("RING BACK").await;
        c2.expect("RINGING").await;

        c2.send("pickup\r\n").await;
        c2.expect("CONNECTED 0").await;
        c1.expect("CONNECTED 1").await;

        c1.send("chat hello\r\n").await;
        c2.expect("CHAT hello").await;
        c1.expect("CONNECTED 1").await;

        c2.send("hangup\r\n").await;
        c2.expect("ON HOOK 1").await;
        c1.expect("DIAL TONE").await;

        c1.send("dial 0\r\n").await;
        c1.expect("BUSY SIGNAL").await;
    }

    #[tokio::test]
    async fn disconnecting_mid_call_frees_peer_and_slot() {
        let (addr, _shutdown, _handle) = start().await;

        let mut c1 = Client::connect(addr).await;
        c1.expect("ON HOOK 0").await;
        let mut c2 = Client::connect(addr).await;
        c2.expect("ON HOOK 1").await;

        c1.send("pickup\r\n").await;
        c1.expect("DIAL TONE").await;
        c1.send("dial 1\r\n").await;
        c1.expect("RING BACK").await;
        c2.expect("RINGING").await;
        c2.send("pickup\r\n").await;
        c2.expect("CONNECTED 0").await;
        c1.expect("CONNECTED 1").await;

        // C2 vanishes without a hangup; its session hangs up for it.
        drop(c2);
        c1.expect("DIAL TONE").await;

        // Extension 1 becomes vacant once C2's session finishes
        // unregistering; retry until a new arrival lands on it.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let mut c3 = Client::connect(addr).await;
            let mut line = String::new();
            timeout(Duration::from_secs(5), c3.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for registration")
                .unwrap();
            if line.trim_end_matches(['\r', '\n']) == "ON HOOK 1" {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "extension 1 was never released, kept getting {line:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn unknown_commands_and_bad_extensions_keep_the_session_alive() {
        let (addr, _shutdown, _handle) = start().await;

        let mut c1 = Client::connect(addr).await;
        c1.expect("ON HOOK 0").await;

        c1.send("wave\r\n").await;
        c1.send("PICKUP\r\n").await;
        c1.send("pickup\r\n").await;
        c1.expect("DIAL TONE").await;

        c1.send("dial abc\r\n").await;
        c1.expect("ERROR").await;
        c1.send("hangup\r\n").await;
        c1.expect("ON HOOK 0").await;

        c1.send("pickup\r\n").await;
        c1.expect("DIAL TONE").await;
        c1.send("dial 999999\r\n").await;
        c1.expect("ERROR").await;
    }

    #[tokio::test]
    async fn chat_outside_a_call_only_renotifies() {
        let (addr, _shutdown, _handle) = start().await;

        let mut c1 = Client::connect(addr).await;
        c1.expect("ON HOOK 0").await;
        c1.send("chat anyone\r\n").await;
        c1.expect("ON HOOK 0").await;
        // The session stays alive and usable.
        c1.send("pickup\r\n").await;
        c1.expect("DIAL TONE").await;
    }

    #[tokio::test]
    async fn shutdown_tears_down_live_calls_and_drains() {
        let (addr, shutdown, handle) = start().await;

        let mut c1 = Client::connect(addr).await;
        c1.expect("ON HOOK 0").await;
        let mut c2 = Client::connect(addr).await;
        c2.expect("ON HOOK 1").await;
        c1.send("pickup\r\n").await;
        c1.expect("DIAL TONE").await;
        c1.send("dial 1\r\n").await;
        c1.expect("RING BACK").await;
        c2.expect("RINGING").await;

        shutdown.cancel();
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("server did not drain")
            .unwrap()
            .unwrap();
        c1.drain_to_eof("ON HOOK 0").await;
        c2.drain_to_eof("ON HOOK 1").await;
    }
}
