use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::registry::Pbx;
use crate::tu::{Tu, TuError};

/// One client request, parsed from a single CRLF-terminated line.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Pickup,
    Hangup,
    /// `None` when the extension did not parse; the registry dials a null
    /// target for it.
    Dial(Option<u32>),
    /// Everything after the single space following the keyword.
    Chat(String),
}

impl Command {
    /// Parse one request line. `None` means the line is not a well-formed
    /// command and is ignored; keywords are case-sensitive.
    pub fn parse(line: &str) -> Option<Command> {
        let line = line.strip_suffix('\n')?;
        let line = line.strip_suffix('\r').unwrap_or(line);
        match line.split_once(' ') {
            None => match line {
                "pickup" => Some(Command::Pickup),
                "hangup" => Some(Command::Hangup),
                "chat" => Some(Command::Chat(String::new())),
                _ => None,
            },
            Some(("dial", arg)) => Some(Command::Dial(arg.parse().ok())),
            Some(("chat", text)) => Some(Command::Chat(text.to_string())),
            Some(_) => None,
        }
    }
}

/// Serve one client connection: register a TU, then read one command per
/// line until EOF, read error, or shutdown, and unplug on the way out.
pub(crate) async fn serve_client(
    pbx: Arc<Pbx>,
    stream: TcpStream,
    peer_addr: SocketAddr,
) {
    let (read_half, write_half) = stream.into_split();
    let tu = Tu::new(Box::new(write_half), pbx.session_token());
    let ext = match pbx.register(&tu).await {
        Ok(ext) => ext,
        Err(err) => {
            warn!(%peer_addr, "refusing connection: {err}");
            return;
        }
    };
    info!(%peer_addr, ext, "client connected");

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::select! {
            _ = tu.cancelled() => break,
            read = reader.read_line(&mut line) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(ext, "read failed: {err}");
                break;
            }
        }
        let Some(command) = Command::parse(&line) else {
            debug!(ext, line = line.trim_end(), "ignoring unknown command");
            continue;
        };
        let result = match command {
            Command::Pickup => tu.pickup().await,
            Command::Hangup => tu.hangup().await,
            Command::Dial(dialed) => pbx.dial_ext(&tu, dialed).await,
            Command::Chat(text) => tu.chat(&text).await,
        };
        match result {
            Ok(()) => {}
            Err(TuError::ClientGone(err)) => {
                debug!(ext, "client lost: {err}");
                break;
            }
            // Invalid-for-state and dead-peer failures keep the session
            // alive; the protocol has already told the client what it
            // needs to know.
            Err(err) => debug!(ext, "command failed: {err}"),
        }
    }

    let _ = tu.hangup().await;
    if let Err(err) = pbx.unregister(&tu).await {
        warn!(ext, "unregister failed: {err}");
    }
    info!(%peer_addr, ext, "client disconnected");
}
