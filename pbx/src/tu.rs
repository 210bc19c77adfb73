//! TU: a "telephone unit" interfacing one network client with the exchange.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

/// Byte sink for a TU's client. The server hands in the write half of the
/// TCP connection; tests hand in an in-memory pipe.
pub type ClientConn = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_TU_ID: AtomicU64 = AtomicU64::new(0);

//                      pickup
//     +-----------+------------>+-----------+
//     |  ON HOOK  |             | DIAL TONE |<-------------------+
//     +-----------+<------------+-----------+                    |
//        ^  ^  ^      hangup      |        | dial <bad/busy>     |
//        |  |  |             dial |        +------->BUSY SIGNAL  |
// hangup |  |  | hangup           v        +------->ERROR        |
//        |  |  |            +-----------+                        |
//        |  |  +------------| RING BACK |. . . peer: RINGING     |
//        |  |               +-----------+                        |
//        |  |  peer hangup        | peer pickup                  |
//        |  |  while RINGING      v                              |
//        |  |               +-----------+      peer hangup       |
//        |  +---------------| CONNECTED |------------------------+
//        |                  +-----------+      (peer side)
//        +-- hangup --------------+
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum TuState {
    #[strum(serialize = "ON HOOK")]
    OnHook,
    #[strum(serialize = "RINGING")]
    Ringing,
    #[strum(serialize = "DIAL TONE")]
    DialTone,
    #[strum(serialize = "RING BACK")]
    RingBack,
    #[strum(serialize = "BUSY SIGNAL")]
    BusySignal,
    #[strum(serialize = "CONNECTED")]
    Connected,
    #[strum(serialize = "ERROR")]
    Error,
}

#[derive(Debug, Error)]
pub enum TuError {
    #[error("no call in progress")]
    NotConnected,

    #[error("client connection lost")]
    ClientGone(#[source] io::Error),

    #[error("peer connection lost")]
    PeerGone(#[source] io::Error),
}

/// One side of an established pairing. The extension is captured when the
/// pairing commits (both locks held), so a later `CONNECTED <peer-ext>`
/// line never needs the peer's lock.
struct PeerLink {
    tu: Arc<Tu>,
    ext: u32,
}

/// Everything the TU lock guards: call state, extension, the peer link and
/// the client socket. Notifications are written while the lock is held, so
/// the lines a client sees are ordered with its TU's transitions.
struct TuInner {
    state: TuState,
    ext: Option<u32>,
    conn: ClientConn,
    peer: Option<PeerLink>,
}

pub struct Tu {
    id: u64,
    cancel: CancellationToken,
    inner: Mutex<TuInner>,
}

impl Tu {
    pub fn new(conn: ClientConn, cancel: CancellationToken) -> Arc<Tu> {
        Arc::new(Tu {
            id: NEXT_TU_ID.fetch_add(1, Ordering::Relaxed),
            cancel,
            inner: Mutex::new(TuInner {
                state: TuState::OnHook,
                ext: None,
                conn,
                peer: None,
            }),
        })
    }

    /// Resolved when the exchange is shutting down and this TU's session
    /// should stop reading.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub async fn extension(&self) -> Option<u32> {
        self.inner.lock().await.ext
    }

    pub async fn state(&self) -> TuState {
        self.inner.lock().await.state
    }

    /// Assign the extension at registration time and notify the client.
    /// The registry calls this before the TU is reachable from its table,
    /// so taking the TU lock here cannot invert the two-lock order used by
    /// the call paths.
    pub(crate) async fn assign_extension(&self, ext: u32) -> Result<(), TuError> {
        let mut inner = self.inner.lock().await;
        inner.ext = Some(ext);
        inner.state = TuState::OnHook;
        inner.notify().await.map_err(TuError::ClientGone)
    }

    /// Take the receiver off-hook. ON_HOOK gives dial tone; RINGING
    /// answers the incoming call and connects both parties.
    pub async fn pickup(self: &Arc<Self>) -> Result<(), TuError> {
        loop {
            let mut inner = self.inner.lock().await;
            match inner.state {
                TuState::OnHook => {
                    inner.state = TuState::DialTone;
                    return inner.notify().await.map_err(TuError::ClientGone);
                }
                TuState::Ringing => {
                    let peer = inner.peer_handle();
                    drop(inner);
                    let (mut me, mut other) = lock_pair(self, &peer).await;
                    if me.state != TuState::Ringing || !me.peer_is(&peer) {
                        // A hangup got in during the unlocked gap; redo the
                        // dispatch against the current state.
                        continue;
                    }
                    me.state = TuState::Connected;
                    other.state = TuState::Connected;
                    let res = me.notify().await;
                    other.notify_best_effort().await;
                    return res.map_err(TuError::ClientGone);
                }
                _ => return inner.notify().await.map_err(TuError::ClientGone),
            }
        }
    }

    /// Replace the receiver on the switchhook. Dissolves any pairing:
    /// a CONNECTED hangup leaves the peer on dial tone, while hanging up
    /// an unanswered call (either side) puts the peer back on hook.
    pub async fn hangup(self: &Arc<Self>) -> Result<(), TuError> {
        loop {
            let mut inner = self.inner.lock().await;
            match inner.state {
                TuState::Connected | TuState::Ringing | TuState::RingBack => {
                    let was = inner.state;
                    let peer = inner.peer_handle();
                    drop(inner);
                    let (mut me, mut other) = lock_pair(self, &peer).await;
                    if me.state != was || !me.peer_is(&peer) {
                        continue;
                    }
                    me.state = TuState::OnHook;
                    other.state = if was == TuState::Connected {
                        TuState::DialTone
                    } else {
                        TuState::OnHook
                    };
                    let res = me.notify().await;
                    other.notify_best_effort().await;
                    // Clients have seen their final state; now drop the
                    // pairing references from both sides.
                    me.peer = None;
                    other.peer = None;
                    return res.map_err(TuError::ClientGone);
                }
                TuState::DialTone | TuState::BusySignal | TuState::Error => {
                    inner.state = TuState::OnHook;
                    return inner.notify().await.map_err(TuError::ClientGone);
                }
                TuState::OnHook => {
                    return inner.notify().await.map_err(TuError::ClientGone);
                }
            }
        }
    }

    /// Call another TU. `target` is `None` when the dialed extension could
    /// not be resolved; in DIAL_TONE that is an ERROR transition. A busy or
    /// already-peered target gives BUSY_SIGNAL; an eligible one is paired
    /// and starts RINGING while this TU hears RING_BACK.
    pub async fn dial(
        self: &Arc<Self>,
        target: Option<Arc<Tu>>,
    ) -> Result<(), TuError> {
        loop {
            let mut inner = self.inner.lock().await;
            if inner.state != TuState::DialTone {
                return inner.notify().await.map_err(TuError::ClientGone);
            }
            let target = match &target {
                None => {
                    inner.state = TuState::Error;
                    return inner.notify().await.map_err(TuError::ClientGone);
                }
                Some(t) if Arc::ptr_eq(self, t) => {
                    inner.state = TuState::BusySignal;
                    return inner.notify().await.map_err(TuError::ClientGone);
                }
                Some(t) => t.clone(),
            };
            // The eligibility check needs the target's lock, and both locks
            // have to be taken in id order, so give up our own first and
            // re-verify everything once the pair is held.
            drop(inner);
            let (mut me, mut other) = lock_pair(self, &target).await;
            if me.state != TuState::DialTone {
                continue;
            }
            if other.state != TuState::OnHook || other.peer.is_some() {
                me.state = TuState::BusySignal;
                return me.notify().await.map_err(TuError::ClientGone);
            }
            let me_ext = me.ext.expect("dial from an unregistered TU");
            let other_ext = other.ext.expect("dial to an unregistered TU");
            me.state = TuState::RingBack;
            other.state = TuState::Ringing;
            me.peer = Some(PeerLink {
                tu: target.clone(),
                ext: other_ext,
            });
            other.peer = Some(PeerLink {
                tu: self.clone(),
                ext: me_ext,
            });
            let res = me.notify().await;
            other.notify_best_effort().await;
            return res.map_err(TuError::ClientGone);
        }
    }

    /// Relay a chat line to the connected peer. Valid only in CONNECTED;
    /// anywhere else nothing is sent to a peer, the sender is re-notified
    /// of its unchanged state, and the caller gets a failure result.
    pub async fn chat(self: &Arc<Self>, text: &str) -> Result<(), TuError> {
        loop {
            let mut inner = self.inner.lock().await;
            if inner.state != TuState::Connected {
                inner.notify().await.map_err(TuError::ClientGone)?;
                return Err(TuError::NotConnected);
            }
            let peer = inner.peer_handle();
            drop(inner);
            let (mut me, mut other) = lock_pair(self, &peer).await;
            if me.state != TuState::Connected || !me.peer_is(&peer) {
                continue;
            }
            let res = me.notify().await;
            let sent = other.send_line(&format!("CHAT {text}\n")).await;
            res.map_err(TuError::ClientGone)?;
            return sent.map_err(TuError::PeerGone);
        }
    }
}

impl TuInner {
    /// The peer handle in a peered state. Its absence there is a broken
    /// invariant, not a recoverable condition.
    fn peer_handle(&self) -> Arc<Tu> {
        self.peer
            .as_ref()
            .map(|p| p.tu.clone())
            .expect("peered state without a peer link")
    }

    fn peer_is(&self, other: &Arc<Tu>) -> bool {
        self.peer
            .as_ref()
            .is_some_and(|p| Arc::ptr_eq(&p.tu, other))
    }

    async fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.conn.write_all(line.as_bytes()).await?;
        self.conn.flush().await
    }

    /// One state line for the current state, in the wire form the client
    /// expects.
    async fn notify(&mut self) -> io::Result<()> {
        let line = match self.state {
            TuState::OnHook => match self.ext {
                Some(ext) => format!("{} {ext}\n", self.state),
                None => format!("{}\n", self.state),
            },
            TuState::Connected => {
                let peer = self.peer.as_ref().expect("connected without a peer");
                format!("{} {}\n", self.state, peer.ext)
            }
            state => format!("{state}\n"),
        };
        self.send_line(&line).await
    }

    /// Peer-side notification. A dead peer socket is the peer session's
    /// problem; it gets cleaned up on that session's EOF.
    async fn notify_best_effort(&mut self) {
        if let Err(err) = self.notify().await {
            debug!(ext = self.ext, "peer notification failed: {err}");
        }
    }
}

/// Acquire two TU locks in ascending-id order, whichever side initiated
/// the operation. This is the single deadlock-avoidance rule for every
/// two-TU mutation.
async fn lock_pair<'a>(
    a: &'a Arc<Tu>,
    b: &'a Arc<Tu>,
) -> (MutexGuard<'a, TuInner>, MutexGuard<'a, TuInner>) {
    if a.id < b.id {
        let ga = a.inner.lock().await;
        let gb = b.inner.lock().await;
        (ga, gb)
    } else {
        let gb = b.inner.lock().await;
        let ga = a.inner.lock().await;
        (ga, gb)
    }
}
