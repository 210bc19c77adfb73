//! PBX registry: the switchboard mapping extension numbers to TUs.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::tu::{Tu, TuError};
use crate::MAX_EXTENSIONS;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("extension {0} is out of range")]
    OutOfRange(u32),

    #[error("extension {0} is already in use")]
    InUse(u32),

    #[error("no free extension")]
    Exhausted,

    #[error("telephone unit is not registered")]
    NotRegistered,

    #[error(transparent)]
    Tu(#[from] TuError),
}

struct Registry {
    entries: Vec<Option<Arc<Tu>>>,
    num_entries: usize,
}

/// The exchange. Holds one reference to every registered TU for as long as
/// the registration lasts.
///
/// The registry lock is a leaf: no TU lock is ever taken while it is held,
/// with the single exception of the extension assignment on a TU that is
/// not yet reachable from the table.
pub struct Pbx {
    registry: Mutex<Registry>,
    occupancy: watch::Sender<usize>,
    closing: CancellationToken,
}

impl Default for Pbx {
    fn default() -> Self {
        Self::new()
    }
}

impl Pbx {
    pub fn new() -> Pbx {
        let (occupancy, _) = watch::channel(0);
        Pbx {
            registry: Mutex::new(Registry {
                entries: vec![None; MAX_EXTENSIONS],
                num_entries: 0,
            }),
            occupancy,
            closing: CancellationToken::new(),
        }
    }

    /// Cancellation token for a new session; fires when the exchange shuts
    /// down, including for sessions that register after shutdown began.
    pub fn session_token(&self) -> CancellationToken {
        self.closing.child_token()
    }

    /// Plug a TU into the lowest vacant extension and notify its client.
    pub async fn register(&self, tu: &Arc<Tu>) -> Result<u32, RegistryError> {
        let mut reg = self.registry.lock().await;
        let ext = reg
            .entries
            .iter()
            .position(Option::is_none)
            .ok_or(RegistryError::Exhausted)? as u32;
        self.register_slot(&mut reg, tu, ext).await?;
        Ok(ext)
    }

    /// Plug a TU into a caller-chosen extension; fails if the slot is
    /// occupied or out of range.
    pub async fn register_at(
        &self,
        tu: &Arc<Tu>,
        ext: u32,
    ) -> Result<(), RegistryError> {
        let mut reg = self.registry.lock().await;
        self.register_slot(&mut reg, tu, ext).await
    }

    async fn register_slot(
        &self,
        reg: &mut Registry,
        tu: &Arc<Tu>,
        ext: u32,
    ) -> Result<(), RegistryError> {
        let slot = reg
            .entries
            .get_mut(ext as usize)
            .ok_or(RegistryError::OutOfRange(ext))?;
        if slot.is_some() {
            return Err(RegistryError::InUse(ext));
        }
        // The TU is not in the table yet, so no other task can be waiting
        // on its lock; assigning here cannot invert the lock order.
        tu.assign_extension(ext).await?;
        *slot = Some(tu.clone());
        reg.num_entries += 1;
        self.occupancy.send_replace(reg.num_entries);
        debug!(ext, registered = reg.num_entries, "registered TU");
        Ok(())
    }

    /// Unplug a TU, releasing the registry's reference. Any call the TU was
    /// in is expected to have been hung up by the caller already; a peering
    /// that survives is torn down by the peer's own hangup.
    pub async fn unregister(&self, tu: &Arc<Tu>) -> Result<(), RegistryError> {
        let ext = tu.extension().await.ok_or(RegistryError::NotRegistered)?;
        let mut reg = self.registry.lock().await;
        let slot = reg
            .entries
            .get_mut(ext as usize)
            .ok_or(RegistryError::OutOfRange(ext))?;
        match slot {
            Some(current) if Arc::ptr_eq(current, tu) => {
                *slot = None;
                reg.num_entries -= 1;
                self.occupancy.send_replace(reg.num_entries);
                debug!(ext, registered = reg.num_entries, "unregistered TU");
                Ok(())
            }
            _ => Err(RegistryError::NotRegistered),
        }
    }

    /// Initiate a call from `tu` to a dialed extension. `None` (a number
    /// the session could not parse) and unresolvable extensions both dial a
    /// null target, which the TU turns into its ERROR transition.
    pub async fn dial_ext(
        &self,
        tu: &Arc<Tu>,
        ext: Option<u32>,
    ) -> Result<(), TuError> {
        let target = match ext {
            Some(ext) => {
                let reg = self.registry.lock().await;
                reg.entries.get(ext as usize).and_then(|slot| slot.clone())
            }
            None => None,
        };
        tu.dial(target).await
    }

    /// Shut down the exchange: kick every session off its blocked read,
    /// then wait for them all to drain through hangup + unregister.
    pub async fn shutdown(&self) {
        let registered = {
            let reg = self.registry.lock().await;
            reg.num_entries
        };
        info!(registered, "shutting down the exchange");
        self.closing.cancel();

        let mut occupancy = self.occupancy.subscribe();
        while *occupancy.borrow_and_update() != 0 {
            if occupancy.changed().await.is_err() {
                break;
            }
        }
        info!("all sessions drained");
    }
}
