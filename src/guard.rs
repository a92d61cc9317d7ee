use crate::prelude::*;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;

// {{{ GuardKind
/// The blocking activities that must never overlap on the shared bus or radio.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum GuardKind {
    ClientProcessing,
    BusOperation,
    NetworkValidation,
    WifiScan,
    FirmwareUpdate,
}

impl GuardKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::ClientProcessing => "TCP",
            Self::BusOperation => "RS485",
            Self::NetworkValidation => "NET_VALID",
            Self::WifiScan => "WiFi_SCAN",
            Self::FirmwareUpdate => "OTA",
        }
    }
}

impl fmt::Display for GuardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
// }}}

#[derive(Clone, Debug)]
struct Holder {
    kind: GuardKind,
    reason: String,
    since: Instant,
    id: u64,
}

/// Snapshot of the current holder, for logging and status.
#[derive(Clone, Debug)]
pub struct ActiveOperation {
    pub kind: GuardKind,
    pub reason: String,
    pub since: Instant,
}

// {{{ GuardArbiter
/// Process-wide arbiter: at most one [`OperationGuard`] exists at any time.
///
/// Acquisition never waits. A refusal means "try later".
#[derive(Debug, Default)]
pub struct GuardArbiter {
    holder: Mutex<Option<Holder>>,
    next_id: Mutex<u64>,
}

impl GuardArbiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn holder(&self) -> MutexGuard<'_, Option<Holder>> {
        self.holder.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn try_acquire(
        self: &Arc<Self>,
        kind: GuardKind,
        reason: impl Into<String>,
    ) -> Option<OperationGuard> {
        let reason = reason.into();
        let mut holder = self.holder();

        if let Some(current) = holder.as_ref() {
            debug!(
                "guard {} ({}) refused: {} ({}) active for {}ms",
                kind,
                reason,
                current.kind,
                current.reason,
                current.since.elapsed().as_millis()
            );
            return None;
        }

        let id = {
            let mut next = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
            *next += 1;
            *next
        };

        trace!("guard {} acquired: {}", kind, reason);
        *holder = Some(Holder {
            kind,
            reason,
            since: Instant::now(),
            id,
        });

        Some(OperationGuard {
            arbiter: Arc::clone(self),
            kind,
            id,
            released: false,
        })
    }

    /// True when nothing is held or `kind` itself is the holder.
    pub fn can_perform(&self, kind: GuardKind) -> bool {
        match self.holder().as_ref() {
            None => true,
            Some(current) => current.kind == kind,
        }
    }

    pub fn is_held(&self) -> bool {
        self.holder().is_some()
    }

    pub fn active(&self) -> Option<ActiveOperation> {
        self.holder().as_ref().map(|h| ActiveOperation {
            kind: h.kind,
            reason: h.reason.clone(),
            since: h.since,
        })
    }

    fn release(&self, id: u64) {
        let mut holder = self.holder();
        match holder.as_ref() {
            Some(current) if current.id == id => {
                trace!(
                    "guard {} released after {}ms",
                    current.kind,
                    current.since.elapsed().as_millis()
                );
                *holder = None;
            }
            _ => {}
        }
    }
}
// }}}

// {{{ OperationGuard
/// Token for an acquired operation. Dropping it releases the arbiter.
pub struct OperationGuard {
    arbiter: Arc<GuardArbiter>,
    kind: GuardKind,
    id: u64,
    released: bool,
}

impl OperationGuard {
    pub fn kind(&self) -> GuardKind {
        self.kind
    }

    /// Safe to call more than once; only the first call has an effect.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.arbiter.release(self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        !self.released
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for OperationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationGuard")
            .field("kind", &self.kind)
            .field("active", &!self.released)
            .finish()
    }
}
// }}}
