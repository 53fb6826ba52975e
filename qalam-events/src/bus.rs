//! Process-wide signal bus for independent cache instances.

use qalam_core::{CacheConfig, CacheSignal};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Broadcast channel carrying [`CacheSignal`]s between cache instances.
///
/// Cloning the bus shares the underlying channel. Emitting never fails: with
/// no listeners the signal is simply dropped, and a listener whose buffer is
/// full misses the oldest signals (it keeps running).
#[derive(Clone)]
pub struct SignalBus {
    tx: broadcast::Sender<CacheSignal>,
}

impl SignalBus {
    /// Create a bus buffering up to `capacity` signals per listener.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.signal_capacity)
    }

    /// Publish a signal. Returns how many listeners received it.
    pub fn emit(&self, signal: CacheSignal) -> usize {
        let subject = signal.subject_id.clone();
        let kind = signal.kind;
        match self.tx.send(signal) {
            Ok(receivers) => {
                debug!(subject = %subject, kind = %kind, receivers, "Emitted cache signal");
                receivers
            }
            Err(_) => {
                debug!(subject = %subject, kind = %kind, "No listeners for cache signal");
                0
            }
        }
    }

    /// Listen for signals emitted from now on.
    pub fn subscribe(&self) -> SignalReceiver {
        SignalReceiver {
            rx: self.tx.subscribe(),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

/// Receiving side of a [`SignalBus`].
pub struct SignalReceiver {
    rx: broadcast::Receiver<CacheSignal>,
}

impl SignalReceiver {
    /// Next signal, or `None` once every bus handle is gone.
    ///
    /// Lagged gaps are skipped: a missed signal only delays a refresh until
    /// the entry's TTL runs out.
    pub async fn recv(&mut self) -> Option<CacheSignal> {
        loop {
            match self.rx.recv().await {
                Ok(signal) => return Some(signal),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Signal listener lagged, some signals were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
