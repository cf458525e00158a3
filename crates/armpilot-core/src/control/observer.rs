//! Optional, non-blocking observation tap for displays and recorders

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::policy::Observation;

/// Receives every observation the loop sends to the policy
///
/// Implementations must return promptly; they run on the control thread.
pub trait ObservationObserver: Send {
    fn observe(&mut self, tick: u64, observation: &Observation);
}

/// One observation as delivered to a [`ChannelObserver`] consumer
#[derive(Debug, Clone)]
pub struct ObservedTick {
    pub tick: u64,
    pub observation: Observation,
}

/// Forwards observations over a bounded channel, dropping when full
#[derive(Debug)]
pub struct ChannelObserver {
    tx: Sender<ObservedTick>,
    dropped: Arc<AtomicU64>,
}

impl ChannelObserver {
    /// Create the observer and the consumer end
    pub fn bounded(capacity: usize) -> (Self, Receiver<ObservedTick>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Shared counter of frames dropped because the consumer lagged
    pub fn dropped(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }
}

impl ObservationObserver for ChannelObserver {
    fn observe(&mut self, tick: u64, observation: &Observation) {
        let msg = ObservedTick {
            tick,
            observation: observation.clone(),
        };
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::trace!("Observer consumer gone; dropping tick {}", tick);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_channel_drops_instead_of_blocking() {
        let (mut observer, rx) = ChannelObserver::bounded(2);
        let dropped = observer.dropped();
        let obs = Observation::new([0.0; 7], "watch");

        for tick in 0..5 {
            observer.observe(tick, &obs);
        }
        assert_eq!(dropped.load(Ordering::Relaxed), 3);
        assert_eq!(rx.try_recv().unwrap().tick, 0);
        assert_eq!(rx.try_recv().unwrap().tick, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disconnected_consumer_is_harmless() {
        let (mut observer, rx) = ChannelObserver::bounded(1);
        drop(rx);
        observer.observe(0, &Observation::new([0.0; 7], "x"));
        assert_eq!(observer.dropped().load(Ordering::Relaxed), 0);
    }
}
