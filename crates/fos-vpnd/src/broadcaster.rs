//! Event fan-out
//!
//! One bounded channel per subscriber, fed only by the control loop. A
//! subscriber that falls `buffer` events behind is disconnected rather than
//! silently missing events; its stream simply ends.

use fos_vpn::events::DaemonEvent;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub type EventStream = mpsc::Receiver<DaemonEvent>;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<DaemonEvent>,
}

pub struct EventBroadcaster {
    subscribers: Vec<Subscriber>,
    buffer: usize,
    next_id: u64,
}

impl EventBroadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Vec::new(),
            buffer: buffer.max(1),
            next_id: 0,
        }
    }

    /// New subscriber; it only sees events published from now on
    pub fn subscribe(&mut self) -> EventStream {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push(Subscriber { id, tx });
        info!("Subscriber {} connected ({} total)", id, self.subscribers.len());
        rx
    }

    pub fn publish(&mut self, event: DaemonEvent) {
        debug!("Publishing {} event", event.name());
        self.subscribers.retain(|subscriber| {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Subscriber {} is too slow, disconnecting", subscriber.id);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    info!("Subscriber {} disconnected", subscriber.id);
                    false
                }
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
