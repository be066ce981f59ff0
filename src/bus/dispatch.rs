use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, warn};

use super::listeners::{ListenerFn, ListenerId};
use crate::message::{Endpoint, Message};

/// What became of one delivery handed to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The lane was full and the delivery was discarded.
    Overflowed,
    /// The listener was unregistered before its lane could be opened.
    ListenerGone,
}

/// Fire-and-forget fan-out through bounded delivery lanes.
///
/// Every (destination, listener) pair gets its own queue and worker task, so
/// deliveries to one destination arrive in publish order while a slow or hung
/// listener only ever holds up its own lane. Enqueueing never waits: when a
/// lane is full the delivery is discarded.
pub struct Dispatcher {
    lane_capacity: usize,
    lanes: DashMap<(Endpoint, ListenerId), mpsc::Sender<Arc<Message>>>,
}

impl Dispatcher {
    pub fn new(lane_capacity: usize) -> Self {
        Self {
            lane_capacity: lane_capacity.max(1),
            lanes: DashMap::new(),
        }
    }

    /// Queue `message` for one listener at `destination`.
    ///
    /// `still_registered` is consulted before a new lane is opened, while the
    /// lane slot is locked, so a listener removed concurrently never gets a
    /// fresh lane.
    pub fn dispatch<F>(
        &self,
        destination: &Endpoint,
        listener_id: ListenerId,
        listener: &ListenerFn,
        message: &Arc<Message>,
        still_registered: F,
    ) -> Delivery
    where
        F: Fn() -> bool,
    {
        let key = (destination.clone(), listener_id);
        let sender = match self.lanes.entry(key.clone()) {
            Entry::Occupied(lane) => lane.get().clone(),
            Entry::Vacant(slot) => {
                if !still_registered() {
                    return Delivery::ListenerGone;
                }
                slot.insert(self.open_lane(destination, listener))
                    .value()
                    .clone()
            }
        };

        match sender.try_send(Arc::clone(message)) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Delivery lane to {} is full, dropping message from {}",
                    destination, message.source
                );
                Delivery::Overflowed
            }
            Err(TrySendError::Closed(message)) => {
                // worker is gone (runtime shutting down); reopen once
                if !still_registered() {
                    self.lanes.remove(&key);
                    return Delivery::ListenerGone;
                }
                let sender = self.open_lane(destination, listener);
                let queued = sender.try_send(message).is_ok();
                self.lanes.insert(key, sender);
                if queued {
                    Delivery::Queued
                } else {
                    Delivery::Overflowed
                }
            }
        }
    }

    fn open_lane(&self, destination: &Endpoint, listener: &ListenerFn) -> mpsc::Sender<Arc<Message>> {
        let (tx, rx) = mpsc::channel(self.lane_capacity);
        tokio::spawn(run_lane(destination.clone(), Arc::clone(listener), rx));
        debug!("Opened delivery lane to {}", destination);
        tx
    }

    /// Close every lane feeding this listener. Already-queued deliveries still
    /// run; the workers exit once drained.
    pub fn close_listener(&self, listener_id: ListenerId) {
        self.lanes.retain(|(_, id), _| *id != listener_id);
    }

    /// Close lanes whose destination fails `keep`. Queued deliveries still
    /// run before the workers exit. Returns how many lanes were closed.
    pub fn retain_destinations<F>(&self, keep: F) -> usize
    where
        F: Fn(&Endpoint) -> bool,
    {
        let before = self.lanes.len();
        self.lanes.retain(|(destination, _), _| keep(destination));
        let closed = before.saturating_sub(self.lanes.len());
        if closed > 0 {
            debug!("Closed {} delivery lanes to unlinked destinations", closed);
        }
        closed
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }
}

async fn run_lane(
    destination: Endpoint,
    listener: ListenerFn,
    mut rx: mpsc::Receiver<Arc<Message>>,
) {
    while let Some(message) = rx.recv().await {
        let source = message.source.clone();
        let channel = destination.channel.clone();
        let call = async { listener(channel, message).await };
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => debug!("Delivered message from {} to {}", source, destination),
            Ok(Err(e)) => error!(
                "Listener failed delivering message from {} to {}: {:#}",
                source, destination, e
            ),
            Err(_) => error!(
                "Listener panicked delivering message from {} to {}",
                source, destination
            ),
        }
    }
    debug!("Delivery lane to {} closed", destination);
}
