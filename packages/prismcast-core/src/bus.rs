//! Notification bus.
//!
//! State changes fan in from any thread and fan out to two consumers with
//! different delivery guarantees:
//!
//! - The control thread reads from an unbounded channel. The pipeline always
//!   prefers its own progress; publish collapse in the object layer bounds
//!   steady-state traffic.
//! - The host subscribes to a bounded broadcast stream. A host that stops
//!   reading observes a lag marker and misses old notifications; it never
//!   stalls the pipeline. Hosts recover by re-reading current state from the
//!   object handles.
//!
//! Delivery is reliable and ordered per object; interleaving across objects
//! is arbitrary.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::object::{ObjectRef, ObjectState};

/// A single state-change event.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Notification {
    /// Object that changed state.
    pub object: ObjectRef,
    /// Current (new) state.
    pub state: ObjectState,
    /// State at the previous notification.
    pub last_state: ObjectState,
}

/// Cloneable producer half handed to every object core.
#[derive(Clone)]
pub(crate) struct BusSender {
    control: crossbeam_channel::Sender<Notification>,
    host: broadcast::Sender<Notification>,
}

impl BusSender {
    /// Publishes to both consumers. Never blocks: the control channel is
    /// unbounded and broadcast drops the oldest entries on overflow.
    pub(crate) fn publish(&self, n: Notification) {
        // Send errors mean the consumer side is gone, which only happens
        // during context teardown.
        let _ = self.control.send(n);
        let _ = self.host.send(n);
    }
}

/// The bus endpoints owned by the context.
pub(crate) struct Bus {
    control_tx: crossbeam_channel::Sender<Notification>,
    control_rx: crossbeam_channel::Receiver<Notification>,
    host: broadcast::Sender<Notification>,
}

impl Bus {
    pub(crate) fn new(host_capacity: usize) -> Self {
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let (host, _) = broadcast::channel(host_capacity);
        Self {
            control_tx,
            control_rx,
            host,
        }
    }

    pub(crate) fn sender(&self) -> BusSender {
        BusSender {
            control: self.control_tx.clone(),
            host: self.host.clone(),
        }
    }

    /// Control-thread receiver. Crossbeam channels are multi-consumer, so
    /// the handle can be cloned into each control-thread incarnation.
    pub(crate) fn control_receiver(&self) -> crossbeam_channel::Receiver<Notification> {
        self.control_rx.clone()
    }

    /// Opens a host subscription.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.host.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn try_recv_control(&self) -> Option<Notification> {
        self.control_rx.try_recv().ok()
    }
}
