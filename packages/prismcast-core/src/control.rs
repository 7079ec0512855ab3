//! The control thread.
//!
//! A single thread owns all lifecycle decisions: it consumes notifications,
//! fans each one out to the other entities (prerequisite recomputation,
//! mixer linkage bookkeeping), and drives the originating object toward its
//! target. It performs no blocking I/O; the only long operations permitted
//! here are session setup and teardown, which the GPU and encoder layers
//! keep bounded.

use std::sync::Weak;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::bus::Notification;
use crate::context::Context;

/// Poll interval for detecting an abandoned context when no notifications
/// are flowing.
const IDLE_POLL: Duration = Duration::from_secs(1);

pub(crate) fn run(ctx: Weak<Context>, rx: Receiver<Notification>) {
    tracing::debug!("control thread started");

    loop {
        match rx.recv_timeout(IDLE_POLL) {
            Ok(n) => {
                let Some(ctx) = ctx.upgrade() else {
                    break;
                };
                ctx.dispatch(&n);
                if ctx.finish_stop_if_idle() {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if ctx.upgrade().is_none() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    tracing::debug!("control thread exiting");
}
