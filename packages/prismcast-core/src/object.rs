//! Object state machine.
//!
//! Every live entity in a context carries the same state record: a current
//! state the object alone may advance, a target state any thread may request,
//! and a small flag set gating startability. State writes happen under the
//! object's single mutex and are followed by a publish through the
//! notification bus; the control thread reacts and drives each object toward
//! its target.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::bus::{BusSender, Notification};

/// Unique per-context object identity. Monotonic, never reused.
pub type ObjectId = u64;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// The state an object is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CurrentState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// The state an object should be driven toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    Running,
    Idle,
    /// Semantically idle, flipping to [`TargetState::Running`] once the
    /// object is observed idle.
    Restart,
}

/// Additional state bits.
///
/// `RESYNC` is one-shot: it forces a notification for an otherwise unchanged
/// state and is cleared at publish time. `NEEDS_RESTART` marks configuration
/// that only takes effect after a stop/start cycle and auto-clears when the
/// object returns to idle. `CONFIG_VALID`, `CAN_START` and `ERROR` gate the
/// start call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct Flags(u8);

impl Flags {
    pub const RESYNC: Flags = Flags(1 << 0);
    pub const NEEDS_RESTART: Flags = Flags(1 << 1);
    pub const CONFIG_VALID: Flags = Flags(1 << 2);
    pub const CAN_START: Flags = Flags(1 << 3);
    pub const ERROR: Flags = Flags(1 << 4);

    /// The empty flag set.
    pub const fn empty() -> Flags {
        Flags(0)
    }

    /// Returns true if every bit of `other` is set in `self`.
    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns a copy with the bits of `other` set.
    pub const fn with(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }

    /// Returns a copy with the bits of `other` cleared.
    pub const fn without(self, other: Flags) -> Flags {
        Flags(self.0 & !other.0)
    }

    /// Sets the bits of `other` in place.
    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    /// Clears the bits of `other` in place.
    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }

    /// Sets or clears `other` depending on `on`.
    pub fn set(&mut self, other: Flags, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

/// Basic type of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Context,
    VideoMixer,
    AudioMixer,
    Connection,
    VideoClock,
    VideoSource,
    AudioSource,
}

/// Complete object state: current, target and flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ObjectState {
    pub current: CurrentState,
    pub target: TargetState,
    pub flags: Flags,
}

impl Default for ObjectState {
    fn default() -> Self {
        Self {
            current: CurrentState::Idle,
            target: TargetState::Running,
            flags: Flags::empty(),
        }
    }
}

impl ObjectState {
    /// The start gate: idle, aiming for running, with a valid configuration,
    /// satisfied prerequisites and no standing error.
    pub fn can_start(&self) -> bool {
        self.current == CurrentState::Idle
            && self.target == TargetState::Running
            && self.flags.contains(Flags::CONFIG_VALID)
            && self.flags.contains(Flags::CAN_START)
            && !self.flags.contains(Flags::ERROR)
    }
}

/// Cheap object identity carried in notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ObjectRef {
    pub id: ObjectId,
    pub kind: ObjectKind,
}

/// Shared, lock-free portion of every object: identity, the bus sender and
/// the host's opaque data slot.
pub struct ObjectCore {
    id: ObjectId,
    kind: ObjectKind,
    bus: BusSender,
    user_data: Mutex<Option<Box<dyn Any + Send>>>,
}

impl ObjectCore {
    pub(crate) fn new(kind: ObjectKind, bus: BusSender) -> Self {
        Self {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            bus,
            user_data: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            id: self.id,
            kind: self.kind,
        }
    }

    /// Attaches host data to this object, returning the previous value.
    pub fn set_user_data(&self, data: Option<Box<dyn Any + Send>>) -> Option<Box<dyn Any + Send>> {
        std::mem::replace(&mut self.user_data.lock(), data)
    }

    /// Runs `f` with a reference to the attached host data, if any.
    pub fn with_user_data<R>(&self, f: impl FnOnce(Option<&(dyn Any + Send)>) -> R) -> R {
        let slot = self.user_data.lock();
        f(slot.as_deref())
    }

    fn publish_raw(&self, state: ObjectState, last_state: ObjectState) {
        self.bus.publish(Notification {
            object: self.object_ref(),
            state,
            last_state,
        });
    }
}

/// The mutable state record each entity keeps inside its own mutex.
///
/// `publish` collapses identical consecutive observations: a notification
/// goes out only when the snapshot differs from the last published state or
/// the one-shot resync bit is set.
pub(crate) struct StateCell {
    state: ObjectState,
    last: ObjectState,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            state: ObjectState::default(),
            last: ObjectState::default(),
        }
    }

    /// Creates a cell with flags pre-seeded and no pending notification,
    /// used by fixed elements that are valid from construction.
    pub(crate) fn with_flags(flags: Flags) -> Self {
        let state = ObjectState {
            flags,
            ..ObjectState::default()
        };
        Self { state, last: state }
    }

    pub(crate) fn state(&self) -> ObjectState {
        self.state
    }

    /// Publishes the current state if it changed or a resync is pending.
    ///
    /// The published snapshot carries the resync bit so consumers can tell a
    /// forced notification apart; the stored state has it cleared.
    pub(crate) fn publish(&mut self, core: &ObjectCore) {
        let snapshot = self.state;
        if !snapshot.flags.contains(Flags::RESYNC) && snapshot == self.last {
            return;
        }
        self.state.flags.remove(Flags::RESYNC);
        core.publish_raw(snapshot, self.last);
        self.last = self.state;
    }

    /// Advances the current state. Returning to idle drops the
    /// restart-pending marker.
    pub(crate) fn set_current(&mut self, current: CurrentState) {
        self.state.current = current;
        if current == CurrentState::Idle {
            self.state.flags.remove(Flags::NEEDS_RESTART);
        }
    }

    /// Requests a target state and publishes. A running target clears the
    /// error flag unconditionally, which is also the host's acknowledgement
    /// path after a failure.
    pub(crate) fn set_target(&mut self, core: &ObjectCore, target: TargetState) {
        self.state.target = target;
        if target == TargetState::Running {
            self.state.flags.remove(Flags::ERROR);
        }
        self.publish(core);
    }

    /// Forces a notification without a state change.
    pub(crate) fn resync(&mut self, core: &ObjectCore) {
        self.state.flags.insert(Flags::RESYNC);
        self.publish(core);
    }

    pub(crate) fn set_flag(&mut self, flag: Flags, on: bool) {
        self.state.flags.set(flag, on);
    }

    /// Involuntary transition to idle: the session died. Start stays
    /// inhibited until the host re-targets running.
    pub(crate) fn fail_idle(&mut self, core: &ObjectCore) {
        self.set_current(CurrentState::Idle);
        self.state.flags.insert(Flags::ERROR);
        self.publish(core);
    }
}

/// What the control loop should do with an object, given its state.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DriveAction {
    Start,
    Stop,
    /// Idle with a restart target: flip the target back to running.
    FlipRestart,
    None,
}

/// Pure transition planning for the control loop.
pub(crate) fn plan(state: &ObjectState) -> DriveAction {
    match state.current {
        CurrentState::Idle => match state.target {
            TargetState::Restart => DriveAction::FlipRestart,
            TargetState::Running if state.can_start() => DriveAction::Start,
            _ => DriveAction::None,
        },
        CurrentState::Running => match state.target {
            TargetState::Idle | TargetState::Restart => DriveAction::Stop,
            TargetState::Running if state.flags.contains(Flags::NEEDS_RESTART) => DriveAction::Stop,
            TargetState::Running => DriveAction::None,
        },
        _ => DriveAction::None,
    }
}

/// Uniform entity access used by the control loop and the context registry.
pub(crate) trait Entity: Send + Sync {
    fn object_ref(&self) -> ObjectRef;
    fn state(&self) -> ObjectState;
    fn set_target(&self, target: TargetState);
    fn resync(&self);
    /// A peer changed state; recompute prerequisites and react.
    fn deliver(&self, n: &Notification);
    /// Drive the object one step toward its target.
    fn drive(&self);
}
