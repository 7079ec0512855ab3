//! Video source entities.
//!
//! A video source wraps a host-provided frame producer. The entity parses
//! the placement keys, owns the object state, and tracks the one
//! prerequisite every video source shares: the video mixer must be running
//! before a source can start. That prerequisite is learned from mixer
//! notifications rather than by peeking at the mixer under its lock, which
//! keeps acquisitions container-first.

use std::sync::{Arc, Weak};

use crate::bus::{BusSender, Notification};
use crate::config::Config;
use crate::lock_order::{OrderedMutex, RANK_ELEMENT};
use crate::object::{
    plan, CurrentState, DriveAction, Entity, Flags, ObjectCore, ObjectRef, ObjectState, StateCell,
    TargetState,
};
use crate::plugin::{apply_config_status, apply_start, apply_stop, VideoSource};

/// Destination and crop rectangles for composition.
///
/// `x1,y1`–`x2,y2` place the frame in the output image in [-1, +1]
/// coordinates; `u1,v1`–`u2,v2` select the area of the frame to sample in
/// [0, 1] coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub u1: f32,
    pub v1: f32,
    pub u2: f32,
    pub v2: f32,
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            x1: -1.0,
            y1: -1.0,
            x2: 1.0,
            y2: 1.0,
            u1: 0.0,
            v1: 0.0,
            u2: 1.0,
            v2: 1.0,
        }
    }
}

impl Placement {
    /// The four-vertex triangle strip drawn for this source, interleaved as
    /// position/texcoord pairs.
    pub(crate) fn quad(&self) -> [f32; 16] {
        [
            self.x1, self.y1, self.u1, self.v1, //
            self.x1, self.y2, self.u1, self.v2, //
            self.x2, self.y1, self.u2, self.v1, //
            self.x2, self.y2, self.u2, self.v2, //
        ]
    }
}

/// Handle for video source implementations to complete transitions from
/// their own threads. Frames themselves are pulled by the mixer on the
/// clock thread, never pushed.
#[derive(Clone)]
pub struct VideoSourceLink {
    entity: Weak<VideoSourceHandle>,
}

impl VideoSourceLink {
    /// Confirms a pending start.
    pub fn announce_running(&self) {
        if let Some(entity) = self.entity.upgrade() {
            entity.announce_running();
        }
    }

    /// Announces the source idle, optionally because of a failure.
    pub fn announce_idle(&self, error: bool) {
        if let Some(entity) = self.entity.upgrade() {
            entity.announce_idle(error);
        }
    }

    /// Snapshot of the source's state, for capture-loop checks.
    pub fn snapshot(&self) -> Option<ObjectState> {
        self.entity.upgrade().map(|entity| entity.state())
    }
}

pub(crate) struct VideoSourceInner {
    pub(crate) state: StateCell,
    pub(crate) placement: Placement,
    mixer_running: bool,
    imp: Box<dyn VideoSource>,
}

/// A video source registered with the context.
pub struct VideoSourceHandle {
    core: ObjectCore,
    weak: Weak<VideoSourceHandle>,
    inner: OrderedMutex<VideoSourceInner>,
}

impl VideoSourceHandle {
    pub(crate) fn new(bus: BusSender, mixer_running: bool, imp: Box<dyn VideoSource>) -> Arc<Self> {
        let mut flags = Flags::empty();
        if mixer_running {
            flags.insert(Flags::CAN_START);
        }
        Arc::new_cyclic(|weak| Self {
            core: ObjectCore::new(crate::ObjectKind::VideoSource, bus),
            weak: weak.clone(),
            inner: OrderedMutex::new(
                RANK_ELEMENT,
                VideoSourceInner {
                    state: StateCell::with_flags(flags),
                    placement: Placement::default(),
                    mixer_running,
                    imp,
                },
            ),
        })
    }

    pub fn core(&self) -> &ObjectCore {
        &self.core
    }

    /// Reads the placement keys, then the implementation's own.
    pub fn configure(&self, cfg: &dyn Config) {
        let mut inner = self.inner.lock();

        inner.placement = Placement {
            x1: cfg.get_float("x1").unwrap_or(-1.0),
            y1: cfg.get_float("y1").unwrap_or(-1.0),
            x2: cfg.get_float("x2").unwrap_or(1.0),
            y2: cfg.get_float("y2").unwrap_or(1.0),
            u1: cfg.get_float("u1").unwrap_or(0.0),
            v1: cfg.get_float("v1").unwrap_or(0.0),
            u2: cfg.get_float("u2").unwrap_or(1.0),
            v2: cfg.get_float("v2").unwrap_or(1.0),
        };

        let status = inner.imp.configure(cfg);
        let VideoSourceInner { state, .. } = &mut *inner;
        apply_config_status(state, &self.core, status);
    }

    pub fn set_target(&self, target: TargetState) {
        let mut inner = self.inner.lock();
        inner.state.set_target(&self.core, target);
    }

    pub fn state(&self) -> ObjectState {
        self.inner.lock().state.state()
    }

    pub fn resync(&self) {
        let mut inner = self.inner.lock();
        inner.state.resync(&self.core);
    }

    pub fn placement(&self) -> Placement {
        self.inner.lock().placement
    }

    fn announce_running(&self) {
        let mut inner = self.inner.lock();
        if inner.state.state().current == CurrentState::Starting {
            inner.state.set_current(CurrentState::Running);
            inner.state.publish(&self.core);
        }
    }

    fn announce_idle(&self, error: bool) {
        let mut inner = self.inner.lock();
        if error {
            inner.state.fail_idle(&self.core);
        } else {
            inner.state.set_current(CurrentState::Idle);
            inner.state.publish(&self.core);
        }
    }

    /// Mixer-side access for the tick: runs `f` against the placement and
    /// implementation iff the source is running. Taken with the mixer lock
    /// already held (container before element).
    pub(crate) fn with_running<R>(
        &self,
        f: impl FnOnce(&Placement, &mut dyn VideoSource) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.lock();
        if inner.state.state().current != CurrentState::Running {
            return None;
        }
        let VideoSourceInner { placement, imp, .. } = &mut *inner;
        Some(f(placement, imp.as_mut()))
    }
}

impl Entity for VideoSourceHandle {
    fn object_ref(&self) -> ObjectRef {
        self.core.object_ref()
    }

    fn state(&self) -> ObjectState {
        VideoSourceHandle::state(self)
    }

    fn set_target(&self, target: TargetState) {
        VideoSourceHandle::set_target(self, target)
    }

    fn resync(&self) {
        VideoSourceHandle::resync(self)
    }

    fn deliver(&self, n: &Notification) {
        let mut inner = self.inner.lock();
        if n.object.kind == crate::ObjectKind::VideoMixer {
            inner.mixer_running = n.state.current == CurrentState::Running;
        }
        let hook = inner.imp.peer_changed(n);
        let can_start = inner.mixer_running && hook;
        let VideoSourceInner { state, .. } = &mut *inner;
        state.set_flag(Flags::CAN_START, can_start);
        state.publish(&self.core);
    }

    fn drive(&self) {
        let link = VideoSourceLink {
            entity: self.weak.clone(),
        };
        let mut inner = self.inner.lock();
        match plan(&inner.state.state()) {
            DriveAction::Start => {
                let VideoSourceInner { state, imp, .. } = &mut *inner;
                let disposition = imp.start(link);
                apply_start(state, &self.core, disposition);
            }
            DriveAction::Stop => {
                let VideoSourceInner { state, imp, .. } = &mut *inner;
                let disposition = imp.stop();
                apply_stop(state, &self.core, disposition);
            }
            DriveAction::FlipRestart => inner.state.set_target(&self.core, TargetState::Running),
            DriveAction::None => {}
        }
    }
}
