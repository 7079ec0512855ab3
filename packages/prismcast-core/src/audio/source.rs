//! Audio source entities.
//!
//! An audio source wraps a host-provided capture implementation. The entity
//! parses the common keys (`volume`, `master`), owns the object state and
//! the mixer-facing accounting (`mix_pos`), and hands the implementation an
//! [`AudioSourceLink`] for delivering buffers from its capture threads.

use std::sync::{Arc, Weak};

use crate::audio::mixer::AudioMixer;
use crate::bus::{BusSender, Notification};
use crate::config::Config;
use crate::lock_order::{OrderedGuard, OrderedMutex, RANK_ELEMENT};
use crate::object::{
    plan, CurrentState, DriveAction, Entity, Flags, ObjectCore, ObjectRef, ObjectState, StateCell,
    TargetState,
};
use crate::plugin::{apply_config_status, apply_start, apply_stop, AudioSource, ConfigStatus};
use crate::timebase::Ticks;

/// Handle for audio source implementations: buffer delivery plus the
/// asynchronous transition announcements.
#[derive(Clone)]
pub struct AudioSourceLink {
    entity: Weak<AudioSourceHandle>,
    mixer: Weak<AudioMixer>,
}

impl AudioSourceLink {
    /// Delivers interleaved f32 samples captured at host time `time`.
    ///
    /// Callable from any thread. Buffers are dropped unless the source, the
    /// audio mixer and the connection are all running.
    pub fn push(&self, time: Ticks, samples: &[f32]) {
        let (Some(entity), Some(mixer)) = (self.entity.upgrade(), self.mixer.upgrade()) else {
            return;
        };
        if entity.state().current != CurrentState::Running {
            return;
        }
        mixer.buffer(&entity, time, samples);
    }

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

pub(crate) struct AudioSourceInner {
    pub(crate) state: StateCell,
    /// Gain applied while mixing, in [0, 1].
    pub(crate) volume: f32,
    /// The master source anchors the mix buffer's time base.
    pub(crate) master: bool,
    /// Interleaved samples already written into the mix buffer for this
    /// source since the buffer's base time. Guarded by this lock but only
    /// ever touched on the mixer's write/drain paths.
    pub(crate) mix_pos: usize,
    imp: Box<dyn AudioSource>,
}

/// An audio source registered with the context.
pub struct AudioSourceHandle {
    core: ObjectCore,
    weak: Weak<AudioSourceHandle>,
    mixer: Weak<AudioMixer>,
    inner: OrderedMutex<AudioSourceInner>,
}

impl AudioSourceHandle {
    pub(crate) fn new(
        bus: BusSender,
        mixer: Weak<AudioMixer>,
        imp: Box<dyn AudioSource>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            core: ObjectCore::new(crate::ObjectKind::AudioSource, bus),
            weak: weak.clone(),
            mixer,
            inner: OrderedMutex::new(
                RANK_ELEMENT,
                AudioSourceInner {
                    state: StateCell::with_flags(Flags::CAN_START),
                    volume: 1.0,
                    master: false,
                    mix_pos: 0,
                    imp,
                },
            ),
        })
    }

    pub fn core(&self) -> &ObjectCore {
        &self.core
    }

    /// Reads the common keys, then the implementation's own. A volume
    /// outside [0, 1] invalidates the configuration.
    pub fn configure(&self, cfg: &dyn Config) {
        let mut inner = self.inner.lock();

        let volume = cfg.get_float("volume").unwrap_or(1.0);
        let master = cfg.get_bool("master").unwrap_or(false);

        let status = if !(0.0..=1.0).contains(&volume) {
            log::error!("[Audio] Source volume {volume} out of range");
            ConfigStatus::Invalid
        } else {
            inner.volume = volume;
            inner.master = master;
            inner.imp.configure(cfg)
        };

        let AudioSourceInner { state, .. } = &mut *inner;
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

    /// Current volume and master flag, mainly for host display.
    pub fn mix_params(&self) -> (f32, bool) {
        let inner = self.inner.lock();
        (inner.volume, inner.master)
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

    /// Mixer-side access to the mixing accounting. Always taken with the
    /// mixer lock already held (container before element).
    pub(crate) fn lock_mix(&self) -> OrderedGuard<'_, AudioSourceInner> {
        self.inner.lock()
    }

    /// Builds the link handed to the implementation.
    pub(crate) fn link(&self) -> AudioSourceLink {
        AudioSourceLink {
            entity: self.weak.clone(),
            mixer: self.mixer.clone(),
        }
    }
}

impl Entity for AudioSourceHandle {
    fn object_ref(&self) -> ObjectRef {
        self.core.object_ref()
    }

    fn state(&self) -> ObjectState {
        AudioSourceHandle::state(self)
    }

    fn set_target(&self, target: TargetState) {
        AudioSourceHandle::set_target(self, target)
    }

    fn resync(&self) {
        AudioSourceHandle::resync(self)
    }

    fn deliver(&self, n: &Notification) {
        let mut inner = self.inner.lock();
        let can_start = inner.imp.peer_changed(n);
        let AudioSourceInner { state, .. } = &mut *inner;
        state.set_flag(Flags::CAN_START, can_start);
        state.publish(&self.core);
    }

    fn drive(&self) {
        let link = self.link();
        let mut inner = self.inner.lock();
        match plan(&inner.state.state()) {
            DriveAction::Start => {
                // A fresh session starts with nothing in the mix buffer.
                inner.mix_pos = 0;
                let AudioSourceInner { state, imp, .. } = &mut *inner;
                let disposition = imp.start(link);
                apply_start(state, &self.core, disposition);
            }
            DriveAction::Stop => {
                let AudioSourceInner { state, imp, .. } = &mut *inner;
                let disposition = imp.stop();
                apply_stop(state, &self.core, disposition);
            }
            DriveAction::FlipRestart => inner.state.set_target(&self.core, TargetState::Running),
            DriveAction::None => {}
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A synchronous scriptable source for mixer and context tests.

    use super::*;
    use crate::plugin::{StartDisposition, StopDisposition};
    use parking_lot::Mutex;

    /// Starts synchronously and exposes its link so tests push buffers
    /// directly from the test thread.
    #[derive(Default)]
    pub struct ScriptedAudioSource {
        pub link: Arc<Mutex<Option<AudioSourceLink>>>,
    }

    impl ScriptedAudioSource {
        pub fn new() -> (Self, Arc<Mutex<Option<AudioSourceLink>>>) {
            let link = Arc::new(Mutex::new(None));
            (
                Self {
                    link: Arc::clone(&link),
                },
                link,
            )
        }
    }

    impl AudioSource for ScriptedAudioSource {
        fn start(&mut self, link: AudioSourceLink) -> StartDisposition {
            *self.link.lock() = Some(link);
            StartDisposition::Running
        }

        fn stop(&mut self) -> StopDisposition {
            *self.link.lock() = None;
            StopDisposition::Idle
        }
    }
}
