//! The fixed connection element.
//!
//! The connection consumes the encoded output of both mixers. Its concrete
//! implementation (an RTMP muxer, a file writer, a test recorder) is
//! installed by the host while the element is idle; the entity here owns the
//! state machine and gates the data path on the running state, so mixers can
//! hand off without re-checking a peer they do not lock.

use std::sync::{Arc, Weak};

use crate::bus::{BusSender, Notification};
use crate::config::Config;
use crate::lock_order::{OrderedMutex, RANK_ELEMENT};
use crate::object::{
    plan, CurrentState, DriveAction, Entity, Flags, ObjectCore, ObjectRef, ObjectState, StateCell,
    TargetState,
};
use crate::plugin::{apply_config_status, apply_start, apply_stop, ConfigStatus, Connection};
use crate::timebase::Ticks;
use crate::video::mixer::Picture;
use crate::PipelineError;

/// Stream parameters delivered through [`Connection::video_config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
}

/// Handle for asynchronous connection implementations to complete
/// transitions from their own threads.
#[derive(Clone)]
pub struct ConnectionLink {
    entity: Weak<ConnectionHandle>,
}

impl ConnectionLink {
    /// Confirms a pending start.
    pub fn announce_running(&self) {
        if let Some(entity) = self.entity.upgrade() {
            entity.announce_running();
        }
    }

    /// Announces the connection idle, optionally because of a failure.
    pub fn announce_idle(&self, error: bool) {
        if let Some(entity) = self.entity.upgrade() {
            entity.announce_idle(error);
        }
    }

    /// Snapshot of the connection's state, for worker-loop checks.
    pub fn snapshot(&self) -> Option<ObjectState> {
        self.entity.upgrade().map(|entity| entity.state())
    }
}

struct ConnectionInner {
    state: StateCell,
    imp: Option<Box<dyn Connection>>,
}

/// The connection element: object state plus the installed implementation.
pub struct ConnectionHandle {
    core: ObjectCore,
    weak: Weak<ConnectionHandle>,
    inner: OrderedMutex<ConnectionInner>,
}

impl ConnectionHandle {
    pub(crate) fn new(bus: BusSender) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            core: ObjectCore::new(crate::ObjectKind::Connection, bus),
            weak: weak.clone(),
            inner: OrderedMutex::new(
                RANK_ELEMENT,
                ConnectionInner {
                    state: StateCell::with_flags(Flags::CAN_START),
                    imp: None,
                },
            ),
        })
    }

    pub fn core(&self) -> &ObjectCore {
        &self.core
    }

    /// Installs the connection implementation. Only permitted while idle.
    pub fn install(&self, imp: Box<dyn Connection>) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock();
        if inner.state.state().current != CurrentState::Idle {
            return Err(PipelineError::NotIdle("connection"));
        }
        inner.imp = Some(imp);
        Ok(())
    }

    /// Reads configuration through the installed implementation. With no
    /// implementation installed the configuration is invalid by definition.
    pub fn configure(&self, cfg: &dyn Config) {
        let mut inner = self.inner.lock();
        let status = match inner.imp.as_mut() {
            Some(imp) => imp.configure(cfg),
            None => {
                log::error!("[Connection] No implementation installed");
                ConfigStatus::Invalid
            }
        };
        let ConnectionInner { state, .. } = &mut *inner;
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

    /// Quick running check for mixers deciding whether to produce output.
    pub(crate) fn is_running(&self) -> bool {
        self.inner.lock().state.state().current == CurrentState::Running
    }

    /// Asks the implementation to emit the AAC stream configuration.
    pub(crate) fn request_audio_config(&self) {
        let mut inner = self.inner.lock();
        if inner.state.state().current != CurrentState::Running {
            return;
        }
        if let Some(imp) = inner.imp.as_mut() {
            imp.audio_config();
        }
    }

    /// Hands one encoded AAC batch to the implementation.
    pub(crate) fn stream_audio(&self, time: Ticks, payload: &[u8]) {
        let mut inner = self.inner.lock();
        if inner.state.state().current != CurrentState::Running {
            return;
        }
        if let Some(imp) = inner.imp.as_mut() {
            imp.audio(time, payload);
        }
    }

    /// Announces the video parameters of the upcoming picture stream.
    pub(crate) fn send_video_config(&self, params: VideoParams) {
        let mut inner = self.inner.lock();
        if inner.state.state().current != CurrentState::Running {
            return;
        }
        if let Some(imp) = inner.imp.as_mut() {
            imp.video_config(params);
        }
    }

    /// Hands one composed picture to the implementation.
    pub(crate) fn stream_video(&self, time: Ticks, picture: &Picture) {
        let mut inner = self.inner.lock();
        if inner.state.state().current != CurrentState::Running {
            return;
        }
        if let Some(imp) = inner.imp.as_mut() {
            imp.video(time, picture);
        }
    }
}

impl Entity for ConnectionHandle {
    fn object_ref(&self) -> ObjectRef {
        self.core.object_ref()
    }

    fn state(&self) -> ObjectState {
        ConnectionHandle::state(self)
    }

    fn set_target(&self, target: TargetState) {
        ConnectionHandle::set_target(self, target)
    }

    fn resync(&self) {
        ConnectionHandle::resync(self)
    }

    fn deliver(&self, n: &Notification) {
        let mut inner = self.inner.lock();
        let can_start = match inner.imp.as_mut() {
            Some(imp) => imp.peer_changed(n),
            None => false,
        };
        let ConnectionInner { state, .. } = &mut *inner;
        state.set_flag(Flags::CAN_START, can_start);
        state.publish(&self.core);
    }

    fn drive(&self) {
        let mut inner = self.inner.lock();
        match plan(&inner.state.state()) {
            DriveAction::Start => {
                let link = ConnectionLink {
                    entity: self.weak.clone(),
                };
                let ConnectionInner { state, imp } = &mut *inner;
                match imp.as_mut() {
                    Some(imp) => {
                        let disposition = imp.start(link);
                        apply_start(state, &self.core, disposition);
                    }
                    None => state.fail_idle(&self.core),
                }
            }
            DriveAction::Stop => {
                let ConnectionInner { state, imp } = &mut *inner;
                match imp.as_mut() {
                    Some(imp) => {
                        let disposition = imp.stop();
                        apply_stop(state, &self.core, disposition);
                    }
                    None => {
                        state.set_current(CurrentState::Idle);
                        state.publish(&self.core);
                    }
                }
            }
            DriveAction::FlipRestart => inner.state.set_target(&self.core, TargetState::Running),
            DriveAction::None => {}
        }
    }
}

/// A connection that discards everything. Useful for bring-up and tests:
/// the mixers see a running consumer without any network in the loop.
#[derive(Debug, Default)]
pub struct NullConnection;

impl Connection for NullConnection {
    fn start(&mut self, _link: ConnectionLink) -> crate::plugin::StartDisposition {
        crate::plugin::StartDisposition::Running
    }

    fn audio(&mut self, _time: Ticks, payload: &[u8]) {
        log::trace!("[Connection] Discarding {} audio bytes", payload.len());
    }

    fn video(&mut self, _time: Ticks, picture: &Picture) {
        log::trace!(
            "[Connection] Discarding {}x{} picture",
            picture.width(),
            picture.height()
        );
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::config::EmptyConfig;

    #[test]
    fn configure_without_implementation_is_invalid() {
        let bus = Bus::new(16);
        let handle = ConnectionHandle::new(bus.sender());
        handle.configure(&EmptyConfig);
        assert!(!handle.state().flags.contains(Flags::CONFIG_VALID));
    }

    #[test]
    fn null_connection_starts_and_stops_synchronously() {
        let bus = Bus::new(16);
        let handle = ConnectionHandle::new(bus.sender());
        handle.install(Box::new(NullConnection)).expect("idle");
        handle.configure(&EmptyConfig);

        handle.drive();
        assert_eq!(handle.state().current, CurrentState::Running);

        handle.set_target(TargetState::Idle);
        handle.drive();
        assert_eq!(handle.state().current, CurrentState::Idle);
    }

    #[test]
    fn install_is_rejected_while_running() {
        let bus = Bus::new(16);
        let handle = ConnectionHandle::new(bus.sender());
        handle.install(Box::new(NullConnection)).expect("idle");
        handle.configure(&EmptyConfig);
        handle.drive();

        assert!(matches!(
            handle.install(Box::new(NullConnection)),
            Err(PipelineError::NotIdle(_))
        ));
    }

    #[test]
    fn data_path_is_gated_on_running() {
        let bus = Bus::new(16);
        let (handle, events) = test_support::running_recorder(&bus);

        handle.stream_audio(10, &[0u8; 32]);
        handle.set_target(TargetState::Idle);
        handle.drive();
        handle.stream_audio(20, &[0u8; 32]);

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            test_support::ConnEvent::Audio { time: 10, bytes: 32 }
        ));
    }
}
