//! The plugin contract.
//!
//! Clocks, sources and the connection are host-provided implementations of
//! the traits below. The pipeline wraps each one in an entity that owns the
//! object state machine; hooks return plain data and the entity performs the
//! flag writes and the follow-up notification. A hook must never call back
//! into the pipeline synchronously — the entity's lock is held across the
//! call. Asynchronous plugins complete transitions later through their link
//! handle, from their own threads.

use crate::audio::source::AudioSourceLink;
use crate::bus::Notification;
use crate::config::Config;
use crate::connection::{ConnectionLink, VideoParams};
use crate::error::FrameError;
use crate::object::{CurrentState, Flags, ObjectCore, StateCell};
use crate::timebase::Ticks;
use crate::video::clock::ClockLink;
use crate::video::mixer::{FrameSink, Picture};
use crate::video::source::VideoSourceLink;

/// Result of a `configure` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStatus {
    /// Configuration parsed completely.
    Ok {
        /// The new configuration only takes effect after a restart.
        needs_restart: bool,
    },
    /// Configuration is incomplete or ill-typed; the object cannot start
    /// until reconfigured.
    Invalid,
}

impl ConfigStatus {
    /// Valid configuration, effective immediately.
    pub fn ok() -> Self {
        Self::Ok {
            needs_restart: false,
        }
    }

    /// Valid configuration that requires a stop/start cycle.
    pub fn restart_required() -> Self {
        Self::Ok {
            needs_restart: true,
        }
    }
}

/// Result of a `start` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDisposition {
    /// The plugin is immediately running.
    Running,
    /// Startup continues asynchronously; the plugin announces the final
    /// state through its link.
    Starting,
    /// Startup failed; the object goes idle with its error flag set.
    Failed,
}

/// Result of a `stop` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDisposition {
    /// The plugin is immediately idle.
    Idle,
    /// Teardown continues asynchronously; the plugin announces idle through
    /// its link once its resources are drained.
    Stopping,
}

/// A video clock's start result. A synchronously running clock must report
/// its rate here; an asynchronous clock reports it when announcing running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockStart {
    Running { fps_num: u32, fps_den: u32 },
    Starting,
    Failed,
}

/// Provides video timing. Once running, the clock calls
/// [`ClockLink::tick`] at `fps_num / fps_den` Hz from a dedicated thread;
/// all video processing happens on that thread. On stop the clock drains its
/// thread and only then announces idle.
pub trait VideoClock: Send {
    /// Reads configuration. The entity has already reset the config flags.
    fn configure(&mut self, _cfg: &dyn Config) -> ConfigStatus {
        ConfigStatus::ok()
    }

    /// Another object changed state. Returns whether this clock's
    /// prerequisites are satisfied.
    fn peer_changed(&mut self, _n: &Notification) -> bool {
        true
    }

    /// Opens resources and begins ticking.
    fn start(&mut self, link: ClockLink) -> ClockStart;

    /// Stops ticking and releases resources.
    fn stop(&mut self) -> StopDisposition {
        StopDisposition::Idle
    }
}

/// Produces an image on each clock tick. Placement and crop rectangles are
/// parsed by the entity from the common keys (`x1,y1,x2,y2` in [-1, +1],
/// `u1,v1,u2,v2` in [0, 1]).
pub trait VideoSource: Send {
    fn configure(&mut self, _cfg: &dyn Config) -> ConfigStatus {
        ConfigStatus::ok()
    }

    fn peer_changed(&mut self, _n: &Notification) -> bool {
        true
    }

    fn start(&mut self, link: VideoSourceLink) -> StartDisposition;

    fn stop(&mut self) -> StopDisposition {
        StopDisposition::Idle
    }

    /// Uploads the current frame into the mixer-bound texture. Called on the
    /// clock thread, once per tick, while the source is running and linked.
    /// An error aborts the tick and halts the mixer.
    fn frame(&mut self, sink: &mut FrameSink<'_>) -> Result<(), FrameError>;
}

/// Produces interleaved f32 audio buffers from its own threads via
/// [`AudioSourceLink::push`]. Volume and the master flag are parsed by the
/// entity from the common keys.
pub trait AudioSource: Send {
    fn configure(&mut self, _cfg: &dyn Config) -> ConfigStatus {
        ConfigStatus::ok()
    }

    fn peer_changed(&mut self, _n: &Notification) -> bool {
        true
    }

    fn start(&mut self, link: AudioSourceLink) -> StartDisposition;

    fn stop(&mut self) -> StopDisposition {
        StopDisposition::Idle
    }
}

/// Applies a `configure` hook result to an object's flags and publishes.
pub(crate) fn apply_config_status(cell: &mut StateCell, core: &ObjectCore, status: ConfigStatus) {
    match status {
        ConfigStatus::Ok { needs_restart } => {
            cell.set_flag(Flags::CONFIG_VALID, true);
            cell.set_flag(Flags::NEEDS_RESTART, needs_restart);
        }
        ConfigStatus::Invalid => {
            cell.set_flag(Flags::CONFIG_VALID, false);
            cell.set_flag(Flags::NEEDS_RESTART, false);
        }
    }
    cell.publish(core);
}

/// Applies a `start` hook result and publishes the transition.
pub(crate) fn apply_start(cell: &mut StateCell, core: &ObjectCore, disposition: StartDisposition) {
    match disposition {
        StartDisposition::Running => {
            cell.set_current(CurrentState::Running);
            cell.publish(core);
        }
        StartDisposition::Starting => {
            cell.set_current(CurrentState::Starting);
            cell.publish(core);
        }
        StartDisposition::Failed => cell.fail_idle(core),
    }
}

/// Applies a `stop` hook result and publishes the transition.
pub(crate) fn apply_stop(cell: &mut StateCell, core: &ObjectCore, disposition: StopDisposition) {
    match disposition {
        StopDisposition::Idle => {
            cell.set_current(CurrentState::Idle);
            cell.publish(core);
        }
        StopDisposition::Stopping => {
            cell.set_current(CurrentState::Stopping);
            cell.publish(core);
        }
    }
}

/// The encoded-output consumer: an RTMP muxer or any other sink.
///
/// Data-path methods are called on mixer threads with the connection entity
/// locked and must return promptly. `audio_config` and `video_config` arrive
/// once per mixer session, before the first frame of the respective kind.
pub trait Connection: Send {
    fn configure(&mut self, _cfg: &dyn Config) -> ConfigStatus {
        ConfigStatus::ok()
    }

    fn peer_changed(&mut self, _n: &Notification) -> bool {
        true
    }

    fn start(&mut self, link: ConnectionLink) -> StartDisposition;

    fn stop(&mut self) -> StopDisposition {
        StopDisposition::Idle
    }

    /// The audio mixer accepted its first buffer; emit the AAC stream
    /// configuration. The audio parameters are fixed (44.1 kHz stereo
    /// AAC-LC), so the payload is implementation knowledge.
    fn audio_config(&mut self) {}

    /// One batch of encoded AAC, timestamped with the host time of its
    /// first sample.
    fn audio(&mut self, time: Ticks, payload: &[u8]);

    /// The video mixer is about to deliver its first picture.
    fn video_config(&mut self, _params: VideoParams) {}

    /// One composed I420 picture, timestamped with its clock tick.
    fn video(&mut self, time: Ticks, picture: &Picture);
}
