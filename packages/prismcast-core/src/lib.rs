//! Prismcast Core - the media pipeline of a desktop broadcaster.
//!
//! A [`Context`] models a pipeline of elements, each responsible for part of
//! the media processing. Three elements are fixed:
//!
//! - a [`VideoMixer`] composing video sources into a single output image and
//!   converting it to planar I420,
//! - an [`AudioMixer`] summing audio sources and encoding AAC,
//! - a connection slot ([`ConnectionHandle`]) consuming the encoded output.
//!
//! The remaining elements are plugins provided by the host: one video clock
//! ([`VideoClock`]) driving the video path, plus any number of video and
//! audio sources. The crate bundles a [`CadenceClock`]; capture backends and
//! the streaming connection are host concerns behind the plugin traits.
//!
//! # Lifecycle
//!
//! Every element carries the same state machine: a current state, a target
//! state and gating flags. All state changes flow through the notification
//! bus to a single control thread, which drives each object toward its
//! target, and to the host via [`Context::subscribe`]. Hosts request
//! transitions by setting targets and observe outcomes on the stream; a
//! failed element parks idle with its error flag set until the host targets
//! it running again.
//!
//! # Threads
//!
//! The control thread owns lifecycle decisions. The clock plugin owns the
//! thread every video tick, GPU call and preview callback runs on. Audio
//! sources deliver buffers from arbitrary capture threads; the audio mixer
//! serializes them internally. Cross-object locking is container-first and
//! checked in debug builds.

#![warn(clippy::all)]

pub mod audio;
mod bus;
pub mod config;
mod connection;
mod context;
mod control;
mod error;
mod lock_order;
mod object;
pub mod plugin;
mod timebase;
pub mod tuning;
pub mod video;

pub use bus::Notification;
pub use config::{Config, EmptyConfig, MemoryConfig};
pub use connection::{ConnectionHandle, ConnectionLink, NullConnection, VideoParams};
pub use context::Context;
pub use error::{AudioCodecError, FrameError, GpuError, PipelineError, PipelineResult};
pub use object::{
    CurrentState, Flags, ObjectCore, ObjectId, ObjectKind, ObjectRef, ObjectState, TargetState,
};
pub use plugin::{
    AudioSource, ClockStart, ConfigStatus, Connection, StartDisposition, StopDisposition,
    VideoClock, VideoSource,
};
pub use timebase::{Ticks, TimeBase};

pub use audio::{AudioMixer, AudioSourceHandle, AudioSourceLink};
pub use video::{
    CadenceClock, ClockLink, FrameSink, Picture, Placement, PreviewFrame, PreviewSink, VideoMixer,
    VideoClockHandle, VideoSourceHandle, VideoSourceLink,
};
