//! Video composition, colour conversion and timing.

pub mod clock;
pub(crate) mod gpu;
pub mod mixer;
pub mod source;

pub use clock::{CadenceClock, ClockLink, VideoClockHandle};
pub use mixer::{FrameSink, Picture, PreviewFrame, PreviewSink, VideoMixer};
pub use source::{Placement, VideoSourceHandle, VideoSourceLink};
