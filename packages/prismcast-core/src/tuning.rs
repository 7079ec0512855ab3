//! Fixed pipeline parameters.
//!
//! The audio path is locked to 44.1 kHz stereo AAC-LC at a fixed bitrate;
//! changing these requires coordinated changes to the encoder setup and the
//! connection handoff, so they live here rather than in configuration.

/// Audio sample rate in Hz.
pub const AUDIO_SAMPLE_RATE: u32 = 44_100;

/// Interleaved channel count.
pub const AUDIO_CHANNELS: u32 = 2;

/// AAC bitrate in bits per second.
pub const AUDIO_BIT_RATE: u32 = 128 * 1024;

/// Mix buffer length in interleaved samples: one full second.
pub const MIX_SAMPLES: usize = (AUDIO_SAMPLE_RATE * AUDIO_CHANNELS) as usize;

/// Minimum free output space required per encoder call (FDK AAC requirement).
pub const ENC_OUT_MIN: usize = 6144 / 8 * AUDIO_CHANNELS as usize;

/// Complete encoder output buffer, also roughly one second of stream data.
pub const ENC_OUT_SIZE: usize = ENC_OUT_MIN * 64;

/// Host-facing notification stream capacity. A host that falls further
/// behind than this observes a lag marker and misses old notifications;
/// the pipeline itself never blocks on the host.
pub const NOTIFY_HOST_CAPACITY: usize = 256;

/// Default frame rate for the bundled cadence clock.
pub const DEFAULT_CLOCK_FPS: u32 = 60;
