//! AAC encoding seam.
//!
//! The mixer drains through the [`PcmEncoder`] trait so the encode loop can
//! be exercised deterministically in tests; production sessions wrap the
//! FDK AAC encoder at the pipeline's fixed parameters.

use fdk_aac::enc::{BitRate, ChannelMode, Encoder, EncoderParams, Transport};

use crate::error::AudioCodecError;
use crate::tuning::{AUDIO_BIT_RATE, AUDIO_SAMPLE_RATE};

/// Outcome of one encoder call.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EncodeStep {
    /// Interleaved 16-bit samples the encoder ingested.
    pub consumed_samples: usize,
    /// Bytes written into the output window.
    pub bytes_written: usize,
}

/// One call against a PCM-to-bitstream encoder. The encoder is free to
/// consume less than the full window and to buffer internally; the drain
/// loop keeps calling while progress is made.
pub(crate) trait PcmEncoder: Send {
    fn encode(&mut self, input: &[i16], output: &mut [u8]) -> Result<EncodeStep, AudioCodecError>;
}

/// FDK AAC-LC at the pipeline's fixed parameters, raw transport (the
/// connection wraps the bitstream for its own container).
pub(crate) struct AacEncoder {
    encoder: Encoder,
}

// The raw encoder handle has no thread affinity; it is only ever touched
// under the audio mixer lock.
unsafe impl Send for AacEncoder {}

impl AacEncoder {
    pub(crate) fn open() -> Result<Self, AudioCodecError> {
        let encoder = Encoder::new(EncoderParams {
            bit_rate: BitRate::Cbr(AUDIO_BIT_RATE),
            sample_rate: AUDIO_SAMPLE_RATE,
            transport: Transport::Raw,
            channels: ChannelMode::Stereo,
        })
        .map_err(|err| AudioCodecError::Open(format!("{err:?}")))?;
        Ok(Self { encoder })
    }
}

impl PcmEncoder for AacEncoder {
    fn encode(&mut self, input: &[i16], output: &mut [u8]) -> Result<EncodeStep, AudioCodecError> {
        let info = self
            .encoder
            .encode(input, output)
            .map_err(|err| AudioCodecError::Encode(format!("{err:?}")))?;
        Ok(EncodeStep {
            consumed_samples: info.input_consumed,
            bytes_written: info.output_size,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Deterministic stand-in mimicking FDK's ingest behavior: input is
    /// consumed into an internal accumulator in arbitrary amounts, and a
    /// fixed-size output frame appears each time `frame_samples` interleaved
    /// samples have been gathered.
    pub(crate) struct StubEncoder {
        pub frame_samples: usize,
        pub bytes_per_frame: usize,
        buffered: usize,
        pub fail_next: bool,
    }

    impl StubEncoder {
        pub fn new(frame_samples: usize, bytes_per_frame: usize) -> Self {
            Self {
                frame_samples,
                bytes_per_frame,
                buffered: 0,
                fail_next: false,
            }
        }

        pub fn failing() -> Self {
            let mut stub = Self::new(2048, 128);
            stub.fail_next = true;
            stub
        }
    }

    impl PcmEncoder for StubEncoder {
        fn encode(
            &mut self,
            input: &[i16],
            output: &mut [u8],
        ) -> Result<EncodeStep, AudioCodecError> {
            if self.fail_next {
                return Err(AudioCodecError::Encode("stub failure".into()));
            }
            if output.len() < self.bytes_per_frame {
                return Ok(EncodeStep::default());
            }
            let take = (self.frame_samples - self.buffered).min(input.len());
            self.buffered += take;
            if self.buffered == self.frame_samples {
                self.buffered = 0;
                output[..self.bytes_per_frame].fill(0xA5);
                return Ok(EncodeStep {
                    consumed_samples: take,
                    bytes_written: self.bytes_per_frame,
                });
            }
            Ok(EncodeStep {
                consumed_samples: take,
                bytes_written: 0,
            })
        }
    }
}
