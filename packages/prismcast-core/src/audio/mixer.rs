//! The fixed audio mixer element.
//!
//! Sources sum interleaved f32 samples into a one-second mix buffer; each
//! source tracks how far it has written via `mix_pos`. A drain converts the
//! prefix common to all running sources to 16-bit, feeds it to the AAC
//! encoder, hands the encoded bytes to the connection, and compacts the
//! buffer. The buffer's base time `t0` is anchored by the master source's
//! arrival timestamps and advances exactly with the drained sample count,
//! so it is strictly monotonic across drains.

use std::sync::Arc;

use crate::audio::encoder::{AacEncoder, PcmEncoder};
use crate::audio::source::AudioSourceHandle;
use crate::bus::{BusSender, Notification};
use crate::config::Config;
use crate::connection::ConnectionHandle;
use crate::error::AudioCodecError;
use crate::lock_order::{OrderedMutex, RANK_MIXER};
use crate::object::{
    plan, CurrentState, DriveAction, Entity, Flags, ObjectCore, ObjectId, ObjectRef, ObjectState,
    StateCell, TargetState,
};
use crate::timebase::{TimeBase, Ticks};
use crate::tuning::{ENC_OUT_MIN, ENC_OUT_SIZE, MIX_SAMPLES};

/// Session resources held between start and idle.
struct AudioSession {
    /// One second of summed interleaved floats.
    mix: Vec<f32>,
    /// Conversion scratch handed to the encoder.
    enc_in: Vec<i16>,
    /// Encoder output accumulator.
    out: Vec<u8>,
    encoder: Box<dyn PcmEncoder>,
    /// Host time of `mix[0]`.
    time: Ticks,
    /// Whether the connection was asked to emit the AAC configuration.
    sent_config: bool,
}

struct AudioInner {
    state: StateCell,
    sources: Vec<Arc<AudioSourceHandle>>,
    session: Option<AudioSession>,
}

/// The fixed audio mixer element.
pub struct AudioMixer {
    core: ObjectCore,
    conn: Arc<ConnectionHandle>,
    timebase: Arc<TimeBase>,
    inner: OrderedMutex<AudioInner>,
}

impl AudioMixer {
    pub(crate) fn new(
        bus: BusSender,
        conn: Arc<ConnectionHandle>,
        timebase: Arc<TimeBase>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: ObjectCore::new(crate::ObjectKind::AudioMixer, bus),
            conn,
            timebase,
            inner: OrderedMutex::new(
                RANK_MIXER,
                AudioInner {
                    // The mixer has no configuration of its own; it is
                    // startable as soon as a start is requested.
                    state: StateCell::with_flags(Flags::CONFIG_VALID.with(Flags::CAN_START)),
                    sources: Vec::new(),
                    session: None,
                },
            ),
        })
    }

    pub fn core(&self) -> &ObjectCore {
        &self.core
    }

    /// The mixer reads no keys; configuration always validates.
    pub fn configure(&self, _cfg: &dyn Config) {
        let mut inner = self.inner.lock();
        inner.state.set_flag(Flags::CONFIG_VALID, true);
        inner.state.publish(&self.core);
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

    pub(crate) fn add_source(&self, source: Arc<AudioSourceHandle>) {
        self.inner.lock().sources.push(source);
    }

    pub(crate) fn remove_source(&self, id: ObjectId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.sources.len();
        inner.sources.retain(|s| s.core().id() != id);
        inner.sources.len() != before
    }

    /// Accepts a capture buffer from `src`.
    ///
    /// Called from arbitrary capture threads; the mixer lock serializes
    /// mixing. Buffers are dropped while the mixer or the connection is not
    /// running. Residue that does not fit the mix buffer even after draining
    /// is counted and logged, never partially written.
    pub(crate) fn buffer(&self, src: &AudioSourceHandle, time: Ticks, samples: &[f32]) {
        let mut inner = self.inner.lock();
        if inner.state.state().current != CurrentState::Running || inner.session.is_none() {
            return;
        }
        if !self.conn.is_running() {
            return;
        }

        {
            let session = match inner.session.as_mut() {
                Some(session) => session,
                None => return,
            };
            if !session.sent_config {
                session.sent_config = true;
                self.conn.request_audio_config();
            }
        }

        // The master source anchors the mix clock: host time of mix[0] is
        // the buffer timestamp minus what this source already wrote.
        {
            let s = src.lock_mix();
            if s.master {
                if let Some(session) = inner.session.as_mut() {
                    session.time = time - self.timebase.samples_to_ticks(s.mix_pos);
                }
            }
        }

        let mut remaining = samples;
        loop {
            let wrote = {
                let mut s = src.lock_mix();
                let session = match inner.session.as_mut() {
                    Some(session) => session,
                    None => return,
                };
                let to_write = remaining.len().min(MIX_SAMPLES - s.mix_pos);
                let base = s.mix_pos;
                for (i, &sample) in remaining[..to_write].iter().enumerate() {
                    session.mix[base + i] += sample * s.volume;
                }
                s.mix_pos += to_write;
                to_write
            };
            remaining = &remaining[wrote..];

            let drain_time = match inner.session.as_ref() {
                Some(session) => session.time,
                None => return,
            };
            match Self::drain(&mut *inner, &self.timebase) {
                Ok(0) => break,
                Ok(bytes) => {
                    if let Some(session) = inner.session.as_ref() {
                        self.conn.stream_audio(drain_time, &session.out[..bytes]);
                    }
                }
                Err(err) => {
                    log::error!("[Audio] {err}");
                    inner.session = None;
                    inner.state.fail_idle(&self.core);
                    return;
                }
            }
        }

        if !remaining.is_empty() {
            log::warn!(
                "[Audio] Mix buffer full, dropped {} samples",
                remaining.len()
            );
        }
    }

    /// Encodes and compacts the prefix common to all running sources.
    /// Returns the number of bytes staged in the session's output buffer.
    fn drain(inner: &mut AudioInner, timebase: &TimeBase) -> Result<usize, AudioCodecError> {
        let AudioInner {
            sources, session, ..
        } = inner;
        let session = match session.as_mut() {
            Some(session) => session,
            None => return Ok(0),
        };

        let mut ready = usize::MAX;
        let mut any_running = false;
        for src in sources.iter() {
            let s = src.lock_mix();
            if s.state.state().current == CurrentState::Running {
                any_running = true;
                ready = ready.min(s.mix_pos);
            }
        }
        if !any_running || ready == 0 {
            return Ok(0);
        }

        // Saturating full-scale conversion.
        for i in 0..ready {
            session.enc_in[i] = (session.mix[i].clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
        }

        // The encoder takes small batches; keep feeding the window while it
        // makes progress and output space remains.
        let mut consumed = 0usize;
        let mut out_pos = 0usize;
        while consumed < ready && session.out.len() - out_pos > ENC_OUT_MIN {
            let step = session
                .encoder
                .encode(&session.enc_in[consumed..ready], &mut session.out[out_pos..])?;
            consumed += step.consumed_samples;
            out_pos += step.bytes_written;
            if step.consumed_samples == 0 {
                break;
            }
        }

        if consumed > 0 {
            // Shift the whole buffer down, including samples beyond the
            // common prefix: faster sources keep their accumulated data.
            session.mix.copy_within(consumed.., 0);
            let tail = MIX_SAMPLES - consumed;
            session.mix[tail..].fill(0.0);

            for src in sources.iter() {
                let mut s = src.lock_mix();
                s.mix_pos = s.mix_pos.saturating_sub(consumed);
            }

            session.time += timebase.samples_to_ticks(consumed);
        }

        Ok(out_pos)
    }

    fn start_session(&self, inner: &mut AudioInner, encoder: Box<dyn PcmEncoder>) {
        inner.session = Some(AudioSession {
            mix: vec![0.0; MIX_SAMPLES],
            enc_in: vec![0; MIX_SAMPLES],
            out: vec![0; ENC_OUT_SIZE],
            encoder,
            time: self.timebase.now_ticks(),
            sent_config: false,
        });
        inner.state.set_current(CurrentState::Running);
        inner.state.publish(&self.core);
        log::info!("[Audio] Mixer running");
    }

    #[cfg(test)]
    pub(crate) fn start_with_encoder(&self, encoder: Box<dyn PcmEncoder>) {
        let mut inner = self.inner.lock();
        self.start_session(&mut inner, encoder);
    }

    #[cfg(test)]
    pub(crate) fn base_time(&self) -> Option<Ticks> {
        self.inner.lock().session.as_ref().map(|s| s.time)
    }
}

impl Entity for AudioMixer {
    fn object_ref(&self) -> ObjectRef {
        self.core.object_ref()
    }

    fn state(&self) -> ObjectState {
        AudioMixer::state(self)
    }

    fn set_target(&self, target: TargetState) {
        AudioMixer::set_target(self, target)
    }

    fn resync(&self) {
        AudioMixer::resync(self)
    }

    fn deliver(&self, _n: &Notification) {
        // Peer states are sampled on the data path; nothing to precompute.
    }

    fn drive(&self) {
        let mut inner = self.inner.lock();
        match plan(&inner.state.state()) {
            DriveAction::Start => match AacEncoder::open() {
                Ok(encoder) => self.start_session(&mut inner, Box::new(encoder)),
                Err(err) => {
                    log::error!("[Audio] {err}");
                    inner.state.fail_idle(&self.core);
                }
            },
            DriveAction::Stop => {
                inner.session = None;
                inner.state.set_current(CurrentState::Idle);
                inner.state.publish(&self.core);
                log::info!("[Audio] Mixer idle");
            }
            DriveAction::FlipRestart => inner.state.set_target(&self.core, TargetState::Running),
            DriveAction::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::encoder::test_support::StubEncoder;
    use crate::audio::source::test_support::ScriptedAudioSource;
    use crate::audio::source::AudioSourceLink;
    use crate::bus::Bus;
    use crate::config::MemoryConfig;
    use crate::connection::test_support::{running_recorder, ConnEvent};

    struct Rig {
        _bus: Bus,
        conn_events: Arc<parking_lot::Mutex<Vec<ConnEvent>>>,
        mixer: Arc<AudioMixer>,
    }

    fn rig() -> Rig {
        let bus = Bus::new(64);
        let (conn, conn_events) = running_recorder(&bus);
        let timebase = Arc::new(TimeBase::identity());
        let mixer = AudioMixer::new(bus.sender(), conn, timebase);
        Rig {
            _bus: bus,
            conn_events,
            mixer,
        }
    }

    fn add_source(rig: &Rig, master: bool) -> (Arc<AudioSourceHandle>, AudioSourceLink) {
        let (imp, link_slot) = ScriptedAudioSource::new();
        let src = AudioSourceHandle::new(
            rig._bus.sender(),
            Arc::downgrade(&rig.mixer),
            Box::new(imp),
        );
        rig.mixer.add_source(Arc::clone(&src));

        let mut cfg = MemoryConfig::new();
        cfg.set("volume", 1.0).set("master", master);
        src.configure(&cfg);
        src.drive();
        assert_eq!(src.state().current, CurrentState::Running);

        let link = link_slot.lock().clone().expect("link captured at start");
        (src, link)
    }

    /// Ticks for `samples` interleaved samples under the identity time base.
    fn ticks(samples: usize) -> Ticks {
        samples as i64 / 2 * 1_000_000_000 / 44_100
    }

    #[test]
    fn buffers_are_dropped_while_idle() {
        let r = rig();
        let (src, link) = add_source(&r, true);
        link.push(0, &[0.25; 1024]);
        assert_eq!(src.lock_mix().mix_pos, 0);
        assert!(r.conn_events.lock().is_empty());
    }

    #[test]
    fn silence_stream_drains_and_advances_t0() {
        let r = rig();
        let (_src, link) = add_source(&r, true);
        r.mixer
            .start_with_encoder(Box::new(StubEncoder::new(2048, 100)));

        let tick_step = 100_000_000; // 100 ms of host time per write
        for i in 0..10i64 {
            link.push(i * tick_step, &[0.0f32; 4410]);
        }

        // 44100 samples total at 2048 samples per stub frame.
        let expected_frames = 44_100 / 2048;
        let events = r.conn_events.lock();
        assert_eq!(events[0], ConnEvent::AudioConfig);

        let total_bytes: usize = events
            .iter()
            .filter_map(|e| match e {
                ConnEvent::Audio { bytes, .. } => Some(*bytes),
                _ => None,
            })
            .sum();
        assert_eq!(total_bytes, expected_frames * 100);

        // Every batch is stamped with the master-anchored base time of the
        // write that produced it.
        for (i, event) in events
            .iter()
            .filter(|e| matches!(e, ConnEvent::Audio { .. }))
            .enumerate()
        {
            if let ConnEvent::Audio { time, .. } = event {
                assert_eq!(*time, i as i64 * tick_step);
            }
        }
        drop(events);

        // All input consumed: t0 sits one write-length past the last write.
        assert_eq!(
            r.mixer.base_time(),
            Some(9 * tick_step + ticks(4410)),
            "t0 must equal the host time of the earliest unread sample"
        );
    }

    #[test]
    fn slow_joiner_blocks_drain_without_corrupting_fast_source() {
        let r = rig();
        let (src_a, link_a) = add_source(&r, true);
        let (src_b, link_b) = add_source(&r, false);
        r.mixer
            .start_with_encoder(Box::new(StubEncoder::new(2048, 100)));

        link_a.push(0, &[0.5f32; 22_050]);
        assert_eq!(src_a.lock_mix().mix_pos, 22_050);
        assert_eq!(src_b.lock_mix().mix_pos, 0, "B has not delivered");
        assert!(
            !r.conn_events
                .lock()
                .iter()
                .any(|e| matches!(e, ConnEvent::Audio { .. })),
            "drain must not advance while the common prefix is empty"
        );

        link_b.push(0, &[0.5f32; 100]);
        assert_eq!(src_a.lock_mix().mix_pos, 22_050 - 100);
        assert_eq!(src_b.lock_mix().mix_pos, 0);
    }

    #[test]
    fn master_retime_anchors_base_time() {
        let r = rig();
        let (_src, link) = add_source(&r, true);
        r.mixer
            .start_with_encoder(Box::new(StubEncoder::new(512, 64)));

        let t = 5_000_000_000;
        link.push(t, &[0.1f32; 512]);

        assert_eq!(r.mixer.base_time(), Some(t + ticks(512)));
    }

    #[test]
    fn base_time_is_monotonic_across_drains() {
        let r = rig();
        let (_src, link) = add_source(&r, true);
        r.mixer
            .start_with_encoder(Box::new(StubEncoder::new(1024, 32)));

        let mut last = i64::MIN;
        for i in 0..20i64 {
            link.push(i * 25_000_000, &[0.0f32; 2205]);
            let t0 = r.mixer.base_time().expect("session alive");
            assert!(t0 >= last, "t0 went backwards: {t0} < {last}");
            last = t0;
        }
    }

    #[test]
    fn overflow_drops_residue_and_keeps_accounting() {
        let r = rig();
        let (src_a, link_a) = add_source(&r, true);
        let (src_b, _link_b) = add_source(&r, false);
        r.mixer
            .start_with_encoder(Box::new(StubEncoder::new(2048, 100)));

        // B never delivers, so nothing drains and A eventually overflows.
        link_a.push(0, &[0.25f32; MIX_SAMPLES + 1000]);

        assert_eq!(src_a.lock_mix().mix_pos, MIX_SAMPLES);
        assert_eq!(src_b.lock_mix().mix_pos, 0);
        assert!(
            !r.conn_events
                .lock()
                .iter()
                .any(|e| matches!(e, ConnEvent::Audio { .. })),
        );
    }

    #[test]
    fn encoder_failure_halts_the_mixer() {
        let r = rig();
        let (_src, link) = add_source(&r, true);
        r.mixer.start_with_encoder(Box::new(StubEncoder::failing()));

        link.push(0, &[0.5f32; 4096]);

        let state = r.mixer.state();
        assert_eq!(state.current, CurrentState::Idle);
        assert!(state.flags.contains(Flags::ERROR));
        assert_eq!(r.mixer.base_time(), None, "session released");

        // Error clears when the host re-targets running.
        r.mixer.set_target(TargetState::Running);
        assert!(!r.mixer.state().flags.contains(Flags::ERROR));
    }

    #[test]
    fn saturating_conversion_clamps_full_scale() {
        let r = rig();
        let (_src, link) = add_source(&r, true);
        r.mixer
            .start_with_encoder(Box::new(StubEncoder::new(4, 16)));

        // Out-of-range floats must clamp, not wrap.
        link.push(0, &[2.0f32, -2.0, 1.0, -1.0]);

        // The stub consumed the frame; conversion happened without panic and
        // the mix buffer was compacted back to zeroes.
        assert_eq!(r.mixer.base_time(), Some(ticks(4)));
    }

    #[test]
    fn real_aac_encoder_produces_output() {
        let r = rig();
        let (_src, link) = add_source(&r, true);

        r.mixer.drive();
        assert_eq!(
            r.mixer.state().current,
            CurrentState::Running,
            "AAC encoder must open"
        );

        // One second of silence through the real encoder.
        for i in 0..10i64 {
            link.push(i * 100_000_000, &[0.0f32; 8820]);
        }

        let events = r.conn_events.lock();
        assert_eq!(events[0], ConnEvent::AudioConfig);
        let total_bytes: usize = events
            .iter()
            .filter_map(|e| match e {
                ConnEvent::Audio { bytes, .. } => Some(*bytes),
                _ => None,
            })
            .sum();
        assert!(total_bytes > 0, "encoder produced no bytes");
    }
}
