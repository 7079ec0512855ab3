//! The context: root object of a pipeline.
//!
//! A context owns the notification bus, the host time base, the three fixed
//! elements (video mixer, audio mixer, connection) and the registered
//! plugins. Starting the context spawns the control thread and nudges every
//! object toward its target; stopping re-targets everything idle and the
//! context itself announces idle once the last object has wound down.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use tokio::sync::broadcast;

use crate::audio::mixer::AudioMixer;
use crate::audio::source::AudioSourceHandle;
use crate::bus::{Bus, Notification};
use crate::config::Config;
use crate::connection::ConnectionHandle;
use crate::control;
use crate::error::{PipelineError, PipelineResult};
use crate::lock_order::{OrderedMutex, RANK_CONTEXT};
use crate::object::{
    CurrentState, Entity, ObjectCore, ObjectId, ObjectState, StateCell, TargetState,
};
use crate::plugin::{AudioSource, VideoClock, VideoSource};
use crate::timebase::{TimeBase, Ticks};
use crate::tuning::NOTIFY_HOST_CAPACITY;
use crate::video::clock::VideoClockHandle;
use crate::video::mixer::VideoMixer;
use crate::video::source::VideoSourceHandle;

struct ContextInner {
    state: StateCell,
    clock: Option<Arc<VideoClockHandle>>,
    registry: HashMap<ObjectId, Arc<dyn Entity>>,
    control: Option<JoinHandle<()>>,
}

/// Root object owning a complete pipeline.
pub struct Context {
    core: ObjectCore,
    weak: Weak<Context>,
    bus: Bus,
    timebase: Arc<TimeBase>,
    video: Arc<VideoMixer>,
    audio: Arc<AudioMixer>,
    connection: Arc<ConnectionHandle>,
    inner: OrderedMutex<ContextInner>,
}

impl Context {
    /// Creates a context with the identity time base (ticks are
    /// nanoseconds from the context's own monotonic origin).
    pub fn new() -> Arc<Self> {
        Self::with_timebase(TimeBase::identity())
    }

    /// Creates a context with a host-supplied tick mapping.
    pub fn with_timebase(timebase: TimeBase) -> Arc<Self> {
        let bus = Bus::new(NOTIFY_HOST_CAPACITY);
        let timebase = Arc::new(timebase);
        let connection = ConnectionHandle::new(bus.sender());
        let audio = AudioMixer::new(bus.sender(), Arc::clone(&connection), Arc::clone(&timebase));
        let video = VideoMixer::new(bus.sender(), Arc::clone(&connection));

        let mut registry: HashMap<ObjectId, Arc<dyn Entity>> = HashMap::new();
        registry.insert(connection.core().id(), Arc::clone(&connection) as Arc<dyn Entity>);
        registry.insert(audio.core().id(), Arc::clone(&audio) as Arc<dyn Entity>);
        registry.insert(video.core().id(), Arc::clone(&video) as Arc<dyn Entity>);

        Arc::new_cyclic(|weak| Self {
            core: ObjectCore::new(crate::ObjectKind::Context, bus.sender()),
            weak: weak.clone(),
            bus,
            timebase,
            video,
            audio,
            connection,
            inner: OrderedMutex::new(
                RANK_CONTEXT,
                ContextInner {
                    state: StateCell::new(),
                    clock: None,
                    registry,
                    control: None,
                },
            ),
        })
    }

    pub fn core(&self) -> &ObjectCore {
        &self.core
    }

    pub fn video(&self) -> &Arc<VideoMixer> {
        &self.video
    }

    pub fn audio(&self) -> &Arc<AudioMixer> {
        &self.audio
    }

    pub fn connection(&self) -> &Arc<ConnectionHandle> {
        &self.connection
    }

    /// The installed video clock, if any.
    pub fn video_clock(&self) -> Option<Arc<VideoClockHandle>> {
        self.inner.lock().clock.clone()
    }

    pub fn timebase(&self) -> &TimeBase {
        &self.timebase
    }

    /// Current host time in ticks.
    pub fn now_ticks(&self) -> Ticks {
        self.timebase.now_ticks()
    }

    /// Opens a host notification subscription. A subscriber that falls more
    /// than the stream capacity behind observes a lag marker and continues
    /// from newer notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.bus.subscribe()
    }

    /// Configures the fixed elements. Plugins are configured individually
    /// through their handles, each against its own key space.
    pub fn configure(&self, cfg: &dyn Config) {
        self.video.configure(cfg);
        self.audio.configure(cfg);
        self.connection.configure(cfg);
    }

    /// Installs the video clock, replacing an idle predecessor.
    pub fn set_video_clock(
        &self,
        imp: Box<dyn VideoClock>,
    ) -> PipelineResult<Arc<VideoClockHandle>> {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.clock.take() {
            if old.state().current != CurrentState::Idle {
                inner.clock = Some(old);
                return Err(PipelineError::NotIdle("video clock"));
            }
            inner.registry.remove(&old.core().id());
        }

        let clock = VideoClockHandle::new(
            self.bus.sender(),
            Arc::clone(&self.video),
            Arc::clone(&self.timebase),
            imp,
        );
        inner.clock = Some(Arc::clone(&clock));
        inner
            .registry
            .insert(clock.core().id(), Arc::clone(&clock) as Arc<dyn Entity>);
        Ok(clock)
    }

    /// Registers a video source with the video mixer.
    pub fn add_video_source(&self, imp: Box<dyn VideoSource>) -> Arc<VideoSourceHandle> {
        let mixer_running = self.video.state().current == CurrentState::Running;
        let src = VideoSourceHandle::new(self.bus.sender(), mixer_running, imp);
        self.video.add_source(Arc::clone(&src));
        self.inner
            .lock()
            .registry
            .insert(src.core().id(), Arc::clone(&src) as Arc<dyn Entity>);
        self.video.resync();
        src
    }

    /// Removes an idle video source.
    pub fn remove_video_source(&self, src: &Arc<VideoSourceHandle>) -> PipelineResult<()> {
        if src.state().current != CurrentState::Idle {
            return Err(PipelineError::NotIdle("video source"));
        }
        if !self.video.remove_source(src.core().id()) {
            return Err(PipelineError::UnknownObject);
        }
        self.inner.lock().registry.remove(&src.core().id());
        self.video.resync();
        Ok(())
    }

    /// Registers an audio source with the audio mixer.
    pub fn add_audio_source(&self, imp: Box<dyn AudioSource>) -> Arc<AudioSourceHandle> {
        let src = AudioSourceHandle::new(self.bus.sender(), Arc::downgrade(&self.audio), imp);
        self.audio.add_source(Arc::clone(&src));
        self.inner
            .lock()
            .registry
            .insert(src.core().id(), Arc::clone(&src) as Arc<dyn Entity>);
        self.audio.resync();
        src
    }

    /// Removes an idle audio source.
    pub fn remove_audio_source(&self, src: &Arc<AudioSourceHandle>) -> PipelineResult<()> {
        if src.state().current != CurrentState::Idle {
            return Err(PipelineError::NotIdle("audio source"));
        }
        if !self.audio.remove_source(src.core().id()) {
            return Err(PipelineError::UnknownObject);
        }
        self.inner.lock().registry.remove(&src.core().id());
        self.audio.resync();
        Ok(())
    }

    /// Starts the pipeline: spawns the control thread and re-announces
    /// every object so the control loop evaluates its target.
    pub fn start(&self) -> PipelineResult<()> {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.control.take() {
            if inner.state.state().current == CurrentState::Idle {
                // Previous incarnation has wound down; reap its thread.
                let _ = handle.join();
            } else {
                inner.control = Some(handle);
                return Err(PipelineError::AlreadyStarted);
            }
        }

        let rx = self.bus.control_receiver();
        let weak = self.weak.clone();
        let handle = std::thread::Builder::new()
            .name("prismcast-control".into())
            .spawn(move || control::run(weak, rx))
            .map_err(|err| PipelineError::ControlThread(err.to_string()))?;
        inner.control = Some(handle);

        inner.state.set_current(CurrentState::Running);
        inner.state.publish(&self.core);

        let entities: Vec<Arc<dyn Entity>> = inner.registry.values().cloned().collect();
        drop(inner);

        tracing::info!("pipeline starting");
        for entity in entities {
            entity.resync();
        }
        Ok(())
    }

    /// Requests a stop of every object. Asynchronous: the context announces
    /// idle through the notification stream once everything wound down.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if inner.state.state().current != CurrentState::Running {
            return;
        }
        inner.state.set_current(CurrentState::Stopping);
        inner.state.publish(&self.core);

        let entities: Vec<Arc<dyn Entity>> = inner.registry.values().cloned().collect();
        drop(inner);

        tracing::info!("pipeline stopping");
        for entity in entities {
            entity.set_target(TargetState::Idle);
        }
    }

    /// Stops and waits for the control thread to finish winding down.
    pub fn stop_blocking(&self) {
        self.stop();
        let handle = self.inner.lock().control.take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// The context's own state.
    pub fn state(&self) -> ObjectState {
        self.inner.lock().state.state()
    }

    /// One control-loop step: fan the notification out to the peers, then
    /// drive the originating object.
    pub(crate) fn dispatch(&self, n: &Notification) {
        let entities: Vec<Arc<dyn Entity>> = {
            let inner = self.inner.lock();
            inner.registry.values().cloned().collect()
        };

        for entity in &entities {
            if entity.object_ref().id != n.object.id {
                entity.deliver(n);
            }
        }
        if let Some(origin) = entities.iter().find(|e| e.object_ref().id == n.object.id) {
            origin.drive();
        }
    }

    /// While stopping, checks whether every object has reached idle and if
    /// so completes the context's own transition. Returns true when the
    /// control thread should exit.
    pub(crate) fn finish_stop_if_idle(&self) -> bool {
        let entities: Vec<Arc<dyn Entity>> = {
            let inner = self.inner.lock();
            if inner.state.state().current != CurrentState::Stopping {
                return false;
            }
            inner.registry.values().cloned().collect()
        };

        if !entities
            .iter()
            .all(|e| e.state().current == CurrentState::Idle)
        {
            return false;
        }

        let mut inner = self.inner.lock();
        if inner.state.state().current == CurrentState::Stopping {
            inner.state.set_current(CurrentState::Idle);
            inner.state.publish(&self.core);
            tracing::info!("pipeline idle");
            true
        } else {
            false
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let inner = self.inner.lock();
        if inner.control.is_some() && inner.state.state().current != CurrentState::Idle {
            tracing::warn!("context dropped while running; control thread will wind down on its own");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::source::test_support::ScriptedAudioSource;
    use crate::config::MemoryConfig;
    use crate::connection::test_support::{ConnEvent, RecordingConnection};
    use crate::connection::NullConnection;
    use crate::object::Flags;
    use crate::video::clock::CadenceClock;
    use std::time::{Duration, Instant};

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn pipeline_starts_audio_and_connection_then_stops_clean() {
        let ctx = Context::new();
        ctx.connection()
            .install(Box::new(NullConnection))
            .expect("idle at install");
        // No video dimensions: the video mixer stays unconfigured and idle.
        ctx.configure(&MemoryConfig::new());

        ctx.start().expect("start");
        wait_until("audio mixer running", || {
            ctx.audio().state().current == CurrentState::Running
        });
        wait_until("connection running", || {
            ctx.connection().state().current == CurrentState::Running
        });
        assert_eq!(ctx.video().state().current, CurrentState::Idle);
        assert!(!ctx.video().state().flags.contains(Flags::CONFIG_VALID));

        ctx.stop_blocking();
        assert_eq!(ctx.state().current, CurrentState::Idle);
        assert_eq!(ctx.audio().state().current, CurrentState::Idle);
        assert_eq!(ctx.connection().state().current, CurrentState::Idle);
    }

    #[test]
    fn restart_after_stop_is_supported() {
        let ctx = Context::new();
        ctx.connection()
            .install(Box::new(NullConnection))
            .expect("idle");
        ctx.configure(&MemoryConfig::new());

        ctx.start().expect("first start");
        wait_until("audio running", || {
            ctx.audio().state().current == CurrentState::Running
        });
        ctx.stop_blocking();

        ctx.start().expect("second start");
        wait_until("audio running again", || {
            ctx.audio().state().current == CurrentState::Running
        });
        ctx.stop_blocking();
    }

    #[test]
    fn double_start_is_rejected() {
        let ctx = Context::new();
        ctx.configure(&MemoryConfig::new());
        ctx.start().expect("start");
        assert!(matches!(ctx.start(), Err(PipelineError::AlreadyStarted)));
        ctx.stop_blocking();
    }

    #[test]
    fn clock_config_change_cycles_through_restart() {
        let ctx = Context::new();
        ctx.configure(&MemoryConfig::new());
        let clock = ctx
            .set_video_clock(Box::new(CadenceClock::new()))
            .expect("slot empty");

        let mut cfg = MemoryConfig::new();
        cfg.set("fps", 240).set("divisor", 1);
        clock.configure(&cfg);

        ctx.start().expect("start");
        wait_until("clock running", || {
            clock.state().current == CurrentState::Running
        });
        assert_eq!(clock.fps(), Some((240, 1)));

        // A divisor change while running must cycle the clock through idle
        // and back up at the new rate, without any further host action.
        let mut cfg = MemoryConfig::new();
        cfg.set("fps", 240).set("divisor", 2);
        clock.configure(&cfg);

        wait_until("clock restarted at the new rate", || {
            clock.state().current == CurrentState::Running && clock.fps() == Some((240, 2))
        });

        ctx.stop_blocking();
        assert_eq!(clock.state().current, CurrentState::Idle);
    }

    #[test]
    fn audio_flows_end_to_end_through_the_control_loop() {
        let ctx = Context::new();
        let (conn, events) = RecordingConnection::new();
        ctx.connection().install(Box::new(conn)).expect("idle");
        ctx.configure(&MemoryConfig::new());

        let (imp, link_slot) = ScriptedAudioSource::new();
        let src = ctx.add_audio_source(Box::new(imp));
        let mut cfg = MemoryConfig::new();
        cfg.set("volume", 1.0).set("master", true);
        src.configure(&cfg);

        ctx.start().expect("start");
        wait_until("source running", || {
            src.state().current == CurrentState::Running
        });
        wait_until("audio mixer running", || {
            ctx.audio().state().current == CurrentState::Running
        });
        wait_until("connection running", || {
            ctx.connection().state().current == CurrentState::Running
        });

        let link = link_slot.lock().clone().expect("link captured");
        for i in 0..5i64 {
            link.push(i * 100_000_000, &[0.0f32; 8820]);
        }

        wait_until("encoded audio reached the connection", || {
            events
                .lock()
                .iter()
                .any(|e| matches!(e, ConnEvent::Audio { .. }))
        });
        assert_eq!(events.lock()[0], ConnEvent::AudioConfig);

        ctx.stop_blocking();
    }

    #[test]
    fn clock_slot_replacement_requires_idle() {
        let ctx = Context::new();
        ctx.configure(&MemoryConfig::new());
        let clock = ctx
            .set_video_clock(Box::new(CadenceClock::new()))
            .expect("slot empty");
        let mut cfg = MemoryConfig::new();
        cfg.set("fps", 120);
        clock.configure(&cfg);

        ctx.start().expect("start");
        wait_until("clock running", || {
            clock.state().current == CurrentState::Running
        });

        assert!(matches!(
            ctx.set_video_clock(Box::new(CadenceClock::new())),
            Err(PipelineError::NotIdle(_))
        ));

        ctx.stop_blocking();
        ctx.set_video_clock(Box::new(CadenceClock::new()))
            .expect("idle clock can be replaced");
    }

    #[test]
    fn idle_source_can_be_removed_and_running_source_cannot() {
        let ctx = Context::new();
        let (imp, _slot) = ScriptedAudioSource::new();
        let src = ctx.add_audio_source(Box::new(imp));
        src.configure(&MemoryConfig::new());

        src.drive();
        assert_eq!(src.state().current, CurrentState::Running);
        assert!(matches!(
            ctx.remove_audio_source(&src),
            Err(PipelineError::NotIdle(_))
        ));

        src.set_target(TargetState::Idle);
        src.drive();
        ctx.remove_audio_source(&src).expect("idle source removes");
        assert!(matches!(
            ctx.remove_audio_source(&src),
            Err(PipelineError::UnknownObject)
        ));
    }

    #[tokio::test]
    async fn host_subscription_observes_lifecycle() {
        let ctx = Context::new();
        let mut events = ctx.subscribe();
        ctx.connection()
            .install(Box::new(NullConnection))
            .expect("idle");
        ctx.configure(&MemoryConfig::new());

        ctx.start().expect("start");
        wait_until("audio running", || {
            ctx.audio().state().current == CurrentState::Running
        });
        ctx.stop_blocking();

        // The stream must contain the audio mixer reaching running and the
        // context reaching idle, in per-object order.
        let mut audio_running = false;
        let mut context_idle = false;
        while let Ok(n) = events.try_recv() {
            if n.object.kind == crate::ObjectKind::AudioMixer
                && n.state.current == CurrentState::Running
            {
                audio_running = true;
            }
            if n.object.kind == crate::ObjectKind::Context
                && n.state.current == CurrentState::Idle
            {
                context_idle = true;
            }
        }
        assert!(audio_running, "audio mixer transition not observed");
        assert!(context_idle, "context idle transition not observed");
    }
}
