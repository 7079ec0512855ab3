//! Video clock entities and the bundled cadence clock.
//!
//! The clock owns the thread every video tick runs on. The entity holds the
//! object state and the reported rate; the plugin's thread drives the mixer
//! through its [`ClockLink`] without ever holding the clock's own lock
//! across a tick, so tick delivery and state changes cannot deadlock.

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::bus::{BusSender, Notification};
use crate::config::Config;
use crate::lock_order::{OrderedMutex, RANK_ELEMENT};
use crate::object::{
    plan, CurrentState, DriveAction, Entity, Flags, ObjectCore, ObjectRef, ObjectState, StateCell,
    TargetState,
};
use crate::plugin::{apply_config_status, apply_stop, ClockStart, ConfigStatus, VideoClock};
use crate::timebase::{TimeBase, Ticks};
use crate::tuning::DEFAULT_CLOCK_FPS;
use crate::video::mixer::VideoMixer;

/// Handle given to clock implementations: tick delivery, host time access
/// and the asynchronous transition announcements.
#[derive(Clone)]
pub struct ClockLink {
    entity: Weak<VideoClockHandle>,
}

impl ClockLink {
    /// Delivers one tick to the video mixer. Call from the clock thread
    /// with no clock-side locks held.
    pub fn tick(&self, host_time: Ticks) {
        if let Some(entity) = self.entity.upgrade() {
            entity.mixer.tick(host_time);
        }
    }

    /// Current host time in ticks.
    pub fn now_ticks(&self) -> Option<Ticks> {
        self.entity
            .upgrade()
            .map(|entity| entity.timebase.now_ticks())
    }

    /// Confirms a pending start, reporting the delivered rate.
    pub fn announce_running(&self, fps_num: u32, fps_den: u32) {
        if let Some(entity) = self.entity.upgrade() {
            entity.announce_running(fps_num, fps_den);
        }
    }

    /// Announces the clock idle, optionally because of a failure.
    pub fn announce_idle(&self, error: bool) {
        if let Some(entity) = self.entity.upgrade() {
            entity.announce_idle(error);
        }
    }

    /// Snapshot of the clock's state, for the thread's stop checks.
    pub fn snapshot(&self) -> Option<ObjectState> {
        self.entity.upgrade().map(|entity| entity.state())
    }
}

struct ClockInner {
    state: StateCell,
    /// Reported rate as a fraction, set by the time the clock runs.
    fps: Option<(u32, u32)>,
    imp: Box<dyn VideoClock>,
}

/// The video clock slot of a context.
pub struct VideoClockHandle {
    core: ObjectCore,
    weak: Weak<VideoClockHandle>,
    mixer: Arc<VideoMixer>,
    timebase: Arc<TimeBase>,
    inner: OrderedMutex<ClockInner>,
}

impl VideoClockHandle {
    pub(crate) fn new(
        bus: BusSender,
        mixer: Arc<VideoMixer>,
        timebase: Arc<TimeBase>,
        imp: Box<dyn VideoClock>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            core: ObjectCore::new(crate::ObjectKind::VideoClock, bus),
            weak: weak.clone(),
            mixer,
            timebase,
            inner: OrderedMutex::new(
                RANK_ELEMENT,
                ClockInner {
                    state: StateCell::with_flags(Flags::CAN_START),
                    fps: None,
                    imp,
                },
            ),
        })
    }

    pub fn core(&self) -> &ObjectCore {
        &self.core
    }

    pub fn configure(&self, cfg: &dyn Config) {
        let mut inner = self.inner.lock();
        let status = inner.imp.configure(cfg);
        let ClockInner { state, .. } = &mut *inner;
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

    /// The reported rate fraction, available once running.
    pub fn fps(&self) -> Option<(u32, u32)> {
        self.inner.lock().fps
    }

    fn announce_running(&self, fps_num: u32, fps_den: u32) {
        let mut inner = self.inner.lock();
        if inner.state.state().current == CurrentState::Starting {
            inner.fps = Some((fps_num, fps_den));
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
}

impl Entity for VideoClockHandle {
    fn object_ref(&self) -> ObjectRef {
        self.core.object_ref()
    }

    fn state(&self) -> ObjectState {
        VideoClockHandle::state(self)
    }

    fn set_target(&self, target: TargetState) {
        VideoClockHandle::set_target(self, target)
    }

    fn resync(&self) {
        VideoClockHandle::resync(self)
    }

    fn deliver(&self, n: &Notification) {
        let mut inner = self.inner.lock();
        let can_start = inner.imp.peer_changed(n);
        let ClockInner { state, .. } = &mut *inner;
        state.set_flag(Flags::CAN_START, can_start);
        state.publish(&self.core);
    }

    fn drive(&self) {
        let link = ClockLink {
            entity: self.weak.clone(),
        };
        let mut inner = self.inner.lock();
        match plan(&inner.state.state()) {
            DriveAction::Start => {
                let ClockInner { state, fps, imp } = &mut *inner;
                match imp.start(link) {
                    ClockStart::Running { fps_num, fps_den } => {
                        *fps = Some((fps_num, fps_den));
                        state.set_current(CurrentState::Running);
                        state.publish(&self.core);
                    }
                    ClockStart::Starting => {
                        state.set_current(CurrentState::Starting);
                        state.publish(&self.core);
                    }
                    ClockStart::Failed => state.fail_idle(&self.core),
                }
            }
            DriveAction::Stop => {
                let ClockInner { state, imp, .. } = &mut *inner;
                let disposition = imp.stop();
                apply_stop(state, &self.core, disposition);
            }
            DriveAction::FlipRestart => inner.state.set_target(&self.core, TargetState::Running),
            DriveAction::None => {}
        }
    }
}

/// Tick admission by divisor: of every `divisor` consecutive ticks, the
/// first is admitted and the rest are skipped.
pub(crate) struct TickDivider {
    divisor: u32,
    counter: u32,
}

impl TickDivider {
    pub(crate) fn new(divisor: u32) -> Self {
        Self {
            divisor: divisor.max(1),
            counter: 0,
        }
    }

    pub(crate) fn admit(&mut self) -> bool {
        if self.counter >= self.divisor {
            self.counter = 0;
        }
        let admit = self.counter == 0;
        self.counter += 1;
        admit
    }
}

/// The bundled video clock: a metronome thread at a configured rate.
///
/// `fps` sets the base rate and `divisor` skips ticks, so the delivered
/// rate is `fps / divisor` and the reported fraction is `fps / divisor`
/// exactly as delivered. Both keys take effect on the next start.
pub struct CadenceClock {
    cfg_fps: u32,
    cfg_divisor: u32,
    fps: u32,
    divisor: u32,
    worker: Option<JoinHandle<()>>,
}

impl CadenceClock {
    pub fn new() -> Self {
        Self {
            cfg_fps: DEFAULT_CLOCK_FPS,
            cfg_divisor: 1,
            fps: 0,
            divisor: 0,
            worker: None,
        }
    }

    fn run(link: ClockLink, fps: u32, divisor: u32) {
        link.announce_running(fps, divisor);
        let period = Duration::from_secs_f64(1.0 / f64::from(fps));
        let mut divider = TickDivider::new(divisor);
        let mut next = Instant::now() + period;

        loop {
            match link.snapshot() {
                Some(state) if state.current == CurrentState::Running => {}
                Some(state) if state.current == CurrentState::Stopping => break,
                _ => return,
            }

            let now = Instant::now();
            if let Some(wait) = next.checked_duration_since(now) {
                std::thread::sleep(wait);
            } else if now.duration_since(next) > Duration::from_secs(1) {
                // Fell far behind (suspend, debugger); resynchronize rather
                // than bursting a backlog of ticks.
                next = now;
            }

            if divider.admit() {
                let host_time = link.now_ticks().unwrap_or_default();
                link.tick(host_time);
            }
            next += period;
        }

        link.announce_idle(false);
    }
}

impl Default for CadenceClock {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoClock for CadenceClock {
    fn configure(&mut self, cfg: &dyn Config) -> ConfigStatus {
        let fps = cfg.get_uint32("fps").unwrap_or(DEFAULT_CLOCK_FPS);
        let divisor = cfg.get_int("divisor").unwrap_or(1);

        if fps == 0 || fps > 1000 {
            log::error!("[Clock] Unusable frame rate {fps}");
            return ConfigStatus::Invalid;
        }
        if divisor < 1 || divisor > i64::from(fps) {
            log::error!("[Clock] Unusable divisor {divisor}");
            return ConfigStatus::Invalid;
        }

        self.cfg_fps = fps;
        self.cfg_divisor = divisor as u32;

        let active = self.worker.is_some();
        if active && (self.cfg_fps != self.fps || self.cfg_divisor != self.divisor) {
            ConfigStatus::restart_required()
        } else {
            ConfigStatus::ok()
        }
    }

    fn start(&mut self, link: ClockLink) -> ClockStart {
        // Reap the previous incarnation's thread; it has already announced
        // idle by the time a new start can be planned.
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        self.fps = self.cfg_fps;
        self.divisor = self.cfg_divisor;
        let (fps, divisor) = (self.fps, self.divisor);

        match std::thread::Builder::new()
            .name("prismcast-clock".into())
            .spawn(move || Self::run(link, fps, divisor))
        {
            Ok(worker) => {
                self.worker = Some(worker);
                ClockStart::Starting
            }
            Err(err) => {
                log::error!("[Clock] Failed to spawn clock thread: {err}");
                ClockStart::Failed
            }
        }
    }

    fn stop(&mut self) -> crate::plugin::StopDisposition {
        // The thread observes the stopping state, drains and announces idle.
        crate::plugin::StopDisposition::Stopping
    }
}
