//! Guided capture session - explicit state machine
//!
//! `Idle -> Countdown(n) -> Capturing -> (Advancing -> Countdown(n)) | Complete`,
//! with `Aborted` reachable from every non-terminal phase.
//!
//! The controller owns exactly one timer. The surrounding event loop asks for
//! `next_deadline()` and calls `tick(now_ms)` once it has passed; nothing in
//! here sleeps. Cancelling means dropping the single pending timer, so a tick
//! can never fire after `abort()`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::camera::{Camera, ImageData, StreamHandle};
use crate::stage::SlotRect;
use crate::templates::{validate_template, LayoutError, PhotoSlot, SlotId, Template};

/// Captured frames keyed by slot id.
pub type PhotoSet = HashMap<SlotId, ImageData>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Template has no photo slots")]
    EmptySlotList,

    #[error("Template is not capture-ready: {0}")]
    InvalidLayout(#[from] LayoutError),

    #[error("Camera unavailable: {0}")]
    CameraUnavailable(String),

    #[error("No frame captured for slot {slot_id} after {attempts} attempts")]
    CaptureMiss { slot_id: SlotId, attempts: u32 },

    #[error("Session already started")]
    AlreadyStarted,

    #[error("Session aborted")]
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionTiming {
    #[serde(default = "default_countdown_from")]
    pub countdown_from: u8,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_advance_delay_ms")]
    pub advance_delay_ms: u64,
    #[serde(default = "default_finish_delay_ms")]
    pub finish_delay_ms: u64,
    #[serde(default = "default_flash_ms")]
    pub flash_ms: u64,
    /// Extra countdown cycles granted to a slot after a missed frame. A slot
    /// gets `max_capture_retries + 1` capture attempts in total; the miss after
    /// the last retry aborts the session, and the reported `attempts` counts
    /// every miss including that one (4 with the default of 3).
    #[serde(default = "default_max_capture_retries")]
    pub max_capture_retries: u32,
}

fn default_countdown_from() -> u8 { 3 }
fn default_tick_ms() -> u64 { 1000 }
fn default_advance_delay_ms() -> u64 { 800 }
fn default_finish_delay_ms() -> u64 { 500 }
fn default_flash_ms() -> u64 { 200 }
fn default_max_capture_retries() -> u32 { 3 }

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            countdown_from: default_countdown_from(),
            tick_ms: default_tick_ms(),
            advance_delay_ms: default_advance_delay_ms(),
            finish_delay_ms: default_finish_delay_ms(),
            flash_ms: default_flash_ms(),
            max_capture_retries: default_max_capture_retries(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Countdown(u8),
    Capturing,
    Advancing,
    Complete,
    Aborted,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Aborted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    Operator,
    CaptureRetriesExhausted { slot_id: SlotId, attempts: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Countdown { slot_index: usize, remaining: u8 },
    Flash { slot_id: SlotId, duration_ms: u64 },
    Captured { slot_id: SlotId, sequence: u32 },
    CaptureMissed { slot_id: SlotId, attempt: u32 },
    Advanced { slot_index: usize },
    Completed(PhotoSet),
    Aborted(AbortReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerAction {
    CountdownTick,
    Capture,
    Advance,
    Finish,
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    id: TimerId,
    due_ms: u64,
    action: TimerAction,
}

pub struct CaptureSession<C: Camera> {
    template: Template,
    order: Vec<PhotoSlot>,
    timing: SessionTiming,
    camera: C,
    stream: Option<StreamHandle>,
    phase: Phase,
    current_index: usize,
    photos: PhotoSet,
    timer: Option<Timer>,
    timers_armed: u64,
    misses: u32,
    flash_until: Option<u64>,
    abort_reason: Option<AbortReason>,
}

impl<C: Camera> CaptureSession<C> {
    pub fn new(template: Template, camera: C, timing: SessionTiming) -> Self {
        let order = template.slots_in_capture_order().into_iter().cloned().collect();
        Self {
            template,
            order,
            timing,
            camera,
            stream: None,
            phase: Phase::Idle,
            current_index: 0,
            photos: PhotoSet::new(),
            timer: None,
            timers_armed: 0,
            misses: 0,
            flash_until: None,
            abort_reason: None,
        }
    }

    /// Acquire the camera and enter the first countdown.
    pub fn start(&mut self, now_ms: u64) -> Result<Vec<SessionEvent>, SessionError> {
        if self.phase != Phase::Idle {
            return Err(SessionError::AlreadyStarted);
        }
        if self.order.is_empty() {
            log::warn!("refusing to start session for '{}': no slots", self.template.name);
            return Err(SessionError::EmptySlotList);
        }
        validate_template(&self.template)?;

        let handle = self.camera.start_stream().map_err(|e| {
            log::error!("camera failed to start for '{}': {}", self.template.name, e);
            SessionError::CameraUnavailable(e.to_string())
        })?;
        self.stream = Some(handle);
        self.current_index = 0;
        log::info!(
            "session started for '{}' with {} slots",
            self.template.name,
            self.order.len()
        );

        let mut events = vec![];
        self.enter_countdown(now_ms, &mut events);
        Ok(events)
    }

    /// Fire every timer due at or before `now_ms`.
    pub fn tick(&mut self, now_ms: u64) -> Vec<SessionEvent> {
        let mut events = vec![];
        while let Some(timer) = self.timer {
            if timer.due_ms > now_ms {
                break;
            }
            self.timer = None;
            self.fire(timer, &mut events);
        }
        events
    }

    /// Cancel the session. Returns `false` if it had already ended.
    pub fn abort(&mut self) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        self.finish_aborted(AbortReason::Operator);
        true
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn slot_count(&self) -> usize {
        self.order.len()
    }

    pub fn active_slot(&self) -> Option<&PhotoSlot> {
        if self.phase.is_terminal() {
            return None;
        }
        self.order.get(self.current_index)
    }

    pub fn countdown(&self) -> Option<u8> {
        match self.phase {
            Phase::Countdown(n) => Some(n),
            _ => None,
        }
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.timer.map(|t| t.due_ms)
    }

    pub fn pending_timer(&self) -> Option<TimerId> {
        self.timer.map(|t| t.id)
    }

    /// Photos captured so far; emptied when handed off or discarded.
    pub fn photos(&self) -> &PhotoSet {
        &self.photos
    }

    pub fn is_flashing(&self, now_ms: u64) -> bool {
        self.flash_until.map_or(false, |until| now_ms < until)
    }

    pub fn abort_reason(&self) -> Option<&AbortReason> {
        self.abort_reason.as_ref()
    }

    /// Where the single live camera view sits, in template space.
    pub fn camera_placement(&self) -> Option<SlotRect> {
        self.active_slot().map(SlotRect::from)
    }

    pub fn camera(&self) -> &C {
        &self.camera
    }

    fn arm(&mut self, due_ms: u64, action: TimerAction) {
        self.timers_armed += 1;
        self.timer = Some(Timer {
            id: TimerId(self.timers_armed),
            due_ms,
            action,
        });
    }

    fn fire(&mut self, timer: Timer, events: &mut Vec<SessionEvent>) {
        let at = timer.due_ms;
        match (timer.action, self.phase) {
            (TimerAction::CountdownTick, Phase::Countdown(n)) if n > 0 => {
                let remaining = n - 1;
                self.phase = Phase::Countdown(remaining);
                log::debug!("slot {} countdown {}", self.current_index + 1, remaining);
                events.push(SessionEvent::Countdown {
                    slot_index: self.current_index,
                    remaining,
                });
                if remaining == 0 {
                    self.capture(at, events);
                } else {
                    self.arm(at + self.timing.tick_ms, TimerAction::CountdownTick);
                }
            }
            (TimerAction::Capture, Phase::Countdown(0)) => self.capture(at, events),
            (TimerAction::Advance, Phase::Advancing) => {
                self.current_index += 1;
                self.misses = 0;
                events.push(SessionEvent::Advanced {
                    slot_index: self.current_index,
                });
                self.enter_countdown(at, events);
            }
            (TimerAction::Finish, Phase::Advancing) => {
                self.phase = Phase::Complete;
                self.release_camera();
                let photos = std::mem::take(&mut self.photos);
                log::info!(
                    "session for '{}' complete with {} photos",
                    self.template.name,
                    photos.len()
                );
                events.push(SessionEvent::Completed(photos));
            }
            (action, phase) => {
                log::warn!("dropping stale {:?} timer in phase {:?}", action, phase);
            }
        }
    }

    fn enter_countdown(&mut self, at: u64, events: &mut Vec<SessionEvent>) {
        let from = self.timing.countdown_from;
        self.phase = Phase::Countdown(from);
        events.push(SessionEvent::Countdown {
            slot_index: self.current_index,
            remaining: from,
        });
        if from == 0 {
            self.capture(at, events);
        } else {
            self.arm(at + self.timing.tick_ms, TimerAction::CountdownTick);
        }
    }

    fn capture(&mut self, at: u64, events: &mut Vec<SessionEvent>) {
        self.phase = Phase::Capturing;
        let slot = match self.order.get(self.current_index) {
            Some(slot) => slot.clone(),
            None => return,
        };

        let frame = match self.stream.as_ref() {
            Some(handle) => self.camera.capture_frame(handle),
            None => None,
        };

        match frame {
            Some(frame) => {
                self.photos.insert(slot.id.clone(), frame);
                self.misses = 0;
                self.flash_until = Some(at + self.timing.flash_ms);
                log::info!("captured slot {} ({})", slot.sequence, slot.id);
                events.push(SessionEvent::Flash {
                    slot_id: slot.id.clone(),
                    duration_ms: self.timing.flash_ms,
                });
                events.push(SessionEvent::Captured {
                    slot_id: slot.id,
                    sequence: slot.sequence,
                });

                self.phase = Phase::Advancing;
                if self.current_index + 1 < self.order.len() {
                    self.arm(at + self.timing.advance_delay_ms, TimerAction::Advance);
                } else {
                    self.arm(at + self.timing.finish_delay_ms, TimerAction::Finish);
                }
            }
            None => {
                self.misses += 1;
                log::warn!(
                    "no frame for slot {} ({}), attempt {}",
                    slot.sequence,
                    slot.id,
                    self.misses
                );
                events.push(SessionEvent::CaptureMissed {
                    slot_id: slot.id.clone(),
                    attempt: self.misses,
                });
                if self.misses > self.timing.max_capture_retries {
                    let reason = AbortReason::CaptureRetriesExhausted {
                        slot_id: slot.id,
                        attempts: self.misses,
                    };
                    self.finish_aborted(reason.clone());
                    events.push(SessionEvent::Aborted(reason));
                } else if self.timing.countdown_from == 0 {
                    // nothing paces the retry; wait a tick before asking again
                    self.phase = Phase::Countdown(0);
                    events.push(SessionEvent::Countdown {
                        slot_index: self.current_index,
                        remaining: 0,
                    });
                    self.arm(at + self.timing.tick_ms.max(1), TimerAction::Capture);
                } else {
                    self.enter_countdown(at, events);
                }
            }
        }
    }

    fn finish_aborted(&mut self, reason: AbortReason) {
        self.timer = None;
        self.release_camera();
        let discarded = self.photos.len();
        self.photos.clear();
        self.phase = Phase::Aborted;
        log::info!(
            "session for '{}' aborted ({:?}), discarded {} photos",
            self.template.name,
            reason,
            discarded
        );
        self.abort_reason = Some(reason);
    }

    fn release_camera(&mut self) {
        if let Some(handle) = self.stream.take() {
            self.camera.stop_stream(handle);
            log::debug!("camera stream released");
        }
    }
}

impl<C: Camera> Drop for CaptureSession<C> {
    fn drop(&mut self) {
        self.timer = None;
        self.release_camera();
    }
}

/// Time source for the blocking driver.
pub trait Clock {
    fn now_ms(&self) -> u64;
    fn sleep_until(&self, deadline_ms: u64);
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn sleep_until(&self, deadline_ms: u64) {
        let now = self.now_ms();
        if deadline_ms > now {
            std::thread::sleep(Duration::from_millis(deadline_ms - now));
        }
    }
}

/// Drive a session on the current thread until it completes or aborts.
///
/// `cancel` is polled before every wait; returning `true` aborts the run.
pub fn run_to_end<C, K>(
    session: &mut CaptureSession<C>,
    clock: &K,
    mut cancel: impl FnMut() -> bool,
    mut on_event: impl FnMut(&SessionEvent),
) -> Result<PhotoSet, SessionError>
where
    C: Camera,
    K: Clock,
{
    if session.phase() == Phase::Idle {
        for event in session.start(clock.now_ms())? {
            on_event(&event);
        }
    }

    while let Some(deadline) = session.next_deadline() {
        if cancel() {
            session.abort();
            on_event(&SessionEvent::Aborted(AbortReason::Operator));
            return Err(SessionError::Aborted);
        }
        clock.sleep_until(deadline);
        for event in session.tick(clock.now_ms()) {
            on_event(&event);
            match event {
                SessionEvent::Completed(photos) => return Ok(photos),
                SessionEvent::Aborted(AbortReason::CaptureRetriesExhausted { slot_id, attempts }) => {
                    return Err(SessionError::CaptureMiss { slot_id, attempts });
                }
                _ => {}
            }
        }
    }

    Err(SessionError::Aborted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::QueuedCamera;
    use crate::templates::BackgroundImage;
    use std::cell::Cell;

    struct ManualClock {
        now: Cell<u64>,
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> u64 {
            self.now.get()
        }

        fn sleep_until(&self, deadline_ms: u64) {
            if deadline_ms > self.now.get() {
                self.now.set(deadline_ms);
            }
        }
    }

    fn template(ys: &[i32]) -> Template {
        Template {
            id: "t".into(),
            name: "Strip".into(),
            created_at: chrono::Utc::now(),
            schema_version: crate::SCHEMA_VERSION.into(),
            width: 576,
            height: 800,
            background: BackgroundImage::Url("bg.jpg".into()),
            slots: ys
                .iter()
                .enumerate()
                .map(|(i, &y)| PhotoSlot {
                    id: format!("slot-{}", i + 1),
                    sequence: i as u32 + 1,
                    x: 20,
                    y,
                    width: 200,
                    height: 150,
                    rotation: 0,
                })
                .collect(),
        }
    }

    fn frame(tag: u8) -> Option<ImageData> {
        Some(ImageData(vec![tag]))
    }

    #[test]
    fn test_countdown_ticks_once_per_second() {
        let cam = QueuedCamera::new(vec![frame(1)]);
        let mut session = CaptureSession::new(template(&[10]), cam, SessionTiming::default());
        let events = session.start(0).unwrap();
        assert_eq!(events, vec![SessionEvent::Countdown { slot_index: 0, remaining: 3 }]);
        assert_eq!(session.next_deadline(), Some(1000));

        assert!(session.tick(999).is_empty());
        assert_eq!(session.tick(1000), vec![SessionEvent::Countdown { slot_index: 0, remaining: 2 }]);
        assert_eq!(session.countdown(), Some(2));
        session.tick(2000);
        assert_eq!(session.countdown(), Some(1));

        let events = session.tick(3000);
        assert!(events.contains(&SessionEvent::Captured { slot_id: "slot-1".into(), sequence: 1 }));
        assert_eq!(session.phase(), Phase::Advancing);
        assert!(session.is_flashing(3100));
        assert!(!session.is_flashing(3200));
        assert_eq!(session.next_deadline(), Some(3500));
    }

    #[test]
    fn test_full_run_advances_and_completes() {
        let cam = QueuedCamera::new(vec![frame(1), frame(2)]);
        let mut session = CaptureSession::new(template(&[10, 300]), cam, SessionTiming::default());
        session.start(0).unwrap();

        let events = session.tick(3000);
        assert!(matches!(events.last(), Some(SessionEvent::Captured { .. })));
        assert_eq!(session.next_deadline(), Some(3800));

        let events = session.tick(3800);
        assert_eq!(events[0], SessionEvent::Advanced { slot_index: 1 });
        assert_eq!(session.camera_placement().unwrap().y, 300.0);

        session.tick(6800);
        assert_eq!(session.next_deadline(), Some(7300));
        let events = session.tick(7300);
        match events.as_slice() {
            [SessionEvent::Completed(photos)] => {
                assert_eq!(photos.len(), 2);
                assert_eq!(photos["slot-2"], ImageData(vec![2]));
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert_eq!(session.phase(), Phase::Complete);
        assert_eq!(session.camera().stop_count(), 1);
        assert!(session.active_slot().is_none());
    }

    #[test]
    fn test_abort_cancels_pending_timer() {
        let cam = QueuedCamera::new(vec![frame(1)]);
        let mut session = CaptureSession::new(template(&[10]), cam, SessionTiming::default());
        session.start(0).unwrap();
        session.tick(1000);

        assert!(session.abort());
        assert_eq!(session.phase(), Phase::Aborted);
        assert_eq!(session.next_deadline(), None);
        assert!(session.tick(60_000).is_empty());
        assert!(!session.abort());
        assert_eq!(session.camera().stop_count(), 1);
        assert_eq!(session.abort_reason(), Some(&AbortReason::Operator));
    }

    #[test]
    fn test_missed_frame_retries_same_slot() {
        let cam = QueuedCamera::new(vec![None, frame(7)]);
        let mut session = CaptureSession::new(template(&[10]), cam, SessionTiming::default());
        session.start(0).unwrap();

        let events = session.tick(3000);
        assert!(events.contains(&SessionEvent::CaptureMissed { slot_id: "slot-1".into(), attempt: 1 }));
        assert_eq!(session.countdown(), Some(3));
        assert_eq!(session.current_index(), 0);

        let events = session.tick(6000);
        assert!(events.iter().any(|e| matches!(e, SessionEvent::Captured { .. })));
    }

    #[test]
    fn test_retry_budget_exhaustion_aborts() {
        let timing = SessionTiming { max_capture_retries: 1, ..SessionTiming::default() };
        let cam = QueuedCamera::new(vec![None, None, frame(1)]);
        let mut session = CaptureSession::new(template(&[10]), cam, timing);
        session.start(0).unwrap();

        session.tick(3000);
        let events = session.tick(6000);
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Aborted(AbortReason::CaptureRetriesExhausted { attempts: 2, .. }))
        ));
        assert_eq!(session.phase(), Phase::Aborted);
        assert_eq!(session.camera().stop_count(), 1);
    }

    #[test]
    fn test_zero_countdown_paces_retries_with_timer() {
        let timing = SessionTiming { countdown_from: 0, max_capture_retries: 2_000_000, ..SessionTiming::default() };
        let mut session = CaptureSession::new(template(&[10]), QueuedCamera::new(vec![]), timing);

        let events = session.start(0).unwrap();
        let misses = events.iter().filter(|e| matches!(e, SessionEvent::CaptureMissed { .. })).count();
        assert_eq!(misses, 1);
        assert_eq!(session.phase(), Phase::Countdown(0));
        assert_eq!(session.next_deadline(), Some(1000));

        let events = session.tick(3000);
        assert_eq!(
            events.iter().filter(|e| matches!(e, SessionEvent::CaptureMissed { .. })).count(),
            3
        );
        assert_eq!(session.next_deadline(), Some(4000));
        assert!(session.abort());
    }

    #[test]
    fn test_zero_countdown_retry_captures_late_frame() {
        let timing = SessionTiming { countdown_from: 0, ..SessionTiming::default() };
        let cam = QueuedCamera::new(vec![None, frame(5)]);
        let mut session = CaptureSession::new(template(&[10]), cam, timing);
        session.start(0).unwrap();

        let events = session.tick(1000);
        assert!(events.contains(&SessionEvent::Captured { slot_id: "slot-1".into(), sequence: 1 }));
        assert_eq!(session.phase(), Phase::Advancing);
    }

    #[test]
    fn test_empty_template_never_touches_camera() {
        let mut session = CaptureSession::new(template(&[]), QueuedCamera::new(vec![]), SessionTiming::default());
        assert_eq!(session.start(0), Err(SessionError::EmptySlotList));
        assert_eq!(session.phase(), Phase::Idle);
        assert_eq!(session.camera().start_count(), 0);
    }

    #[test]
    fn test_camera_failure_surfaces() {
        let mut session = CaptureSession::new(template(&[10]), QueuedCamera::unavailable(), SessionTiming::default());
        assert!(matches!(session.start(0), Err(SessionError::CameraUnavailable(_))));
        assert_eq!(session.next_deadline(), None);
    }

    #[test]
    fn test_capture_order_follows_sequence() {
        let mut t = template(&[10, 300]);
        t.slots.reverse();
        let cam = QueuedCamera::new(vec![frame(1), frame(2)]);
        let mut session = CaptureSession::new(t, cam, SessionTiming::default());
        session.start(0).unwrap();
        assert_eq!(session.active_slot().unwrap().id, "slot-1");
    }

    #[test]
    fn test_run_to_end_with_manual_clock() {
        let cam = QueuedCamera::new(vec![frame(1), frame(2), frame(3)]);
        let mut session = CaptureSession::new(template(&[10, 200, 400]), cam, SessionTiming::default());
        let clock = ManualClock { now: Cell::new(0) };
        let mut flashes = 0;
        let photos = run_to_end(&mut session, &clock, || false, |e| {
            if matches!(e, SessionEvent::Flash { .. }) {
                flashes += 1;
            }
        })
        .unwrap();
        assert_eq!(photos.len(), 3);
        assert_eq!(flashes, 3);
        // 3 countdowns of 3s, two 800ms advances, one 500ms finish
        assert_eq!(clock.now_ms(), 9000 + 1600 + 500);
    }

    #[test]
    fn test_run_to_end_cancel_discards_photos() {
        let cam = QueuedCamera::new(vec![frame(1), frame(2)]);
        let mut session = CaptureSession::new(template(&[10, 200]), cam, SessionTiming::default());
        let clock = ManualClock { now: Cell::new(0) };
        let mut polls = 0;
        let mut completed = false;
        let result = run_to_end(
            &mut session,
            &clock,
            || {
                polls += 1;
                polls > 4
            },
            |e| completed |= matches!(e, SessionEvent::Completed(_)),
        );
        assert_eq!(result, Err(SessionError::Aborted));
        assert!(!completed);
        assert!(session.photos().is_empty());
    }
}
