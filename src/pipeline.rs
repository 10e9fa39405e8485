use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::camera::CameraSource;
use crate::clock::PipelineClock;
use crate::compositor::{negotiate_output, Compositor, GridLayout};
use crate::config::Config;
use crate::error::{EngineError, ErrorRecord};
use crate::event::{EventBus, PipelineEvent};
use crate::monitor::FrameMonitor;
use crate::render::{spawn_presentation, Renderer};
use crate::tee::CaptureTee;

/// Lifecycle states of the pipeline graph. Transitions walk the ladder
/// one rung at a time in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineState {
    Null,
    Ready,
    Playing,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Null => write!(f, "Null"),
            PipelineState::Ready => write!(f, "Ready"),
            PipelineState::Playing => write!(f, "Playing"),
        }
    }
}

impl PipelineState {
    fn rank(self) -> usize {
        match self {
            PipelineState::Null => 0,
            PipelineState::Ready => 1,
            PipelineState::Playing => 2,
        }
    }
}

/// Intermediate rungs to pass through when moving `from` -> `to`,
/// inclusive of the destination.
fn ladder(from: PipelineState, to: PipelineState) -> Vec<PipelineState> {
    use PipelineState::*;
    let order = [Null, Ready, Playing];
    let (from_idx, to_idx) = (from.rank(), to.rank());

    if from_idx < to_idx {
        order[from_idx + 1..=to_idx].to_vec()
    } else if from_idx > to_idx {
        order[to_idx..from_idx].iter().rev().copied().collect()
    } else {
        Vec::new()
    }
}

/// One element of the graph that participates in state changes.
///
/// `change_state` may block while the element gets ready; the graph runs
/// the ladder on a worker thread and the watchdog bounds the total time.
pub trait Stage: Send {
    fn name(&self) -> &'static str;
    fn change_state(&mut self, target: PipelineState) -> Result<(), EngineError>;
}

/// An in-flight state change.
#[derive(Debug, Clone, Copy)]
pub struct PendingChange {
    pub id: u64,
    pub target: PipelineState,
    pub prior: PipelineState,
    pub requested_at: Instant,
}

struct StateRecord {
    current: PipelineState,
    pending: Option<PendingChange>,
}

/// The single per-process media graph: camera source, tee, compositor,
/// renderer and monitor, plus the shared clock and the state machinery.
///
/// Structure is mutated only from the control thread; the streaming
/// threads read shared handles. State changes run asynchronously: the
/// request returns immediately and the outcome arrives on the bus, so
/// control operations never block on a stuck element.
pub struct PipelineGraph {
    clock: Arc<PipelineClock>,
    tee: Arc<CaptureTee>,
    compositor: Arc<Mutex<Compositor>>,
    monitor: Arc<FrameMonitor>,
    source: Arc<Mutex<CameraSource>>,
    stages: Vec<Arc<Mutex<Box<dyn Stage>>>>,
    record: Arc<Mutex<StateRecord>>,
    change_counter: AtomicU64,
    timeout: Duration,
    bus: EventBus,
}

impl PipelineGraph {
    /// Assemble the graph around an already-negotiated camera source and
    /// a surface-bound renderer.
    pub fn build(
        config: &Config,
        source: CameraSource,
        renderer: Box<dyn Renderer>,
        monitor: Arc<FrameMonitor>,
        bus: EventBus,
    ) -> Result<Self, EngineError> {
        let format = source
            .negotiated()
            .ok_or_else(|| EngineError::ElementMissing("camera caps".into()))?;

        let layout = GridLayout::new(config.grid.cell_width, format.width, format.height);
        let caps = negotiate_output(
            &layout,
            config.output.target_fps,
            &renderer.supported_layouts(),
        )
        .map_err(|_| {
            EngineError::PipelineBuildFailed("no output format common with the renderer".into())
        })?;

        let clock = Arc::new(PipelineClock::new());
        let tee = Arc::new(CaptureTee::new(config.camera.live_queue_frames));
        let compositor = Arc::new(Mutex::new(Compositor::new(layout, caps)));
        let source = Arc::new(Mutex::new(source));

        let capture_interval = format.frame_interval().as_nanos() as u64;
        let render_interval = PipelineClock::interval_ns(caps.fps_numer, caps.fps_denom);

        let camera_stage = CameraStage {
            source: Arc::clone(&source),
            tee: Arc::clone(&tee),
            clock: Arc::clone(&clock),
            interval_ns: capture_interval,
            bus: bus.clone(),
            worker: None,
        };
        let render_stage = RenderStage {
            clock: Arc::clone(&clock),
            tee: Arc::clone(&tee),
            compositor: Arc::clone(&compositor),
            monitor: Arc::clone(&monitor),
            interval_ns: render_interval,
            bus: bus.clone(),
            renderer: Some(renderer),
            worker: None,
        };

        info!(
            capture_interval,
            render_interval, "pipeline graph assembled"
        );

        Ok(PipelineGraph {
            clock,
            tee,
            compositor,
            monitor,
            source,
            stages: vec![
                Arc::new(Mutex::new(Box::new(camera_stage) as Box<dyn Stage>)),
                Arc::new(Mutex::new(Box::new(render_stage) as Box<dyn Stage>)),
            ],
            record: Arc::new(Mutex::new(StateRecord {
                current: PipelineState::Null,
                pending: None,
            })),
            change_counter: AtomicU64::new(0),
            timeout: config.state_change_timeout(),
            bus,
        })
    }

    pub fn clock(&self) -> Arc<PipelineClock> {
        Arc::clone(&self.clock)
    }

    pub fn tee(&self) -> Arc<CaptureTee> {
        Arc::clone(&self.tee)
    }

    pub fn compositor(&self) -> Arc<Mutex<Compositor>> {
        Arc::clone(&self.compositor)
    }

    pub fn monitor(&self) -> Arc<FrameMonitor> {
        Arc::clone(&self.monitor)
    }

    pub fn source(&self) -> Arc<Mutex<CameraSource>> {
        Arc::clone(&self.source)
    }

    pub fn current_state(&self) -> PipelineState {
        self.record.lock().current
    }

    pub fn pending_change(&self) -> Option<PendingChange> {
        self.record.lock().pending
    }

    /// Append an extra stage to the ladder. Used by tests to inject
    /// misbehaving elements.
    pub fn add_stage(&mut self, stage: Box<dyn Stage>) {
        self.stages.push(Arc::new(Mutex::new(stage)));
    }

    /// Request an asynchronous transition to `target`.
    ///
    /// Returns once the request is accepted; the outcome is posted on the
    /// bus as either a pipeline StateChanged event or a classified error.
    /// Upward ladders visit stages in build order, downward ladders in
    /// reverse, so teardown mirrors initialisation.
    pub fn request_state(&self, target: PipelineState) -> Result<(), EngineError> {
        self.request_state_inner(target, false)
    }

    /// Recovery variant: drive every stage to `target` even when the
    /// graph record already claims that state. After a deadlock the
    /// record and the elements may disagree; forcing re-runs the ladder.
    pub fn request_state_forced(&self, target: PipelineState) -> Result<(), EngineError> {
        self.request_state_inner(target, true)
    }

    fn request_state_inner(&self, target: PipelineState, force: bool) -> Result<(), EngineError> {
        let (prior, id) = {
            let mut record = self.record.lock();
            if let Some(pending) = &record.pending {
                return Err(EngineError::Internal(format!(
                    "state change to {} already in progress",
                    pending.target
                )));
            }
            if record.current == target && !force {
                self.bus.post(PipelineEvent::StateChanged {
                    component: "pipeline",
                    old: target,
                    new: target,
                });
                return Ok(());
            }

            let id = self.change_counter.fetch_add(1, Ordering::SeqCst);
            record.pending = Some(PendingChange {
                id,
                target,
                prior: record.current,
                requested_at: Instant::now(),
            });
            (record.current, id)
        };

        info!(from = %prior, to = %target, id, force, "pipeline state change requested");

        let stages = self.stages.clone();
        let record = Arc::clone(&self.record);
        let bus = self.bus.clone();
        let timeout = self.timeout;
        let steps = if force && prior == target {
            vec![target]
        } else {
            ladder(prior, target)
        };

        thread::Builder::new()
            .name("state-change".into())
            .spawn(move || {
                run_state_change(stages, record, bus, timeout, prior, target, id, steps);
            })
            .map_err(|e| EngineError::Internal(format!("failed to spawn state change: {e}")))?;

        Ok(())
    }

    /// Watchdog probe: declare a deadlock when the pending change has
    /// outlived its budget. Called from the control loop's watchdog tick.
    pub fn check_deadline(&self) {
        let expired = {
            let mut record = self.record.lock();
            match &record.pending {
                Some(pending) if pending.requested_at.elapsed() > self.timeout => {
                    record.pending.take()
                }
                _ => None,
            }
        };

        if let Some(pending) = expired {
            error!(
                target = %pending.target,
                prior = %pending.prior,
                "state change exceeded its budget, declaring deadlock"
            );
            let err = EngineError::DeadlockDetected {
                target: pending.target.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            };
            self.bus.error(ErrorRecord::from_error(&err, "pipeline"));
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_state_change(
    stages: Vec<Arc<Mutex<Box<dyn Stage>>>>,
    record: Arc<Mutex<StateRecord>>,
    bus: EventBus,
    timeout: Duration,
    prior: PipelineState,
    target: PipelineState,
    id: u64,
    steps: Vec<PipelineState>,
) {
    // Stage acquisition gives up short of the watchdog deadline so a busy
    // element surfaces as a failed change, not a racing deadlock verdict.
    let deadline = Instant::now() + timeout.mul_f64(0.9);
    let upward = target > prior;

    let fail = |reason: String| {
        let mut rec = record.lock();
        let ours = matches!(&rec.pending, Some(p) if p.id == id);
        if ours {
            rec.pending = None;
        }
        drop(rec);
        if ours {
            let err = EngineError::StateChangeFailed {
                target: target.to_string(),
                reason,
            };
            bus.error(ErrorRecord::from_error(&err, "pipeline"));
        }
    };

    for step in steps {
        let ordered: Vec<_> = if upward {
            stages.iter().collect()
        } else {
            stages.iter().rev().collect()
        };

        for stage in ordered {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(mut guard) = stage.try_lock_for(remaining) else {
                fail("element busy in a previous transition".into());
                return;
            };
            let name = guard.name();
            if let Err(err) = guard.change_state(step) {
                warn!(stage = name, step = %step, error = %err, "stage refused state change");
                fail(format!("{name}: {err}"));
                return;
            }
            debug!(stage = name, step = %step, "stage reached state");
        }

        let mut rec = record.lock();
        match &rec.pending {
            Some(pending) if pending.id == id => rec.current = step,
            // The watchdog already declared this change dead; leave the
            // graph record alone and stop driving stages.
            _ => {
                warn!(step = %step, "state change superseded, abandoning ladder");
                return;
            }
        }
    }

    let mut rec = record.lock();
    if matches!(&rec.pending, Some(p) if p.id == id) {
        rec.pending = None;
        rec.current = target;
        drop(rec);
        info!(from = %prior, to = %target, "pipeline state change complete");
        bus.post(PipelineEvent::StateChanged {
            component: "pipeline",
            old: prior,
            new: target,
        });
    }
}

// ---------------------------------------------------------------------------
// Concrete stages
// ---------------------------------------------------------------------------

struct CaptureWorker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Head of the graph: paces the camera device at its negotiated cadence
/// and feeds the tee. Capture never blocks on consumers.
struct CameraStage {
    source: Arc<Mutex<CameraSource>>,
    tee: Arc<CaptureTee>,
    clock: Arc<PipelineClock>,
    interval_ns: u64,
    bus: EventBus,
    worker: Option<CaptureWorker>,
}

impl CameraStage {
    fn start(&mut self) -> Result<(), EngineError> {
        if self.worker.is_some() {
            return Ok(());
        }
        let stop = Arc::new(AtomicBool::new(false));
        let source = Arc::clone(&self.source);
        let tee = Arc::clone(&self.tee);
        let clock = Arc::clone(&self.clock);
        let bus = self.bus.clone();
        let interval_ns = self.interval_ns;
        let stop_flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                info!(interval_ns, "capture thread running");
                let mut next = clock.now() + interval_ns;
                let mut disconnected = false;

                while !stop_flag.load(Ordering::SeqCst) {
                    clock.wait_until(next);

                    let captured = source.lock().capture_frame(clock.now());
                    match captured {
                        Ok(frame) => {
                            if disconnected {
                                disconnected = false;
                                info!("camera frames resumed");
                            }
                            bus.post(PipelineEvent::FrameReady {
                                pts: frame.pts(),
                                seq: frame.seq(),
                            });
                            tee.publish(frame);
                        }
                        Err(err @ EngineError::CameraDisconnected(_)) => {
                            // Latch: one classified error per disconnect
                            // episode; the control loop drives recovery
                            // while this thread keeps polling.
                            if !disconnected {
                                disconnected = true;
                                bus.error(ErrorRecord::from_error(&err, "camera"));
                            }
                        }
                        Err(err) => {
                            bus.error(ErrorRecord::from_error(&err, "camera"));
                        }
                    }

                    next += interval_ns;
                    let now = clock.now();
                    if next < now {
                        next = now;
                    }
                }

                bus.post(PipelineEvent::Eos { component: "camera" });
            })
            .map_err(|e| EngineError::Internal(format!("failed to spawn capture: {e}")))?;

        self.worker = Some(CaptureWorker { stop, handle });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::SeqCst);
            let _ = worker.handle.join();
            info!("capture thread stopped");
        }
    }
}

impl Stage for CameraStage {
    fn name(&self) -> &'static str {
        "camera-source"
    }

    fn change_state(&mut self, target: PipelineState) -> Result<(), EngineError> {
        match target {
            PipelineState::Playing => {
                if !self.source.lock().is_connected() {
                    return Err(EngineError::CameraNotFound);
                }
                self.start()
            }
            PipelineState::Ready | PipelineState::Null => {
                self.stop();
                Ok(())
            }
        }
    }
}

struct RenderWorker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Box<dyn Renderer>>,
}

/// Tail of the graph: owns the renderer and runs the presentation thread
/// while playing. The renderer shuttles through the worker thread and
/// back so stop/start cycles reuse the same sink.
struct RenderStage {
    clock: Arc<PipelineClock>,
    tee: Arc<CaptureTee>,
    compositor: Arc<Mutex<Compositor>>,
    monitor: Arc<FrameMonitor>,
    interval_ns: u64,
    bus: EventBus,
    renderer: Option<Box<dyn Renderer>>,
    worker: Option<RenderWorker>,
}

impl RenderStage {
    fn start(&mut self) -> Result<(), EngineError> {
        if self.worker.is_some() {
            return Ok(());
        }
        let renderer = self
            .renderer
            .take()
            .ok_or_else(|| EngineError::ElementMissing("renderer".into()))?;

        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn_presentation(
            Arc::clone(&self.clock),
            self.interval_ns,
            Arc::clone(&self.tee),
            Arc::clone(&self.compositor),
            Arc::clone(&self.monitor),
            renderer,
            Arc::clone(&stop),
            self.bus.clone(),
        )
        .map_err(|e| EngineError::Internal(format!("failed to spawn presentation: {e}")))?;

        self.worker = Some(RenderWorker { stop, handle });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::SeqCst);
            if let Ok(renderer) = worker.handle.join() {
                self.renderer = Some(renderer);
            }
        }
    }
}

impl Stage for RenderStage {
    fn name(&self) -> &'static str {
        "renderer-sink"
    }

    fn change_state(&mut self, target: PipelineState) -> Result<(), EngineError> {
        match target {
            PipelineState::Playing => self.start(),
            PipelineState::Ready | PipelineState::Null => {
                self.stop();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipelineState::*;

    #[test]
    fn ladder_steps_one_rung_at_a_time() {
        assert_eq!(ladder(Null, Playing), vec![Ready, Playing]);
        assert_eq!(ladder(Playing, Null), vec![Ready, Null]);
        assert_eq!(ladder(Ready, Playing), vec![Playing]);
        assert_eq!(ladder(Playing, Ready), vec![Ready]);
        assert!(ladder(Ready, Ready).is_empty());
    }

    #[test]
    fn state_ordering_matches_ladder_direction() {
        assert!(Null < Ready);
        assert!(Ready < Playing);
    }
}
