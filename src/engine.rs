use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::budget::MemoryBudget;
use crate::camera::{request_permission, CameraDevice, CameraSource, PermissionService};
use crate::cell::{transition, CellAction, CellEvent, CellId, CellPhase, KeyEvent};
use crate::config::Config;
use crate::error::{
    EngineError, ErrorCategory, ErrorRecord, ErrorSink, LastError, LoggingErrorSink,
};
use crate::event::{EventBus, PipelineEvent};
use crate::monitor::FrameMonitor;
use crate::pipeline::{PipelineGraph, PipelineState, Stage};
use crate::playback::PlaybackBin;
use crate::record::{RecordBin, RingBuffer};
use crate::render::{OffscreenRenderer, Renderer, SurfaceHandle};

/// Everything the engine needs from the host: capture device, permission
/// prompt, sink for composited frames, the window surface and the error
/// sink. Production and tests differ only in what they plug in here.
pub struct EngineDeps {
    pub camera: Box<dyn CameraDevice>,
    pub permission: Arc<dyn PermissionService>,
    pub renderer: Box<dyn Renderer>,
    pub surface: SurfaceHandle,
    pub error_sink: Arc<dyn ErrorSink>,
}

impl EngineDeps {
    /// Synthetic camera + offscreen renderer, permission always granted.
    pub fn headless() -> Self {
        EngineDeps {
            camera: Box::new(crate::camera::synthetic::SyntheticCamera::new()),
            permission: Arc::new(crate::camera::AlwaysGranted),
            renderer: Box::new(OffscreenRenderer::new()),
            surface: SurfaceHandle::new(1),
            error_sink: Arc::new(LoggingErrorSink),
        }
    }
}

/// Commands accepted by the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlCommand {
    Key(KeyEvent),
    Shutdown,
}

/// Handle for feeding key events and shutdown into a running engine.
/// This is the whole key-input interface: whatever reads the keyboard
/// (or a test script) pushes events here.
#[derive(Clone)]
pub struct Controller {
    tx: mpsc::UnboundedSender<ControlCommand>,
}

impl Controller {
    pub fn key_down(&self, key: u8) {
        let _ = self.tx.send(ControlCommand::Key(KeyEvent::Down(key)));
    }

    pub fn key_up(&self, key: u8) {
        let _ = self.tx.send(ControlCommand::Key(KeyEvent::Up(key)));
    }

    pub fn key(&self, event: KeyEvent) {
        let _ = self.tx.send(ControlCommand::Key(event));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(ControlCommand::Shutdown);
    }
}

/// Per-cell runtime record. The control loop is the only writer.
struct CellEntry {
    phase: CellPhase,
    generation: u64,
    record: Option<RecordBin>,
    playback: Option<Arc<PlaybackBin>>,
    buffer: Option<Arc<RingBuffer>>,
}

impl CellEntry {
    fn new() -> Self {
        CellEntry {
            phase: CellPhase::Empty,
            generation: 0,
            record: None,
            playback: None,
            buffer: None,
        }
    }
}

type CellTable = Vec<CellEntry>;

fn cell_index(cell: CellId) -> usize {
    cell.index() as usize - 2
}

/// Cloneable observation surface of a running engine.
#[derive(Clone)]
pub struct EngineHandles {
    controller: Controller,
    monitor: Arc<FrameMonitor>,
    cells: Arc<Mutex<CellTable>>,
    last_error: Arc<LastError>,
    journal: Arc<Mutex<Vec<String>>>,
}

impl EngineHandles {
    pub fn controller(&self) -> Controller {
        self.controller.clone()
    }

    pub fn monitor(&self) -> Arc<FrameMonitor> {
        Arc::clone(&self.monitor)
    }

    pub fn cell_phase(&self, cell: CellId) -> CellPhase {
        self.cells.lock()[cell_index(cell)].phase
    }

    pub fn cell_buffer(&self, cell: CellId) -> Option<Arc<RingBuffer>> {
        self.cells.lock()[cell_index(cell)].buffer.clone()
    }

    pub fn cell_playback(&self, cell: CellId) -> Option<Arc<PlaybackBin>> {
        self.cells.lock()[cell_index(cell)].playback.clone()
    }

    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.last_error.get()
    }

    /// Ordered log of notable control-loop transitions, for diagnostics
    /// and scenario assertions.
    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }
}

struct Runtime {
    graph: Arc<PipelineGraph>,
    frame_bytes: usize,
    watchdog: tokio::task::JoinHandle<()>,
}

/// How a shutdown came about, and what still needs surfacing.
enum ShutdownCause {
    Clean,
    /// `record` present means the consolidated error has not yet reached
    /// the sink and must be emitted exactly once during shutdown.
    Fatal {
        record: Option<ErrorRecord>,
        exit: i32,
    },
}

/// The application core: wires camera, tee, cells, compositor, renderer
/// and monitor together and runs the control loop.
///
/// `run` drives the whole lifecycle (permission, negotiation, graph
/// build, Ready, Playing, the event loop, shutdown) and resolves to the
/// process exit code.
pub struct Engine {
    config: Config,
    deps: Option<EngineDeps>,
    sink: Arc<dyn ErrorSink>,
    bus: EventBus,
    rx: mpsc::UnboundedReceiver<PipelineEvent>,
    cmd_rx: mpsc::UnboundedReceiver<ControlCommand>,
    handles: EngineHandles,
    budget: Arc<MemoryBudget>,
    extra_stages: Vec<Box<dyn Stage>>,
}

impl Engine {
    pub fn new(config: Config, deps: EngineDeps) -> Engine {
        let (bus, rx) = EventBus::channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let monitor = Arc::new(FrameMonitor::new(
            config.output.target_fps,
            config.output.fps_tolerance,
            config.output.monitor_window,
        ));
        let budget = MemoryBudget::new(config.recording.memory_budget_bytes, bus.clone());
        let cells = Arc::new(Mutex::new(
            CellId::recordable().map(|_| CellEntry::new()).collect::<CellTable>(),
        ));

        let sink = Arc::clone(&deps.error_sink);
        let handles = EngineHandles {
            controller: Controller { tx: cmd_tx },
            monitor,
            cells,
            last_error: Arc::new(LastError::default()),
            journal: Arc::new(Mutex::new(Vec::new())),
        };

        Engine {
            config,
            deps: Some(deps),
            sink,
            bus,
            rx,
            cmd_rx,
            handles,
            budget,
            extra_stages: Vec::new(),
        }
    }

    pub fn handles(&self) -> EngineHandles {
        self.handles.clone()
    }

    /// Inject an extra pipeline stage before startup. Test seam for
    /// misbehaving elements.
    pub fn add_stage(&mut self, stage: Box<dyn Stage>) {
        self.extra_stages.push(stage);
    }

    /// Run to completion; resolves to the process exit code.
    pub async fn run(mut self) -> i32 {
        let runtime = match self.build_pipeline().await {
            Ok(runtime) => runtime,
            Err(err) => return self.fatal_without_pipeline(&err),
        };

        if let Err(err) = self.bring_up(&runtime).await {
            // Consolidated terminal record; the deadlock itself was
            // already surfaced when it was detected.
            let record = ErrorRecord::new(
                ErrorCategory::PipelineStateChangeFailed,
                "engine",
                format!("pipeline failed to start: {err}"),
            );
            let exit = err.exit_code();
            return self
                .shutdown(
                    &runtime,
                    ShutdownCause::Fatal {
                        record: Some(record),
                        exit,
                    },
                )
                .await;
        }

        self.journal("pipeline-playing");
        self.control_loop(runtime).await
    }

    // -- startup ----------------------------------------------------------

    /// Permission, format negotiation and graph assembly. Nothing here
    /// starts a thread; failures leave no resources behind.
    async fn build_pipeline(&mut self) -> Result<Runtime, EngineError> {
        self.journal("startup");

        let deps = self
            .deps
            .take()
            .ok_or_else(|| EngineError::Internal("engine already started".into()))?;

        request_permission(Arc::clone(&deps.permission), self.config.permission_timeout())
            .await?;

        let mut source = CameraSource::new(deps.camera, Arc::clone(&deps.permission));
        let format = source.negotiate_format()?;
        self.journal(format!("camera-negotiated-{}x{}", format.width, format.height));

        let mut renderer = deps.renderer;
        renderer.bind_surface(&deps.surface)?;

        let mut graph = PipelineGraph::build(
            &self.config,
            source,
            renderer,
            Arc::clone(&self.handles.monitor),
            self.bus.clone(),
        )?;
        for stage in self.extra_stages.drain(..) {
            graph.add_stage(stage);
        }
        let graph = Arc::new(graph);

        let watchdog = {
            let graph = Arc::clone(&graph);
            let poll = self.config.watchdog_poll();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(poll);
                loop {
                    interval.tick().await;
                    graph.check_deadline();
                }
            })
        };

        Ok(Runtime {
            graph,
            frame_bytes: format.frame_size(),
            watchdog,
        })
    }

    /// Walk the pipeline up to Playing, with recovery on the way.
    async fn bring_up(&mut self, runtime: &Runtime) -> Result<(), EngineError> {
        self.transition_with_recovery(runtime, PipelineState::Ready)
            .await?;
        self.transition_with_recovery(runtime, PipelineState::Playing)
            .await
    }

    fn fatal_without_pipeline(&mut self, err: &EngineError) -> i32 {
        let record = ErrorRecord::from_error(err, "engine");
        error!(error = %err, "fatal before pipeline start");
        self.journal(format!("fatal-{:?}", record.category));
        self.sink.report(&record);
        self.handles.last_error.set(record);
        err.exit_code()
    }

    // -- state transitions and recovery -----------------------------------

    async fn transition_with_recovery(
        &mut self,
        runtime: &Runtime,
        target: PipelineState,
    ) -> Result<(), EngineError> {
        match self.request_and_await(runtime, target, false).await {
            Ok(()) => Ok(()),
            Err(err) => self.recover_pipeline(runtime, err).await,
        }
    }

    async fn request_and_await(
        &mut self,
        runtime: &Runtime,
        target: PipelineState,
        force: bool,
    ) -> Result<(), EngineError> {
        if force {
            runtime.graph.request_state_forced(target)?;
        } else {
            runtime.graph.request_state(target)?;
        }
        self.await_state_outcome(runtime, target).await
    }

    /// Consume bus events until the pending transition resolves. Events
    /// unrelated to the transition are handled passively so warnings and
    /// drained recordings are not lost while waiting.
    async fn await_state_outcome(
        &mut self,
        runtime: &Runtime,
        target: PipelineState,
    ) -> Result<(), EngineError> {
        // The watchdog declares the deadlock; this deadline is only a
        // backstop in case the watchdog itself is starved.
        let budget = self.config.state_change_timeout() + self.config.watchdog_poll() * 4;
        let deadline = tokio::time::Instant::now() + budget;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let event = match tokio::time::timeout(remaining, self.rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => return Err(EngineError::Internal("event bus closed".into())),
                Err(_) => {
                    return Err(EngineError::DeadlockDetected {
                        target: target.to_string(),
                        timeout_ms: budget.as_millis() as u64,
                    })
                }
            };

            match event {
                PipelineEvent::StateChanged {
                    component: "pipeline",
                    new,
                    ..
                } if new == target => return Ok(()),
                PipelineEvent::Error(record)
                    if record.category == ErrorCategory::DeadlockDetected =>
                {
                    self.note_error(&record);
                    return Err(EngineError::DeadlockDetected {
                        target: target.to_string(),
                        timeout_ms: self.config.timeouts.state_change_ms,
                    });
                }
                PipelineEvent::Error(record)
                    if record.category == ErrorCategory::PipelineStateChangeFailed =>
                {
                    self.note_error(&record);
                    return Err(EngineError::StateChangeFailed {
                        target: target.to_string(),
                        reason: record.message,
                    });
                }
                other => self.handle_passive_event(runtime, other),
            }
        }
    }

    /// Progressive recovery after a failed or deadlocked state change:
    /// revert to the prior state, then force Ready, then force Null.
    /// Any success returns the pipeline to normal operation.
    async fn recover_pipeline(
        &mut self,
        runtime: &Runtime,
        original: EngineError,
    ) -> Result<(), EngineError> {
        let prior = runtime.graph.current_state();
        let strategies = [
            ("revert", prior),
            ("force-ready", PipelineState::Ready),
            ("force-null", PipelineState::Null),
        ];

        for (name, state) in strategies {
            self.journal(format!("recovery-{name}-attempt"));
            info!(strategy = name, target = %state, "attempting pipeline recovery");

            match self.request_and_await(runtime, state, true).await {
                Ok(()) => {
                    self.journal(format!("recovery-{name}-succeeded"));
                    info!(strategy = name, "pipeline recovery succeeded");
                    return Ok(());
                }
                Err(err) => {
                    self.journal(format!("recovery-{name}-failed"));
                    warn!(strategy = name, error = %err, "pipeline recovery step failed");
                }
            }
        }

        self.journal("recovery-exhausted");
        error!("all pipeline recovery strategies exhausted");
        Err(original)
    }

    // -- control loop ------------------------------------------------------

    async fn control_loop(&mut self, runtime: Runtime) -> i32 {
        let mut camera_interval = tokio::time::interval(self.config.camera_poll());
        let mut stats_interval = tokio::time::interval(Duration::from_secs(2));
        let mut reported_drops = 0u64;

        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(ControlCommand::Key(event)) => self.handle_key(&runtime, event),
                    Some(ControlCommand::Shutdown) | None => {
                        return self.shutdown(&runtime, ShutdownCause::Clean).await;
                    }
                },
                event = self.rx.recv() => match event {
                    Some(event) => {
                        if let Some(exit) = self.handle_event(&runtime, event).await {
                            return exit;
                        }
                    }
                    None => {
                        let record = ErrorRecord::new(
                            ErrorCategory::UnknownFatal,
                            "engine",
                            "event bus closed unexpectedly",
                        );
                        return self
                            .shutdown(
                                &runtime,
                                ShutdownCause::Fatal {
                                    exit: ErrorCategory::UnknownFatal.exit_code(),
                                    record: Some(record),
                                },
                            )
                            .await;
                    }
                },
                _ = camera_interval.tick() => {
                    let connected = runtime.graph.source().lock().is_connected();
                    if !connected {
                        if let Some(exit) = self.camera_recovery(&runtime).await {
                            return exit;
                        }
                    }
                },
                _ = stats_interval.tick() => {
                    self.report_stats(&runtime, &mut reported_drops);
                },
            }
        }
    }

    /// Bus events that never change the engine's own course: warnings,
    /// drained recordings, progress chatter.
    fn handle_passive_event(&mut self, runtime: &Runtime, event: PipelineEvent) {
        match event {
            PipelineEvent::FrameReady { .. } => {}
            PipelineEvent::StateChanged { component, old, new } => {
                debug!(component, old = %old, new = %new, "state changed");
            }
            PipelineEvent::Eos { component } => {
                self.journal(format!("eos-{component}"));
            }
            PipelineEvent::Info { component, message } => {
                info!(component, %message, "pipeline info");
            }
            PipelineEvent::RecordDrained {
                cell,
                generation,
                buffer,
            } => self.on_record_drained(runtime, cell, generation, buffer),
            PipelineEvent::Error(record) => {
                self.note_error(&record);
            }
        }
    }

    /// Full event dispatch. Returns Some(exit_code) when the event is
    /// terminal.
    async fn handle_event(&mut self, runtime: &Runtime, event: PipelineEvent) -> Option<i32> {
        match event {
            PipelineEvent::Error(record) => self.handle_error(runtime, record).await,
            other => {
                self.handle_passive_event(runtime, other);
                None
            }
        }
    }

    async fn handle_error(&mut self, runtime: &Runtime, record: ErrorRecord) -> Option<i32> {
        self.note_error(&record);

        match record.category {
            category if category.is_warning() => None,
            // The refused recording start was already surfaced; the cell
            // stayed empty and everything else is unaffected.
            ErrorCategory::ResourceExhausted => None,
            ErrorCategory::CameraDisconnected => self.camera_recovery(runtime).await,
            ErrorCategory::DeadlockDetected | ErrorCategory::PipelineStateChangeFailed => {
                let err = EngineError::StateChangeFailed {
                    target: "steady-state".into(),
                    reason: record.message.clone(),
                };
                match self.recover_pipeline(runtime, err).await {
                    Ok(()) => None,
                    Err(err) => {
                        let consolidated = ErrorRecord::from_error(&err, "pipeline");
                        let exit = err.exit_code();
                        Some(
                            self.shutdown(
                                runtime,
                                ShutdownCause::Fatal {
                                    record: Some(consolidated),
                                    exit,
                                },
                            )
                            .await,
                        )
                    }
                }
            }
            category => {
                // Fatal category from a stage; already surfaced above.
                let exit = category.exit_code();
                Some(
                    self.shutdown(runtime, ShutdownCause::Fatal { record: None, exit })
                        .await,
                )
            }
        }
    }

    fn note_error(&mut self, record: &ErrorRecord) {
        self.journal(format!("error-{:?}", record.category));
        self.sink.report(record);
        self.handles.last_error.set(record.clone());
    }

    // -- key dispatch ------------------------------------------------------

    fn handle_key(&mut self, runtime: &Runtime, event: KeyEvent) {
        let (key, cell_event) = match event {
            KeyEvent::Down(key) => (key, CellEvent::KeyDown),
            KeyEvent::Up(key) => (key, CellEvent::KeyUp),
        };
        let Some(cell) = CellId::from_key(key) else {
            debug!(key, "ignoring out-of-range key");
            return;
        };

        let cells = Arc::clone(&self.handles.cells);
        let mut cells = cells.lock();
        let entry = &mut cells[cell_index(cell)];
        let (next, action) = transition(entry.phase, cell_event);

        match action {
            CellAction::Ignore => {}
            CellAction::StartRecording => {
                self.start_recording(runtime, cell, entry);
            }
            CellAction::StopRecording => {
                if let Some(bin) = entry.record.as_mut() {
                    bin.stop(&runtime.graph.tee());
                    entry.phase = next;
                    self.journal_locked(format!("cell-{cell}-stopping"));
                } else {
                    warn!(cell = %cell, "recording cell without a record bin");
                    entry.phase = CellPhase::Empty;
                }
            }
            CellAction::ResetThenRecord => {
                // Unbind before dropping so no tick can compose from the
                // old buffer once the reset is underway.
                runtime.graph.compositor().lock().unbind(cell);
                entry.playback = None;
                entry.buffer = None;
                self.journal_locked(format!("cell-{cell}-reset"));
                self.start_recording(runtime, cell, entry);
            }
            CellAction::StartPlayback | CellAction::Teardown => {
                // Not reachable from key events.
                debug!(cell = %cell, ?action, "unexpected key action");
            }
        }
    }

    fn start_recording(&self, runtime: &Runtime, cell: CellId, entry: &mut CellEntry) {
        entry.generation += 1;

        match RecordBin::start(
            cell,
            entry.generation,
            self.config.recording.capacity,
            runtime.frame_bytes,
            &runtime.graph.tee(),
            &self.budget,
            self.bus.clone(),
        ) {
            Ok(bin) => {
                entry.record = Some(bin);
                entry.phase = CellPhase::Recording;
                self.journal_locked(format!("cell-{cell}-recording"));
            }
            Err(err @ EngineError::ResourceExhausted { .. }) => {
                // Refused start: the cell stays empty, the rest of the
                // grid is untouched.
                let record = ErrorRecord::from_error(&err, "record-bin");
                self.sink.report(&record);
                self.handles.last_error.set(record);
                entry.phase = CellPhase::Empty;
                self.journal_locked(format!("cell-{cell}-refused"));
            }
            Err(err) => {
                error!(cell = %cell, error = %err, "failed to start recording");
                let record = ErrorRecord::from_error(&err, "record-bin");
                self.sink.report(&record);
                self.handles.last_error.set(record);
                entry.phase = CellPhase::Empty;
            }
        }
    }

    fn on_record_drained(
        &mut self,
        runtime: &Runtime,
        cell: CellId,
        generation: u64,
        buffer: Arc<RingBuffer>,
    ) {
        let cells = Arc::clone(&self.handles.cells);
        let mut cells = cells.lock();
        let entry = &mut cells[cell_index(cell)];

        if entry.generation != generation {
            debug!(cell = %cell, generation, current = entry.generation, "stale drain discarded");
            return;
        }

        let (next, action) = transition(entry.phase, CellEvent::DrainComplete);
        if action != CellAction::StartPlayback {
            debug!(cell = %cell, phase = ?entry.phase, "drain complete ignored");
            return;
        }

        entry.record = None;
        if buffer.is_empty() {
            // Key released before a single frame arrived: nothing to loop.
            entry.phase = CellPhase::Empty;
            self.journal_locked(format!("cell-{cell}-empty-clip"));
            return;
        }

        match PlaybackBin::new(cell, Arc::clone(&buffer)) {
            Ok(bin) => {
                if let Err(err) = runtime.graph.compositor().lock().bind(Arc::clone(&bin)) {
                    error!(cell = %cell, error = %err, "failed to bind playback");
                    entry.phase = CellPhase::Empty;
                    return;
                }
                info!(cell = %cell, frames = buffer.len(), "cell playing");
                entry.playback = Some(bin);
                entry.buffer = Some(buffer);
                entry.phase = next;
                self.journal_locked(format!("cell-{cell}-playing"));
            }
            Err(err) => {
                error!(cell = %cell, error = %err, "failed to create playback bin");
                entry.phase = CellPhase::Empty;
            }
        }
    }

    // -- camera recovery ---------------------------------------------------

    /// Camera disconnect: stop recording cells, then reinitialise with
    /// backoff. Playing cells keep looping their buffers throughout; the
    /// live slot holds its last frame.
    async fn camera_recovery(&mut self, runtime: &Runtime) -> Option<i32> {
        self.journal("camera-recovery-start");
        info!("camera disconnected, starting recovery");

        {
            let tee = runtime.graph.tee();
            let mut cells = self.handles.cells.lock();
            for (idx, entry) in cells.iter_mut().enumerate() {
                if matches!(entry.phase, CellPhase::Recording | CellPhase::Stopping) {
                    if let Some(bin) = entry.record.take() {
                        bin.abort(&tee);
                    }
                    // Invalidate the in-flight drain for this cell.
                    entry.generation += 1;
                    entry.phase = CellPhase::Empty;
                    debug!(cell = idx + 2, "recording stopped by camera loss");
                }
            }
        }

        let retries = self.config.timeouts.disconnect_retries;
        for attempt in 1..=retries {
            self.journal(format!("camera-recovery-attempt-{attempt}"));
            info!(attempt, retries, "reinitialising camera");

            let result = runtime.graph.source().lock().reinitialise();
            match result {
                Ok(format) => {
                    self.journal("camera-recovery-succeeded");
                    info!(format = %format, attempt, "camera recovered");
                    return None;
                }
                Err(err) => {
                    warn!(attempt, error = %err, "camera reinitialisation failed");
                    tokio::time::sleep(self.config.disconnect_backoff()).await;
                }
            }
        }

        self.journal("camera-recovery-exhausted");
        let err = EngineError::CameraDisconnected(format!(
            "reinitialisation failed after {retries} attempts"
        ));
        let record = ErrorRecord::from_error(&err, "camera").with_retries(retries);
        let exit = err.exit_code();
        Some(
            self.shutdown(
                runtime,
                ShutdownCause::Fatal {
                    record: Some(record),
                    exit,
                },
            )
            .await,
        )
    }

    // -- stats -------------------------------------------------------------

    fn report_stats(&mut self, runtime: &Runtime, reported_drops: &mut u64) {
        let stats = self.handles.monitor.stats();
        let verdict = self.handles.monitor.verdict();
        let tee = runtime.graph.tee().stats();

        info!(
            avg_fps = format!("{:.1}", stats.avg_fps),
            stddev = format!("{:.1}", stats.stddev_fps),
            drops = stats.drops,
            verdict = ?verdict,
            live_dropped = tee.live_dropped,
            branches = tee.active_branches,
            retained_bytes = self.budget.reserved_bytes(),
            "pipeline stats"
        );

        if stats.drops > *reported_drops {
            let record = ErrorRecord::new(
                ErrorCategory::FrameDropDetected,
                "frame-monitor",
                format!("{} frames dropped since start", stats.drops),
            );
            self.sink.report(&record);
            self.handles.last_error.set(record);
            *reported_drops = stats.drops;
        }
    }

    // -- shutdown ----------------------------------------------------------

    /// Stop the pipeline in reverse-initialisation order, free per-cell
    /// resources, surface the consolidated error if one is due, and
    /// resolve the exit code.
    async fn shutdown(&mut self, runtime: &Runtime, cause: ShutdownCause) -> i32 {
        self.journal("shutdown");
        info!("engine shutting down");

        // Stop the graph first; the downward ladder visits stages in
        // reverse build order. Best effort: a wedged element must not
        // prevent the rest of the teardown.
        if runtime.graph.request_state(PipelineState::Null).is_ok() {
            let _ = self.await_state_outcome(runtime, PipelineState::Null).await;
        }
        runtime.watchdog.abort();

        // Per-cell resources: detach record branches, unbind playback,
        // drop buffers.
        {
            let tee = runtime.graph.tee();
            let compositor_arc = runtime.graph.compositor();
            let mut compositor = compositor_arc.lock();
            let mut cells = self.handles.cells.lock();
            for (idx, entry) in cells.iter_mut().enumerate() {
                if let Some(bin) = entry.record.take() {
                    bin.abort(&tee);
                }
                if let Some(cell) = CellId::new(idx as u8 + 2) {
                    compositor.clear(cell);
                }
                entry.playback = None;
                entry.buffer = None;
                entry.generation += 1;
                entry.phase = CellPhase::Empty;
            }
        }

        match cause {
            ShutdownCause::Clean => {
                let stats = self.handles.monitor.stats();
                info!(
                    rendered = self.handles.monitor.total_rendered(),
                    drops = stats.drops,
                    "clean shutdown"
                );
                self.journal("exit-0");
                0
            }
            ShutdownCause::Fatal { record, exit } => {
                if let Some(record) = record {
                    self.sink.report(&record);
                    self.handles.last_error.set(record);
                }
                self.journal(format!("exit-{exit}"));
                exit
            }
        }
    }

    fn journal(&mut self, entry: impl Into<String>) {
        let entry = entry.into();
        debug!(entry = %entry, "journal");
        self.handles.journal.lock().push(entry);
    }

    /// Journal variant usable while the cell table lock is held.
    fn journal_locked(&self, entry: impl Into<String>) {
        let entry = entry.into();
        debug!(entry = %entry, "journal");
        self.handles.journal.lock().push(entry);
    }
}
