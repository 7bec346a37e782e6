//! The acquisition engine.
//!
//! One engine serializes all acquisitions on a microscope. `acquire()`
//! validates the stream, materializes the scan plan, and spawns the
//! acquisition task, returning an [`AcquireFuture`] immediately. The task
//! walks the scan tile by tile: readers armed before the emitter produces
//! samples, per-tile timeouts with bounded retries on transient faults,
//! oversampling decimation into the assembly buffers, leeches fired at
//! pixel boundaries with their drift offsets folded into later tiles, and
//! live updates published along the way. Cancellation is cooperative and
//! observed at every suspension point; the hardware is always parked and
//! the scan stage restored on the way out.

use crate::assemble::{self, ImageIntegrator};
use crate::leech::{Leech, LeechStart};
use crate::plan::{ScanPlan, ScanPlanner};
use crate::stream::{PerPixel, RasterStream, StreamState};
use crate::timing::Tiling;
use acq_core::data::{DataArray, Dtype, DynArray, DIMS_CTZYX, DIMS_YX};
use acq_core::hw::{
    Actuator, Detector, DetectorKind, Emitter, MoveHandle, RawBlock, Waveform, WaveformHandle,
};
use acq_core::metadata::{Metadata, Polarization};
use acq_core::{AcqError, AcqResult};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tracing::{debug, error, info, warn};

/// Transient-fault retries per tile before the scan is aborted.
const MAX_TILE_RETRIES: u32 = 5;
/// Backoff between tile retries.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);
/// Minimum interval between in-progress image publications.
const LIVE_PERIOD: Duration = Duration::from_secs(2);

/// Engine state observable by the surrounding container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    HwError(String),
}

/// Progress snapshot delivered to update subscribers.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    /// Estimated start, seconds since the epoch.
    pub start: f64,
    /// Estimated end, seconds since the epoch.
    pub end: f64,
    pub pixels_done: u64,
    pub pixels_total: u64,
}

/// Final outcome of an acquisition.
#[derive(Clone)]
pub struct AcqOutcome {
    /// Assembled arrays, detector order first, leech arrays after.
    pub data: Vec<DataArray>,
    /// Secondary error (partial results may still be coherent).
    pub error: Option<AcqError>,
    pub cancelled: bool,
}

struct FutureShared {
    cancel_flag: AtomicBool,
    cancel_notify: Notify,
    done_tx: watch::Sender<bool>,
    progress_tx: watch::Sender<Progress>,
    outcome: parking_lot::Mutex<Option<AcqOutcome>>,
    estimate: Duration,
    skipped_positions: AtomicU64,
}

impl FutureShared {
    fn cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    /// Err(Cancelled) when a cancel is pending; the cheap check used at
    /// every suspension point.
    fn checkpoint(&self) -> AcqResult<()> {
        if self.cancelled() {
            Err(AcqError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Handle on a running acquisition.
pub struct AcquireFuture {
    shared: Arc<FutureShared>,
}

impl AcquireFuture {
    /// Request cancellation; a no-op once the future has completed.
    pub fn cancel(&self) {
        self.shared.cancel_flag.store(true, Ordering::SeqCst);
        self.shared.cancel_notify.notify_waiters();
    }

    pub fn done(&self) -> bool {
        *self.shared.done_tx.subscribe().borrow()
    }

    /// Wall-clock estimate derived from the scan plan.
    pub fn estimated_duration(&self) -> Duration {
        self.shared.estimate
    }

    /// Progress updates (start/end estimates and pixel counts).
    pub fn updates(&self) -> watch::Receiver<Progress> {
        self.shared.progress_tx.subscribe()
    }

    /// newPosition emissions skipped because the wall clock overran.
    pub fn skipped_position_events(&self) -> u64 {
        self.shared.skipped_positions.load(Ordering::Relaxed)
    }

    /// Wait for completion and return the assembled arrays plus any
    /// secondary error. A cancelled acquisition returns `Err(Cancelled)`;
    /// not finishing within `timeout` returns `Err(Timeout)`.
    pub async fn result(&self, timeout: Duration) -> AcqResult<(Vec<DataArray>, Option<AcqError>)> {
        let mut done_rx = self.shared.done_tx.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        while !*done_rx.borrow_and_update() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero()
                || tokio::time::timeout(remaining, done_rx.changed())
                    .await
                    .is_err()
            {
                return Err(AcqError::Timeout(timeout, "acquisition result".into()));
            }
        }
        let outcome = self
            .shared
            .outcome
            .lock()
            .clone()
            .ok_or_else(|| AcqError::External("acquisition finished without outcome".into()))?;
        if outcome.cancelled {
            return Err(AcqError::Cancelled);
        }
        Ok((outcome.data, outcome.error))
    }
}

struct EngineInner {
    acq_lock: AsyncMutex<()>,
    state_tx: watch::Sender<EngineState>,
    planner: ScanPlanner,
}

/// Top-level orchestrator; one per microscope.
#[derive(Clone)]
pub struct AcquisitionEngine {
    inner: Arc<EngineInner>,
}

impl Default for AcquisitionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AcquisitionEngine {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(EngineState::Idle);
        Self {
            inner: Arc::new(EngineInner {
                acq_lock: AsyncMutex::new(()),
                state_tx,
                planner: ScanPlanner::new(),
            }),
        }
    }

    /// Observable engine state.
    pub fn state(&self) -> watch::Receiver<EngineState> {
        self.inner.state_tx.subscribe()
    }

    /// Wall-clock estimate for acquiring `stream` with the current plan.
    pub fn estimate_acquisition_time(&self, stream: &RasterStream) -> AcqResult<Duration> {
        let plan = self.plan_for(stream)?;
        Ok(estimate_total(stream, &plan))
    }

    fn plan_for(&self, stream: &RasterStream) -> AcqResult<Arc<ScanPlan>> {
        let settings = stream.scan_settings();
        let min_leech = stream
            .leeches
            .iter()
            .map(|l| l.period_pixels(stream.pixel_dwell()))
            .min();
        self.inner.planner.plan(
            &settings,
            stream.emitter.as_ref(),
            &stream.detectors,
            min_leech,
        )
    }

    /// Validate the stream, plan the scan, and start the acquisition.
    /// Validation failures are synchronous and leave no side effects.
    pub fn acquire(&self, stream: RasterStream) -> AcqResult<AcquireFuture> {
        let plan = self.plan_for(&stream)?;
        if stream.scan_stage.is_some() {
            validate_stage_range(&stream, &plan)?;
        }

        let estimate = estimate_total(&stream, &plan);
        let now = epoch_seconds();
        let (done_tx, _) = watch::channel(false);
        let (progress_tx, _) = watch::channel(Progress {
            start: now,
            end: now + estimate.as_secs_f64(),
            pixels_done: 0,
            pixels_total: plan.total_pixels(),
        });
        let shared = Arc::new(FutureShared {
            cancel_flag: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            done_tx,
            progress_tx,
            outcome: parking_lot::Mutex::new(None),
            estimate,
            skipped_positions: AtomicU64::new(0),
        });

        let inner = self.inner.clone();
        let task_shared = shared.clone();
        tokio::spawn(async move {
            run_acquisition(inner, stream, plan, task_shared).await;
        });

        Ok(AcquireFuture { shared })
    }
}

fn epoch_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 * 1e-6
}

fn estimate_total(stream: &RasterStream, plan: &ScanPlan) -> Duration {
    let mut total = plan.frame_time();
    // fixed per-tile turnaround
    total += Duration::from_millis(2) * plan.tile_rows().len() as u32;
    let pixel_time = plan.pixel_time();
    for leech in &stream.leeches {
        let period = leech.period_pixels(pixel_time).max(1);
        let fires = plan.total_pixels() / period;
        total += leech.estimate(fires + 1);
    }
    if stream.acquire_all_pol {
        total *= Polarization::ALL.len() as u32;
    }
    total
}

fn validate_stage_range(stream: &RasterStream, plan: &ScanPlan) -> AcqResult<()> {
    let stage = match &stream.scan_stage {
        Some(s) => s,
        None => return Ok(()),
    };
    let axes = stage.axes();
    let (h, w) = plan.shape;
    let half_w = plan.pixel_size.0 * w as f64 / 2.0;
    let half_h = plan.pixel_size.1 * h as f64 / 2.0;
    for (axis, half) in [("x", half_w), ("y", half_h)] {
        let desc = axes.get(axis).ok_or_else(|| {
            AcqError::validation(format!("scan stage has no '{axis}' axis"))
        })?;
        let center = if axis == "x" { plan.center.0 } else { plan.center.1 };
        if center - half < desc.range.0 || center + half > desc.range.1 {
            return Err(AcqError::validation(format!(
                "scan roi exceeds stage '{axis}' range {:?}",
                desc.range
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Acquisition task
// ---------------------------------------------------------------------------

async fn run_acquisition(
    inner: Arc<EngineInner>,
    mut stream: RasterStream,
    plan: Arc<ScanPlan>,
    shared: Arc<FutureShared>,
) {
    // one acquisition at a time per microscope
    let _guard = inner.acq_lock.lock().await;
    inner.state_tx.send_replace(EngineState::Running);
    stream.set_state(StreamState::Active);
    info!(stream = %stream.name, shape = ?plan.shape, "acquisition started");

    let mut leeches = std::mem::take(&mut stream.leeches);
    let outcome = if stream.scan_stage.is_some() {
        run_stage_scan(&stream, &plan, &mut leeches, &shared).await
    } else {
        run_raster_scan(&stream, &plan, &mut leeches, &shared).await
    };

    // leeches always see the end of their series
    for leech in &mut leeches {
        leech.series_complete().await;
    }
    stream.leeches = leeches;

    let engine_state = match (&outcome.error, outcome.cancelled) {
        (Some(AcqError::Hardware(msg)), _) => EngineState::HwError(msg.clone()),
        _ => EngineState::Idle,
    };
    let stream_state = match (&outcome.error, outcome.cancelled) {
        (Some(e), false) => StreamState::Error(e.to_string()),
        _ => StreamState::Idle,
    };
    inner.state_tx.send_replace(engine_state);
    stream.set_state(stream_state);

    // publish the final arrays on the detector flows, detector order
    if !outcome.cancelled {
        for (i, det) in stream.detectors.iter().enumerate() {
            if let Some(da) = outcome.data.get(i) {
                det.data().notify(da);
            }
        }
    }

    info!(
        stream = %stream.name,
        cancelled = outcome.cancelled,
        results = outcome.data.len(),
        "acquisition finished"
    );
    *shared.outcome.lock() = Some(outcome);
    shared.done_tx.send_replace(true);
}

/// Assembly buffers for one scan pass.
struct PassBuffers {
    /// Fine-grid planes for scalar detectors, indexed like the detector
    /// list (None for camera slots).
    planes: Vec<Option<DynArray>>,
    /// CTZYX cube for the spectrum/temporal camera, allocated on the first
    /// frame.
    cube: Option<DynArray>,
    cube_md: Metadata,
    /// Per-pixel camera images (AR), scan order.
    images: Vec<DataArray>,
}

impl PassBuffers {
    fn new(stream: &RasterStream, plan: &ScanPlan) -> Self {
        let (fh, fw) = plan.fine_shape;
        let planes = stream
            .detectors
            .iter()
            .map(|det| match det.kind() {
                DetectorKind::Analog => Some(DynArray::zeros(Dtype::U16, &[fh, fw])),
                // counting sums can exceed the raw sample range
                DetectorKind::Counting => Some(DynArray::zeros(Dtype::U32, &[fh, fw])),
                _ => None,
            })
            .collect();
        Self {
            planes,
            cube: None,
            cube_md: Metadata::default(),
            images: Vec::new(),
        }
    }
}

/// The scan-grid region one write covers.
#[derive(Debug, Clone, Copy)]
enum TileSpan {
    /// Whole rows `[r0, r1)`.
    Rows { r0: usize, r1: usize },
    /// Pixels `[c0, c1)` of one row (pixel-tile fallbacks; lets a leech
    /// fire at its exact pixel index).
    PixelRun { row: usize, c0: usize, c1: usize },
}

impl TileSpan {
    /// Index of the pixel one past this span, in scan order.
    fn end_pixel(&self, width: usize) -> u64 {
        match *self {
            TileSpan::Rows { r1, .. } => (r1 * width) as u64,
            TileSpan::PixelRun { row, c1, .. } => (row * width + c1) as u64,
        }
    }
}

/// One tile's worth of decimated data, ready for assembly.
struct TileData {
    span: TileSpan,
    /// Fine-grid blocks per scalar detector.
    planes: Vec<Option<DynArray>>,
    /// Integrated frames per camera detector, pixel scan order.
    frames: Vec<Vec<DataArray>>,
}

async fn run_raster_scan(
    stream: &RasterStream,
    plan: &ScanPlan,
    leeches: &mut [Box<dyn Leech>],
    shared: &Arc<FutureShared>,
) -> AcqOutcome {
    match raster_scan_inner(stream, plan, leeches, shared).await {
        Ok(data) => AcqOutcome {
            data,
            error: None,
            cancelled: false,
        },
        Err(AcqError::Cancelled) => {
            cleanup_hardware(stream).await;
            AcqOutcome {
                data: Vec::new(),
                error: None,
                cancelled: true,
            }
        }
        Err(e) => {
            error!(stream = %stream.name, "acquisition failed: {e}");
            cleanup_hardware(stream).await;
            AcqOutcome {
                data: Vec::new(),
                error: Some(e),
                cancelled: false,
            }
        }
    }
}

/// Park the emitter and quiet the indicator after a failure or cancel.
async fn cleanup_hardware(stream: &RasterStream) {
    for det in &stream.detectors {
        det.cancel().await;
    }
    if let Err(e) = stream.emitter.park_at(stream.emitter.resting_position()).await {
        warn!("parking after abort failed: {e}");
    }
    // an abort never waits out the indicator grace period
    if let Err(e) = stream.emitter.set_scanning_indicator(false, true).await {
        warn!("indicator release failed: {e}");
    }
}

async fn raster_scan_inner(
    stream: &RasterStream,
    plan: &ScanPlan,
    leeches: &mut [Box<dyn Leech>],
    shared: &Arc<FutureShared>,
) -> AcqResult<Vec<DataArray>> {
    let acq_date = epoch_seconds();

    wait_sync_events(stream, shared).await?;

    stream.emitter.set_scanning_indicator(true, false).await?;

    let start = LeechStart {
        total_pixels: plan.total_pixels(),
        pixel_time: plan.pixel_time(),
    };
    let mut next_fire: Vec<Option<u64>> = Vec::with_capacity(leeches.len());
    for leech in leeches.iter_mut() {
        match leech.series_start(&start).await {
            Ok(np) => next_fire.push(Some(np)),
            Err(e) if leech.required() => return Err(e),
            Err(e) => {
                warn!(leech = leech.name(), "leech series_start failed: {e}");
                next_fire.push(None);
            }
        }
    }

    // park at the waveform start ahead of time so the first pixel gets
    // extra settling
    if let Some(first) = plan.waveform.start_position() {
        stream.emitter.park_at(first).await?;
    }

    let pol_positions: Vec<Option<Polarization>> = if stream.acquire_all_pol {
        Polarization::ALL.iter().copied().map(Some).collect()
    } else {
        vec![None]
    };

    let mut outputs: Vec<DataArray> = Vec::new();
    let mut drift = (0.0, 0.0);
    let mut sem_final: Option<DataArray> = None;
    let mut point_finals: Vec<DataArray> = Vec::new();
    let mut cube_final: Option<DataArray> = None;
    let mut ar_images: Vec<DataArray> = Vec::new();

    for pol in pol_positions {
        let mut buffers = PassBuffers::new(stream, plan);
        drift = scan_pass(
            stream, plan, leeches, &mut next_fire, shared, &mut buffers, drift, acq_date,
        )
        .await?;

        let pass = assemble_pass(stream, plan, buffers, acq_date, drift, pol)?;
        sem_final = Some(pass.sem);
        point_finals = pass.points;
        if pass.cube.is_some() {
            cube_final = pass.cube;
        }
        ar_images.extend(pass.images);
    }

    if let Some(sem) = sem_final {
        outputs.push(sem);
    }
    outputs.extend(point_finals);
    if let Some(cube) = cube_final {
        outputs.push(cube);
    }
    outputs.extend(ar_images);

    // final leech firings and metadata attachment
    for (leech, nf) in leeches.iter_mut().zip(next_fire.iter()) {
        if leech.fires_at_end() && nf.is_some() {
            if let Err(e) = leech.fire(plan.total_pixels()).await {
                if leech.required() {
                    return Err(e);
                }
                warn!(leech = leech.name(), "final leech firing failed: {e}");
            }
        }
    }
    for (leech, nf) in leeches.iter_mut().zip(next_fire.iter()) {
        if nf.is_some() {
            leech.complete(&mut outputs);
        }
    }

    stream.emitter.park_at(stream.emitter.resting_position()).await?;
    // graceful release: another scan may start within the grace period
    stream.emitter.set_scanning_indicator(false, false).await?;

    Ok(outputs)
}

/// Wait once per bound sync event before the scan starts. The wait is
/// unbounded, so the cancel flag is polled alongside it.
async fn wait_sync_events(stream: &RasterStream, shared: &Arc<FutureShared>) -> AcqResult<()> {
    for det in &stream.detectors {
        if let Some(ev) = det.data().sync_event() {
            debug!(event = ev.name(), "waiting for sync event");
            loop {
                shared.checkpoint()?;
                if ev.wait_timeout(Duration::from_millis(20)).await {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// One full pass over the scan grid. Returns the accumulated drift offset.
#[allow(clippy::too_many_arguments)]
async fn scan_pass(
    stream: &RasterStream,
    plan: &ScanPlan,
    leeches: &mut [Box<dyn Leech>],
    next_fire: &mut [Option<u64>],
    shared: &Arc<FutureShared>,
    buffers: &mut PassBuffers,
    mut drift: (f64, f64),
    acq_date: f64,
) -> AcqResult<(f64, f64)> {
    let (h, w) = plan.shape;
    let mut last_live = Instant::now();

    match plan.tiling {
        Tiling::Rows(_) => {
            let mut tiles = plan.tile_rows();
            let mut t = 0;
            while t < tiles.len() {
                let (r0, mut r1) = tiles[t];
                shared.checkpoint()?;

                // stop the tile at the row holding the earliest due leech
                // pixel, so the firing lands at a pixel boundary at most
                // one row early; the remainder becomes its own tile
                if let Some(np) = next_fire.iter().flatten().min().copied() {
                    let boundary_row = (np.div_ceil(w as u64) as usize).min(h);
                    if boundary_row > r0 && boundary_row < r1 {
                        tiles.insert(t + 1, (boundary_row, r1));
                        r1 = boundary_row;
                        tiles[t] = (r0, r1);
                    }
                }

                let span = TileSpan::Rows { r0, r1 };
                let tile = acquire_tile_with_retry(stream, plan, span, drift, shared).await?;
                write_tile(stream, plan, buffers, &tile)?;

                let pixels_done = span.end_pixel(w);
                publish_progress(shared, plan, pixels_done);
                if last_live.elapsed() >= LIVE_PERIOD {
                    publish_live(stream, plan, buffers, acq_date);
                    last_live = Instant::now();
                }
                fire_due_leeches(leeches, next_fire, pixels_done, &mut drift, shared).await?;
                t += 1;
            }
        }
        Tiling::Pixel | Tiling::SubPixel => {
            for row in 0..h {
                let mut c0 = 0;
                while c0 < w {
                    shared.checkpoint()?;
                    let row_base = (row * w) as u64;

                    // run up to the row end, or to a leech's exact pixel
                    let mut c1 = w;
                    if let Some(np) = next_fire.iter().flatten().min().copied() {
                        if np > row_base + c0 as u64 && np < row_base + w as u64 {
                            c1 = (np - row_base) as usize;
                        }
                    }

                    let span = TileSpan::PixelRun { row, c0, c1 };
                    let tile = acquire_tile_with_retry(stream, plan, span, drift, shared).await?;
                    write_tile(stream, plan, buffers, &tile)?;

                    let pixels_done = span.end_pixel(w);
                    publish_progress(shared, plan, pixels_done);
                    if last_live.elapsed() >= LIVE_PERIOD {
                        publish_live(stream, plan, buffers, acq_date);
                        last_live = Instant::now();
                    }
                    fire_due_leeches(leeches, next_fire, pixels_done, &mut drift, shared).await?;
                    c0 = c1;
                }
            }
        }
    }

    Ok(drift)
}

/// Fire every leech whose advertised pixel has been reached, in stream
/// declaration order. A failing optional leech is disarmed; a required one
/// fails the scan.
async fn fire_due_leeches(
    leeches: &mut [Box<dyn Leech>],
    next_fire: &mut [Option<u64>],
    pixels_done: u64,
    drift: &mut (f64, f64),
    shared: &Arc<FutureShared>,
) -> AcqResult<()> {
    for (i, leech) in leeches.iter_mut().enumerate() {
        let due = matches!(next_fire[i], Some(np) if np <= pixels_done);
        if !due {
            continue;
        }
        shared.checkpoint()?;
        match leech.fire(pixels_done).await {
            Ok(fire) => {
                next_fire[i] = Some(fire.next_pixel);
                if let Some(d) = fire.drift {
                    *drift = d;
                }
            }
            Err(e) if leech.required() => return Err(e),
            Err(e) => {
                warn!(leech = leech.name(), "leech failed, scan continues: {e}");
                next_fire[i] = None;
            }
        }
    }
    Ok(())
}

fn publish_progress(shared: &Arc<FutureShared>, plan: &ScanPlan, pixels_done: u64) {
    let now = epoch_seconds();
    let total = plan.total_pixels().max(1);
    let remaining = shared.estimate.as_secs_f64() * (total - pixels_done.min(total)) as f64
        / total as f64;
    shared.progress_tx.send_replace(Progress {
        start: now,
        end: now + remaining,
        pixels_done,
        pixels_total: total,
    });
}

fn publish_live(stream: &RasterStream, plan: &ScanPlan, buffers: &PassBuffers, acq_date: f64) {
    if let Some(Some(plane)) = buffers.planes.first() {
        let md = Metadata {
            acq_date: Some(acq_date),
            pixel_size: Some((
                plan.pixel_size.0 / plan.fuzz as f64,
                plan.pixel_size.1 / plan.fuzz as f64,
            )),
            dims: Some(DIMS_YX.into()),
            ..Default::default()
        };
        stream.publish_live(DataArray::new(plane.clone(), md));
    }
}

async fn acquire_tile_with_retry(
    stream: &RasterStream,
    plan: &ScanPlan,
    span: TileSpan,
    drift: (f64, f64),
    shared: &Arc<FutureShared>,
) -> AcqResult<TileData> {
    let mut attempt = 0;
    loop {
        shared.checkpoint()?;
        match acquire_tile(stream, plan, span, drift, shared).await {
            Ok(tile) => return Ok(tile),
            Err(AcqError::Cancelled) => return Err(AcqError::Cancelled),
            Err(e) if e.is_transient() && attempt + 1 < MAX_TILE_RETRIES => {
                attempt += 1;
                warn!(?span, attempt, "transient tile failure, retrying: {e}");
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            Err(e) if e.is_transient() => {
                return Err(AcqError::Hardware(format!(
                    "tile {span:?} failed after {MAX_TILE_RETRIES} attempts: {e}"
                )));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Acquire one span and decimate to assembly-ready blocks.
async fn acquire_tile(
    stream: &RasterStream,
    plan: &ScanPlan,
    span: TileSpan,
    drift: (f64, f64),
    shared: &Arc<FutureShared>,
) -> AcqResult<TileData> {
    match span {
        TileSpan::Rows { r0, r1 } => acquire_tile_rows(stream, plan, r0, r1, drift, shared).await,
        TileSpan::PixelRun { row, c0, c1 } => {
            acquire_tile_pixels(stream, plan, row, c0, c1, drift, shared).await
        }
    }
}

/// Sub-exposure count per pixel for a camera detector.
fn sub_exposures(stream: &RasterStream, det: &Arc<dyn Detector>) -> u32 {
    let integration = match stream.integration_time {
        Some(t) => t,
        None => return 1,
    };
    match det.max_exposure() {
        Some(max) if integration > max => {
            (integration.as_secs_f64() / max.as_secs_f64()).ceil() as u32
        }
        _ => 1,
    }
}

fn reader_timeout(expected: Duration) -> Duration {
    (expected.mul_f64(1.1) + Duration::from_millis(100)).max(Duration::from_secs(1))
}

fn writer_timeout(expected: Duration) -> Duration {
    expected.max(Duration::from_millis(100)) + Duration::from_secs(1)
}

/// Repeat each waveform entry `dpr` times (long dwells replayed rather
/// than stretched past the emitter's max period).
fn expand_dpr(wf: &Waveform, dpr: usize) -> Waveform {
    if dpr == 1 {
        return wf.clone();
    }
    let mut xy = Vec::with_capacity(wf.len() * dpr);
    for s in &wf.xy {
        for _ in 0..dpr {
            xy.push(*s);
        }
    }
    Waveform {
        xy,
        rows: wf.rows,
        cols: wf.cols * dpr,
    }
}

/// Drop the lead-in sample some counting hardware needs to latch.
fn drop_lead_in(raw: DynArray) -> AcqResult<DynArray> {
    let n = raw.len();
    if n == 0 {
        return Ok(raw);
    }
    let mut out = DynArray::zeros(raw.dtype(), &[n - 1]);
    for i in 1..n {
        out.set_at(&[i - 1], raw.at(&[i]));
    }
    Ok(out)
}

/// Schedule newPosition emissions by wall clock for the logical pixels of
/// a tile; margin columns fire nothing. Overruns are skipped and counted.
fn spawn_position_notifier(
    stream: &RasterStream,
    plan: &ScanPlan,
    rows: usize,
    shared: &Arc<FutureShared>,
) -> tokio::task::JoinHandle<()> {
    let event = stream.emitter.new_position_event();
    let pixel_time = plan.pixel_time();
    let margin_time = plan.entry_time() * plan.margin as u32;
    let width = plan.shape.1;
    let skipped = shared.clone();
    tokio::spawn(async move {
        let t0 = tokio::time::Instant::now();
        let mut skips = 0u64;
        for r in 0..rows {
            let row_start = t0 + (margin_time + pixel_time * width as u32) * r as u32 + margin_time;
            for p in 0..width {
                let target = row_start + pixel_time * p as u32;
                let now = tokio::time::Instant::now();
                if now > target + pixel_time {
                    // too far behind to be meaningful; never hidden
                    skips += 1;
                    continue;
                }
                tokio::time::sleep_until(target).await;
                event.notify();
            }
        }
        if skips > 0 {
            skipped.skipped_positions.fetch_add(skips, Ordering::Relaxed);
            warn!(skips, "newPosition emissions skipped (clock overrun)");
        }
    })
}

async fn acquire_tile_rows(
    stream: &RasterStream,
    plan: &ScanPlan,
    r0: usize,
    r1: usize,
    drift: (f64, f64),
    shared: &Arc<FutureShared>,
) -> AcqResult<TileData> {
    let rows = r1 - r0;
    let (_, w) = plan.shape;
    let entries = rows * plan.entries_per_row();
    let pixels = rows * w;

    let mut wave = plan.waveform.slice_rows(r0, r1);
    wave.translate(drift.0, drift.1);
    let wave = expand_dpr(&wave, plan.timing.dpr);
    let expected = plan.entry_time() * (entries as u32);

    // prepare every reader before anything runs
    let mut subexp: Vec<u32> = Vec::with_capacity(stream.detectors.len());
    for det in &stream.detectors {
        let k = match det.kind() {
            DetectorKind::Analog | DetectorKind::Counting => {
                let extra = usize::from(det.discards_first_sample());
                det.prepare(entries * plan.samples_per_entry() + extra, expected)
                    .await?;
                1
            }
            _ => {
                let k = sub_exposures(stream, det);
                det.prepare(pixels * k as usize, expected).await?;
                k
            }
        };
        subexp.push(k);
    }

    shared.checkpoint()?;

    // readers first so no sample is lost, emitter last in software mode
    for det in &stream.detectors {
        det.run().await?;
    }
    let mut writer = match stream
        .emitter
        .write_waveform(&wave, plan.timing.period * plan.timing.osr as u32, plan.trigger)
        .await
    {
        Ok(w) => w,
        Err(e) => {
            for d in &stream.detectors {
                d.cancel().await;
            }
            return Err(e);
        }
    };

    let notifier = spawn_position_notifier(stream, plan, rows, shared);

    let mut blocks: Vec<RawBlock> = Vec::with_capacity(stream.detectors.len());
    let timeout = reader_timeout(expected);
    for det in &stream.detectors {
        let wait = tokio::select! {
            r = det.wait(timeout) => r,
            _ = shared.cancel_notify.notified() => Err(AcqError::Cancelled),
        };
        match wait {
            Ok(block) => blocks.push(block),
            Err(e) => {
                notifier.abort();
                for d in &stream.detectors {
                    d.cancel().await;
                }
                writer.cancel().await;
                return Err(e);
            }
        }
    }

    // flush the writer state
    if let Err(e) = writer.wait(writer_timeout(expected)).await {
        notifier.abort();
        writer.cancel().await;
        return Err(e);
    }
    writer.cancel().await;
    notifier.abort();

    decimate_tile(stream, plan, TileSpan::Rows { r0, r1 }, blocks, &subexp)
}

async fn acquire_tile_pixels(
    stream: &RasterStream,
    plan: &ScanPlan,
    row: usize,
    c0: usize,
    c1: usize,
    drift: (f64, f64),
    shared: &Arc<FutureShared>,
) -> AcqResult<TileData> {
    let per_pixel = plan.entries_per_pixel();
    let cols = plan.waveform.cols;
    let run = c1 - c0;

    // one pixel run assembled from per-pixel writes
    let mut planes: Vec<Option<DynArray>> = stream
        .detectors
        .iter()
        .map(|det| match det.kind() {
            DetectorKind::Analog => {
                Some(DynArray::zeros(Dtype::U16, &[plan.fuzz, run * plan.fuzz]))
            }
            DetectorKind::Counting => {
                Some(DynArray::zeros(Dtype::U32, &[plan.fuzz, run * plan.fuzz]))
            }
            _ => None,
        })
        .collect();
    let mut frames: Vec<Vec<DataArray>> = stream.detectors.iter().map(|_| Vec::new()).collect();

    // one newPosition per completed pixel, strictly in scan order
    let np_event = stream.emitter.new_position_event();

    for px in c0..c1 {
        shared.checkpoint()?;

        // margin entries lead the row's first pixel only
        let base = row * cols + plan.margin + px * per_pixel;
        let mut xy: Vec<[f64; 2]> = Vec::with_capacity(plan.margin + per_pixel);
        if px == 0 {
            xy.extend_from_slice(&plan.waveform.xy[row * cols..row * cols + plan.margin]);
        }
        xy.extend_from_slice(&plan.waveform.xy[base..base + per_pixel]);
        let margin_entries = if px == 0 { plan.margin } else { 0 };
        let mut wave = Waveform {
            rows: 1,
            cols: xy.len(),
            xy,
        };
        wave.translate(drift.0, drift.1);
        let wave = expand_dpr(&wave, plan.timing.dpr);

        let entries = margin_entries + per_pixel;
        let expected = plan.entry_time() * entries as u32;

        let mut subexp: Vec<u32> = Vec::with_capacity(stream.detectors.len());
        for det in &stream.detectors {
            let k = match det.kind() {
                DetectorKind::Analog | DetectorKind::Counting => {
                    let extra = usize::from(det.discards_first_sample());
                    det.prepare(entries * plan.samples_per_entry() + extra, expected)
                        .await?;
                    1
                }
                _ => {
                    let k = sub_exposures(stream, det);
                    det.prepare(k as usize, expected).await?;
                    k
                }
            };
            subexp.push(k);
        }

        for det in &stream.detectors {
            det.run().await?;
        }
        let mut writer = match stream
            .emitter
            .write_waveform(&wave, plan.timing.period * plan.timing.osr as u32, plan.trigger)
            .await
        {
            Ok(w) => w,
            Err(e) => {
                for d in &stream.detectors {
                    d.cancel().await;
                }
                return Err(e);
            }
        };

        let timeout = reader_timeout(expected);
        for (i, det) in stream.detectors.iter().enumerate() {
            let wait = tokio::select! {
                r = det.wait(timeout) => r,
                _ = shared.cancel_notify.notified() => Err(AcqError::Cancelled),
            };
            let block = match wait {
                Ok(b) => b,
                Err(e) => {
                    for d in &stream.detectors {
                        d.cancel().await;
                    }
                    writer.cancel().await;
                    return Err(e);
                }
            };
            place_pixel_block(
                stream, plan, px - c0, margin_entries, block, subexp[i], i, &mut planes,
                &mut frames,
            )?;
        }
        if let Err(e) = writer.wait(writer_timeout(expected)).await {
            writer.cancel().await;
            return Err(e);
        }
        writer.cancel().await;
        np_event.notify();
    }

    Ok(TileData {
        span: TileSpan::PixelRun { row, c0, c1 },
        planes,
        frames,
    })
}

/// Fold one pixel's raw block into the run buffers (pixel-tile path).
/// `px` is relative to the run start.
#[allow(clippy::too_many_arguments)]
fn place_pixel_block(
    stream: &RasterStream,
    plan: &ScanPlan,
    px: usize,
    margin_entries: usize,
    block: RawBlock,
    subexp: u32,
    det_index: usize,
    planes: &mut [Option<DynArray>],
    frames: &mut [Vec<DataArray>],
) -> AcqResult<()> {
    let det = &stream.detectors[det_index];
    let k = plan.fuzz;
    match block {
        RawBlock::Scalars(raw) => {
            let raw = if det.discards_first_sample() {
                drop_lead_in(raw)?
            } else {
                raw
            };
            let entries = margin_entries + plan.entries_per_pixel();
            let average = det.kind() == DetectorKind::Analog;
            let mut per_entry =
                assemble::decimate_entries(&raw, entries, plan.samples_per_entry(), average)?;
            assemble::apply_inversion(&mut per_entry, det.inverted(), det.max_value());
            // sub-raster of this pixel, margin skipped
            if let Some(plane) = planes[det_index].as_mut() {
                let mut i = margin_entries;
                for ky in 0..k {
                    for kx in 0..k {
                        plane.set_at(&[ky, px * k + kx], per_entry.at(&[i]));
                        i += 1;
                    }
                }
            }
        }
        RawBlock::Frames(raw_frames) => {
            let mut integrator = ImageIntegrator::new(subexp);
            for mut frame in raw_frames {
                if det.inverted() {
                    frame.data.invert(det.max_value());
                }
                if let Some(done) = integrator.add(&frame)? {
                    frames[det_index].push(done);
                }
            }
        }
    }
    Ok(())
}

/// Decimate a whole rows-tile worth of raw blocks.
fn decimate_tile(
    stream: &RasterStream,
    plan: &ScanPlan,
    span: TileSpan,
    blocks: Vec<RawBlock>,
    subexp: &[u32],
) -> AcqResult<TileData> {
    let nrows = match span {
        TileSpan::Rows { r0, r1 } => r1 - r0,
        TileSpan::PixelRun { .. } => 1,
    };
    let (_, w) = plan.shape;
    let mut planes: Vec<Option<DynArray>> = stream.detectors.iter().map(|_| None).collect();
    let mut frames: Vec<Vec<DataArray>> = stream.detectors.iter().map(|_| Vec::new()).collect();

    for (i, (det, block)) in stream.detectors.iter().zip(blocks.into_iter()).enumerate() {
        match block {
            RawBlock::Scalars(raw) => {
                let raw = if det.discards_first_sample() {
                    drop_lead_in(raw)?
                } else {
                    raw
                };
                let entries = nrows * plan.entries_per_row();
                let average = det.kind() == DetectorKind::Analog;
                let mut per_entry =
                    assemble::decimate_entries(&raw, entries, plan.samples_per_entry(), average)?;
                assemble::apply_inversion(&mut per_entry, det.inverted(), det.max_value());
                let trimmed = assemble::trim_margin(
                    &per_entry,
                    nrows,
                    plan.entries_per_row(),
                    plan.margin,
                )?;
                planes[i] = Some(assemble::scatter_fine(&trimmed, nrows, w, plan.fuzz)?);
            }
            RawBlock::Frames(raw_frames) => {
                let mut integrator = ImageIntegrator::new(subexp[i]);
                for mut frame in raw_frames {
                    if det.inverted() {
                        frame.data.invert(det.max_value());
                    }
                    if let Some(done) = integrator.add(&frame)? {
                        frames[i].push(done);
                    }
                }
            }
        }
    }

    Ok(TileData {
        span,
        planes,
        frames,
    })
}

/// Write a tile's decimated data into the pass buffers.
fn write_tile(
    stream: &RasterStream,
    plan: &ScanPlan,
    buffers: &mut PassBuffers,
    tile: &TileData,
) -> AcqResult<()> {
    let k = plan.fuzz;
    let (_, w) = plan.shape;
    let first_pixel = match tile.span {
        TileSpan::Rows { r0, .. } => r0 * w,
        TileSpan::PixelRun { row, c0, .. } => row * w + c0,
    };

    for (i, det) in stream.detectors.iter().enumerate() {
        if let Some(block) = &tile.planes[i] {
            if let Some(plane) = buffers.planes[i].as_mut() {
                match tile.span {
                    TileSpan::Rows { r0, .. } => plane.assign_rows(r0 * k, block)?,
                    TileSpan::PixelRun { row, c0, .. } => {
                        // a fuzz-sized band of one row, at a column offset
                        for by in 0..block.shape()[0] {
                            for bx in 0..block.shape()[1] {
                                plane.set_at(
                                    &[row * k + by, c0 * k + bx],
                                    block.at(&[by, bx]),
                                );
                            }
                        }
                    }
                }
            }
        }
        if tile.frames[i].is_empty() {
            continue;
        }
        match stream.caps().per_pixel {
            PerPixel::Image => {
                buffers.images.extend(tile.frames[i].iter().cloned());
            }
            PerPixel::Spectrum | PerPixel::TemporalSpectrum | PerPixel::TimeHistogram => {
                for (j, frame) in tile.frames[i].iter().enumerate() {
                    let pixel = first_pixel + j;
                    let (py, px) = (pixel / w, pixel % w);
                    store_cube_pixel(stream, plan, buffers, det, frame, py, px)?;
                }
            }
            PerPixel::Scalar => {}
        }
    }
    Ok(())
}

/// Allocate the CTZYX cube lazily from the first frame and place one
/// pixel's camera payload.
fn store_cube_pixel(
    stream: &RasterStream,
    plan: &ScanPlan,
    buffers: &mut PassBuffers,
    _det: &Arc<dyn Detector>,
    frame: &DataArray,
    py: usize,
    px: usize,
) -> AcqResult<()> {
    let (h, w) = plan.shape;
    let per_pixel = stream.caps().per_pixel;

    let (nc, nt, payload) = match per_pixel {
        PerPixel::Spectrum => {
            let n = frame.data.len();
            (n, 1, frame.data.clone().into_shape(&[n])?)
        }
        PerPixel::TimeHistogram => {
            let n = frame.data.len();
            (1, n, frame.data.clone().into_shape(&[1, n])?)
        }
        PerPixel::TemporalSpectrum => {
            if frame.data.ndim() != 2 {
                return Err(AcqError::External(
                    "streak camera frame is not 2-D".into(),
                ));
            }
            let (nc, nt) = (frame.data.shape()[0], frame.data.shape()[1]);
            (nc, nt, frame.data.clone())
        }
        _ => return Ok(()),
    };

    if buffers.cube.is_none() {
        buffers.cube = Some(DynArray::zeros(frame.data.dtype(), &[nc, nt, 1, h, w]));
        buffers.cube_md = frame.metadata.clone();
    }
    if let Some(cube) = buffers.cube.as_mut() {
        match per_pixel {
            PerPixel::Spectrum => cube.assign_pixel_vector(py, px, &payload)?,
            _ => cube.assign_pixel_plane(py, px, &payload)?,
        }
    }
    Ok(())
}

/// Final arrays of one pass, before leech attachments.
struct PassOutput {
    sem: DataArray,
    points: Vec<DataArray>,
    cube: Option<DataArray>,
    images: Vec<DataArray>,
}

fn assemble_pass(
    stream: &RasterStream,
    plan: &ScanPlan,
    buffers: PassBuffers,
    acq_date: f64,
    drift: (f64, f64),
    pol: Option<Polarization>,
) -> AcqResult<PassOutput> {
    let pos = (plan.center.0 + drift.0, plan.center.1 + drift.1);
    let fine_pixel = (
        plan.pixel_size.0 / plan.fuzz as f64,
        plan.pixel_size.1 / plan.fuzz as f64,
    );
    let base = Metadata {
        pos: Some(pos),
        rotation: Some(stream.rotation),
        acq_date: Some(acq_date),
        ..Default::default()
    };

    let mut planes = buffers.planes.into_iter();
    let sem_plane = planes
        .next()
        .flatten()
        .ok_or_else(|| AcqError::External("scan produced no SEM plane".into()))?;
    let sem_md = base.overlay(&Metadata {
        pixel_size: Some(fine_pixel),
        dwell_time: Some(stream.pixel_dwell().as_secs_f64()),
        dims: Some(DIMS_YX.into()),
        detector_type: Some(stream.detectors[0].name().to_string()),
        user_tint: stream.tints[0],
        ..Default::default()
    });
    let sem = DataArray::new(sem_plane, sem_md);

    let mut points = Vec::new();
    for (i, plane) in planes.enumerate() {
        let det_index = i + 1;
        if let Some(plane) = plane {
            let md = base.overlay(&Metadata {
                pixel_size: Some(fine_pixel),
                dwell_time: Some(stream.pixel_dwell().as_secs_f64()),
                dims: Some(DIMS_YX.into()),
                detector_type: Some(stream.detectors[det_index].name().to_string()),
                user_tint: stream.tints[det_index],
                ..Default::default()
            });
            points.push(DataArray::new(plane, md));
        }
    }

    let cube = buffers.cube.map(|cube| {
        let md = base.overlay(&buffers.cube_md).overlay(&Metadata {
            pixel_size: Some(plan.pixel_size),
            exp_time: buffers.cube_md.exp_time,
            dims: Some(DIMS_CTZYX.into()),
            ..Default::default()
        });
        DataArray::new(cube, md)
    });

    let images = buffers
        .images
        .into_iter()
        .map(|img| {
            let md = base.overlay(&img.metadata).overlay(&Metadata {
                pixel_size: Some(plan.pixel_size),
                pol_mode: pol,
                dims: Some(DIMS_YX.into()),
                ..Default::default()
            });
            DataArray::new(img.data, md)
        })
        .collect();

    Ok(PassOutput {
        sem,
        points,
        cube,
        images,
    })
}

// ---------------------------------------------------------------------------
// Scan-stage variant
// ---------------------------------------------------------------------------

/// Move a mechanical stage to each pixel with the emitter held at the ROI
/// center. The stage's pre-scan position is restored on every exit path.
async fn run_stage_scan(
    stream: &RasterStream,
    plan: &ScanPlan,
    leeches: &mut [Box<dyn Leech>],
    shared: &Arc<FutureShared>,
) -> AcqOutcome {
    let stage = match &stream.scan_stage {
        Some(s) => s.clone(),
        None => {
            return AcqOutcome {
                data: Vec::new(),
                error: Some(AcqError::External("stage scan without a stage".into())),
                cancelled: false,
            }
        }
    };

    let pre_position = match stage.position().await {
        Ok(p) => p,
        Err(e) => {
            return AcqOutcome {
                data: Vec::new(),
                error: Some(e),
                cancelled: false,
            }
        }
    };

    let result = stage_scan_inner(stream, plan, leeches, shared).await;

    // restore the stage wherever we stopped
    match stage.move_abs(pre_position).await {
        Ok(mut handle) => {
            if let Err(e) = handle.wait(Duration::from_secs(30)).await {
                warn!("scan stage restore failed: {e}");
            }
        }
        Err(e) => warn!("scan stage restore failed: {e}"),
    }

    match result {
        Ok(data) => AcqOutcome {
            data,
            error: None,
            cancelled: false,
        },
        Err(AcqError::Cancelled) => {
            cleanup_hardware(stream).await;
            AcqOutcome {
                data: Vec::new(),
                error: None,
                cancelled: true,
            }
        }
        Err(e) => {
            cleanup_hardware(stream).await;
            AcqOutcome {
                data: Vec::new(),
                error: Some(e),
                cancelled: false,
            }
        }
    }
}

async fn stage_scan_inner(
    stream: &RasterStream,
    plan: &ScanPlan,
    leeches: &mut [Box<dyn Leech>],
    shared: &Arc<FutureShared>,
) -> AcqResult<Vec<DataArray>> {
    let acq_date = epoch_seconds();
    let stage = stream
        .scan_stage
        .as_ref()
        .ok_or_else(|| AcqError::External("stage scan without a stage".into()))?;
    let (h, w) = plan.shape;

    wait_sync_events(stream, shared).await?;
    stream.emitter.set_scanning_indicator(true, false).await?;

    let start = LeechStart {
        total_pixels: plan.total_pixels(),
        pixel_time: plan.pixel_time(),
    };
    let mut next_fire: Vec<Option<u64>> = Vec::with_capacity(leeches.len());
    for leech in leeches.iter_mut() {
        match leech.series_start(&start).await {
            Ok(np) => next_fire.push(Some(np)),
            Err(e) if leech.required() => return Err(e),
            Err(e) => {
                warn!(leech = leech.name(), "leech series_start failed: {e}");
                next_fire.push(None);
            }
        }
    }

    // emitter fixed at the ROI center for the whole scan
    stream.emitter.park_at(plan.center).await?;

    let mut buffers = PassBuffers::new(stream, plan);
    let mut pixels_done: u64 = 0;

    for py in 0..h {
        for px in 0..w {
            shared.checkpoint()?;

            let target_x = plan.center.0 + (px as f64 + 0.5 - w as f64 / 2.0) * plan.pixel_size.0;
            let target_y = plan.center.1 + (py as f64 + 0.5 - h as f64 / 2.0) * plan.pixel_size.1;
            let mut mv = stage
                .move_abs(
                    [("x".to_string(), target_x), ("y".to_string(), target_y)]
                        .into_iter()
                        .collect(),
                )
                .await?;
            mv.wait(Duration::from_secs(30)).await?;

            let tile = acquire_point(stream, plan, shared).await?;
            place_point(stream, plan, &mut buffers, tile, py, px)?;
            pixels_done += 1;
            publish_progress(shared, plan, pixels_done);

            for (i, leech) in leeches.iter_mut().enumerate() {
                if next_fire[i].is_some_and(|np| np <= pixels_done) {
                    match leech.fire(pixels_done).await {
                        Ok(fire) => next_fire[i] = Some(fire.next_pixel),
                        Err(e) if leech.required() => return Err(e),
                        Err(e) => {
                            warn!(leech = leech.name(), "leech failed: {e}");
                            next_fire[i] = None;
                        }
                    }
                }
            }
        }
    }

    let pass = assemble_pass(stream, plan, buffers, acq_date, (0.0, 0.0), None)?;
    let mut outputs = Vec::new();
    outputs.push(pass.sem);
    outputs.extend(pass.points);
    if let Some(cube) = pass.cube {
        outputs.push(cube);
    }
    outputs.extend(pass.images);

    for (leech, nf) in leeches.iter_mut().zip(next_fire.iter()) {
        if nf.is_some() {
            leech.complete(&mut outputs);
        }
    }

    stream.emitter.park_at(stream.emitter.resting_position()).await?;
    stream.emitter.set_scanning_indicator(false, false).await?;
    Ok(outputs)
}

/// One stationary-point acquisition: every detector reads one pixel's
/// worth with the emitter holding position.
async fn acquire_point(
    stream: &RasterStream,
    plan: &ScanPlan,
    shared: &Arc<FutureShared>,
) -> AcqResult<TileData> {
    let expected = plan.pixel_time();

    let mut subexp: Vec<u32> = Vec::with_capacity(stream.detectors.len());
    for det in &stream.detectors {
        let k = match det.kind() {
            DetectorKind::Analog | DetectorKind::Counting => {
                let extra = usize::from(det.discards_first_sample());
                det.prepare(plan.samples_per_entry() * plan.entries_per_pixel() + extra, expected)
                    .await?;
                1
            }
            _ => {
                let k = sub_exposures(stream, det);
                det.prepare(k as usize, expected).await?;
                k
            }
        };
        subexp.push(k);
    }

    shared.checkpoint()?;
    for det in &stream.detectors {
        det.run().await?;
    }

    let timeout = reader_timeout(expected);
    let mut blocks = Vec::with_capacity(stream.detectors.len());
    for det in &stream.detectors {
        let wait = tokio::select! {
            r = det.wait(timeout) => r,
            _ = shared.cancel_notify.notified() => Err(AcqError::Cancelled),
        };
        match wait {
            Ok(b) => blocks.push(b),
            Err(e) => {
                for d in &stream.detectors {
                    d.cancel().await;
                }
                return Err(e);
            }
        }
    }

    let mut planes: Vec<Option<DynArray>> = stream.detectors.iter().map(|_| None).collect();
    let mut frames: Vec<Vec<DataArray>> = stream.detectors.iter().map(|_| Vec::new()).collect();
    for (i, (det, block)) in stream.detectors.iter().zip(blocks.into_iter()).enumerate() {
        match block {
            RawBlock::Scalars(raw) => {
                let raw = if det.discards_first_sample() {
                    drop_lead_in(raw)?
                } else {
                    raw
                };
                let average = det.kind() == DetectorKind::Analog;
                let entries = plan.entries_per_pixel();
                let mut per_entry =
                    assemble::decimate_entries(&raw, entries, plan.samples_per_entry(), average)?;
                assemble::apply_inversion(&mut per_entry, det.inverted(), det.max_value());
                planes[i] = Some(per_entry);
            }
            RawBlock::Frames(raw_frames) => {
                let mut integrator = ImageIntegrator::new(subexp[i]);
                for mut frame in raw_frames {
                    if det.inverted() {
                        frame.data.invert(det.max_value());
                    }
                    if let Some(done) = integrator.add(&frame)? {
                        frames[i].push(done);
                    }
                }
            }
        }
    }

    Ok(TileData {
        span: TileSpan::PixelRun {
            row: 0,
            c0: 0,
            c1: 1,
        },
        planes,
        frames,
    })
}

/// Place one stage-scan point into the pass buffers.
fn place_point(
    stream: &RasterStream,
    plan: &ScanPlan,
    buffers: &mut PassBuffers,
    tile: TileData,
    py: usize,
    px: usize,
) -> AcqResult<()> {
    let k = plan.fuzz;
    for (i, det) in stream.detectors.iter().enumerate() {
        if let Some(per_entry) = &tile.planes[i] {
            if let Some(plane) = buffers.planes[i].as_mut() {
                let mut e = 0;
                for ky in 0..k {
                    for kx in 0..k {
                        plane.set_at(&[py * k + ky, px * k + kx], per_entry.at(&[e]));
                        e += 1;
                    }
                }
            }
        }
        for frame in &tile.frames[i] {
            match stream.caps().per_pixel {
                PerPixel::Image => buffers.images.push(frame.clone()),
                PerPixel::Spectrum | PerPixel::TemporalSpectrum | PerPixel::TimeHistogram => {
                    store_cube_pixel(stream, plan, buffers, det, frame, py, px)?;
                }
                PerPixel::Scalar => {}
            }
        }
    }
    Ok(())
}
