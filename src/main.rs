//! VDBOX Backend Demo Service
//!
//! Drives a configured workload through the multi-pipe scheduler:
//! 1. Loads the configuration (first argument, or defaults)
//! 2. Allocates picture, status and semaphore resources
//! 3. Builds each frame's pipe buffers and submits them together
//! 4. Executes them on the simulated engine
//! 5. Waits for the frame's status report

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vdbox_backend::config::{Config, DemoConfig};
use vdbox_backend::encoder::{create_encoder, CodecKind, CodecParams, HevcParams, TileLayout, Vp9Params};
use vdbox_backend::engine::SimulatedEngine;
use vdbox_backend::packet::{PictureResources, ProbabilityUpdatePacket};
use vdbox_backend::resource::{GpuRef, ResourceTracker};
use vdbox_backend::scalability::{FrameJob, ScalabilityEngine};
use vdbox_backend::status_report::{StatusMonitor, StatusReport};

const VP9_CONTEXT_DWORDS: u32 = 16;
const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

/// Probability buffers for the VP9 workload.
struct Vp9Contexts {
    active: GpuRef,
    saved: GpuRef,
}

/// Demo service state
struct DemoService {
    config: Config,
    tracker: ResourceTracker,
    status: Arc<Mutex<StatusReport>>,
    scheduler: ScalabilityEngine,
    params: CodecParams,
    resources: PictureResources,
    vp9: Option<Vp9Contexts>,
    shutdown: Arc<AtomicBool>,
}

fn demo_params(demo: &DemoConfig) -> Result<CodecParams> {
    match demo.codec {
        CodecKind::Hevc => {
            let mut p = HevcParams::new(demo.direction, demo.width, demo.height);
            p.tiles = TileLayout::uniform(demo.tile_columns, 1, p.width_in_ctb(), p.height_in_ctb())?;
            p.slices[0].bitstream_length = 0x800;
            Ok(CodecParams::Hevc(p))
        }
        CodecKind::Vp9 => {
            let mut p = Vp9Params::new(demo.direction, demo.width, demo.height);
            p.tiles = TileLayout::uniform(demo.tile_columns, 1, p.width_in_sb(), p.height_in_sb())?;
            p.bitstream_length = 0x800;
            Ok(CodecParams::Vp9(p))
        }
        other => bail!("demo workload cannot drive {:?}", other),
    }
}

impl DemoService {
    fn new(config: Config) -> Result<Self> {
        let params = demo_params(&config.demo)?;
        params.validate()?;

        let mut tracker = ResourceTracker::new();
        let resources = PictureResources::allocate(&mut tracker, &params)?;
        let status = StatusReport::new(&mut tracker, config.status_ring_depth, config.status_options())?;
        let vp9 = match params.kind() {
            CodecKind::Vp9 => {
                let size = VP9_CONTEXT_DWORDS * 4;
                Some(Vp9Contexts {
                    active: tracker.create_buffer("vp9 probabilities", size, true)?.at(0),
                    saved: tracker.create_buffer("vp9 saved context", size, true)?.at(0),
                })
            }
            _ => None,
        };

        let encoder = create_encoder(config.generation);
        info!("Using {:?} command encoder", encoder.generation());
        let scheduler = ScalabilityEngine::new(encoder, config.scalability_options());

        Ok(Self {
            config,
            tracker,
            status: Arc::new(Mutex::new(status)),
            scheduler,
            params,
            resources,
            vp9,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    fn probability_update(&self, frame: u32) -> Option<ProbabilityUpdatePacket> {
        let vp9 = self.vp9.as_ref()?;
        Some(ProbabilityUpdatePacket {
            probability_buffer: vp9.active,
            saved_context: (frame > 0).then_some(vp9.saved),
            context_dwords: VP9_CONTEXT_DWORDS,
            updates: vec![(0, frame), (4, 0x80)],
        })
    }

    /// Build, execute and retire one frame.
    async fn run_frame(&mut self, monitor: &StatusMonitor, frame: u32) -> Result<()> {
        let unit_id = frame + 1;
        let job = FrameJob {
            params: &self.params,
            resources: &self.resources,
            row_store: self.config.row_store_support(),
            unit_id,
            frame_number: frame,
            bitstream_per_tile: 0x4000,
            probability_update: self.probability_update(frame),
        };
        let submissions = {
            let mut status = self
                .status
                .lock()
                .map_err(|_| anyhow!("status report lock poisoned"))?;
            self.scheduler.encode_frame(&mut self.tracker, &mut status, &job)?
        };

        let buffers: Vec<&[u8]> = submissions.iter().map(|s| s.buffer.as_bytes()).collect();
        let stats = SimulatedEngine::new(&self.tracker).run(&buffers)?;
        for submission in &submissions {
            submission.signal_frame_tracking(&self.tracker)?;
        }

        let report = tokio::time::timeout(FRAME_TIMEOUT, monitor.wait_for(unit_id))
            .await
            .with_context(|| format!("unit {unit_id} never completed"))??;
        match &report.error {
            None => info!(
                "Frame {} done on {} pipe(s): {} commands, {} semaphore stalls",
                frame,
                submissions.len(),
                stats.commands,
                stats.semaphore_stalls
            ),
            Some(err) => warn!("Frame {} reported {} (code {})", frame, err, report.code()),
        }
        self.scheduler.recycle(submissions);
        Ok(())
    }

    /// Main processing loop
    async fn run_loop(&mut self) -> Result<()> {
        let period = Duration::from_millis(self.config.demo.poll_interval_ms.max(1));
        let monitor = StatusMonitor::new(self.status.clone(), period);
        let frames = self.config.demo.frames;

        info!("Entering frame loop...");
        let mut frame = 0;
        while frames == 0 || frame < frames {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("Shutdown requested");
                break;
            }
            if let Err(e) = self.run_frame(&monitor, frame).await {
                error!("Frame {} failed: {:#}", frame, e);
                return Err(e);
            }
            frame += 1;
        }
        info!(
            "Ran {} frame(s) with {} command buffer(s) allocated",
            frame,
            self.scheduler.pool().allocated()
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    info!("VDBOX backend starting...");

    // Load config from the first argument, or fall back to defaults
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    config.validate()?;
    info!("Configuration loaded: {:?}", config);

    let mut service = DemoService::new(config)?;

    // Setup Ctrl+C handler
    let shutdown = service.shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        shutdown.store(true, Ordering::Relaxed);
    })
    .context("setting Ctrl+C handler")?;

    let result = service.run_loop().await;
    info!("VDBOX backend shutting down");
    result
}
