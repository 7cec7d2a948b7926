//! Scalability Module
//!
//! Splits one frame across up to four VDBOX pipes. Each pipe gets its own
//! command buffer; cross-pipe ordering exists only where a GPU semaphore
//! encodes it. Buffers are held until the last pipe is built and then
//! submitted together.
//!
//! Lifecycle per frame:
//! ```text
//! Uninitialized -> Configured{Single,Multi} -> PipeExecuting(0..N) -> Synced -> Submitted
//! ```

use std::collections::HashSet;
use std::fmt;

use bitflags::bitflags;
use tracing::{debug, info, trace, warn};

use crate::cmdbuf::{CommandBuffer, CommandDescriptor};
use crate::encoder::{CodecKind, CodecParams, CodingDirection, CommandEncoder, RowStoreSupport, TileRect};
use crate::error::{MediaError, Result};
use crate::mi::FlushDwParams;
use crate::packet::{
    Packet, PictureEndPacket, PicturePacket, PictureResources, PipeAssignment, ProbabilityUpdatePacket, TilePacket,
};
use crate::protocol::*;
use crate::resource::{GpuRef, ResourceHandle, ResourceTracker};
use crate::sizer::{estimate_size, verify_space, BufferPool, SizeEstimate, UnitOfWork};
use crate::status_report::StatusReport;

/// Rendezvous semaphores available to `SyncRole::AllPipes`.
pub const ALL_PIPES_SEMAPHORES: u32 = 4;
/// Per-pipe semaphores are written by post-sync flushes, which need 8-byte
/// aligned targets.
const PIPE_SEMAPHORE_STRIDE: u32 = 8;

bitflags! {
    /// Attributes of one pipe's buffer at submission.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SubmitFlags: u32 {
        const MASTER = 1 << 0;
        const SLAVE = 1 << 1;
        const LAST_PIPE = 1 << 2;
    }
}

/// Cross-pipe synchronization patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncRole {
    /// Every pipe increments, then waits until all have arrived.
    AllPipes,
    /// Every pipe flags its pass; the first pipe waits for all flags.
    FirstWaitsForOthers,
    /// The first pipe releases exactly one other pipe.
    OneWaitsForAnother,
    /// The first pipe releases every other pipe.
    OthersWaitForOne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalabilityState {
    Uninitialized,
    ConfiguredSingle,
    ConfiguredMulti,
    PipeExecuting(usize),
    Synced,
    Submitted,
}

/// The combination a GPU context is created for. Also handed to the
/// scheduler as the engine hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextKey {
    pub codec: CodecKind,
    pub direction: CodingDirection,
    pub num_pipes: usize,
    pub width: u32,
    pub height: u32,
}

/// Engine-instance configuration. Never mutated; a different key means a
/// new context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuContext {
    pub id: u32,
    pub key: ContextKey,
    /// VDBOX instance serving each pipe.
    pub affinity: Vec<usize>,
    pub frame_tracking: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalabilityOptions {
    /// Pipe count to use regardless of tiling, 0 for automatic.
    pub forced_pipes: usize,
    pub max_pipes: usize,
    pub allow_single_pipe_fallback: bool,
    pub semaphore_delay_writes: u32,
    pub frame_tracking: bool,
    pub resize_retries: u32,
    pub initial_buffer_size: usize,
    pub initial_patch_entries: usize,
    pub max_buffer_size: usize,
}

impl Default for ScalabilityOptions {
    fn default() -> Self {
        Self {
            forced_pipes: 0,
            max_pipes: MAX_PIPES,
            allow_single_pipe_fallback: true,
            semaphore_delay_writes: 4,
            frame_tracking: true,
            resize_retries: 2,
            initial_buffer_size: 0x4000,
            initial_patch_entries: 128,
            max_buffer_size: MAX_COMMAND_BUFFER_SIZE,
        }
    }
}

/// One pipe's finished buffer, ready for the kernel.
#[derive(Debug)]
pub struct Submission {
    pub pipe: usize,
    pub flags: SubmitFlags,
    pub context_id: u32,
    /// Tag the kernel writes to the tracking address once the frame retires.
    pub frame_tracking: Option<(GpuRef, u32)>,
    pub buffer: CommandBuffer,
}

impl Submission {
    /// Perform the frame-tracking write the kernel does on completion.
    pub fn signal_frame_tracking(&self, tracker: &ResourceTracker) -> Result<()> {
        if let Some((target, tag)) = self.frame_tracking {
            tracker.host_memory(target.handle)?.write_u32(target.offset, tag)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Semaphores {
    all_pipes: ResourceHandle,
    pipe_wait: ResourceHandle,
    one_for_another: ResourceHandle,
    others_for_one: ResourceHandle,
    delay: ResourceHandle,
}

impl Semaphores {
    fn allocate(tracker: &mut ResourceTracker) -> Result<Self> {
        let layout = [
            ("semaphore all pipes", ALL_PIPES_SEMAPHORES * DWORD_SIZE as u32),
            ("semaphore pipe wait", MAX_PIPES as u32 * PIPE_SEMAPHORE_STRIDE),
            ("semaphore one for another", DWORD_SIZE as u32),
            ("semaphore others for one", DWORD_SIZE as u32),
            ("semaphore delay", DWORD_SIZE as u32),
        ];
        let mut handles = Vec::with_capacity(layout.len());
        for (name, size) in layout {
            match tracker.create_buffer(name, size, true) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    for handle in handles {
                        tracker.destroy(handle);
                    }
                    return Err(err);
                }
            }
        }
        Ok(Self {
            all_pipes: handles[0],
            pipe_wait: handles[1],
            one_for_another: handles[2],
            others_for_one: handles[3],
            delay: handles[4],
        })
    }

    fn handles(&self) -> [ResourceHandle; 5] {
        [self.all_pipes, self.pipe_wait, self.one_for_another, self.others_for_one, self.delay]
    }

    fn pipe_wait_slot(&self, pipe: usize) -> GpuRef {
        self.pipe_wait.at(pipe as u32 * PIPE_SEMAPHORE_STRIDE)
    }
}

/// Everything needed to build one frame.
#[derive(Debug, Clone)]
pub struct FrameJob<'a> {
    pub params: &'a CodecParams,
    pub resources: &'a PictureResources,
    pub row_store: RowStoreSupport,
    pub unit_id: u32,
    pub frame_number: u32,
    pub bitstream_per_tile: u32,
    pub probability_update: Option<ProbabilityUpdatePacket>,
}

/// Distribute tiles over pipes by column.
pub fn assign_tiles(params: &CodecParams, num_pipes: usize) -> Result<Vec<Vec<TileRect>>> {
    let layout = params
        .tiles()
        .ok_or_else(|| MediaError::unsupported(format!("{:?} has no tile layout", params.kind())))?;
    if num_pipes == 0 || (num_pipes > 1 && num_pipes > layout.columns() as usize) {
        return Err(MediaError::invalid(format!(
            "{} pipes for {} tile columns",
            num_pipes,
            layout.columns()
        )));
    }
    let mut per_pipe = vec![Vec::new(); num_pipes];
    for tile in layout.tiles() {
        per_pipe[tile.column as usize % num_pipes].push(tile);
    }
    Ok(per_pipe)
}

pub struct ScalabilityEngine {
    encoder: Box<dyn CommandEncoder>,
    options: ScalabilityOptions,
    state: ScalabilityState,
    context: Option<GpuContext>,
    next_context_id: u32,
    semaphores: Option<Semaphores>,
    num_pipes: usize,
    pipe_closed: bool,
    current_pass: u32,
    used_roles: HashSet<(SyncRole, u32, usize)>,
    one_for_another_consumer: Option<usize>,
    buffers: Vec<Option<CommandBuffer>>,
    pool: BufferPool,
}

impl ScalabilityEngine {
    pub fn new(encoder: Box<dyn CommandEncoder>, options: ScalabilityOptions) -> Self {
        let pool = BufferPool::new(
            options.initial_buffer_size,
            options.initial_patch_entries,
            options.max_buffer_size,
        );
        Self {
            encoder,
            options,
            state: ScalabilityState::Uninitialized,
            context: None,
            next_context_id: 1,
            semaphores: None,
            num_pipes: 0,
            pipe_closed: false,
            current_pass: 0,
            used_roles: HashSet::new(),
            one_for_another_consumer: None,
            buffers: Vec::new(),
            pool,
        }
    }

    pub fn encoder(&self) -> &dyn CommandEncoder {
        self.encoder.as_ref()
    }

    pub fn state(&self) -> ScalabilityState {
        self.state
    }

    pub fn context(&self) -> Option<&GpuContext> {
        self.context.as_ref()
    }

    pub fn num_pipes(&self) -> usize {
        self.num_pipes
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// BRC pass the next pipe flags in `FirstWaitsForOthers`.
    pub fn set_pass(&mut self, pass: u32) {
        self.current_pass = pass;
    }

    fn contract<T>(&mut self, msg: String) -> Result<T> {
        self.guard(Err(MediaError::contract(msg)))
    }

    /// Tear the context down on frame-fatal errors.
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_frame_fatal() {
                self.teardown(err);
            }
        }
        result
    }

    fn teardown(&mut self, cause: &dyn fmt::Display) {
        warn!("Tearing down scalability context after: {}", cause);
        self.context = None;
        self.buffers.clear();
        self.num_pipes = 0;
        self.state = ScalabilityState::Uninitialized;
    }

    /// Recover from a device reset: everything in flight is void, the
    /// partially built frame is dropped and every semaphore is zeroed.
    pub fn device_reset(&mut self, tracker: &ResourceTracker) -> Result<()> {
        self.teardown(&"device reset");
        self.used_roles.clear();
        self.one_for_another_consumer = None;
        if let Some(sems) = self.semaphores {
            for handle in sems.handles() {
                let memory = tracker.host_memory(handle)?;
                memory.fill(0, memory.len(), 0)?;
            }
        }
        Ok(())
    }

    fn desired_pipes(&self, params: &CodecParams) -> Result<usize> {
        let columns = params.tiles().map_or(1, |t| t.columns() as usize);
        if self.options.forced_pipes > 0 {
            let forced = self.options.forced_pipes;
            if forced > MAX_PIPES || (forced > 1 && forced > columns) {
                return Err(MediaError::invalid(format!(
                    "forced {forced} pipes, picture has {columns} tile columns"
                )));
            }
            return Ok(forced);
        }
        Ok(columns.min(self.options.max_pipes.clamp(1, MAX_PIPES)))
    }

    /// Choose the pipe count for `params` and make sure a matching context
    /// and its semaphores exist. Returns the pipe count.
    pub fn configure(&mut self, tracker: &mut ResourceTracker, params: &CodecParams) -> Result<usize> {
        match self.state {
            ScalabilityState::PipeExecuting(_) | ScalabilityState::Synced => {
                return self.contract(format!("reconfigure requested mid-frame in {:?}", self.state));
            }
            _ => {}
        }
        params.validate()?;
        let mut pipes = self.desired_pipes(params)?;

        if pipes > 1 && self.semaphores.is_none() {
            match Semaphores::allocate(tracker) {
                Ok(semaphores) => self.semaphores = Some(semaphores),
                Err(err) if self.options.allow_single_pipe_fallback => {
                    warn!("Semaphore allocation failed ({}), falling back to one pipe", err);
                    pipes = 1;
                }
                Err(err) => {
                    self.teardown(&err);
                    return Err(err);
                }
            }
        }

        let geometry = params.geometry();
        let key = ContextKey {
            codec: params.kind(),
            direction: params.direction(),
            num_pipes: pipes,
            width: geometry.width,
            height: geometry.height,
        };
        if self.context.as_ref().map(|c| c.key) != Some(key) {
            let context = GpuContext {
                id: self.next_context_id,
                key,
                affinity: (0..pipes).collect(),
                frame_tracking: self.options.frame_tracking,
            };
            self.next_context_id += 1;
            info!(
                "Created GPU context {} for {:?} {:?} {}x{} on {} pipe(s)",
                context.id, key.codec, key.direction, key.width, key.height, pipes
            );
            self.context = Some(context);
        }

        self.num_pipes = pipes;
        self.buffers.clear();
        self.state = if pipes > 1 {
            ScalabilityState::ConfiguredMulti
        } else {
            ScalabilityState::ConfiguredSingle
        };
        Ok(pipes)
    }

    /// Start building `pipe`'s buffer. Pipes are built strictly in order.
    pub fn begin_pipe(&mut self, pipe: usize, estimate: &SizeEstimate) -> Result<()> {
        let in_order = match self.state {
            ScalabilityState::ConfiguredSingle | ScalabilityState::ConfiguredMulti | ScalabilityState::Submitted => {
                pipe == 0 && self.context.is_some()
            }
            ScalabilityState::PipeExecuting(current) => self.pipe_closed && pipe == current + 1,
            _ => false,
        };
        if !in_order || pipe >= self.num_pipes {
            return self.contract(format!("pipe {} started out of order in {:?}", pipe, self.state));
        }

        if pipe == 0 {
            self.used_roles.clear();
            self.one_for_another_consumer = None;
            self.buffers = (0..self.num_pipes).map(|_| None).collect();
        }
        let acquired = self.pool.acquire(estimate);
        let mut buffer = self.guard(acquired)?;
        let verified = verify_space(&mut buffer, estimate, self.options.resize_retries);
        self.guard(verified)?;

        self.buffers[pipe] = Some(buffer);
        self.pipe_closed = false;
        self.state = ScalabilityState::PipeExecuting(pipe);
        trace!("Building pipe {} of {}", pipe, self.num_pipes);
        Ok(())
    }

    pub fn assignment(&self) -> Result<PipeAssignment> {
        match self.state {
            ScalabilityState::PipeExecuting(index) if !self.pipe_closed => Ok(PipeAssignment {
                index,
                num_pipes: self.num_pipes,
            }),
            _ => Err(MediaError::contract(format!("no pipe is being built in {:?}", self.state))),
        }
    }

    fn current_buffer(&mut self) -> Result<(usize, &mut CommandBuffer)> {
        let pipe = self.assignment()?.index;
        match self.buffers.get_mut(pipe).and_then(Option::as_mut) {
            Some(buffer) => Ok((pipe, buffer)),
            None => Err(MediaError::contract(format!("pipe {pipe} has no buffer"))),
        }
    }

    /// Append already-encoded commands to the current pipe.
    pub fn append(&mut self, cmds: &[CommandDescriptor]) -> Result<()> {
        let result = self.append_to_current(cmds);
        self.guard(result)
    }

    fn append_to_current(&mut self, cmds: &[CommandDescriptor]) -> Result<()> {
        let (_, buffer) = self.current_buffer()?;
        let bytes = cmds.iter().map(CommandDescriptor::len_bytes).sum();
        let patches = cmds.iter().map(|c| c.relocations().len()).sum();
        buffer.ensure_capacity(bytes, patches)?;
        for cmd in cmds {
            buffer.append(cmd)?;
        }
        Ok(())
    }

    /// Emit a packet into the current pipe.
    pub fn emit(&mut self, packet: &dyn Packet, tracker: &ResourceTracker) -> Result<usize> {
        let pipe = self.assignment()?.index;
        let result = match self.buffers.get_mut(pipe).and_then(Option::as_mut) {
            Some(buffer) => packet.emit(self.encoder.as_ref(), tracker, buffer),
            None => Err(MediaError::contract(format!("pipe {pipe} has no buffer"))),
        };
        self.guard(result)
    }

    fn sync_commands(&self,role: SyncRole, semaphore_id: u32, pipe: usize, tracker: &ResourceTracker) -> Result<Vec<CommandDescriptor>> {
        let sems = self
            .semaphores
            .ok_or_else(|| MediaError::missing("scalability semaphores not allocated"))?;
        let enc = self.encoder.as_ref();
        let n = self.num_pipes as u32;
        let mut cmds = Vec::new();
        match role {
            SyncRole::AllPipes => {
                let sem = sems.all_pipes.at(semaphore_id * DWORD_SIZE as u32);
                cmds.push(enc.atomic(tracker, sem, AtomicOp::Increment, 0)?);
                cmds.push(enc.semaphore_wait(tracker, sem, n, CompareOp::Equal)?);
                for _ in 0..self.options.semaphore_delay_writes {
                    cmds.push(enc.store_data_imm(tracker, sems.delay.at(0), SEMAPHORE_DELAY_TOKEN)?);
                }
                cmds.push(enc.atomic(tracker, sem, AtomicOp::Decrement, 0)?);
            }
            SyncRole::FirstWaitsForOthers => {
                let flag = self.current_pass + 1;
                cmds.push(enc.flush_dw(
                    tracker,
                    &FlushDwParams {
                        video_pipeline_cache_invalidate: true,
                        post_sync_write: Some((sems.pipe_wait_slot(pipe), flag)),
                        ..FlushDwParams::default()
                    },
                )?);
                if pipe == 0 {
                    for other in 1..self.num_pipes {
                        cmds.push(enc.semaphore_wait(tracker, sems.pipe_wait_slot(other), flag, CompareOp::Equal)?);
                    }
                }
            }
            SyncRole::OneWaitsForAnother => {
                let sem = sems.one_for_another.at(0);
                if pipe == 0 {
                    cmds.push(enc.atomic(tracker, sem, AtomicOp::Increment, 0)?);
                } else {
                    cmds.push(enc.semaphore_wait(tracker, sem, 1, CompareOp::Equal)?);
                    cmds.push(enc.atomic(tracker, sem, AtomicOp::Decrement, 0)?);
                }
            }
            SyncRole::OthersWaitForOne => {
                let sem = sems.others_for_one.at(0);
                if pipe == 0 {
                    cmds.push(enc.atomic(tracker, sem, AtomicOp::Add, n - 1)?);
                } else {
                    cmds.push(enc.semaphore_wait(tracker, sem, 0, CompareOp::NotEqual)?);
                    cmds.push(enc.atomic(tracker, sem, AtomicOp::Decrement, 0)?);
                }
            }
        }
        Ok(cmds)
    }

    /// Insert the current pipe's side of `role`. A no-op on one pipe.
    pub fn sync_pipe(&mut self, role: SyncRole, semaphore_id: u32, tracker: &ResourceTracker) -> Result<()> {
        let pipe = self.assignment()?.index;
        if self.num_pipes <= 1 {
            return Ok(());
        }
        if role == SyncRole::AllPipes && semaphore_id >= ALL_PIPES_SEMAPHORES {
            return Err(MediaError::invalid(format!("semaphore id {semaphore_id} out of range")));
        }
        let releases_from_master = matches!(role, SyncRole::OneWaitsForAnother | SyncRole::OthersWaitForOne);
        if releases_from_master && pipe > 0 && !self.issued_by(role, 0) {
            return self.contract(format!("pipe {pipe} waits on {role:?} that pipe 0 never released"));
        }
        if !self.used_roles.insert((role, semaphore_id, pipe)) {
            return self.contract(format!(
                "{role:?} on semaphore {semaphore_id} issued twice by pipe {pipe} without reset"
            ));
        }
        if role == SyncRole::OneWaitsForAnother && pipe > 0 {
            if let Some(consumer) = self.one_for_another_consumer {
                return self.contract(format!(
                    "pipe {pipe} waits on a release already consumed by pipe {consumer}"
                ));
            }
            self.one_for_another_consumer = Some(pipe);
        }

        let cmds = self.sync_commands(role, semaphore_id, pipe, tracker)?;
        debug!("Pipe {} sync {:?} ({} commands)", pipe, role, cmds.len());
        self.append(&cmds)
    }

    fn issued_by(&self, role: SyncRole, pipe: usize) -> bool {
        self.used_roles.iter().any(|&(r, _, p)| r == role && p == pipe)
    }

    /// Every wait built into this frame must have a matching signal.
    fn check_rendezvous(&self) -> std::result::Result<(), String> {
        if self.num_pipes <= 1 {
            return Ok(());
        }
        if self.issued_by(SyncRole::FirstWaitsForOthers, 0) {
            if let Some(pipe) = (1..self.num_pipes).find(|&p| !self.issued_by(SyncRole::FirstWaitsForOthers, p)) {
                return Err(format!("pipe 0 waits on a completion flag pipe {pipe} never posts"));
            }
        }
        let barriers: HashSet<u32> = self
            .used_roles
            .iter()
            .filter(|&&(r, _, _)| r == SyncRole::AllPipes)
            .map(|&(_, id, _)| id)
            .collect();
        for id in barriers {
            let arrived = self
                .used_roles
                .iter()
                .filter(|&&(r, i, _)| r == SyncRole::AllPipes && i == id)
                .count();
            if arrived != self.num_pipes {
                return Err(format!(
                    "barrier {id} joined by {arrived} of {} pipes",
                    self.num_pipes
                ));
            }
        }
        Ok(())
    }

    /// Zero a semaphore from the current pipe so its role may be reused.
    /// For `FirstWaitsForOthers` the id is the pipe whose flag is cleared.
    pub fn reset_semaphore(&mut self, role: SyncRole, semaphore_id: u32, tracker: &ResourceTracker) -> Result<()> {
        self.assignment()?;
        if self.num_pipes <= 1 {
            return Ok(());
        }
        let sems = self
            .semaphores
            .ok_or_else(|| MediaError::missing("scalability semaphores not allocated"))?;
        let target = match role {
            SyncRole::AllPipes if semaphore_id < ALL_PIPES_SEMAPHORES => sems.all_pipes.at(semaphore_id * DWORD_SIZE as u32),
            SyncRole::FirstWaitsForOthers if (semaphore_id as usize) < MAX_PIPES => sems.pipe_wait_slot(semaphore_id as usize),
            SyncRole::OneWaitsForAnother => sems.one_for_another.at(0),
            SyncRole::OthersWaitForOne => sems.others_for_one.at(0),
            _ => return Err(MediaError::invalid(format!("semaphore id {semaphore_id} out of range for {role:?}"))),
        };
        let cmd = self.encoder.store_data_imm(tracker, target, 0)?;
        self.append(&[cmd])?;

        self.used_roles
            .retain(|&(r, id, _)| r != role || (role == SyncRole::AllPipes && id != semaphore_id));
        if role == SyncRole::OneWaitsForAnother {
            self.one_for_another_consumer = None;
        }
        Ok(())
    }

    /// Close the current pipe's buffer.
    pub fn end_pipe(&mut self) -> Result<()> {
        let pipe = self.assignment()?.index;
        let end = self.encoder.batch_buffer_end()?;
        self.append(&[end])?;
        self.pipe_closed = true;
        if pipe + 1 == self.num_pipes {
            self.state = ScalabilityState::Synced;
        }
        Ok(())
    }

    /// Hand every pipe's buffer over for execution. Only legal once the last
    /// pipe has been closed.
    pub fn submit(&mut self, status: &mut StatusReport) -> Result<Vec<Submission>> {
        if self.state != ScalabilityState::Synced {
            return self.contract(format!("submit before the last pipe was built ({:?})", self.state));
        }
        let (context_id, frame_tracking) = match &self.context {
            Some(c) => (c.id, c.frame_tracking),
            None => return self.contract("submit without a GPU context".to_string()),
        };
        if let Err(msg) = self.check_rendezvous() {
            return self.contract(msg);
        }
        let tracking = frame_tracking.then(|| (status.global_count_address(), status.next_tag()));

        let count = self.buffers.len();
        let mut submissions = Vec::with_capacity(count);
        for (pipe, slot) in self.buffers.iter_mut().enumerate() {
            let Some(buffer) = slot.take() else {
                return Err(MediaError::contract(format!("pipe {pipe} was never built")));
            };
            let mut flags = if pipe == 0 { SubmitFlags::MASTER } else { SubmitFlags::SLAVE };
            if pipe + 1 == count {
                flags |= SubmitFlags::LAST_PIPE;
            }
            submissions.push(Submission {
                pipe,
                flags,
                context_id,
                frame_tracking: if pipe == 0 { tracking } else { None },
                buffer,
            });
        }
        status.reset()?;
        self.state = ScalabilityState::Submitted;
        info!(
            "Submitted {} pipe buffer(s) on context {} ({} bytes on the master)",
            submissions.len(),
            context_id,
            submissions.first().map_or(0, |s| s.buffer.used())
        );
        Ok(submissions)
    }

    /// Return executed buffers to the pool.
    pub fn recycle(&mut self, submissions: Vec<Submission>) {
        for submission in submissions {
            self.pool.release(submission.buffer);
        }
    }

    /// Size, partition, encode and submit one frame.
    pub fn encode_frame(
        &mut self,
        tracker: &mut ResourceTracker,
        status: &mut StatusReport,
        job: &FrameJob,
    ) -> Result<Vec<Submission>> {
        let pipes = self.configure(tracker, job.params)?;
        let tracker: &ResourceTracker = tracker;

        let mut unit = UnitOfWork::for_frame(job.params, pipes as u32)?;
        unit.semaphore_delay_writes = self.options.semaphore_delay_writes;
        if let Some(update) = &job.probability_update {
            unit.probability_update_dwords = (update.updates.len() as u32).max(update.context_dwords);
        }
        let estimated = estimate_size(self.encoder.as_ref(), &unit, self.options.max_buffer_size);
        let estimate = self.guard(estimated)?;

        let built = self.build_pipes(tracker, status, job, pipes, &estimate);
        if built.is_err() {
            self.abandon_frame(status, job.unit_id);
        }
        built?;
        self.submit(status)
    }

    /// Put back whatever a failed frame had built so the next frame starts
    /// from a configured context.
    fn abandon_frame(&mut self, status: &mut StatusReport, unit_id: u32) {
        status.cancel(unit_id);
        for buffer in self.buffers.drain(..).flatten() {
            self.pool.release(buffer);
        }
        if let Some(context) = &self.context {
            debug!("Abandoned unit {} on context {}", unit_id, context.id);
            self.state = if self.num_pipes > 1 {
                ScalabilityState::ConfiguredMulti
            } else {
                ScalabilityState::ConfiguredSingle
            };
        }
    }

    fn build_pipes(
        &mut self,
        tracker: &ResourceTracker,
        status: &mut StatusReport,
        job: &FrameJob,
        pipes: usize,
        estimate: &SizeEstimate,
    ) -> Result<()> {
        let plan = self
            .encoder
            .plan_row_store(&job.params.row_store_query(), &job.row_store);
        let tiles = assign_tiles(job.params, pipes)?;

        for (pipe, pipe_tiles) in tiles.iter().enumerate() {
            self.begin_pipe(pipe, estimate)?;
            let assignment = self.assignment()?;

            if assignment.is_first() {
                let cmds = status.start(job.unit_id, job.params.kind(), self.encoder.as_ref(), tracker)?;
                self.append(&cmds)?;
                for other in 1..pipes {
                    self.reset_semaphore(SyncRole::FirstWaitsForOthers, other as u32, tracker)?;
                }
                if let Some(update) = &job.probability_update {
                    self.emit(update, tracker)?;
                }
            }
            self.sync_pipe(SyncRole::AllPipes, 0, tracker)?;

            self.emit(
                &PicturePacket {
                    params: job.params,
                    resources: job.resources,
                    plan,
                    pipe: assignment,
                    status_report_id: Some(job.unit_id),
                },
                tracker,
            )?;
            for tile in pipe_tiles {
                self.emit(
                    &TilePacket {
                        params: job.params,
                        tile: *tile,
                        pipe: assignment,
                        frame_number: job.frame_number,
                        bitstream_per_tile: job.bitstream_per_tile,
                    },
                    tracker,
                )?;
            }
            self.emit(&PictureEndPacket, tracker)?;
            self.sync_pipe(SyncRole::FirstWaitsForOthers, 0, tracker)?;

            if assignment.is_first() {
                let cmds = status.end(job.unit_id, self.encoder.as_ref(), tracker, 0)?;
                self.append(&cmds)?;
            }
            self.end_pipe()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdbuf::CommandKind;
    use crate::encoder::{create_encoder, Generation, HevcParams, TileLayout};
    use crate::engine::SimulatedEngine;
    use crate::packet::tests::picture_resources;
    use crate::status_report::{PollResult, StatusOptions};

    fn hevc_decode(width: u32, height: u32, columns: u32) -> CodecParams {
        let mut p = HevcParams::new(CodingDirection::Decode, width, height);
        p.tiles = TileLayout::uniform(columns, 1, p.width_in_ctb(), p.height_in_ctb()).unwrap();
        p.slices[0].bitstream_length = 0x800;
        CodecParams::Hevc(p)
    }

    fn options(frame_tracking: bool) -> ScalabilityOptions {
        ScalabilityOptions {
            frame_tracking,
            ..ScalabilityOptions::default()
        }
    }

    fn run(tracker: &ResourceTracker, submissions: &[Submission]) {
        let buffers: Vec<&[u8]> = submissions.iter().map(|s| s.buffer.as_bytes()).collect();
        let mut engine = SimulatedEngine::new(tracker);
        engine.run(&buffers).unwrap();
        for s in submissions {
            s.signal_frame_tracking(tracker).unwrap();
        }
    }

    fn estimate() -> SizeEstimate {
        SizeEstimate { bytes: 4096, patches: 16 }
    }

    #[test]
    fn test_frames_complete_on_one_to_four_pipes() {
        for pipes in 1..=4u32 {
            for tracking in [false, true] {
                let mut tracker = ResourceTracker::new();
                let params = hevc_decode(3840, 2160, pipes);
                let resources = picture_resources(&mut tracker, &params);
                let mut status = StatusReport::new(
                    &mut tracker,
                    4,
                    StatusOptions {
                        frame_tracking: tracking,
                        report_crc: false,
                    },
                )
                .unwrap();
                let mut engine = ScalabilityEngine::new(create_encoder(Generation::Gen12), options(tracking));

                for frame in 0..2u32 {
                    let job = FrameJob {
                        params: &params,
                        resources: &resources,
                        row_store: RowStoreSupport::all(),
                        unit_id: 100 + frame,
                        frame_number: frame,
                        bitstream_per_tile: 0x1000,
                        probability_update: None,
                    };
                    let submissions = engine.encode_frame(&mut tracker, &mut status, &job).unwrap();
                    assert_eq!(submissions.len(), pipes as usize);
                    assert!(submissions[0].flags.contains(SubmitFlags::MASTER));
                    assert!(submissions.last().unwrap().flags.contains(SubmitFlags::LAST_PIPE));
                    assert_eq!(submissions[0].frame_tracking.is_some(), tracking);

                    run(&tracker, &submissions);
                    let PollResult::Complete(done) = status.poll(100 + frame).unwrap() else {
                        panic!("{pipes} pipes frame {frame} not complete");
                    };
                    assert!(done.is_success());
                    engine.recycle(submissions);
                }
                assert_eq!(engine.state(), ScalabilityState::Submitted);
                assert_eq!(engine.context().unwrap().id, 1);
            }
        }
    }

    #[test]
    fn test_dependent_pipes_wait_before_work() {
        let mut tracker = ResourceTracker::new();
        let params = hevc_decode(3840, 2160, 3);
        let resources = picture_resources(&mut tracker, &params);
        let mut status = StatusReport::new(&mut tracker, 4, StatusOptions::default()).unwrap();
        let mut engine = ScalabilityEngine::new(create_encoder(Generation::Gen12), options(false));
        let job = FrameJob {
            params: &params,
            resources: &resources,
            row_store: RowStoreSupport::all(),
            unit_id: 1,
            frame_number: 0,
            bitstream_per_tile: 0x1000,
            probability_update: None,
        };
        let submissions = engine.encode_frame(&mut tracker, &mut status, &job).unwrap();

        for s in &submissions {
            let kinds = SimulatedEngine::command_kinds(s.buffer.as_bytes());
            let first_wait = kinds.iter().position(|&k| k == CommandKind::MiSemaphoreWait).unwrap();
            let first_state = kinds.iter().position(|&k| k == CommandKind::HcpPipeModeSelect).unwrap();
            assert!(first_wait < first_state, "pipe {} works before the rendezvous", s.pipe);
            assert_eq!(kinds.last(), Some(&CommandKind::MiBatchBufferEnd));
        }
        // The master waits for both other pipes after its own work.
        let master = SimulatedEngine::command_kinds(submissions[0].buffer.as_bytes());
        let waits = master.iter().filter(|&&k| k == CommandKind::MiSemaphoreWait).count();
        assert_eq!(waits, 1 + 2);
    }

    #[test]
    fn test_role_reuse_needs_reset() {
        let mut tracker = ResourceTracker::new();
        let params = hevc_decode(1920, 1080, 2);
        let mut engine = ScalabilityEngine::new(create_encoder(Generation::Gen12), options(false));
        assert_eq!(engine.configure(&mut tracker, &params).unwrap(), 2);
        engine.begin_pipe(0, &estimate()).unwrap();
        engine.sync_pipe(SyncRole::OthersWaitForOne, 0, &tracker).unwrap();
        engine.reset_semaphore(SyncRole::OthersWaitForOne, 0, &tracker).unwrap();
        engine.sync_pipe(SyncRole::OthersWaitForOne, 0, &tracker).unwrap();

        let err = engine.sync_pipe(SyncRole::OthersWaitForOne, 0, &tracker).unwrap_err();
        assert!(matches!(err, MediaError::SynchronizationContractViolation(_)));
        assert_eq!(engine.state(), ScalabilityState::Uninitialized);
        assert!(engine.context().is_none());
    }

    #[test]
    fn test_out_of_order_pipes_rejected() {
        let mut tracker = ResourceTracker::new();
        let params = hevc_decode(1920, 1080, 2);
        let mut engine = ScalabilityEngine::new(create_encoder(Generation::Gen11), options(false));
        engine.configure(&mut tracker, &params).unwrap();
        assert!(matches!(
            engine.begin_pipe(1, &estimate()),
            Err(MediaError::SynchronizationContractViolation(_))
        ));

        engine.configure(&mut tracker, &params).unwrap();
        engine.begin_pipe(0, &estimate()).unwrap();
        let mut status = StatusReport::new(&mut tracker, 2, StatusOptions::default()).unwrap();
        assert!(matches!(
            engine.submit(&mut status),
            Err(MediaError::SynchronizationContractViolation(_))
        ));
    }

    #[test]
    fn test_release_roles_execute() {
        let mut tracker = ResourceTracker::new();
        let params = hevc_decode(1920, 1080, 3);
        let mut status = StatusReport::new(&mut tracker, 2, StatusOptions::default()).unwrap();
        let mut engine = ScalabilityEngine::new(create_encoder(Generation::Gen12), options(false));
        assert_eq!(engine.configure(&mut tracker, &params).unwrap(), 3);

        for pipe in 0..3 {
            engine.begin_pipe(pipe, &estimate()).unwrap();
            engine.sync_pipe(SyncRole::OthersWaitForOne, 0, &tracker).unwrap();
            if pipe < 2 {
                engine.sync_pipe(SyncRole::OneWaitsForAnother, 0, &tracker).unwrap();
            } else {
                let err = engine.sync_pipe(SyncRole::OneWaitsForAnother, 0, &tracker).unwrap_err();
                assert!(matches!(err, MediaError::SynchronizationContractViolation(_)));
                break;
            }
            engine.end_pipe().unwrap();
        }
        assert_eq!(engine.state(), ScalabilityState::Uninitialized);

        // Two pipes use both release roles without deadlock.
        let params = hevc_decode(1920, 1080, 2);
        engine.configure(&mut tracker, &params).unwrap();
        for pipe in 0..2 {
            engine.begin_pipe(pipe, &estimate()).unwrap();
            engine.sync_pipe(SyncRole::OthersWaitForOne, 0, &tracker).unwrap();
            engine.sync_pipe(SyncRole::OneWaitsForAnother, 0, &tracker).unwrap();
            engine.end_pipe().unwrap();
        }
        let submissions = engine.submit(&mut status).unwrap();
        run(&tracker, &submissions);
        assert_eq!(engine.context().unwrap().id, 2);
    }

    #[test]
    fn test_wait_without_release_rejected() {
        let mut tracker = ResourceTracker::new();
        let params = hevc_decode(1920, 1080, 2);
        let mut engine = ScalabilityEngine::new(create_encoder(Generation::Gen12), options(false));

        for role in [SyncRole::OneWaitsForAnother, SyncRole::OthersWaitForOne] {
            assert_eq!(engine.configure(&mut tracker, &params).unwrap(), 2);
            engine.begin_pipe(0, &estimate()).unwrap();
            engine.end_pipe().unwrap();
            engine.begin_pipe(1, &estimate()).unwrap();
            let err = engine.sync_pipe(role, 0, &tracker).unwrap_err();
            assert!(matches!(err, MediaError::SynchronizationContractViolation(_)), "{role:?}");
            assert_eq!(engine.state(), ScalabilityState::Uninitialized);
        }

        // A release issued in an earlier frame does not carry over.
        engine.configure(&mut tracker, &params).unwrap();
        engine.begin_pipe(0, &estimate()).unwrap();
        engine.sync_pipe(SyncRole::OneWaitsForAnother, 0, &tracker).unwrap();
        engine.end_pipe().unwrap();
        engine.begin_pipe(1, &estimate()).unwrap();
        engine.sync_pipe(SyncRole::OneWaitsForAnother, 0, &tracker).unwrap();
        engine.end_pipe().unwrap();
        let mut status = StatusReport::new(&mut tracker, 2, StatusOptions::default()).unwrap();
        let submissions = engine.submit(&mut status).unwrap();
        engine.recycle(submissions);

        engine.begin_pipe(0, &estimate()).unwrap();
        engine.end_pipe().unwrap();
        engine.begin_pipe(1, &estimate()).unwrap();
        assert!(matches!(
            engine.sync_pipe(SyncRole::OneWaitsForAnother, 0, &tracker),
            Err(MediaError::SynchronizationContractViolation(_))
        ));
    }

    #[test]
    fn test_missing_pipe_flag_rejected_at_submit() {
        let mut tracker = ResourceTracker::new();
        let params = hevc_decode(3840, 2160, 3);
        let mut status = StatusReport::new(&mut tracker, 2, StatusOptions::default()).unwrap();
        let mut engine = ScalabilityEngine::new(create_encoder(Generation::Gen12), options(false));
        assert_eq!(engine.configure(&mut tracker, &params).unwrap(), 3);

        // Pipe 2 never posts its completion flag.
        for pipe in 0..3 {
            engine.begin_pipe(pipe, &estimate()).unwrap();
            if pipe < 2 {
                engine.sync_pipe(SyncRole::FirstWaitsForOthers, 0, &tracker).unwrap();
            }
            engine.end_pipe().unwrap();
        }
        let err = engine.submit(&mut status).unwrap_err();
        assert!(matches!(err, MediaError::SynchronizationContractViolation(_)));
        assert!(engine.context().is_none());
        assert_eq!(status.submitted_count(), 0);

        // A barrier every pipe must join.
        engine.configure(&mut tracker, &params).unwrap();
        for pipe in 0..3 {
            engine.begin_pipe(pipe, &estimate()).unwrap();
            if pipe != 1 {
                engine.sync_pipe(SyncRole::AllPipes, 2, &tracker).unwrap();
            }
            engine.end_pipe().unwrap();
        }
        assert!(matches!(
            engine.submit(&mut status),
            Err(MediaError::SynchronizationContractViolation(_))
        ));

        // With every flag posted the frame runs to completion.
        engine.configure(&mut tracker, &params).unwrap();
        for pipe in 0..3 {
            engine.begin_pipe(pipe, &estimate()).unwrap();
            engine.sync_pipe(SyncRole::FirstWaitsForOthers, 0, &tracker).unwrap();
            engine.end_pipe().unwrap();
        }
        let submissions = engine.submit(&mut status).unwrap();
        run(&tracker, &submissions);
    }

    #[test]
    fn test_context_recreated_on_change() {
        let mut tracker = ResourceTracker::new();
        let mut engine = ScalabilityEngine::new(create_encoder(Generation::Gen12), options(true));
        engine.configure(&mut tracker, &hevc_decode(1920, 1080, 2)).unwrap();
        let first = engine.context().unwrap().clone();
        engine.configure(&mut tracker, &hevc_decode(1920, 1080, 2)).unwrap();
        assert_eq!(engine.context().unwrap().id, first.id);

        engine.configure(&mut tracker, &hevc_decode(3840, 2160, 4)).unwrap();
        let second = engine.context().unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(second.affinity, vec![0, 1, 2, 3]);
        assert_eq!(engine.state(), ScalabilityState::ConfiguredMulti);
    }

    #[test]
    fn test_semaphore_failure_falls_back_to_single_pipe() {
        let params = hevc_decode(1920, 1080, 2);

        let mut tracker = ResourceTracker::with_address_budget(PAGE_SIZE);
        let mut engine = ScalabilityEngine::new(create_encoder(Generation::Gen12), options(false));
        assert_eq!(engine.configure(&mut tracker, &params).unwrap(), 1);
        assert_eq!(engine.state(), ScalabilityState::ConfiguredSingle);
        // The partial allocation was released.
        assert!(tracker.is_empty());

        let mut tracker = ResourceTracker::with_address_budget(PAGE_SIZE);
        let strict = ScalabilityOptions {
            allow_single_pipe_fallback: false,
            ..options(false)
        };
        let mut engine = ScalabilityEngine::new(create_encoder(Generation::Gen12), strict);
        assert!(matches!(
            engine.configure(&mut tracker, &params),
            Err(MediaError::MissingResource(_))
        ));
        assert_eq!(engine.state(), ScalabilityState::Uninitialized);
    }

    #[test]
    fn test_oversized_frame_rejected_before_buffers() {
        let mut tracker = ResourceTracker::new();
        let params = hevc_decode(3840, 2160, 2);
        let resources = picture_resources(&mut tracker, &params);
        let mut status = StatusReport::new(&mut tracker, 2, StatusOptions::default()).unwrap();
        let tiny = ScalabilityOptions {
            max_buffer_size: 1024,
            ..options(false)
        };
        let mut engine = ScalabilityEngine::new(create_encoder(Generation::Gen12), tiny);
        let job = FrameJob {
            params: &params,
            resources: &resources,
            row_store: RowStoreSupport::all(),
            unit_id: 1,
            frame_number: 0,
            bitstream_per_tile: 0x1000,
            probability_update: None,
        };
        let err = engine.encode_frame(&mut tracker, &mut status, &job).unwrap_err();
        assert!(matches!(err, MediaError::ExceedsMaximumSize { .. }));
        assert_eq!(engine.pool().allocated(), 0);
        assert_eq!(status.pending(), 0);
        assert!(engine.context().is_none());
    }

    #[test]
    fn test_failed_frame_is_abandoned() {
        let mut tracker = ResourceTracker::new();
        let params = hevc_decode(1920, 1080, 2);
        let resources = picture_resources(&mut tracker, &params);
        let mut status = StatusReport::new(&mut tracker, 1, StatusOptions::default()).unwrap();
        let mut engine = ScalabilityEngine::new(create_encoder(Generation::Gen12), options(false));
        let mut job = FrameJob {
            params: &params,
            resources: &resources,
            row_store: RowStoreSupport::none(),
            unit_id: 1,
            frame_number: 0,
            bitstream_per_tile: 0x1000,
            probability_update: None,
        };
        let submissions = engine.encode_frame(&mut tracker, &mut status, &job).unwrap();
        engine.recycle(submissions);

        // Unit 1 still occupies the only status slot.
        job.unit_id = 2;
        let err = engine.encode_frame(&mut tracker, &mut status, &job).unwrap_err();
        assert!(matches!(err, MediaError::InvalidParameter(_)));
        assert_eq!(engine.state(), ScalabilityState::ConfiguredMulti);
        assert_eq!(engine.pool().allocated(), 2);
        assert_eq!(engine.pool().free_buffers(), 2);
        assert_eq!(status.pending(), 1);
    }

    #[test]
    fn test_device_reset_clears_semaphores() {
        let mut tracker = ResourceTracker::new();
        let params = hevc_decode(1920, 1080, 2);
        let mut engine = ScalabilityEngine::new(create_encoder(Generation::Gen12), options(false));
        engine.configure(&mut tracker, &params).unwrap();
        engine.begin_pipe(0, &estimate()).unwrap();
        engine.sync_pipe(SyncRole::OthersWaitForOne, 0, &tracker).unwrap();
        engine.end_pipe().unwrap();

        // Only the first pipe ran before the hang.
        let pipe0 = engine.buffers[0].as_ref().unwrap().as_bytes().to_vec();
        SimulatedEngine::new(&tracker).run(&[&pipe0]).unwrap();
        let sem = engine.semaphores.unwrap().others_for_one;
        assert_eq!(tracker.host_memory(sem).unwrap().read_u32(0).unwrap(), 1);

        engine.device_reset(&tracker).unwrap();
        assert_eq!(tracker.host_memory(sem).unwrap().read_u32(0).unwrap(), 0);
        assert_eq!(engine.state(), ScalabilityState::Uninitialized);
        assert!(engine.context().is_none());
        assert_eq!(engine.configure(&mut tracker, &params).unwrap(), 2);
    }

    #[test]
    fn test_assign_tiles_by_column() {
        let params = hevc_decode(3840, 2160, 3);
        let tiles = assign_tiles(&params, 2).unwrap();
        assert_eq!(tiles[0].iter().map(|t| t.column).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(tiles[1].iter().map(|t| t.column).collect::<Vec<_>>(), vec![1]);
        assert!(assign_tiles(&params, 4).is_err());
    }
}
