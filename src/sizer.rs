//! Command Buffer Sizer
//!
//! Worst-case byte and patch-entry estimates for a unit of work, computed
//! from the generation's command sizes before anything is encoded, plus the
//! recycling pool the per-pipe command buffers come from.

use std::collections::BTreeMap;
use std::ops::{Add, AddAssign};

use tracing::{debug, warn};

use crate::cmdbuf::{CommandBuffer, CommandKind};
use crate::encoder::{CodecKind, CodecParams, CodingDirection, CommandEncoder};
use crate::error::{MediaError, Result};
use crate::protocol::*;

/// Bytes and patch-list entries a unit of work may consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SizeEstimate {
    pub bytes: usize,
    pub patches: usize,
}

impl Add for SizeEstimate {
    type Output = SizeEstimate;

    fn add(self, rhs: SizeEstimate) -> SizeEstimate {
        SizeEstimate {
            bytes: self.bytes + rhs.bytes,
            patches: self.patches + rhs.patches,
        }
    }
}

impl AddAssign for SizeEstimate {
    fn add_assign(&mut self, rhs: SizeEstimate) {
        *self = *self + rhs;
    }
}

/// Worst-case number of address fields a command kind registers.
pub fn patch_slots(kind: CommandKind) -> usize {
    use CommandKind::*;
    match kind {
        MiBatchBufferStart | MiLoadRegisterMem | MiStoreRegisterMem | MiStoreDataImm | MiSemaphoreWait | MiAtomic
        | MiConditionalBatchBufferEnd | MiFlushDw => 1,
        MiCopyMemMem => 2,
        // Decoded, 9 row-store/tile buffers, current MV, 8 references,
        // source, streamout, status, 4 VP9 buffers, SAO rowstore, stats.
        HcpPipeBufAddrState => 28,
        HcpIndObjBaseAddrState => 5,
        _ => 0,
    }
}

/// Multiset of command kinds, the unit every size computation works in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandTally {
    counts: BTreeMap<CommandKind, usize>,
}

impl CommandTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: CommandKind, count: usize) -> &mut Self {
        if count > 0 {
            *self.counts.entry(kind).or_default() += count;
        }
        self
    }

    pub fn merge(&mut self, other: &CommandTally) -> &mut Self {
        for (&kind, &count) in &other.counts {
            self.add(kind, count);
        }
        self
    }

    /// Every count multiplied by `factor`.
    pub fn scaled(&self, factor: usize) -> CommandTally {
        CommandTally {
            counts: self.counts.iter().map(|(&k, &c)| (k, c * factor)).collect(),
        }
    }

    pub fn count(&self, kind: CommandKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn total_commands(&self) -> usize {
        self.counts.values().sum()
    }

    /// Size under `encoder`'s command table. Kinds the generation lacks are
    /// an error, never silently counted as zero.
    pub fn estimate(&self, encoder: &dyn CommandEncoder) -> Result<SizeEstimate> {
        let mut estimate = SizeEstimate::default();
        for (&kind, &count) in &self.counts {
            estimate.bytes += encoder.command_bytes(kind)? * count;
            estimate.patches += patch_slots(kind) * count;
        }
        Ok(estimate)
    }
}

/// Shape of one frame's work on one pipe, as far as sizing is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitOfWork {
    pub codec: CodecKind,
    pub direction: CodingDirection,
    pub num_pipes: u32,
    pub num_tiles: u32,
    pub num_slices: u32,
    /// Extra flushes requested by dynamic slicing; capped at
    /// `MAX_DYNAMIC_SLICE_WA`.
    pub dynamic_slice_workarounds: u32,
    pub semaphore_delay_writes: u32,
    /// Dwords rewritten by a VP9 probability update pass.
    pub probability_update_dwords: u32,
}

impl UnitOfWork {
    pub fn for_frame(params: &CodecParams, num_pipes: u32) -> Result<Self> {
        params.validate()?;
        if num_pipes == 0 || num_pipes as usize > MAX_PIPES {
            return Err(MediaError::invalid(format!("{num_pipes} pipes requested")));
        }
        let num_slices = match params {
            CodecParams::Hevc(p) => p.slices.len() as u32,
            _ => 0,
        };
        Ok(Self {
            codec: params.kind(),
            direction: params.direction(),
            num_pipes,
            num_tiles: params.tiles().map_or(1, |t| t.num_tiles()),
            num_slices,
            dynamic_slice_workarounds: 0,
            semaphore_delay_writes: 0,
            probability_update_dwords: 0,
        })
    }
}

/// Picture-level HCP state, worst case for the codec and direction.
fn picture_tally(unit: &UnitOfWork, vdenc: bool) -> CommandTally {
    use CommandKind::*;
    let mut t = CommandTally::new();
    t.add(VdPipelineFlush, 1)
        .add(MiFlushDw, 1)
        .add(HcpPipeModeSelect, 1)
        .add(HcpPipeBufAddrState, 1)
        .add(HcpIndObjBaseAddrState, 1)
        .add(MiLoadRegisterReg, 8);

    match unit.codec {
        CodecKind::Hevc => {
            t.add(HcpSurfaceState, 1).add(HcpQmState, 20).add(HcpPicState, 1);
            match unit.direction {
                CodingDirection::Encode => {
                    t.add(HcpSurfaceState, 1)
                        .add(HcpFqmState, 8)
                        .add(HcpRdoqState, 1)
                        .add(MiStoreDataImm, 8)
                        .add(MiFlushDw, 2)
                        .add(MiStoreRegisterMem, 10)
                        .add(MiLoadRegisterMem, 1)
                        .add(HcpPakInsertObject, 2)
                        .add(MiSemaphoreWait, 19)
                        .add(MiCopyMemMem, 8);
                    if vdenc {
                        t.add(VdencCmd2, 1);
                    }
                }
                CodingDirection::Decode => {
                    t.add(HcpTileState, 1).add(HcpTileCoding, 1);
                }
            }
        }
        CodecKind::Vp9 => {
            t.add(HcpSurfaceState, 4)
                .add(HcpVp9SegmentState, 8)
                .add(HcpBsdObject, 1)
                .add(HcpVp9PicState, 1);
        }
        CodecKind::Avc | CodecKind::Av1 => {}
    }
    t
}

/// Cross-pipe synchronization and scalable-mode bookkeeping.
fn scalable_tally(unit: &UnitOfWork) -> CommandTally {
    use CommandKind::*;
    let mut t = CommandTally::new();
    if unit.num_pipes <= 1 {
        return t;
    }
    let pipes = unit.num_pipes as usize;
    t.add(MiAtomic, 4)
        .add(MiConditionalBatchBufferEnd, 2)
        .add(MiSemaphoreWait, 3 + pipes)
        .add(MiStoreDataImm, 18 + unit.semaphore_delay_writes as usize + pipes)
        .add(MiLoadRegisterImm, 3)
        .add(MiFlushDw, 2)
        .add(MiStoreRegisterMem, 2)
        .add(MiLoadRegisterReg, 1);
    t
}

fn slice_tally(unit: &UnitOfWork) -> CommandTally {
    use CommandKind::*;
    let mut t = CommandTally::new();
    t.add(HcpRefIdxState, 2)
        .add(HcpWeightOffsetState, 2)
        .add(HcpSliceState, 1)
        .add(HcpBsdObject, 1);
    if unit.direction == CodingDirection::Encode {
        t.add(HcpPakInsertObject, 2);
    }
    t
}

fn tile_tally() -> CommandTally {
    let mut t = CommandTally::new();
    t.add(CommandKind::HcpTileCoding, 1).add(CommandKind::HcpBsdObject, 1);
    t
}

/// Status start/end, frame tracking and batch termination.
fn frame_tally(unit: &UnitOfWork) -> CommandTally {
    use CommandKind::*;
    let mut t = CommandTally::new();
    t.add(MiStoreDataImm, 3)
        .add(MiStoreRegisterMem, 3)
        .add(MiFlushDw, 2)
        .add(MiBatchBufferStart, 1)
        .add(MiBatchBufferEnd, 1)
        .add(MiFlushDw, unit.dynamic_slice_workarounds.min(MAX_DYNAMIC_SLICE_WA) as usize);
    if unit.probability_update_dwords > 0 {
        let dwords = unit.probability_update_dwords as usize;
        t.add(MiStoreDataImm, dwords).add(MiCopyMemMem, dwords).add(MiFlushDw, 1);
    }
    t
}

/// Full worst-case tally for `unit` on one pipe.
pub fn unit_tally(encoder: &dyn CommandEncoder, unit: &UnitOfWork) -> CommandTally {
    let vdenc = encoder.command_dwords(CommandKind::VdencCmd2).is_some();
    let mut tally = picture_tally(unit, vdenc);
    tally
        .merge(&scalable_tally(unit))
        .merge(&slice_tally(unit).scaled(unit.num_slices as usize))
        .merge(&tile_tally().scaled(unit.num_tiles as usize))
        .merge(&frame_tally(unit));
    tally
}

/// Upper bound on the bytes and patch entries `unit` needs in one pipe's
/// buffer. Fails with `ExceedsMaximumSize` when the bound alone is over
/// `ceiling`.
pub fn estimate_size(encoder: &dyn CommandEncoder, unit: &UnitOfWork, ceiling: usize) -> Result<SizeEstimate> {
    match unit.codec {
        CodecKind::Hevc | CodecKind::Vp9 => {}
        other => return Err(MediaError::unsupported(format!("no size table for {other:?}"))),
    }
    let estimate = unit_tally(encoder, unit).estimate(encoder)?;
    if estimate.bytes > ceiling {
        return Err(MediaError::ExceedsMaximumSize {
            requested: estimate.bytes,
            ceiling,
        });
    }
    debug!(
        "Estimated {:?} {:?} on {} pipe(s): {} bytes, {} patches",
        unit.codec, unit.direction, unit.num_pipes, estimate.bytes, estimate.patches
    );
    Ok(estimate)
}

/// Make room for `estimate` more bytes and patches, keeping what is
/// already recorded.
pub fn ensure_capacity(buffer: &mut CommandBuffer, estimate: &SizeEstimate) -> Result<()> {
    buffer.ensure_capacity(estimate.bytes, estimate.patches)
}

/// Verify that `estimate` fits, growing up to `retries` times.
pub fn verify_space(buffer: &mut CommandBuffer, estimate: &SizeEstimate, retries: u32) -> Result<()> {
    for attempt in 0..=retries {
        let patches_fit = buffer.patches().len() + estimate.patches <= buffer.patch_capacity();
        if buffer.remaining() >= estimate.bytes && patches_fit {
            return Ok(());
        }
        if attempt > 0 {
            warn!("Command buffer space check failed, resize attempt {}", attempt + 1);
        }
        ensure_capacity(buffer, estimate)?;
    }
    Err(MediaError::ExceedsMaximumSize {
        requested: buffer.used() + estimate.bytes,
        ceiling: buffer.max_size(),
    })
}

/// Recycles command buffers between frames.
#[derive(Debug)]
pub struct BufferPool {
    free: Vec<CommandBuffer>,
    initial_size: usize,
    initial_patches: usize,
    max_size: usize,
    allocated: usize,
}

impl BufferPool {
    pub fn new(initial_size: usize, initial_patches: usize, max_size: usize) -> Self {
        Self {
            free: Vec::new(),
            initial_size,
            initial_patches,
            max_size,
            allocated: 0,
        }
    }

    /// An empty buffer with room for at least `estimate`.
    pub fn acquire(&mut self, estimate: &SizeEstimate) -> Result<CommandBuffer> {
        if estimate.bytes > self.max_size {
            return Err(MediaError::ExceedsMaximumSize {
                requested: estimate.bytes,
                ceiling: self.max_size,
            });
        }
        // Prefer the smallest free buffer that already fits.
        let fitting = self
            .free
            .iter()
            .enumerate()
            .filter(|(_, b)| b.capacity() >= estimate.bytes)
            .min_by_key(|(_, b)| b.capacity())
            .map(|(i, _)| i);
        let mut buffer = match fitting.or_else(|| self.free.len().checked_sub(1)) {
            Some(i) => self.free.swap_remove(i),
            None => {
                self.allocated += 1;
                debug!("Allocating command buffer #{}", self.allocated);
                CommandBuffer::new(self.initial_size, self.initial_patches, self.max_size)
            }
        };
        buffer.reset();
        ensure_capacity(&mut buffer, estimate)?;
        Ok(buffer)
    }

    pub fn release(&mut self, mut buffer: CommandBuffer) {
        buffer.reset();
        self.free.push(buffer);
    }

    pub fn free_buffers(&self) -> usize {
        self.free.len()
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }
}
