//! Packet Module
//!
//! A packet orders the encoder calls for one unit of work and declares the
//! size it needs before anything is appended. Commands are built first and
//! appended only once all of them encoded, so a failing packet never leaves
//! a partial unit in the buffer.

use tracing::debug;

use crate::cmdbuf::{CommandBuffer, CommandDescriptor, CommandKind};
use crate::encoder::{
    clamp_tuning, tile_streamout_offsets, CodecParams, CodingDirection, CommandEncoder, HevcSlice, RowStorePlan, TileRect,
};
use crate::error::{MediaError, Result};
use crate::hcp::{
    IndObjBaseAddrParams, MultiEngineMode, PipeBufAddrParams, PipeModeSelectParams, PipeWorkingMode, SurfaceId,
    SurfaceStateParams, TileCodingParams, VdPipelineFlushFlags, VdencCmd2Params,
};
use crate::mi::FlushDwParams;
use crate::protocol::SurfaceFormat;
use crate::resource::{GpuRef, ResourceHandle, ResourceTracker, SurfaceDesc};
use crate::sizer::{CommandTally, SizeEstimate};

/// VP9 surface states beyond the decoded picture: previous, golden, altref.
const VP9_REFERENCE_SURFACES: usize = 3;
const VP9_SEGMENTS: u32 = 8;
const LINE_BUFFER_SIZE: u32 = 0x40000;
const BITSTREAM_BUFFER_SIZE: u32 = 0x100000;

/// Which pipe a packet is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeAssignment {
    pub index: usize,
    pub num_pipes: usize,
}

impl PipeAssignment {
    pub const SINGLE: PipeAssignment = PipeAssignment {
        index: 0,
        num_pipes: 1,
    };

    pub fn is_first(&self) -> bool {
        self.index == 0
    }

    pub fn is_last(&self) -> bool {
        self.index + 1 == self.num_pipes
    }

    pub fn multi_engine(&self) -> MultiEngineMode {
        MultiEngineMode::for_pipe(self.index, self.num_pipes)
    }

    pub fn working_mode(&self) -> PipeWorkingMode {
        if self.num_pipes > 1 {
            PipeWorkingMode::Scalable
        } else {
            PipeWorkingMode::Legacy
        }
    }
}

pub trait Packet {
    fn name(&self) -> &'static str;

    /// Exact commands this packet emits.
    fn tally(&self, encoder: &dyn CommandEncoder) -> CommandTally;

    fn commands(&self, encoder: &dyn CommandEncoder, tracker: &ResourceTracker) -> Result<Vec<CommandDescriptor>>;

    fn size(&self, encoder: &dyn CommandEncoder) -> Result<SizeEstimate> {
        self.tally(encoder).estimate(encoder)
    }

    /// Encode and append. Returns the bytes appended.
    fn emit(&self, encoder: &dyn CommandEncoder, tracker: &ResourceTracker, buffer: &mut CommandBuffer) -> Result<usize> {
        let commands = self.commands(encoder, tracker)?;
        let size = self.size(encoder)?;
        buffer.ensure_capacity(size.bytes, size.patches)?;

        let start = buffer.used();
        for cmd in &commands {
            buffer.append(cmd)?;
        }
        let written = buffer.used() - start;
        debug!(
            "{} packet: {} commands, {} bytes (declared {})",
            self.name(),
            commands.len(),
            written,
            size.bytes
        );
        Ok(written)
    }
}

// =============================================================================
// Picture
// =============================================================================

/// Surfaces and buffers one picture binds.
#[derive(Debug, Clone)]
pub struct PictureResources {
    pub recon: ResourceHandle,
    /// Raw input picture, required for encode.
    pub source: Option<ResourceHandle>,
    pub references: Vec<ResourceHandle>,
    pub buffers: PipeBufAddrParams,
    pub bitstream: IndObjBaseAddrParams,
}

impl PictureResources {
    /// Create every surface and line buffer a picture of `params` binds.
    pub fn allocate(tracker: &mut ResourceTracker, params: &CodecParams) -> Result<Self> {
        let g = params.geometry();
        let format = if g.bit_depth_minus8 > 0 {
            SurfaceFormat::P010
        } else {
            SurfaceFormat::Planar420_8
        };
        let desc = SurfaceDesc::new(g.width, g.height, format);
        let recon = tracker.create_surface("recon", desc)?;
        let source = tracker.create_surface("source", desc)?;
        let reference = tracker.create_surface("reference", desc)?;

        let mut buffers = PipeBufAddrParams::new(params.kind(), recon.at(0));
        buffers.deblock_line = Some(tracker.create_buffer("deblock line", LINE_BUFFER_SIZE, false)?.at(0));
        buffers.metadata_line = Some(tracker.create_buffer("metadata line", LINE_BUFFER_SIZE, false)?.at(0));
        buffers.sao_line = Some(tracker.create_buffer("sao line", LINE_BUFFER_SIZE, false)?.at(0));
        buffers.vp9_hvd_line = Some(tracker.create_buffer("hvd line", LINE_BUFFER_SIZE, false)?.at(0));
        buffers.streamout = Some(tracker.create_buffer("streamout", LINE_BUFFER_SIZE, false)?.at(0));
        buffers.references[0] = Some(reference.at(0));

        let bitstream = tracker.create_buffer("bitstream", BITSTREAM_BUFFER_SIZE, false)?;
        Ok(Self {
            recon,
            source: Some(source),
            references: vec![reference],
            buffers,
            bitstream: IndObjBaseAddrParams {
                direction: params.direction(),
                bitstream: bitstream.at(0),
                bitstream_size: BITSTREAM_BUFFER_SIZE,
                cu_object: None,
            },
        })
    }
}

/// Picture-level state for one pipe.
#[derive(Debug, Clone, Copy)]
pub struct PicturePacket<'a> {
    pub params: &'a CodecParams,
    pub resources: &'a PictureResources,
    pub plan: RowStorePlan,
    pub pipe: PipeAssignment,
    pub status_report_id: Option<u32>,
}

impl PicturePacket<'_> {
    fn uses_vdenc(&self, encoder: &dyn CommandEncoder) -> bool {
        matches!(self.params, CodecParams::Hevc(_))
            && self.params.direction() == CodingDirection::Encode
            && encoder.command_dwords(CommandKind::VdencCmd2).is_some()
    }

    fn vp9_reference_count(&self) -> usize {
        self.resources.references.len().min(VP9_REFERENCE_SURFACES)
    }

    fn surface(&self, encoder: &dyn CommandEncoder, tracker: &ResourceTracker, surface: ResourceHandle, id: SurfaceId) -> Result<CommandDescriptor> {
        encoder.surface_state(tracker, &SurfaceStateParams { surface, id })
    }
}

impl Packet for PicturePacket<'_> {
    fn name(&self) -> &'static str {
        "picture"
    }

    fn tally(&self, encoder: &dyn CommandEncoder) -> CommandTally {
        use CommandKind::*;
        let mut t = CommandTally::new();
        t.add(MiFlushDw, 1)
            .add(HcpPipeModeSelect, 1)
            .add(HcpSurfaceState, 1)
            .add(HcpPipeBufAddrState, 1)
            .add(HcpIndObjBaseAddrState, 1);
        match self.params {
            CodecParams::Hevc(p) => {
                t.add(HcpPicState, 1);
                if p.direction == CodingDirection::Encode {
                    t.add(HcpSurfaceState, 1);
                }
                if self.uses_vdenc(encoder) {
                    t.add(VdencCmd2, 1);
                }
            }
            CodecParams::Vp9(p) => {
                t.add(HcpSurfaceState, self.vp9_reference_count())
                    .add(HcpVp9PicState, 1)
                    .add(HcpVp9SegmentState, if p.segmentation_enabled { VP9_SEGMENTS as usize } else { 1 });
            }
            CodecParams::Avc(_) | CodecParams::Av1(_) => {}
        }
        t
    }

    fn commands(&self, encoder: &dyn CommandEncoder, tracker: &ResourceTracker) -> Result<Vec<CommandDescriptor>> {
        self.params.validate()?;
        let direction = self.params.direction();
        let vdenc = self.uses_vdenc(encoder);
        let mut cmds = Vec::new();

        cmds.push(encoder.flush_dw(
            tracker,
            &FlushDwParams {
                video_pipeline_cache_invalidate: true,
                ..FlushDwParams::default()
            },
        )?);
        cmds.push(encoder.pipe_mode_select(&PipeModeSelectParams {
            codec: self.params.kind(),
            direction,
            vdenc,
            multi_engine: self.pipe.multi_engine(),
            working_mode: self.pipe.working_mode(),
            status_report_id: if self.pipe.is_first() { self.status_report_id } else { None },
            phase: 0,
        })?);
        cmds.push(self.surface(encoder, tracker, self.resources.recon, SurfaceId::Decoded)?);

        match self.params {
            CodecParams::Hevc(p) => {
                if direction == CodingDirection::Encode {
                    let source = self
                        .resources
                        .source
                        .ok_or_else(|| MediaError::missing("encode source picture"))?;
                    cmds.push(self.surface(encoder, tracker, source, SurfaceId::Source)?);
                }
                cmds.push(encoder.pipe_buf_addr_state(tracker, &self.resources.buffers, &self.plan)?);
                cmds.push(encoder.ind_obj_base_addr_state(tracker, &self.resources.bitstream)?);
                cmds.push(encoder.hevc_pic_state(p)?);
                if vdenc {
                    cmds.push(encoder.vdenc_cmd2(&VdencCmd2Params {
                        width: p.geometry.width,
                        height: p.geometry.height,
                        tuning: clamp_tuning(&p.tuning),
                    })?);
                }
            }
            CodecParams::Vp9(p) => {
                let ids = [SurfaceId::PreviousReference, SurfaceId::GoldenReference, SurfaceId::AlternateReference];
                for (&reference, &id) in self.resources.references.iter().zip(ids.iter()) {
                    cmds.push(self.surface(encoder, tracker, reference, id)?);
                }
                cmds.push(encoder.pipe_buf_addr_state(tracker, &self.resources.buffers, &self.plan)?);
                cmds.push(encoder.ind_obj_base_addr_state(tracker, &self.resources.bitstream)?);
                cmds.push(encoder.vp9_pic_state(p)?);
                let segments = if p.segmentation_enabled { VP9_SEGMENTS } else { 1 };
                for segment in 0..segments {
                    cmds.push(encoder.vp9_segment_state(segment)?);
                }
            }
            CodecParams::Avc(_) | CodecParams::Av1(_) => {
                return Err(MediaError::unsupported(format!("{:?} picture packet", self.params.kind())));
            }
        }
        Ok(cmds)
    }
}

/// Pipe flush closing a picture.
#[derive(Debug, Clone, Copy, Default)]
pub struct PictureEndPacket;

impl Packet for PictureEndPacket {
    fn name(&self) -> &'static str {
        "picture end"
    }

    fn tally(&self, _encoder: &dyn CommandEncoder) -> CommandTally {
        let mut t = CommandTally::new();
        t.add(CommandKind::VdPipelineFlush, 1).add(CommandKind::MiFlushDw, 1);
        t
    }

    fn commands(&self, encoder: &dyn CommandEncoder, tracker: &ResourceTracker) -> Result<Vec<CommandDescriptor>> {
        Ok(vec![
            encoder.vd_pipeline_flush(VdPipelineFlushFlags::hevc())?,
            encoder.flush_dw(tracker, &FlushDwParams::default())?,
        ])
    }
}

// =============================================================================
// Tile
// =============================================================================

/// One tile: TILE_CODING plus the slice or bitstream objects inside it.
#[derive(Debug, Clone, Copy)]
pub struct TilePacket<'a> {
    pub params: &'a CodecParams,
    pub tile: TileRect,
    pub pipe: PipeAssignment,
    pub frame_number: u32,
    /// Bitstream budget per tile in bytes.
    pub bitstream_per_tile: u32,
}

impl<'a> TilePacket<'a> {
    fn contains(&self, slice: &HevcSlice) -> bool {
        let t = &self.tile;
        (t.start_x..t.start_x + t.width).contains(&slice.start_ctb_x)
            && (t.start_y..t.start_y + t.height).contains(&slice.start_ctb_y)
    }

    fn slices(&self) -> Vec<&'a HevcSlice> {
        match self.params {
            CodecParams::Hevc(p) => p.slices.iter().filter(|s| self.contains(s)).collect(),
            _ => Vec::new(),
        }
    }

    fn vp9_bitstream(&self) -> bool {
        matches!(self.params, CodecParams::Vp9(_))
            && self.params.direction() == CodingDirection::Decode
            && self.bitstream_per_tile > 0
    }
}

impl Packet for TilePacket<'_> {
    fn name(&self) -> &'static str {
        "tile"
    }

    fn tally(&self, _encoder: &dyn CommandEncoder) -> CommandTally {
        let slices = self.slices().len();
        let decode = self.params.direction() == CodingDirection::Decode;
        let mut t = CommandTally::new();
        t.add(CommandKind::HcpTileCoding, 1)
            .add(CommandKind::HcpSliceState, slices)
            .add(CommandKind::HcpBsdObject, if decode { slices } else { 0 })
            .add(CommandKind::HcpBsdObject, self.vp9_bitstream() as usize);
        t
    }

    fn commands(&self, encoder: &dyn CommandEncoder, _tracker: &ResourceTracker) -> Result<Vec<CommandDescriptor>> {
        let offsets = tile_streamout_offsets(self.params, &self.tile, self.bitstream_per_tile)?;
        let coding = TileCodingParams::for_tile(
            self.params,
            &self.tile,
            self.pipe.num_pipes as u32,
            self.frame_number,
            offsets,
        )?;
        let mut cmds = vec![encoder.tile_coding(&coding)?];

        let slices = self.slices();
        let decode = self.params.direction() == CodingDirection::Decode;
        for (i, slice) in slices.iter().enumerate() {
            cmds.push(encoder.slice_state(slice, i + 1 == slices.len())?);
            if decode {
                cmds.push(encoder.bsd_object(slice.bitstream_offset, slice.bitstream_length)?);
            }
        }
        if self.vp9_bitstream() {
            cmds.push(encoder.bsd_object(offsets.bitstream, self.bitstream_per_tile)?);
        }
        Ok(cmds)
    }
}

// =============================================================================
// VP9 probability update
// =============================================================================

/// Restores a saved VP9 probability context and patches individual dwords
/// of the active probability buffer.
#[derive(Debug, Clone)]
pub struct ProbabilityUpdatePacket {
    pub probability_buffer: GpuRef,
    /// Context saved by an earlier frame, copied dword by dword.
    pub saved_context: Option<GpuRef>,
    pub context_dwords: u32,
    /// (byte offset inside the probability buffer, value)
    pub updates: Vec<(u32, u32)>,
}

impl ProbabilityUpdatePacket {
    fn at(base: GpuRef, offset: u32) -> GpuRef {
        GpuRef {
            handle: base.handle,
            offset: base.offset + offset,
        }
    }
}

impl Packet for ProbabilityUpdatePacket {
    fn name(&self) -> &'static str {
        "probability update"
    }

    fn tally(&self, _encoder: &dyn CommandEncoder) -> CommandTally {
        let copies = if self.saved_context.is_some() { self.context_dwords as usize } else { 0 };
        let mut t = CommandTally::new();
        t.add(CommandKind::MiCopyMemMem, copies)
            .add(CommandKind::MiStoreDataImm, self.updates.len())
            .add(CommandKind::MiFlushDw, 1);
        t
    }

    fn commands(&self, encoder: &dyn CommandEncoder, tracker: &ResourceTracker) -> Result<Vec<CommandDescriptor>> {
        let mut cmds = Vec::new();
        if let Some(saved) = self.saved_context {
            for i in 0..self.context_dwords {
                cmds.push(encoder.copy_mem_mem(
                    tracker,
                    Self::at(saved, 4 * i),
                    Self::at(self.probability_buffer, 4 * i),
                )?);
            }
        }
        for &(offset, value) in &self.updates {
            cmds.push(encoder.store_data_imm(tracker, Self::at(self.probability_buffer, offset), value)?);
        }
        cmds.push(encoder.flush_dw(tracker, &FlushDwParams::default())?);
        Ok(cmds)
    }
}
