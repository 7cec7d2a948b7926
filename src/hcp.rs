//! HCP, VD and VDENC Command Encoders
//!
//! Picture-level and tile-level commands of the HEVC/VP9 codec pipe. Every
//! function takes the generation's dword count as its first argument; fields
//! beyond that count are simply not written.

use bitflags::bitflags;
use tracing::trace;

use crate::cmdbuf::{CommandDescriptor, CommandKind};
use crate::encoder::{
    ClampedTuning, CodecKind, CodecParams, CodingDirection, FrameType, HevcParams, HevcSlice, QualityDefaults,
    RowStoreCache, RowStorePlan, TileRect, TileStreamoutOffsets, Vp9Params,
};
use crate::error::{MediaError, Result};
use crate::protocol::*;
use crate::resource::{GpuRef, ResolvedAddress, ResourceHandle, ResourceTracker};

/// Memory attribute tiled-mode value for Tile-Y/Tile-4 surfaces.
const TILED_MODE_TILE_Y: u32 = 3;

/// Two's-complement encode of `value` into a `bits`-wide field.
fn signed_field(value: i32, bits: u32) -> u32 {
    (value as u32) & field_mask(0, bits - 1)
}

fn hcp_command(kind: CommandKind, subop: u32, len: u32) -> CommandDescriptor {
    CommandDescriptor::new(kind, len, media_header(MEDIA_OPCODE_HCP, subop, len))
}

fn require_len(kind: CommandKind, len: u32, min: u32) -> Result<()> {
    if len < min {
        return Err(MediaError::invalid(format!(
            "{kind:?} needs at least {min} dwords, table gives {len}"
        )));
    }
    Ok(())
}

/// Memory attribute dword placed after every address pair.
pub fn memory_attributes(resolved: &ResolvedAddress, row_store_cache: bool) -> u32 {
    let mut dw = 0;
    set_field(&mut dw, 1, 6, resolved.cache_policy.mocs_index());
    set_bit(&mut dw, 9, resolved.compression.enabled());
    set_bit(&mut dw, 10, resolved.compression.type_bit());
    set_bit(&mut dw, 12, row_store_cache);
    if resolved.tiled {
        set_field(&mut dw, 13, 14, TILED_MODE_TILE_Y);
    }
    dw
}

/// Write an address pair plus its attribute dword at `index + 2`.
fn write_buffer(
    cmd: &mut CommandDescriptor,
    tracker: &ResourceTracker,
    index: usize,
    target: Option<GpuRef>,
    writable: bool,
) -> Result<()> {
    if let Some(resolved) = cmd.write_optional_address(tracker, index, target, writable, CACHELINE_SIZE)? {
        let attributes = memory_attributes(&resolved, false);
        cmd.set(index + 2, 0, 31, attributes);
    }
    Ok(())
}

/// Row-store field: an enabled cache wins over the buffer, otherwise the
/// buffer is bound writable. Required fields with neither fail.
fn write_row_store(
    cmd: &mut CommandDescriptor,
    tracker: &ResourceTracker,
    index: usize,
    cache: RowStoreCache,
    buffer: Option<GpuRef>,
    required: bool,
    name: &str,
) -> Result<()> {
    if cache.enabled {
        cmd.set(index, 6, 31, cache.address);
        cmd.set(index + 1, 0, 31, 0);
        cmd.set_flag(index + 2, 12, true);
        trace!("{} served from row-store cache at line {}", name, cache.address);
        return Ok(());
    }
    match buffer {
        Some(target) => write_buffer(cmd, tracker, index, Some(target), true),
        None if required => Err(MediaError::missing(format!("{name} buffer required without row-store cache"))),
        None => Ok(()),
    }
}

// =============================================================================
// VD_PIPELINE_FLUSH
// =============================================================================

bitflags! {
    /// VD_PIPELINE_FLUSH DW1: wait-for-done and flush requests per pipe.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VdPipelineFlushFlags: u32 {
        const HEVC_PIPELINE_DONE = 1 << 0;
        const VDENC_PIPELINE_DONE = 1 << 1;
        const MFL_PIPELINE_DONE = 1 << 2;
        const MFX_PIPELINE_DONE = 1 << 3;
        const VD_COMMAND_MESSAGE_PARSER_DONE = 1 << 4;
        const HEVC_PIPELINE_FLUSH = 1 << 16;
        const VDENC_PIPELINE_FLUSH = 1 << 17;
        const MFL_PIPELINE_FLUSH = 1 << 18;
        const MFX_PIPELINE_FLUSH = 1 << 19;
    }
}

impl VdPipelineFlushFlags {
    /// Wait for and flush the HEVC pipe.
    pub fn hevc() -> Self {
        Self::HEVC_PIPELINE_DONE | Self::HEVC_PIPELINE_FLUSH | Self::VD_COMMAND_MESSAGE_PARSER_DONE
    }
}

pub fn vd_pipeline_flush(len: u32, flags: VdPipelineFlushFlags) -> Result<CommandDescriptor> {
    require_len(CommandKind::VdPipelineFlush, len, 2)?;
    let mut cmd = CommandDescriptor::new(
        CommandKind::VdPipelineFlush,
        len,
        media_header(MEDIA_OPCODE_VD_CONTROL, 0, len),
    );
    cmd.set(1, 0, 31, flags.bits());
    Ok(cmd)
}

// =============================================================================
// HCP_PIPE_MODE_SELECT
// =============================================================================

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiEngineMode {
    Single = 0,
    Left = 1,
    Right = 2,
    Middle = 3,
}

impl MultiEngineMode {
    /// Position of `pipe` among `num_pipes` engines working on one frame.
    pub fn for_pipe(pipe: usize, num_pipes: usize) -> Self {
        if num_pipes <= 1 {
            MultiEngineMode::Single
        } else if pipe == 0 {
            MultiEngineMode::Left
        } else if pipe + 1 == num_pipes {
            MultiEngineMode::Right
        } else {
            MultiEngineMode::Middle
        }
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeWorkingMode {
    Legacy = 0,
    Scalable = 2,
    RealTiles = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeModeSelectParams {
    pub codec: CodecKind,
    pub direction: CodingDirection,
    pub vdenc: bool,
    pub multi_engine: MultiEngineMode,
    pub working_mode: PipeWorkingMode,
    /// Status report id; enables picture status/error reporting when set.
    pub status_report_id: Option<u32>,
    /// Pass phase for multi-pass scalable encode (0..=3).
    pub phase: u32,
}

impl PipeModeSelectParams {
    pub fn single(codec: CodecKind, direction: CodingDirection) -> Self {
        Self {
            codec,
            direction,
            vdenc: false,
            multi_engine: MultiEngineMode::Single,
            working_mode: PipeWorkingMode::Legacy,
            status_report_id: None,
            phase: 0,
        }
    }
}

pub fn pipe_mode_select(len: u32, params: &PipeModeSelectParams) -> Result<CommandDescriptor> {
    require_len(CommandKind::HcpPipeModeSelect, len, 6)?;
    let standard = match params.codec {
        CodecKind::Hevc => 0,
        CodecKind::Vp9 => 1,
        other => return Err(MediaError::unsupported(format!("{other:?} on the HCP pipe"))),
    };
    if params.vdenc && params.direction == CodingDirection::Decode {
        return Err(MediaError::invalid("VDENC mode requested for a decode pipe"));
    }
    let scalable = params.working_mode != PipeWorkingMode::Legacy;
    if scalable == (params.multi_engine == MultiEngineMode::Single) {
        return Err(MediaError::invalid(format!(
            "engine mode {:?} inconsistent with working mode {:?}",
            params.multi_engine, params.working_mode
        )));
    }
    if params.phase > 3 {
        return Err(MediaError::invalid(format!("pipe phase {} out of range", params.phase)));
    }

    let mut cmd = hcp_command(CommandKind::HcpPipeModeSelect, HCP_PIPE_MODE_SELECT, len);
    cmd.set_flag(1, 0, params.direction == CodingDirection::Encode);
    cmd.set_flag(1, 3, params.status_report_id.is_some());
    cmd.set(1, 5, 7, standard);
    cmd.set_flag(1, 10, params.vdenc);
    cmd.set(1, 13, 14, params.multi_engine as u32);
    cmd.set(1, 15, 16, params.working_mode as u32);
    cmd.set(3, 0, 31, params.status_report_id.unwrap_or(0));
    if len > 6 {
        cmd.set(6, 0, 1, params.phase);
    }
    Ok(cmd)
}

// =============================================================================
// HCP_SURFACE_STATE
// =============================================================================

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceId {
    /// Decoded picture for decode, reconstructed picture for encode.
    Decoded = 0,
    Source = 1,
    PreviousReference = 2,
    GoldenReference = 3,
    AlternateReference = 4,
    Reference = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceStateParams {
    pub surface: ResourceHandle,
    pub id: SurfaceId,
}

pub fn surface_state(len: u32, tracker: &ResourceTracker, params: &SurfaceStateParams) -> Result<CommandDescriptor> {
    require_len(CommandKind::HcpSurfaceState, len, 3)?;
    let resource = tracker.get(params.surface)?;
    let desc = resource
        .surface()
        .ok_or_else(|| MediaError::invalid(format!("resource {} is not a surface", params.surface)))?;

    let mut cmd = hcp_command(CommandKind::HcpSurfaceState, HCP_SURFACE_STATE, len);
    cmd.set(1, 0, 16, desc.pitch - 1);
    cmd.set(1, 28, 31, params.id as u32);
    cmd.set(2, 0, 14, desc.y_offset_cb());
    cmd.set(2, 27, 31, desc.format as u32);
    if len > 4 {
        let compression = resource.compression;
        cmd.set(4, 0, 7, if compression.enabled() { 0xFF } else { 0 });
        cmd.set(4, 8, 15, if compression.type_bit() { 0xFF } else { 0 });
    }
    Ok(cmd)
}

// =============================================================================
// HCP_PIPE_BUF_ADDR_STATE
// =============================================================================

/// Buffers bound by PIPE_BUF_ADDR_STATE. Row-store fields may be left `None`
/// when the plan serves them from the on-chip cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeBufAddrParams {
    pub codec: CodecKind,
    pub decoded: GpuRef,
    pub deblock_line: Option<GpuRef>,
    pub deblock_tile_line: Option<GpuRef>,
    pub deblock_tile_column: Option<GpuRef>,
    pub metadata_line: Option<GpuRef>,
    pub metadata_tile_line: Option<GpuRef>,
    pub metadata_tile_column: Option<GpuRef>,
    pub sao_line: Option<GpuRef>,
    pub sao_tile_line: Option<GpuRef>,
    pub sao_tile_column: Option<GpuRef>,
    pub current_mv: Option<GpuRef>,
    pub references: [Option<GpuRef>; MAX_REFERENCE_FRAMES],
    pub original_source: Option<GpuRef>,
    pub streamout: Option<GpuRef>,
    pub status_error: Option<GpuRef>,
    pub vp9_probability: Option<GpuRef>,
    pub vp9_segment_id: Option<GpuRef>,
    pub vp9_hvd_line: Option<GpuRef>,
    pub vp9_hvd_tile: Option<GpuRef>,
    pub sao_rowstore: Option<GpuRef>,
    pub frame_statistics: Option<GpuRef>,
}

impl PipeBufAddrParams {
    pub fn new(codec: CodecKind, decoded: GpuRef) -> Self {
        Self {
            codec,
            decoded,
            deblock_line: None,
            deblock_tile_line: None,
            deblock_tile_column: None,
            metadata_line: None,
            metadata_tile_line: None,
            metadata_tile_column: None,
            sao_line: None,
            sao_tile_line: None,
            sao_tile_column: None,
            current_mv: None,
            references: [None; MAX_REFERENCE_FRAMES],
            original_source: None,
            streamout: None,
            status_error: None,
            vp9_probability: None,
            vp9_segment_id: None,
            vp9_hvd_line: None,
            vp9_hvd_tile: None,
            sao_rowstore: None,
            frame_statistics: None,
        }
    }

    /// Bound address fields, used by the sizer for patch-slot accounting.
    pub fn bound_buffers(&self) -> usize {
        let optional = [
            self.deblock_line,
            self.deblock_tile_line,
            self.deblock_tile_column,
            self.metadata_line,
            self.metadata_tile_line,
            self.metadata_tile_column,
            self.sao_line,
            self.sao_tile_line,
            self.sao_tile_column,
            self.current_mv,
            self.original_source,
            self.streamout,
            self.status_error,
            self.vp9_probability,
            self.vp9_segment_id,
            self.vp9_hvd_line,
            self.vp9_hvd_tile,
            self.sao_rowstore,
            self.frame_statistics,
        ];
        1 + optional.iter().flatten().count() + self.references.iter().flatten().count()
    }
}

const PBA_REFERENCE_BASE: usize = 37;
const PBA_REFERENCE_ATTRIBUTES: usize = 53;

pub fn pipe_buf_addr_state(
    len: u32,
    tracker: &ResourceTracker,
    params: &PipeBufAddrParams,
    plan: &RowStorePlan,
) -> Result<CommandDescriptor> {
    require_len(CommandKind::HcpPipeBufAddrState, len, 101)?;
    let hevc = match params.codec {
        CodecKind::Hevc => true,
        CodecKind::Vp9 => false,
        other => return Err(MediaError::unsupported(format!("{other:?} on the HCP pipe"))),
    };

    let mut cmd = hcp_command(CommandKind::HcpPipeBufAddrState, HCP_PIPE_BUF_ADDR_STATE, len);
    write_buffer(&mut cmd, tracker, 1, Some(params.decoded), true)?;

    write_row_store(&mut cmd, tracker, 4, plan.df, params.deblock_line, true, "deblocking filter line")?;
    write_buffer(&mut cmd, tracker, 7, params.deblock_tile_line, true)?;
    write_buffer(&mut cmd, tracker, 10, params.deblock_tile_column, true)?;

    write_row_store(&mut cmd, tracker, 13, plan.dat, params.metadata_line, true, "metadata line")?;
    write_buffer(&mut cmd, tracker, 16, params.metadata_tile_line, true)?;
    write_buffer(&mut cmd, tracker, 19, params.metadata_tile_column, true)?;

    write_row_store(&mut cmd, tracker, 22, plan.sao, params.sao_line, hevc, "SAO line")?;
    write_buffer(&mut cmd, tracker, 25, params.sao_tile_line, true)?;
    write_buffer(&mut cmd, tracker, 28, params.sao_tile_column, true)?;

    write_buffer(&mut cmd, tracker, 31, params.current_mv, true)?;

    let mut reference_attributes = None;
    for (i, reference) in params.references.iter().enumerate() {
        let resolved = cmd.write_optional_address(tracker, PBA_REFERENCE_BASE + 2 * i, *reference, false, CACHELINE_SIZE)?;
        if reference_attributes.is_none() {
            reference_attributes = resolved;
        }
    }
    if let Some(resolved) = reference_attributes {
        cmd.set(PBA_REFERENCE_ATTRIBUTES, 0, 31, memory_attributes(&resolved, false));
    }

    write_buffer(&mut cmd, tracker, 54, params.original_source, false)?;
    write_buffer(&mut cmd, tracker, 57, params.streamout, true)?;
    write_buffer(&mut cmd, tracker, 60, params.status_error, true)?;

    write_buffer(&mut cmd, tracker, 83, params.vp9_probability, true)?;
    write_buffer(&mut cmd, tracker, 86, params.vp9_segment_id, true)?;
    write_row_store(&mut cmd, tracker, 89, plan.hvd, params.vp9_hvd_line, !hevc, "VP9 HVD line")?;
    write_buffer(&mut cmd, tracker, 92, params.vp9_hvd_tile, true)?;
    write_row_store(&mut cmd, tracker, 95, plan.hsao, params.sao_rowstore, false, "SAO rowstore")?;
    write_buffer(&mut cmd, tracker, 98, params.frame_statistics, true)?;
    Ok(cmd)
}

// =============================================================================
// HCP_IND_OBJ_BASE_ADDR_STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndObjBaseAddrParams {
    pub direction: CodingDirection,
    /// Compressed input for decode, PAK-BSE output for encode.
    pub bitstream: GpuRef,
    pub bitstream_size: u32,
    /// CU object input for encode.
    pub cu_object: Option<GpuRef>,
}

pub fn ind_obj_base_addr_state(
    len: u32,
    tracker: &ResourceTracker,
    params: &IndObjBaseAddrParams,
) -> Result<CommandDescriptor> {
    require_len(CommandKind::HcpIndObjBaseAddrState, len, 14)?;
    if params.bitstream_size == 0 {
        return Err(MediaError::invalid("indirect bitstream has zero size"));
    }
    let end = params
        .bitstream
        .offset
        .checked_add(params.bitstream_size)
        .ok_or_else(|| MediaError::invalid("indirect bitstream range overflows"))?;
    let upper = params.bitstream.handle.at(end);

    let mut cmd = hcp_command(CommandKind::HcpIndObjBaseAddrState, HCP_IND_OBJ_BASE_ADDR_STATE, len);
    match params.direction {
        CodingDirection::Decode => {
            let resolved = cmd.write_address(tracker, 1, params.bitstream, false, 1)?;
            cmd.set(3, 0, 31, memory_attributes(&resolved, false));
            cmd.write_address(tracker, 4, upper, false, 1)?;
        }
        CodingDirection::Encode => {
            write_buffer(&mut cmd, tracker, 6, params.cu_object, false)?;
            let resolved = cmd.write_address(tracker, 9, params.bitstream, true, PAGE_SIZE as u32)?;
            cmd.set(11, 0, 31, memory_attributes(&resolved, false));
            cmd.write_address(tracker, 12, upper, true, 1)?;
        }
    }
    Ok(cmd)
}

// =============================================================================
// Picture State
// =============================================================================

pub fn hevc_pic_state(len: u32, params: &HevcParams) -> Result<CommandDescriptor> {
    require_len(CommandKind::HcpPicState, len, 6)?;
    let g = &params.geometry;
    let mut cmd = hcp_command(CommandKind::HcpPicState, HCP_PIC_STATE, len);
    cmd.set(1, 0, 10, params.width_in_min_cb() - 1);
    cmd.set(1, 16, 26, params.height_in_min_cb() - 1);
    cmd.set(2, 0, 1, params.log2_min_cb as u32 - 3);
    cmd.set(2, 2, 3, params.log2_ctb as u32 - 4);
    cmd.set(2, 4, 5, params.log2_min_tu as u32 - 2);
    cmd.set(2, 6, 7, params.log2_max_tu as u32 - 2);
    cmd.set(2, 29, 31, g.chroma as u32);
    cmd.set_flag(4, 17, params.tiles.num_tiles() > 1);
    cmd.set(5, 24, 26, g.bit_depth_minus8 as u32);
    cmd.set(5, 27, 29, g.bit_depth_minus8 as u32);
    Ok(cmd)
}

pub fn vp9_pic_state(len: u32, params: &Vp9Params) -> Result<CommandDescriptor> {
    require_len(CommandKind::HcpVp9PicState, len, 4)?;
    let g = &params.geometry;
    let mut cmd = hcp_command(CommandKind::HcpVp9PicState, HCP_VP9_PIC_STATE, len);
    cmd.set(1, 0, 13, g.width - 1);
    cmd.set(1, 16, 29, g.height - 1);

    cmd.set_flag(2, 0, !params.key_frame);
    cmd.set_flag(2, 1, params.refresh_frame_context && !params.error_resilient);
    cmd.set_flag(2, 2, params.intra_only);
    cmd.set_flag(2, 14, params.refresh_frame_context);
    cmd.set_flag(2, 15, params.error_resilient);
    cmd.set(2, 17, 22, params.filter_level.min(63));
    cmd.set(2, 23, 25, params.sharpness_level.min(7));
    cmd.set_flag(2, 26, params.segmentation_enabled);
    cmd.set_flag(2, 29, params.lossless);

    cmd.set(3, 0, 3, params.log2_tile_columns());
    cmd.set(3, 8, 9, params.log2_tile_rows());
    cmd.set(3, 22, 23, (g.chroma as u32).saturating_sub(1));
    cmd.set(3, 24, 27, g.bit_depth_minus8 as u32);
    Ok(cmd)
}

pub fn vp9_segment_state(len: u32, segment_id: u32) -> Result<CommandDescriptor> {
    if segment_id > 7 {
        return Err(MediaError::invalid(format!("VP9 segment {segment_id} out of range")));
    }
    let mut cmd = hcp_command(CommandKind::HcpVp9SegmentState, HCP_VP9_SEGMENT_STATE, len);
    cmd.set(1, 0, 2, segment_id);
    Ok(cmd)
}

// =============================================================================
// HCP_TILE_CODING
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileCodingParams {
    pub num_active_pipes: u32,
    pub num_tile_columns: u32,
    /// Tile position in LCU/SB units.
    pub column_position: u32,
    pub row_position: u32,
    pub width_in_min_cb: u32,
    pub height_in_min_cb: u32,
    pub last_of_row: bool,
    pub last_of_column: bool,
    pub tile_number: u32,
    pub frame_number: u32,
    pub offsets: TileStreamoutOffsets,
}

impl TileCodingParams {
    /// Derive TILE_CODING fields for `tile` of `params`, clipping the last
    /// row and column to the picture edge.
    pub fn for_tile(
        params: &CodecParams,
        tile: &TileRect,
        num_active_pipes: u32,
        frame_number: u32,
        offsets: TileStreamoutOffsets,
    ) -> Result<Self> {
        let (ratio, pic_w, pic_h, layout) = match params {
            CodecParams::Hevc(p) => (
                1u32 << (p.log2_ctb - p.log2_min_cb),
                p.width_in_min_cb(),
                p.height_in_min_cb(),
                &p.tiles,
            ),
            CodecParams::Vp9(p) => (
                Vp9Params::SUPERBLOCK_SIZE / 8,
                p.geometry.width.div_ceil(8),
                p.geometry.height.div_ceil(8),
                &p.tiles,
            ),
            _ => return Err(MediaError::unsupported(format!("{:?} has no tiles", params.kind()))),
        };
        if num_active_pipes == 0 || num_active_pipes as usize > MAX_PIPES {
            return Err(MediaError::invalid(format!("{num_active_pipes} active pipes")));
        }
        let clip = |start: u32, extent: u32, limit: u32| ((start + extent) * ratio).min(limit) - start * ratio;
        Ok(Self {
            num_active_pipes,
            num_tile_columns: layout.columns(),
            column_position: tile.start_x,
            row_position: tile.start_y,
            width_in_min_cb: clip(tile.start_x, tile.width, pic_w),
            height_in_min_cb: clip(tile.start_y, tile.height, pic_h),
            last_of_row: tile.column + 1 == layout.columns(),
            last_of_column: tile.row + 1 == layout.rows(),
            tile_number: tile.index,
            frame_number,
            offsets,
        })
    }
}

pub fn tile_coding(len: u32, params: &TileCodingParams) -> Result<CommandDescriptor> {
    require_len(CommandKind::HcpTileCoding, len, 18)?;
    if params.tile_number > 63 {
        return Err(MediaError::invalid(format!("tile number {} out of range", params.tile_number)));
    }
    let o = &params.offsets;
    let mut cmd = hcp_command(CommandKind::HcpTileCoding, HCP_TILE_CODING, len);
    cmd.set(1, 0, 7, params.num_active_pipes);
    cmd.set_flag(1, 8, o.row_store_select);
    cmd.set_flag(1, 9, o.column_store_select);
    cmd.set(1, 16, 31, params.num_tile_columns);

    cmd.set(2, 0, 9, params.column_position);
    cmd.set(2, 16, 25, params.row_position);
    cmd.set_flag(2, 30, params.last_of_row);
    cmd.set_flag(2, 31, params.last_of_column);

    cmd.set(3, 0, 10, params.height_in_min_cb.saturating_sub(1));
    cmd.set(3, 16, 26, params.width_in_min_cb.saturating_sub(1));

    cmd.set_flag(4, 0, true);
    cmd.set(4, 6, 31, o.bitstream >> 6);

    // Offsets are cacheline aligned and live in bits 6-31.
    for (dw, value) in [
        (5, o.pak_statistics),
        (6, o.streamout),
        (8, o.cu_record),
        (10, o.sao_rowstore),
        (11, o.tile_size_streamout),
    ] {
        cmd.set(dw, 6, 31, value >> 6);
    }

    cmd.set(17, 8, 13, params.tile_number);
    cmd.set(17, 14, 17, params.frame_number % 16);
    Ok(cmd)
}

// =============================================================================
// Slice Level
// =============================================================================

fn hevc_slice_type(frame_type: FrameType) -> u32 {
    match frame_type {
        FrameType::B => 0,
        FrameType::P => 1,
        FrameType::I => 2,
    }
}

pub fn slice_state(len: u32, slice: &HevcSlice, last_of_tile: bool) -> Result<CommandDescriptor> {
    require_len(CommandKind::HcpSliceState, len, 5)?;
    if !(-12..=51).contains(&slice.qp) {
        return Err(MediaError::invalid(format!("slice QP {} out of range", slice.qp)));
    }
    let mut cmd = hcp_command(CommandKind::HcpSliceState, HCP_SLICE_STATE, len);
    cmd.set(1, 0, 9, slice.start_ctb_x);
    cmd.set(1, 16, 25, slice.start_ctb_y);
    cmd.set(2, 0, 9, slice.next_start_ctb_x);
    cmd.set(2, 16, 26, slice.next_start_ctb_y);

    cmd.set(3, 0, 1, hevc_slice_type(slice.slice_type));
    cmd.set_flag(3, 2, slice.last_slice_of_picture);
    cmd.set_flag(3, 3, slice.qp < 0);
    cmd.set(3, 6, 11, slice.qp.unsigned_abs());
    cmd.set(3, 12, 16, signed_field(slice.cb_qp_offset.clamp(-12, 12), 5));
    cmd.set(3, 17, 21, signed_field(slice.cr_qp_offset.clamp(-12, 12), 5));
    cmd.set_flag(3, 24, last_of_tile);

    cmd.set(4, 1, 4, signed_field(slice.tc_offset_div2.clamp(-6, 6), 4));
    cmd.set(4, 5, 8, signed_field(slice.beta_offset_div2.clamp(-6, 6), 4));
    cmd.set(4, 23, 25, slice.max_merge_idx.min(4));
    Ok(cmd)
}

pub fn bsd_object(len: u32, offset: u32, length: u32) -> Result<CommandDescriptor> {
    if length == 0 {
        return Err(MediaError::invalid("BSD object with zero length"));
    }
    if offset >= 1 << 29 {
        return Err(MediaError::invalid(format!("BSD start offset 0x{offset:X} too large")));
    }
    let mut cmd = hcp_command(CommandKind::HcpBsdObject, HCP_BSD_OBJECT, len);
    cmd.set(1, 0, 31, length);
    cmd.set(2, 0, 28, offset);
    Ok(cmd)
}

// =============================================================================
// VDENC
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VdencCmd2Params {
    pub width: u32,
    pub height: u32,
    pub tuning: ClampedTuning,
}

pub fn vdenc_cmd2(len: u32, params: &VdencCmd2Params) -> Result<CommandDescriptor> {
    require_len(CommandKind::VdencCmd2, len, 27)?;
    if params.width == 0 || params.height == 0 {
        return Err(MediaError::invalid("VDENC picture has zero extent"));
    }
    let t = &params.tuning;
    let mut cmd = CommandDescriptor::new(CommandKind::VdencCmd2, len, media_header(MEDIA_OPCODE_VDENC, VDENC_CMD2, len));
    cmd.set(1, 0, 15, params.width - 1);
    cmd.set(1, 16, 31, params.height - 1);

    let poc = |i: usize, list: usize| t.poc_diffs[i][list] as u8 as u32;
    cmd.set(3, 0, 7, poc(0, 0));
    cmd.set(3, 8, 15, poc(0, 1));
    cmd.set(3, 16, 23, poc(1, 0));
    cmd.set(3, 24, 31, poc(1, 1));
    cmd.set(4, 0, 7, poc(2, 0));
    cmd.set(4, 8, 15, poc(2, 1));

    cmd.set(16, 0, 7, t.min_qp as u32);
    cmd.set(16, 8, 15, t.max_qp as u32);
    cmd.set(21, 28, 31, signed_field(t.rolling_i_qp_adjust as i32, 4));
    cmd.set(26, 0, 15, t.rd_lambda as u32);
    cmd.set(26, 16, 24, t.sad_lambda as u32);
    Ok(cmd)
}

/// 16-dword VDENC streamin record seeded from quality-tier defaults.
pub fn streamin_record(defaults: &QualityDefaults) -> [u32; 16] {
    let mut record = [0u32; 16];
    set_field(&mut record[0], 8, 9, defaults.max_tu_size as u32);
    set_field(&mut record[0], 10, 11, defaults.max_cu_size as u32);
    set_field(&mut record[0], 12, 15, defaults.ime_predictors as u32);
    for (i, &merge) in defaults.merge_candidates.iter().enumerate() {
        let lo = 16 + 4 * i as u32;
        set_field(&mut record[6], lo, lo + 3, merge as u32);
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{clamp_tuning, EncodeTuning, PictureGeometry, TileLayout};
    use crate::resource::{Compression, SurfaceDesc};

    fn sign_extend(raw: u32, bits: u32) -> i32 {
        let shift = 32 - bits;
        ((raw << shift) as i32) >> shift
    }

    /// Read the rate-control fields back out of an encoded VDENC_CMD2.
    fn decode_cmd2(cmd: &CommandDescriptor) -> ClampedTuning {
        let byte = |dw: usize, lo: u32| cmd.get(dw, lo, lo + 7) as u8 as i8;
        ClampedTuning {
            poc_diffs: [
                [byte(3, 0), byte(3, 8)],
                [byte(3, 16), byte(3, 24)],
                [byte(4, 0), byte(4, 8)],
            ],
            min_qp: cmd.get(16, 0, 7) as u8,
            max_qp: cmd.get(16, 8, 15) as u8,
            rolling_i_qp_adjust: sign_extend(cmd.get(21, 28, 31), 4) as i8,
            rd_lambda: cmd.get(26, 0, 15) as u16,
            sad_lambda: cmd.get(26, 16, 24) as u16,
        }
    }

    fn tracker_with_surface() -> (ResourceTracker, ResourceHandle) {
        let mut tracker = ResourceTracker::new();
        let surface = tracker
            .create_surface("recon", SurfaceDesc::new(1920, 1080, SurfaceFormat::Planar420_8))
            .unwrap();
        (tracker, surface)
    }

    #[test]
    fn test_vd_pipeline_flush_header() {
        let cmd = vd_pipeline_flush(2, VdPipelineFlushFlags::hevc()).unwrap();
        assert_eq!(cmd.get(0, 29, 31), 3);
        assert_eq!(cmd.get(0, 27, 28), 2);
        assert_eq!(cmd.get(0, 23, 26), 15);
        assert_eq!(cmd.get(0, 0, 11), 0);
        assert_eq!(cmd.get(1, 0, 0), 1);
        assert_eq!(cmd.get(1, 16, 16), 1);
        assert_eq!(command_length(cmd.dw(0)), Some(2));
    }

    #[test]
    fn test_pipe_mode_select_modes() {
        let mut params = PipeModeSelectParams::single(CodecKind::Hevc, CodingDirection::Encode);
        params.vdenc = true;
        params.status_report_id = Some(9);
        let cmd = pipe_mode_select(7, &params).unwrap();
        assert_eq!(cmd.get(0, 16, 22), HCP_PIPE_MODE_SELECT);
        assert_eq!(cmd.get(1, 0, 0), 1);
        assert_eq!(cmd.get(1, 3, 3), 1);
        assert_eq!(cmd.get(1, 10, 10), 1);
        assert_eq!(cmd.dw(3), 9);

        params.multi_engine = MultiEngineMode::for_pipe(1, 3);
        assert_eq!(params.multi_engine, MultiEngineMode::Middle);
        assert!(pipe_mode_select(7, &params).is_err());
        params.working_mode = PipeWorkingMode::Scalable;
        params.phase = 2;
        let cmd = pipe_mode_select(7, &params).unwrap();
        assert_eq!(cmd.get(1, 13, 14), 3);
        assert_eq!(cmd.get(1, 15, 16), 2);
        assert_eq!(cmd.get(6, 0, 1), 2);

        let vp9 = PipeModeSelectParams::single(CodecKind::Avc, CodingDirection::Decode);
        assert!(matches!(pipe_mode_select(7, &vp9), Err(MediaError::UnsupportedMode(_))));
    }

    #[test]
    fn test_surface_state_fields() {
        let (mut tracker, surface) = tracker_with_surface();
        tracker.set_compression(surface, Compression::Media).unwrap();
        let cmd = surface_state(
            5,
            &tracker,
            &SurfaceStateParams {
                surface,
                id: SurfaceId::Decoded,
            },
        )
        .unwrap();
        assert_eq!(cmd.get(1, 0, 16), 1920 - 1);
        assert_eq!(cmd.get(1, 28, 31), 0);
        assert_eq!(cmd.get(2, 0, 14), 1088);
        assert_eq!(cmd.get(2, 27, 31), SurfaceFormat::Planar420_8 as u32);
        assert_eq!(cmd.get(4, 0, 7), 0xFF);
        assert_eq!(cmd.get(4, 8, 15), 0);

        let buffer = tracker.create_buffer("linear", 64, false).unwrap();
        let params = SurfaceStateParams {
            surface: buffer,
            id: SurfaceId::Source,
        };
        assert!(surface_state(5, &tracker, &params).is_err());
    }

    #[test]
    fn test_pipe_buf_addr_row_store_selection() {
        let (mut tracker, surface) = tracker_with_surface();
        let dat = tracker.create_buffer("dat", 0x10000, false).unwrap();
        let sao = tracker.create_buffer("sao", 0x10000, false).unwrap();

        let mut params = PipeBufAddrParams::new(CodecKind::Hevc, surface.at(0));
        params.metadata_line = Some(dat.at(0));
        params.sao_line = Some(sao.at(0));
        let plan = RowStorePlan {
            df: RowStoreCache::at(256),
            ..RowStorePlan::default()
        };

        let cmd = pipe_buf_addr_state(121, &tracker, &params, &plan).unwrap();
        // DF served from cache: address without a relocation, cache bit set.
        assert_eq!(cmd.dw(4), 256 << 6);
        assert_eq!(cmd.get(6, 12, 12), 1);
        let reloc_dwords: Vec<usize> = cmd.relocations().iter().map(|r| r.dword).collect();
        assert_eq!(reloc_dwords, vec![1, 13, 22]);
        assert!(cmd.relocations().iter().all(|r| r.writable));
        assert_eq!(cmd.get(15, 12, 12), 0);
        // Decoded surface is tiled.
        assert_eq!(cmd.get(3, 13, 14), 3);

        // Neither a cache nor a buffer for a required field.
        params.metadata_line = None;
        let err = pipe_buf_addr_state(121, &tracker, &params, &plan).unwrap_err();
        assert!(matches!(err, MediaError::MissingResource(_)));
    }

    #[test]
    fn test_pipe_buf_addr_vp9_needs_hvd() {
        let (mut tracker, surface) = tracker_with_surface();
        let line = tracker.create_buffer("line", 0x4000, false).unwrap();
        let mut params = PipeBufAddrParams::new(CodecKind::Vp9, surface.at(0));
        params.deblock_line = Some(line.at(0));
        params.metadata_line = Some(line.at(0));
        params.references[0] = Some(surface.at(0));

        let plan = RowStorePlan::default();
        assert!(pipe_buf_addr_state(104, &tracker, &params, &plan).is_err());

        let plan = RowStorePlan {
            hvd: RowStoreCache::at(0),
            ..RowStorePlan::default()
        };
        let cmd = pipe_buf_addr_state(104, &tracker, &params, &plan).unwrap();
        assert_eq!(cmd.dwords().len(), 104);
        assert_eq!(cmd.get(91, 12, 12), 1);
        let reference = cmd.relocations().iter().find(|r| r.dword == 37).unwrap();
        assert!(!reference.writable);
        assert_ne!(cmd.dw(53), 0);
    }

    #[test]
    fn test_ind_obj_upper_bound() {
        let mut tracker = ResourceTracker::new();
        let bs = tracker.create_buffer("bitstream", 0x2000, false).unwrap();
        let va = tracker.get(bs).unwrap().gpu_address;
        let params = IndObjBaseAddrParams {
            direction: CodingDirection::Decode,
            bitstream: bs.at(0x100),
            bitstream_size: 0x1F00,
            cu_object: None,
        };
        let cmd = ind_obj_base_addr_state(29, &tracker, &params).unwrap();
        assert_eq!(cmd.dw(1), (va + 0x100) as u32);
        assert_eq!(cmd.dw(4), (va + 0x2000) as u32);

        let too_big = IndObjBaseAddrParams {
            bitstream_size: 0x2000,
            ..params
        };
        assert!(ind_obj_base_addr_state(29, &tracker, &too_big).is_err());

        let encode = IndObjBaseAddrParams {
            direction: CodingDirection::Encode,
            bitstream: bs.at(0),
            bitstream_size: 0x2000,
            cu_object: None,
        };
        let cmd = ind_obj_base_addr_state(29, &tracker, &encode).unwrap();
        assert_eq!(cmd.dw(9), va as u32);
        assert!(cmd.relocations().iter().all(|r| r.writable));
    }

    #[test]
    fn test_hevc_pic_state_geometry() {
        let mut params = HevcParams::new(CodingDirection::Decode, 1920, 1080);
        params.geometry.bit_depth_minus8 = 2;
        params.tiles = TileLayout::uniform(2, 1, 30, 17).unwrap();
        let cmd = hevc_pic_state(41, &params).unwrap();
        assert_eq!(cmd.get(1, 0, 10), 239);
        assert_eq!(cmd.get(1, 16, 26), 134);
        assert_eq!(cmd.get(2, 2, 3), 2);
        assert_eq!(cmd.get(4, 17, 17), 1);
        assert_eq!(cmd.get(5, 27, 29), 2);
    }

    #[test]
    fn test_vp9_pic_state_flags() {
        let mut params = Vp9Params::new(CodingDirection::Decode, 3840, 2160);
        params.key_frame = false;
        params.filter_level = 80;
        params.sharpness_level = 3;
        params.tiles = TileLayout::uniform(4, 1, 60, 34).unwrap();
        let cmd = vp9_pic_state(42, &params).unwrap();
        assert_eq!(cmd.get(1, 0, 13), 3839);
        assert_eq!(cmd.get(2, 0, 0), 1);
        assert_eq!(cmd.get(2, 17, 22), 63);
        assert_eq!(cmd.get(2, 23, 25), 3);
        assert_eq!(cmd.get(3, 0, 3), 2);
        assert!(vp9_segment_state(8, 8).is_err());
    }

    #[test]
    fn test_tile_coding_last_column() {
        let mut hevc = HevcParams::new(CodingDirection::Encode, 1920, 1080);
        hevc.tiles = TileLayout::uniform(2, 1, 30, 17).unwrap();
        let codec = CodecParams::Hevc(hevc);
        let tiles = codec.tiles().unwrap().tiles();
        let offsets = crate::encoder::tile_streamout_offsets(&codec, &tiles[1], 0).unwrap();
        let params = TileCodingParams::for_tile(&codec, &tiles[1], 2, 17, offsets).unwrap();
        // 30 CTBs of 8 min-CBs is 240; the second tile starts at 120.
        assert_eq!(params.width_in_min_cb, 120);
        // 1080 / 8 = 135 min-CB rows, clipped from 17 * 8 = 136.
        assert_eq!(params.height_in_min_cb, 135);
        assert!(params.last_of_row && params.last_of_column);

        let cmd = tile_coding(20, &params).unwrap();
        assert_eq!(cmd.get(1, 0, 7), 2);
        assert_eq!(cmd.get(1, 8, 8), 1);
        assert_eq!(cmd.get(2, 0, 9), 15);
        assert_eq!(cmd.dw(6), offsets.streamout);
        assert_eq!(cmd.get(17, 8, 13), 1);
        assert_eq!(cmd.get(17, 14, 17), 1);
    }

    #[test]
    fn test_slice_state_signed_fields() {
        let mut slice = HevcParams::new(CodingDirection::Decode, 64, 64).slices.remove(0);
        slice.qp = -3;
        slice.cb_qp_offset = -20;
        slice.tc_offset_div2 = -2;
        let cmd = slice_state(13, &slice, true).unwrap();
        assert_eq!(cmd.get(3, 0, 1), 2);
        assert_eq!(cmd.get(3, 3, 3), 1);
        assert_eq!(cmd.get(3, 6, 11), 3);
        assert_eq!(sign_extend(cmd.get(3, 12, 16), 5), -12);
        assert_eq!(sign_extend(cmd.get(4, 1, 4), 4), -2);
        assert_eq!(cmd.get(3, 24, 24), 1);

        slice.qp = 60;
        assert!(slice_state(13, &slice, false).is_err());
        assert!(bsd_object(3, 0, 0).is_err());
    }

    #[test]
    fn test_vdenc_cmd2_reads_back_clamped_values() {
        let tuning = EncodeTuning {
            frame_type: FrameType::B,
            min_qp: Some(10),
            max_qp: Some(60),
            rolling_i_qp_adjust: Some(-11),
            rd_lambda: Some(70_000),
            poc_diffs: [[-30, 2], [4, -5], [6, 100]],
            ..EncodeTuning::default()
        };
        let clamped = clamp_tuning(&tuning);
        let g = PictureGeometry::new(1920, 1080);
        let cmd = vdenc_cmd2(
            51,
            &VdencCmd2Params {
                width: g.width,
                height: g.height,
                tuning: clamped,
            },
        )
        .unwrap();
        assert_eq!(cmd.get(0, 23, 26), MEDIA_OPCODE_VDENC);
        assert_eq!(cmd.get(1, 16, 31), 1079);

        let decoded = decode_cmd2(&cmd);
        assert_eq!(decoded, clamped);
        assert_eq!(decoded.max_qp, 51);
        assert_eq!(decoded.rolling_i_qp_adjust, -8);
        assert_eq!(decoded.poc_diffs[0][0], -16);
        assert_eq!(decoded.rd_lambda, 0xFFFF);

        // Opposite edges: lower bounds and the positive end of the 4-bit adjust.
        let encode = |tuning: &EncodeTuning| {
            let params = VdencCmd2Params {
                width: g.width,
                height: g.height,
                tuning: clamp_tuning(tuning),
            };
            decode_cmd2(&vdenc_cmd2(51, &params).unwrap())
        };
        let low = encode(&EncodeTuning {
            min_qp: Some(-4),
            rolling_i_qp_adjust: Some(40),
            rd_lambda: Some(-1),
            sad_lambda: Some(i64::MIN),
            ..EncodeTuning::default()
        });
        assert_eq!(low.min_qp, 0);
        assert_eq!(low.rolling_i_qp_adjust, 7);
        assert_eq!(low.rd_lambda, 0);
        assert_eq!(low.sad_lambda, 0);

        let high = encode(&EncodeTuning {
            min_qp: Some(0),
            rolling_i_qp_adjust: Some(7),
            rd_lambda: Some(0),
            sad_lambda: Some(0x1FF),
            ..EncodeTuning::default()
        });
        assert_eq!(high.min_qp, 0);
        assert_eq!(high.rolling_i_qp_adjust, 7);
        assert_eq!(high.rd_lambda, 0);
        assert_eq!(high.sad_lambda, 0x1FF);
        assert_eq!(
            encode(&EncodeTuning {
                sad_lambda: Some(0x200),
                ..EncodeTuning::default()
            })
            .sad_lambda,
            0x1FF
        );
    }

    #[test]
    fn test_streamin_record_layout() {
        let defaults = QualityDefaults {
            merge_candidates: [1, 2, 3, 4],
            ime_predictors: 8,
            max_tu_size: 3,
            max_cu_size: 3,
        };
        let record = streamin_record(&defaults);
        assert_eq!(get_field(record[0], 12, 15), 8);
        assert_eq!(get_field(record[0], 10, 11), 3);
        assert_eq!(get_field(record[6], 16, 19), 1);
        assert_eq!(get_field(record[6], 28, 31), 4);
    }
}
