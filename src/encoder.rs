//! Command Encoder Module
//!
//! The `CommandEncoder` trait maps one semantic parameter struct to one
//! fixed-size command. Each hardware generation implements it once and owns
//! its constant tables; everything that is identical across generations
//! lives here as provided methods and shared helpers.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cmdbuf::{CommandDescriptor, CommandKind};
use crate::error::{MediaError, Result};
use crate::gen11::Gen11Encoder;
use crate::gen12::Gen12Encoder;
use crate::hcp::{
    self, IndObjBaseAddrParams, PipeBufAddrParams, PipeModeSelectParams, SurfaceStateParams, TileCodingParams,
    VdPipelineFlushFlags, VdencCmd2Params,
};
use crate::mi::{self, FlushDwParams};
use crate::protocol::*;
use crate::resource::{GpuRef, ResourceTracker};

// =============================================================================
// Codec Parameters
// =============================================================================

/// Hardware generation an encoder targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Generation {
    Gen11,
    Gen12,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    Avc,
    Hevc,
    Vp9,
    Av1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodingDirection {
    Decode,
    Encode,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChromaFormat {
    Monochrome = 0,
    Yuv420 = 1,
    Yuv422 = 2,
    Yuv444 = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    I,
    P,
    B,
}

/// Picture dimensions and sample format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PictureGeometry {
    pub width: u32,
    pub height: u32,
    pub bit_depth_minus8: u8,
    pub chroma: ChromaFormat,
}

impl PictureGeometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bit_depth_minus8: 0,
            chroma: ChromaFormat::Yuv420,
        }
    }

    pub fn is_8bit(&self) -> bool {
        self.bit_depth_minus8 == 0
    }

    pub fn is_10bit(&self) -> bool {
        (1..=2).contains(&self.bit_depth_minus8)
    }

    pub fn is_12bit(&self) -> bool {
        self.bit_depth_minus8 > 2
    }

    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.width > 16384 || self.height > 16384 {
            return Err(MediaError::invalid(format!(
                "picture {}x{} outside 1..=16384",
                self.width, self.height
            )));
        }
        if self.bit_depth_minus8 > 4 {
            return Err(MediaError::invalid(format!(
                "bit depth {} not supported",
                self.bit_depth_minus8 as u32 + 8
            )));
        }
        Ok(())
    }
}

/// One tile of a picture, in coding units of the tile layout (LCU or SB).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    pub index: u32,
    pub column: u32,
    pub row: u32,
    pub start_x: u32,
    pub start_y: u32,
    pub width: u32,
    pub height: u32,
}

impl TileRect {
    pub fn units(&self) -> u32 {
        self.width * self.height
    }
}

/// Tile column widths and row heights, in coding units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileLayout {
    pub column_widths: Vec<u32>,
    pub row_heights: Vec<u32>,
}

impl TileLayout {
    pub fn single(width_units: u32, height_units: u32) -> Self {
        Self {
            column_widths: vec![width_units],
            row_heights: vec![height_units],
        }
    }

    /// Uniformly spaced tiles, distributing remainders the way HEVC does.
    pub fn uniform(columns: u32, rows: u32, width_units: u32, height_units: u32) -> Result<Self> {
        if columns == 0 || rows == 0 || columns > width_units || rows > height_units {
            return Err(MediaError::invalid(format!(
                "{columns}x{rows} tiles do not fit {width_units}x{height_units} units"
            )));
        }
        let split = |count: u32, total: u32| -> Vec<u32> {
            (0..count)
                .map(|i| ((i + 1) * total) / count - (i * total) / count)
                .collect()
        };
        Ok(Self {
            column_widths: split(columns, width_units),
            row_heights: split(rows, height_units),
        })
    }

    pub fn columns(&self) -> u32 {
        self.column_widths.len() as u32
    }

    pub fn rows(&self) -> u32 {
        self.row_heights.len() as u32
    }

    pub fn num_tiles(&self) -> u32 {
        self.columns() * self.rows()
    }

    pub fn width_units(&self) -> u32 {
        self.column_widths.iter().sum()
    }

    pub fn height_units(&self) -> u32 {
        self.row_heights.iter().sum()
    }

    /// Tiles in raster order.
    pub fn tiles(&self) -> Vec<TileRect> {
        let mut tiles = Vec::with_capacity(self.num_tiles() as usize);
        let mut start_y = 0;
        for (row, &height) in self.row_heights.iter().enumerate() {
            let mut start_x = 0;
            for (column, &width) in self.column_widths.iter().enumerate() {
                tiles.push(TileRect {
                    index: tiles.len() as u32,
                    column: column as u32,
                    row: row as u32,
                    start_x,
                    start_y,
                    width,
                    height,
                });
                start_x += width;
            }
            start_y += height;
        }
        tiles
    }

    fn validate(&self, width_units: u32, height_units: u32) -> Result<()> {
        if self.column_widths.is_empty()
            || self.row_heights.is_empty()
            || self.column_widths.contains(&0)
            || self.row_heights.contains(&0)
        {
            return Err(MediaError::invalid("tile layout has an empty row or column"));
        }
        if self.width_units() != width_units || self.height_units() != height_units {
            return Err(MediaError::invalid(format!(
                "tile layout covers {}x{} units, picture has {}x{}",
                self.width_units(),
                self.height_units(),
                width_units,
                height_units
            )));
        }
        Ok(())
    }
}

/// Rate-control overrides for VDENC encoding. `None` selects defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeTuning {
    pub frame_type: FrameType,
    pub qp: u8,
    pub quality_tier: u8,
    pub min_qp: Option<i32>,
    pub max_qp: Option<i32>,
    pub rolling_i_qp_adjust: Option<i32>,
    pub rd_lambda: Option<i64>,
    pub sad_lambda: Option<i64>,
    /// POC distance per reference index (0..3), list 0 and list 1.
    pub poc_diffs: [[i32; 2]; 3],
}

impl Default for EncodeTuning {
    fn default() -> Self {
        Self {
            frame_type: FrameType::I,
            qp: 26,
            quality_tier: 4,
            min_qp: None,
            max_qp: None,
            rolling_i_qp_adjust: None,
            rd_lambda: None,
            sad_lambda: None,
            poc_diffs: [[0; 2]; 3],
        }
    }
}

/// One HEVC slice, positions in CTBs.
#[derive(Debug, Clone, PartialEq)]
pub struct HevcSlice {
    pub start_ctb_x: u32,
    pub start_ctb_y: u32,
    pub next_start_ctb_x: u32,
    pub next_start_ctb_y: u32,
    pub slice_type: FrameType,
    pub qp: i32,
    pub cb_qp_offset: i32,
    pub cr_qp_offset: i32,
    pub beta_offset_div2: i32,
    pub tc_offset_div2: i32,
    pub max_merge_idx: u32,
    pub last_slice_of_picture: bool,
    pub bitstream_offset: u32,
    pub bitstream_length: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HevcParams {
    pub direction: CodingDirection,
    pub geometry: PictureGeometry,
    pub log2_min_cb: u8,
    pub log2_ctb: u8,
    pub log2_min_tu: u8,
    pub log2_max_tu: u8,
    pub tiles: TileLayout,
    pub slices: Vec<HevcSlice>,
    pub tuning: EncodeTuning,
}

impl HevcParams {
    /// Single-tile, single-slice 8-bit 4:2:0 picture with 64x64 CTBs.
    pub fn new(direction: CodingDirection, width: u32, height: u32) -> Self {
        let geometry = PictureGeometry::new(width, height);
        let w = width.div_ceil(64);
        let h = height.div_ceil(64);
        Self {
            direction,
            geometry,
            log2_min_cb: 3,
            log2_ctb: 6,
            log2_min_tu: 2,
            log2_max_tu: 5,
            tiles: TileLayout::single(w, h),
            slices: vec![HevcSlice {
                start_ctb_x: 0,
                start_ctb_y: 0,
                next_start_ctb_x: 0,
                next_start_ctb_y: 0,
                slice_type: FrameType::I,
                qp: 26,
                cb_qp_offset: 0,
                cr_qp_offset: 0,
                beta_offset_div2: 0,
                tc_offset_div2: 0,
                max_merge_idx: 4,
                last_slice_of_picture: true,
                bitstream_offset: 0,
                bitstream_length: 0,
            }],
            tuning: EncodeTuning::default(),
        }
    }

    pub fn ctb_size(&self) -> u32 {
        1 << self.log2_ctb
    }

    pub fn width_in_ctb(&self) -> u32 {
        self.geometry.width.div_ceil(self.ctb_size())
    }

    pub fn height_in_ctb(&self) -> u32 {
        self.geometry.height.div_ceil(self.ctb_size())
    }

    pub fn width_in_min_cb(&self) -> u32 {
        self.geometry.width.div_ceil(1 << self.log2_min_cb)
    }

    pub fn height_in_min_cb(&self) -> u32 {
        self.geometry.height.div_ceil(1 << self.log2_min_cb)
    }

    fn validate(&self) -> Result<()> {
        self.geometry.validate()?;
        if !(3..=6).contains(&self.log2_min_cb) || !(4..=6).contains(&self.log2_ctb) || self.log2_min_cb > self.log2_ctb {
            return Err(MediaError::invalid(format!(
                "HEVC CB sizes log2 min {} ctb {} invalid",
                self.log2_min_cb, self.log2_ctb
            )));
        }
        if !(2..=5).contains(&self.log2_min_tu) || self.log2_max_tu < self.log2_min_tu || self.log2_max_tu > 5 {
            return Err(MediaError::invalid(format!(
                "HEVC TU sizes log2 min {} max {} invalid",
                self.log2_min_tu, self.log2_max_tu
            )));
        }
        if self.geometry.chroma == ChromaFormat::Monochrome {
            return Err(MediaError::unsupported("HEVC monochrome"));
        }
        self.tiles.validate(self.width_in_ctb(), self.height_in_ctb())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Vp9Params {
    pub direction: CodingDirection,
    pub geometry: PictureGeometry,
    pub key_frame: bool,
    pub intra_only: bool,
    pub refresh_frame_context: bool,
    pub error_resilient: bool,
    pub filter_level: u32,
    pub sharpness_level: u32,
    pub segmentation_enabled: bool,
    pub lossless: bool,
    /// Tiles in 64x64 superblocks. VP9 requires power-of-two tile counts.
    pub tiles: TileLayout,
    pub bitstream_length: u32,
}

impl Vp9Params {
    pub const SUPERBLOCK_SIZE: u32 = 64;

    pub fn new(direction: CodingDirection, width: u32, height: u32) -> Self {
        Self {
            direction,
            geometry: PictureGeometry::new(width, height),
            key_frame: true,
            intra_only: false,
            refresh_frame_context: true,
            error_resilient: false,
            filter_level: 10,
            sharpness_level: 0,
            segmentation_enabled: false,
            lossless: false,
            tiles: TileLayout::single(width.div_ceil(64), height.div_ceil(64)),
            bitstream_length: 0,
        }
    }

    pub fn width_in_sb(&self) -> u32 {
        self.geometry.width.div_ceil(Self::SUPERBLOCK_SIZE)
    }

    pub fn height_in_sb(&self) -> u32 {
        self.geometry.height.div_ceil(Self::SUPERBLOCK_SIZE)
    }

    pub fn log2_tile_columns(&self) -> u32 {
        self.tiles.columns().trailing_zeros()
    }

    pub fn log2_tile_rows(&self) -> u32 {
        self.tiles.rows().trailing_zeros()
    }

    fn validate(&self) -> Result<()> {
        self.geometry.validate()?;
        if self.geometry.chroma == ChromaFormat::Monochrome {
            return Err(MediaError::unsupported("VP9 monochrome"));
        }
        if !self.tiles.columns().is_power_of_two() || !self.tiles.rows().is_power_of_two() || self.tiles.rows() > 4 {
            return Err(MediaError::invalid(format!(
                "VP9 tile grid {}x{} is not a legal power of two",
                self.tiles.columns(),
                self.tiles.rows()
            )));
        }
        self.tiles.validate(self.width_in_sb(), self.height_in_sb())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AvcParams {
    pub direction: CodingDirection,
    pub geometry: PictureGeometry,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Av1Params {
    pub direction: CodingDirection,
    pub geometry: PictureGeometry,
    pub superblock_128: bool,
}

/// Per-codec picture parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum CodecParams {
    Avc(AvcParams),
    Hevc(HevcParams),
    Vp9(Vp9Params),
    Av1(Av1Params),
}

impl CodecParams {
    pub fn kind(&self) -> CodecKind {
        match self {
            CodecParams::Avc(_) => CodecKind::Avc,
            CodecParams::Hevc(_) => CodecKind::Hevc,
            CodecParams::Vp9(_) => CodecKind::Vp9,
            CodecParams::Av1(_) => CodecKind::Av1,
        }
    }

    pub fn geometry(&self) -> &PictureGeometry {
        match self {
            CodecParams::Avc(p) => &p.geometry,
            CodecParams::Hevc(p) => &p.geometry,
            CodecParams::Vp9(p) => &p.geometry,
            CodecParams::Av1(p) => &p.geometry,
        }
    }

    pub fn direction(&self) -> CodingDirection {
        match self {
            CodecParams::Avc(p) => p.direction,
            CodecParams::Hevc(p) => p.direction,
            CodecParams::Vp9(p) => p.direction,
            CodecParams::Av1(p) => p.direction,
        }
    }

    pub fn tiles(&self) -> Option<&TileLayout> {
        match self {
            CodecParams::Hevc(p) => Some(&p.tiles),
            CodecParams::Vp9(p) => Some(&p.tiles),
            CodecParams::Avc(_) | CodecParams::Av1(_) => None,
        }
    }

    /// Check preconditions. Codecs the HCP pipe cannot run are rejected.
    pub fn validate(&self) -> Result<()> {
        match self {
            CodecParams::Hevc(p) => p.validate(),
            CodecParams::Vp9(p) => p.validate(),
            CodecParams::Avc(_) => Err(MediaError::unsupported("AVC is not handled by the HCP pipe")),
            CodecParams::Av1(_) => Err(MediaError::unsupported("AV1 is not handled by the HCP pipe")),
        }
    }

    pub fn row_store_query(&self) -> RowStoreQuery {
        let g = self.geometry();
        let lcu_size = match self {
            CodecParams::Hevc(p) => p.ctb_size(),
            CodecParams::Av1(p) if p.superblock_128 => 128,
            CodecParams::Avc(_) => 16,
            _ => 64,
        };
        RowStoreQuery {
            codec: self.kind(),
            width: g.width,
            height: g.height,
            bit_depth_minus8: g.bit_depth_minus8,
            chroma: g.chroma,
            lcu_size,
        }
    }
}

// =============================================================================
// Row-store Cache Planning
// =============================================================================

/// Which row-store caches configuration allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowStoreSupport {
    pub enabled: bool,
    pub hevc_dat: bool,
    pub hevc_df: bool,
    pub hevc_sao: bool,
    pub vp9_hvd: bool,
    pub vp9_dat: bool,
    pub vp9_df: bool,
}

impl RowStoreSupport {
    pub fn all() -> Self {
        Self {
            enabled: true,
            hevc_dat: true,
            hevc_df: true,
            hevc_sao: true,
            vp9_hvd: true,
            vp9_dat: true,
            vp9_df: true,
        }
    }

    pub fn none() -> Self {
        Self {
            enabled: false,
            ..Self::all()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowStoreCache {
    pub enabled: bool,
    /// Cache base address in cachelines.
    pub address: u32,
}

impl RowStoreCache {
    pub const DISABLED: RowStoreCache = RowStoreCache {
        enabled: false,
        address: 0,
    };

    pub fn at(address: u32) -> Self {
        Self {
            enabled: true,
            address,
        }
    }

    /// Keep the entry only when the table enables it and configuration
    /// allows it.
    pub fn gated(table_enabled: bool, address: u32, supported: bool) -> Self {
        if table_enabled && supported {
            Self::at(address)
        } else {
            Self::DISABLED
        }
    }
}

/// Per-buffer cache decision for one picture. Every field is either an
/// enabled cache with an address or disabled, never left undecided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowStorePlan {
    pub dat: RowStoreCache,
    pub df: RowStoreCache,
    pub sao: RowStoreCache,
    pub hsao: RowStoreCache,
    pub hvd: RowStoreCache,
    pub vdenc: RowStoreCache,
}

impl RowStorePlan {
    pub fn any_enabled(&self) -> bool {
        [self.dat, self.df, self.sao, self.hsao, self.hvd, self.vdenc]
            .iter()
            .any(|c| c.enabled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowStoreQuery {
    pub codec: CodecKind,
    pub width: u32,
    pub height: u32,
    pub bit_depth_minus8: u8,
    pub chroma: ChromaFormat,
    pub lcu_size: u32,
}

// =============================================================================
// Tile Streamout Offsets
// =============================================================================

/// Per-codec streamout record geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamoutLayout {
    /// Reserve placed in front of every tile after the first.
    pub header_reserve: u32,
    pub pak_dwords_per_unit: u32,
    pub dwords_per_cu: u32,
    /// Smallest CU edge counted in the footprint.
    pub min_cu_size: u32,
}

impl StreamoutLayout {
    pub const HEVC: StreamoutLayout = StreamoutLayout {
        header_reserve: CACHELINE_SIZE,
        pak_dwords_per_unit: 5,
        dwords_per_cu: 8,
        min_cu_size: 8,
    };

    pub const VP9: StreamoutLayout = StreamoutLayout {
        header_reserve: CACHELINE_SIZE,
        pak_dwords_per_unit: 8,
        dwords_per_cu: 8,
        min_cu_size: 8,
    };

    /// Worst-case streamout bytes for one LCU/SB of edge `unit_size`.
    pub fn unit_footprint(&self, unit_size: u32) -> u32 {
        let cus_per_unit = (unit_size / self.min_cu_size).pow(2);
        2 * DWORD_SIZE as u32 * (self.pak_dwords_per_unit + cus_per_unit * self.dwords_per_cu)
    }

    /// Byte offset of a tile's streamout entry: the units preceding it in
    /// raster order times the footprint, rounded to a cacheline, plus the
    /// per-tile header reserve. The origin tile starts at zero.
    pub fn tile_offset(&self, tile: &TileRect, picture_width_units: u32, unit_size: u32) -> u32 {
        let units_before = tile.start_y * picture_width_units + tile.start_x * tile.height;
        if units_before == 0 {
            return 0;
        }
        align_up(units_before * self.unit_footprint(unit_size), CACHELINE_SIZE) + self.header_reserve
    }
}

/// CU records per CTB indexed by log2(ctb) - 3.
const CU_RECORDS_PER_CTB: [u32; 4] = [1, 4, 16, 64];
const CU_RECORD_SIZE: u32 = 64;
/// Cachelines of PAK statistics per tile.
const PAK_TILE_STATISTICS_LINES: u32 = 9;

/// Every per-tile offset programmed into TILE_CODING, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TileStreamoutOffsets {
    pub streamout: u32,
    pub cu_record: u32,
    pub pak_statistics: u32,
    pub tile_size_streamout: u32,
    pub sao_rowstore: u32,
    pub bitstream: u32,
    pub row_store_select: bool,
    pub column_store_select: bool,
}

/// Offsets for `tile` of an HEVC or VP9 picture. `bitstream_per_tile` is
/// the bitstream budget of one tile in bytes.
pub fn tile_streamout_offsets(params: &CodecParams, tile: &TileRect, bitstream_per_tile: u32) -> Result<TileStreamoutOffsets> {
    let (layout, unit_size, width_units, log2_unit) = match params {
        CodecParams::Hevc(p) => (StreamoutLayout::HEVC, p.ctb_size(), p.width_in_ctb(), p.log2_ctb as u32),
        CodecParams::Vp9(p) => (StreamoutLayout::VP9, Vp9Params::SUPERBLOCK_SIZE, p.width_in_sb(), 6),
        _ => return Err(MediaError::unsupported(format!("{:?} has no tile streamout", params.kind()))),
    };

    let units_before = tile.start_y * width_units + tile.start_x * tile.height;
    let records = CU_RECORDS_PER_CTB[(log2_unit - 3) as usize];

    Ok(TileStreamoutOffsets {
        streamout: layout.tile_offset(tile, width_units, unit_size),
        cu_record: align_up(records * units_before * CU_RECORD_SIZE, CACHELINE_SIZE),
        pak_statistics: PAK_TILE_STATISTICS_LINES * tile.index * CACHELINE_SIZE,
        tile_size_streamout: tile.index * CACHELINE_SIZE,
        sao_rowstore: if tile.start_y == 0 {
            tile.start_x * unit_size / 32 * CACHELINE_SIZE
        } else {
            0
        },
        bitstream: align_up(bitstream_per_tile, CACHELINE_SIZE) * tile.index,
        row_store_select: tile.column % 2 == 1,
        column_store_select: tile.row % 2 == 1,
    })
}

// =============================================================================
// Clamping and Quality Defaults
// =============================================================================

/// Streamin defaults selected by quality tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityDefaults {
    /// Merge candidates for CU 8x8, 16x16, 32x32 and 64x64.
    pub merge_candidates: [u8; 4],
    pub ime_predictors: u8,
    pub max_tu_size: u8,
    pub max_cu_size: u8,
}

pub const POC_DIFF_RANGE: (i32, i32) = (-16, 16);
pub const HEVC_QP_RANGE: (i32, i32) = (0, 51);
pub const ROLLING_I_QP_ADJUST_RANGE: (i32, i32) = (-8, 7);
pub const RD_LAMBDA_RANGE: (i64, i64) = (0, 0xFFFF);
pub const SAD_LAMBDA_RANGE: (i64, i64) = (0, 0x1FF);

/// Rate-control fields after clamping and default selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClampedTuning {
    pub poc_diffs: [[i8; 2]; 3],
    pub min_qp: u8,
    pub max_qp: u8,
    pub rolling_i_qp_adjust: i8,
    pub rd_lambda: u16,
    pub sad_lambda: u16,
}

/// Default RD and SAD lambdas for a QP and frame type.
pub fn default_lambdas(qp: u8, frame_type: FrameType) -> (i64, i64) {
    let idx = qp.saturating_sub(12) as f64;
    let rd = 4.0 * 2f64.powf(idx / 3.0);
    let sad = 4.0 * 2f64.powf(idx / 6.0);
    let (rd_scale, sad_scale) = match frame_type {
        FrameType::I => (0.65, 0.65),
        FrameType::P => (0.50, 0.75),
        FrameType::B => (1.20, 1.10),
    };
    ((rd_scale * rd) as i64, (sad_scale * sad) as i64)
}

/// Clamp every VDENC rate-control field into its legal range, filling in
/// defaults for fields without an override.
pub fn clamp_tuning(tuning: &EncodeTuning) -> ClampedTuning {
    let clamp = |v: i32, (lo, hi): (i32, i32)| v.clamp(lo, hi);

    let mut poc_diffs = [[0i8; 2]; 3];
    for (dst, src) in poc_diffs.iter_mut().zip(tuning.poc_diffs.iter()) {
        for (d, s) in dst.iter_mut().zip(src.iter()) {
            *d = clamp(*s, POC_DIFF_RANGE) as i8;
        }
    }

    let min_qp = clamp(tuning.min_qp.unwrap_or(HEVC_QP_RANGE.0), HEVC_QP_RANGE) as u8;
    let max_qp = (clamp(tuning.max_qp.unwrap_or(HEVC_QP_RANGE.1), HEVC_QP_RANGE) as u8).max(min_qp);

    let (default_rd, default_sad) = default_lambdas(tuning.qp, tuning.frame_type);
    let rd = tuning.rd_lambda.unwrap_or(default_rd).clamp(RD_LAMBDA_RANGE.0, RD_LAMBDA_RANGE.1);
    let sad = tuning.sad_lambda.unwrap_or(default_sad).clamp(SAD_LAMBDA_RANGE.0, SAD_LAMBDA_RANGE.1);

    ClampedTuning {
        poc_diffs,
        min_qp,
        max_qp,
        rolling_i_qp_adjust: clamp(tuning.rolling_i_qp_adjust.unwrap_or(0), ROLLING_I_QP_ADJUST_RANGE) as i8,
        rd_lambda: rd as u16,
        sad_lambda: sad as u16,
    }
}

// =============================================================================
// MMIO
// =============================================================================

/// Absolute register addresses of one VDBOX.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioRegisters {
    pub engine_id: u32,
    pub gpr0: u32,
    pub dec_status: u32,
    pub cabac_status: u32,
    pub bitstream_byte_count: u32,
    pub frame_crc: u32,
}

impl MmioRegisters {
    pub fn for_vdbox(index: usize) -> Result<Self> {
        let base = *VDBOX_MMIO_BASE
            .get(index)
            .ok_or_else(|| MediaError::invalid(format!("VDBOX {index} does not exist")))?;
        Ok(Self {
            engine_id: base + CS_ENGINE_ID_OFFSET,
            gpr0: base + CS_GPR0_OFFSET,
            dec_status: base + HCP_DEC_STATUS_OFFSET,
            cabac_status: base + HCP_CABAC_STATUS_OFFSET,
            bitstream_byte_count: base + HCP_BITSTREAM_BYTECOUNT_FRAME_OFFSET,
            frame_crc: base + HCP_FRAME_CRC_OFFSET,
        })
    }
}

// =============================================================================
// CommandEncoder
// =============================================================================

/// Per-generation command encoder.
///
/// Implementors supply the command size table, the row-store tables and the
/// commands whose layout differs between generations. Everything else is a
/// provided method built on the shared MI and HCP encoders.
pub trait CommandEncoder: Send + Sync + fmt::Debug {
    fn generation(&self) -> Generation;

    /// Fixed dword count of `kind`, `None` if the generation lacks it.
    fn command_dwords(&self, kind: CommandKind) -> Option<u32>;

    fn plan_row_store(&self, query: &RowStoreQuery, support: &RowStoreSupport) -> RowStorePlan;

    fn quality_defaults(&self, tier: u8) -> Result<QualityDefaults>;

    fn semaphore_wait(&self, tracker: &ResourceTracker, target: GpuRef, value: u32, op: CompareOp) -> Result<CommandDescriptor>;

    fn vdenc_cmd2(&self, params: &VdencCmd2Params) -> Result<CommandDescriptor>;

    fn dwords(&self, kind: CommandKind) -> Result<u32> {
        self.command_dwords(kind)
            .ok_or_else(|| MediaError::unsupported(format!("{kind:?} not available on {:?}", self.generation())))
    }

    fn command_bytes(&self, kind: CommandKind) -> Result<usize> {
        Ok(self.dwords(kind)? as usize * DWORD_SIZE)
    }

    fn mmio(&self, vdbox: usize) -> Result<MmioRegisters> {
        MmioRegisters::for_vdbox(vdbox)
    }

    /// Encode the 16-dword VDENC streamin record for a quality tier.
    fn streamin_record(&self, tier: u8) -> Result<[u32; 16]> {
        let defaults = self.quality_defaults(tier)?;
        Ok(hcp::streamin_record(&defaults))
    }

    // MI

    fn noop(&self) -> Result<CommandDescriptor> {
        Ok(mi::noop())
    }

    fn batch_buffer_end(&self) -> Result<CommandDescriptor> {
        Ok(mi::batch_buffer_end())
    }

    fn batch_buffer_start(&self, tracker: &ResourceTracker, target: GpuRef) -> Result<CommandDescriptor> {
        mi::batch_buffer_start(self.dwords(CommandKind::MiBatchBufferStart)?, tracker, target)
    }

    fn load_register_imm(&self, register: u32, value: u32) -> Result<CommandDescriptor> {
        mi::load_register_imm(self.dwords(CommandKind::MiLoadRegisterImm)?, register, value)
    }

    fn load_register_mem(&self, tracker: &ResourceTracker, register: u32, source: GpuRef) -> Result<CommandDescriptor> {
        mi::load_register_mem(self.dwords(CommandKind::MiLoadRegisterMem)?, tracker, register, source)
    }

    fn load_register_reg(&self, source: u32, destination: u32) -> Result<CommandDescriptor> {
        mi::load_register_reg(self.dwords(CommandKind::MiLoadRegisterReg)?, source, destination)
    }

    fn store_register_mem(&self, tracker: &ResourceTracker, register: u32, target: GpuRef) -> Result<CommandDescriptor> {
        mi::store_register_mem(self.dwords(CommandKind::MiStoreRegisterMem)?, tracker, register, target)
    }

    fn store_data_imm(&self, tracker: &ResourceTracker, target: GpuRef, value: u32) -> Result<CommandDescriptor> {
        mi::store_data_imm(self.dwords(CommandKind::MiStoreDataImm)?, tracker, target, value)
    }

    fn copy_mem_mem(&self, tracker: &ResourceTracker, source: GpuRef, target: GpuRef) -> Result<CommandDescriptor> {
        mi::copy_mem_mem(self.dwords(CommandKind::MiCopyMemMem)?, tracker, source, target)
    }

    fn atomic(&self, tracker: &ResourceTracker, target: GpuRef, op: AtomicOp, operand: u32) -> Result<CommandDescriptor> {
        mi::atomic(self.dwords(CommandKind::MiAtomic)?, tracker, target, op, operand)
    }

    fn conditional_batch_buffer_end(&self, tracker: &ResourceTracker, target: GpuRef, compare: u32) -> Result<CommandDescriptor> {
        mi::conditional_batch_buffer_end(
            self.dwords(CommandKind::MiConditionalBatchBufferEnd)?,
            tracker,
            target,
            compare,
        )
    }

    fn flush_dw(&self, tracker: &ResourceTracker, params: &FlushDwParams) -> Result<CommandDescriptor> {
        mi::flush_dw(self.dwords(CommandKind::MiFlushDw)?, tracker, params)
    }

    fn mfx_wait(&self) -> Result<CommandDescriptor> {
        Ok(mi::mfx_wait())
    }

    fn vd_pipeline_flush(&self, flags: VdPipelineFlushFlags) -> Result<CommandDescriptor> {
        hcp::vd_pipeline_flush(self.dwords(CommandKind::VdPipelineFlush)?, flags)
    }

    // HCP

    fn pipe_mode_select(&self, params: &PipeModeSelectParams) -> Result<CommandDescriptor> {
        hcp::pipe_mode_select(self.dwords(CommandKind::HcpPipeModeSelect)?, params)
    }

    fn surface_state(&self, tracker: &ResourceTracker, params: &SurfaceStateParams) -> Result<CommandDescriptor> {
        hcp::surface_state(self.dwords(CommandKind::HcpSurfaceState)?, tracker, params)
    }

    fn pipe_buf_addr_state(
        &self,
        tracker: &ResourceTracker,
        params: &PipeBufAddrParams,
        plan: &RowStorePlan,
    ) -> Result<CommandDescriptor> {
        hcp::pipe_buf_addr_state(self.dwords(CommandKind::HcpPipeBufAddrState)?, tracker, params, plan)
    }

    fn ind_obj_base_addr_state(&self, tracker: &ResourceTracker, params: &IndObjBaseAddrParams) -> Result<CommandDescriptor> {
        hcp::ind_obj_base_addr_state(self.dwords(CommandKind::HcpIndObjBaseAddrState)?, tracker, params)
    }

    fn hevc_pic_state(&self, params: &HevcParams) -> Result<CommandDescriptor> {
        hcp::hevc_pic_state(self.dwords(CommandKind::HcpPicState)?, params)
    }

    fn vp9_pic_state(&self, params: &Vp9Params) -> Result<CommandDescriptor> {
        hcp::vp9_pic_state(self.dwords(CommandKind::HcpVp9PicState)?, params)
    }

    fn vp9_segment_state(&self, segment_id: u32) -> Result<CommandDescriptor> {
        hcp::vp9_segment_state(self.dwords(CommandKind::HcpVp9SegmentState)?, segment_id)
    }

    fn tile_coding(&self, params: &TileCodingParams) -> Result<CommandDescriptor> {
        hcp::tile_coding(self.dwords(CommandKind::HcpTileCoding)?, params)
    }

    fn slice_state(&self, slice: &HevcSlice, last_of_tile: bool) -> Result<CommandDescriptor> {
        hcp::slice_state(self.dwords(CommandKind::HcpSliceState)?, slice, last_of_tile)
    }

    fn bsd_object(&self, offset: u32, length: u32) -> Result<CommandDescriptor> {
        hcp::bsd_object(self.dwords(CommandKind::HcpBsdObject)?, offset, length)
    }
}

/// Build the encoder for `generation`.
pub fn create_encoder(generation: Generation) -> Box<dyn CommandEncoder> {
    debug!("Creating {:?} command encoder", generation);
    match generation {
        Generation::Gen11 => Box::new(Gen11Encoder::new()),
        Generation::Gen12 => Box::new(Gen12Encoder::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalability::assign_tiles;
    use proptest::prelude::*;

    #[test]
    fn test_uniform_tiles_cover_picture() {
        let layout = TileLayout::uniform(3, 2, 30, 17).unwrap();
        assert_eq!(layout.column_widths, vec![10, 10, 10]);
        assert_eq!(layout.row_heights, vec![8, 9]);
        let tiles = layout.tiles();
        assert_eq!(tiles.len(), 6);
        assert_eq!(tiles[4].start_x, 10);
        assert_eq!(tiles[4].start_y, 8);
        assert_eq!(tiles.iter().map(|t| t.units()).sum::<u32>(), 30 * 17);
        assert!(TileLayout::uniform(0, 1, 4, 4).is_err());
    }

    #[test]
    fn test_codec_validation() {
        let hevc = CodecParams::Hevc(HevcParams::new(CodingDirection::Decode, 1920, 1080));
        assert!(hevc.validate().is_ok());

        let avc = CodecParams::Avc(AvcParams {
            direction: CodingDirection::Decode,
            geometry: PictureGeometry::new(1920, 1080),
        });
        assert!(matches!(avc.validate(), Err(MediaError::UnsupportedMode(_))));

        let mut vp9 = Vp9Params::new(CodingDirection::Decode, 1920, 1080);
        vp9.tiles = TileLayout::uniform(3, 1, 30, 17).unwrap();
        assert!(matches!(
            CodecParams::Vp9(vp9).validate(),
            Err(MediaError::InvalidParameter(_))
        ));

        let mut bad = HevcParams::new(CodingDirection::Decode, 1920, 1080);
        bad.tiles = TileLayout::single(10, 10);
        assert!(CodecParams::Hevc(bad).validate().is_err());
    }

    #[test]
    fn test_two_pipe_tile_offset() {
        // 2 tile columns at 64x64 CTBs; tile 1 starts at a non-zero column.
        let mut params = HevcParams::new(CodingDirection::Encode, 1920, 1080);
        params.tiles = TileLayout::uniform(2, 1, 30, 17).unwrap();
        let codec = CodecParams::Hevc(params);
        let tiles = codec.tiles().unwrap().tiles();

        let first = tile_streamout_offsets(&codec, &tiles[0], 0).unwrap();
        let second = tile_streamout_offsets(&codec, &tiles[1], 0).unwrap();
        assert_eq!(first.streamout, 0);

        let footprint = StreamoutLayout::HEVC.unit_footprint(64);
        assert_eq!(footprint, 2 * 4 * (5 + 64 * 8));
        let expected = align_up(tiles[0].units() * footprint, CACHELINE_SIZE) + CACHELINE_SIZE;
        assert_eq!(second.streamout, expected);
        assert_eq!(second.streamout % CACHELINE_SIZE, 0);
        assert!(second.row_store_select);
        assert_eq!(second.sao_rowstore, 15 * 64 / 32 * CACHELINE_SIZE);
    }

    #[test]
    fn test_tile_offsets_in_lower_row() {
        let mut params = HevcParams::new(CodingDirection::Decode, 1024, 1024);
        params.tiles = TileLayout::uniform(2, 2, 16, 16).unwrap();
        let codec = CodecParams::Hevc(params);
        let tiles = codec.tiles().unwrap().tiles();
        let t2 = tile_streamout_offsets(&codec, &tiles[2], 4096).unwrap();
        assert_eq!(tiles[2].start_y, 8);
        // Rows above: 8 CTB rows of 16 CTBs.
        let footprint = StreamoutLayout::HEVC.unit_footprint(64);
        assert_eq!(t2.streamout, align_up(128 * footprint, 64) + 64);
        assert_eq!(t2.sao_rowstore, 0);
        assert_eq!(t2.bitstream, 2 * 4096);
        assert_eq!(t2.pak_statistics, 2 * 9 * 64);
        assert!(t2.column_store_select);
    }

    #[test]
    fn test_clamp_tuning_limits() {
        let tuning = EncodeTuning {
            frame_type: FrameType::P,
            qp: 30,
            quality_tier: 4,
            min_qp: Some(-5),
            max_qp: Some(99),
            rolling_i_qp_adjust: Some(-20),
            rd_lambda: Some(1 << 20),
            sad_lambda: Some(-3),
            poc_diffs: [[-40, 40], [3, -3], [16, -16]],
        };
        let c = clamp_tuning(&tuning);
        assert_eq!(c.min_qp, 0);
        assert_eq!(c.max_qp, 51);
        assert_eq!(c.rolling_i_qp_adjust, -8);
        assert_eq!(c.rd_lambda, 0xFFFF);
        assert_eq!(c.sad_lambda, 0);
        assert_eq!(c.poc_diffs, [[-16, 16], [3, -3], [16, -16]]);
    }

    #[test]
    fn test_clamp_tuning_defaults() {
        let c = clamp_tuning(&EncodeTuning {
            min_qp: Some(40),
            max_qp: Some(20),
            ..EncodeTuning::default()
        });
        assert_eq!((c.min_qp, c.max_qp), (40, 40));
        let (rd, sad) = default_lambdas(26, FrameType::I);
        assert_eq!(c.rd_lambda as i64, rd);
        assert_eq!(c.sad_lambda as i64, sad);
        assert_eq!(default_lambdas(12, FrameType::I), (2, 2));
    }

    #[test]
    fn test_mmio_registers() {
        let regs = MmioRegisters::for_vdbox(0).unwrap();
        assert_eq!(regs.dec_status, 0x1C2800);
        assert_eq!(regs.cabac_status, 0x1C2804);
        assert_eq!(regs.frame_crc, 0x1C2920);
        assert_eq!(MmioRegisters::for_vdbox(1).unwrap().engine_id, 0x1C408C);
        assert!(MmioRegisters::for_vdbox(4).is_err());
    }

    proptest! {
        #[test]
        fn test_tile_streamout_offsets_ascend_per_pipe(
            columns in 1u32..=8,
            rows in 1u32..=4,
            spare_width in 0u32..24,
            spare_height in 0u32..12,
            pipes in 1usize..=4,
            log2_ctb in 4u8..=6,
            vp9 in any::<bool>(),
        ) {
            let pipes = pipes.min(columns as usize);
            let codec = if vp9 {
                let sb = Vp9Params::SUPERBLOCK_SIZE;
                let mut p = Vp9Params::new(
                    CodingDirection::Decode,
                    (columns + spare_width) * sb,
                    (rows + spare_height) * sb,
                );
                p.tiles = TileLayout::uniform(columns, rows, p.width_in_sb(), p.height_in_sb()).unwrap();
                CodecParams::Vp9(p)
            } else {
                let ctb = 1u32 << log2_ctb;
                let mut p = HevcParams::new(
                    CodingDirection::Decode,
                    (columns + spare_width) * ctb,
                    (rows + spare_height) * ctb,
                );
                p.log2_ctb = log2_ctb;
                p.tiles = TileLayout::uniform(columns, rows, p.width_in_ctb(), p.height_in_ctb()).unwrap();
                CodecParams::Hevc(p)
            };

            let all: Vec<u32> = codec
                .tiles()
                .unwrap()
                .tiles()
                .iter()
                .map(|t| tile_streamout_offsets(&codec, t, 0x1000).unwrap().streamout)
                .collect();
            prop_assert_eq!(all[0], 0);
            for pair in all.windows(2) {
                prop_assert!(pair[1] > pair[0], "offsets {:?}", all);
            }

            for tiles in assign_tiles(&codec, pipes).unwrap() {
                let offsets: Vec<u32> = tiles
                    .iter()
                    .map(|t| tile_streamout_offsets(&codec, t, 0x1000).unwrap().streamout)
                    .collect();
                for (i, &offset) in offsets.iter().enumerate() {
                    prop_assert_eq!(offset % CACHELINE_SIZE, 0);
                    if i + 1 < offsets.len() {
                        prop_assert!(offsets[i + 1] > offset);
                    }
                }
            }
        }
    }
}
