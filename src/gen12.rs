//! Gen12 Command Encoder
//!
//! Gen12 command sizes, row-store cache tables and VDENC quality-tier
//! defaults. Semaphore waits carry the trailing wait-token dword.

use crate::cmdbuf::{CommandDescriptor, CommandKind};
use crate::encoder::{
    ChromaFormat, CodecKind, CommandEncoder, Generation, QualityDefaults, RowStoreCache, RowStorePlan, RowStoreQuery,
    RowStoreSupport,
};
use crate::error::{MediaError, Result};
use crate::hcp::{self, VdencCmd2Params};
use crate::mi;
use crate::protocol::CompareOp;
use crate::resource::{GpuRef, ResourceTracker};

/// Column order of the HEVC row-store tables.
const HEVC_DAT: usize = 0;
const HEVC_DF: usize = 1;
const HEVC_SAO: usize = 2;
const HEVC_VDENC: usize = 3;
const HEVC_HSAO: usize = 4;

/// Column order of the VP9 row-store tables.
const VP9_HVD: usize = 0;
const VP9_DAT: usize = 1;
const VP9_DF: usize = 2;
const VP9_VDENC: usize = 3;

/// Widest picture any row-store cache can serve.
const ROW_STORE_MAX_WIDTH: u32 = 8192;

#[derive(Debug, Default, Clone, Copy)]
pub struct Gen12Encoder;

impl Gen12Encoder {
    pub const HEVC_ROW_STORE_ENABLE: [[bool; 5]; 16] = {
        const T: bool = true;
        const F: bool = false;
        [
            [T, T, T, F, T],
            [T, T, T, T, T],
            [T, T, F, F, F],
            [T, T, F, T, F],
            [T, T, T, T, T],
            [T, T, F, F, T],
            [T, T, T, F, F],
            [T, F, T, F, T],
            [T, T, T, F, F],
            [T, F, T, F, T],
            [T, T, T, T, T],
            [T, T, F, T, T],
            [T, T, T, T, T],
            [T, F, T, T, T],
            [T, T, T, T, T],
            [T, F, T, T, T],
        ]
    };

    /// Cache base per HEVC table row, in cachelines.
    pub const HEVC_ROW_STORE_ADDRESS: [[u32; 5]; 16] = [
        [0, 256, 1280, 0, 2048],
        [0, 256, 1280, 1824, 1792],
        [0, 512, 0, 0, 0],
        [0, 256, 0, 2304, 0],
        [0, 256, 1024, 0, 1792],
        [0, 512, 0, 0, 2048],
        [0, 256, 1792, 0, 0],
        [0, 0, 512, 0, 2048],
        [0, 256, 1792, 0, 0],
        [0, 0, 256, 0, 1792],
        [0, 256, 1024, 1568, 1536],
        [0, 512, 0, 2112, 2048],
        [0, 256, 1792, 2336, 2304],
        [0, 0, 512, 1600, 1536],
        [0, 128, 1664, 2336, 2304],
        [0, 0, 256, 1600, 1536],
    ];

    pub const VP9_ROW_STORE_ENABLE: [[bool; 4]; 13] = {
        const T: bool = true;
        const F: bool = false;
        [
            [T, T, T, T],
            [F, F, T, T],
            [T, F, T, T],
            [T, T, F, T],
            [T, T, T, T],
            [F, F, T, T],
            [F, F, T, F],
            [T, T, F, T],
            [T, T, T, T],
            [T, T, F, T],
            [T, T, T, T],
            [T, T, F, T],
            [T, T, F, T],
        ]
    };

    pub const VP9_ROW_STORE_ADDRESS: [[u32; 4]; 13] = [
        [0, 64, 384, 1536],
        [0, 0, 0, 2304],
        [0, 0, 64, 2368],
        [0, 128, 0, 768],
        [0, 64, 384, 1536],
        [0, 0, 0, 2304],
        [0, 0, 0, 0],
        [0, 128, 0, 768],
        [0, 64, 384, 2112],
        [0, 128, 0, 768],
        [0, 32, 192, 1920],
        [0, 128, 0, 768],
        [0, 128, 0, 768],
    ];

    /// Merge candidates per quality tier, rows CU8/16/32/64.
    pub const MERGE_CANDIDATES: [[u8; 8]; 4] = [
        [0, 1, 1, 1, 1, 1, 2, 2],
        [0, 2, 2, 2, 2, 2, 2, 2],
        [0, 3, 3, 3, 3, 3, 2, 2],
        [0, 4, 4, 4, 4, 4, 2, 2],
    ];

    pub const IME_PREDICTORS: [u8; 8] = [0, 8, 8, 8, 8, 8, 4, 4];

    const MAX_TU_SIZE: u8 = 3;
    const MAX_CU_SIZE: u8 = 3;

    pub fn new() -> Self {
        Self
    }

    fn hevc_row_store(query: &RowStoreQuery, support: &RowStoreSupport) -> RowStorePlan {
        if query.chroma == ChromaFormat::Monochrome || query.width > ROW_STORE_MAX_WIDTH {
            return RowStorePlan::default();
        }
        let gt4k = (query.width > 4096) as usize;
        let lcu32or64 = (query.lcu_size >= 32) as usize;
        let depth = match query.bit_depth_minus8 {
            0 => 0,
            1 | 2 => 1,
            _ => 2,
        };
        let index = if query.chroma == ChromaFormat::Yuv444 {
            4 + 6 * lcu32or64 + 2 * depth + gt4k
        } else {
            2 * gt4k + lcu32or64
        };
        let enable = &Self::HEVC_ROW_STORE_ENABLE[index];
        let address = &Self::HEVC_ROW_STORE_ADDRESS[index];
        let entry = |column: usize, supported: bool| RowStoreCache::gated(enable[column], address[column], supported);
        RowStorePlan {
            dat: entry(HEVC_DAT, support.hevc_dat),
            df: entry(HEVC_DF, support.hevc_df),
            sao: entry(HEVC_SAO, support.hevc_sao),
            hsao: entry(HEVC_HSAO, support.hevc_sao),
            vdenc: entry(HEVC_VDENC, true),
            hvd: RowStoreCache::DISABLED,
        }
    }

    fn vp9_row_store(query: &RowStoreQuery, support: &RowStoreSupport) -> RowStorePlan {
        if query.chroma == ChromaFormat::Monochrome || query.width > ROW_STORE_MAX_WIDTH {
            return RowStorePlan::default();
        }
        let gt4k = (query.width > 4096) as usize;
        let gt2k = (query.width > 2048) as usize;
        let high_depth = (query.bit_depth_minus8 > 0) as usize;
        let mut index = 4 * (query.chroma as usize - 1) + 2 * high_depth + gt4k;
        if query.chroma == ChromaFormat::Yuv444 && high_depth == 1 {
            index += gt2k;
        }
        let enable = &Self::VP9_ROW_STORE_ENABLE[index];
        let address = &Self::VP9_ROW_STORE_ADDRESS[index];
        let entry = |column: usize, supported: bool| RowStoreCache::gated(enable[column], address[column], supported);
        RowStorePlan {
            hvd: entry(VP9_HVD, support.vp9_hvd),
            dat: entry(VP9_DAT, support.vp9_dat),
            df: entry(VP9_DF, support.vp9_df),
            vdenc: entry(VP9_VDENC, true),
            ..RowStorePlan::default()
        }
    }
}

impl CommandEncoder for Gen12Encoder {
    fn generation(&self) -> Generation {
        Generation::Gen12
    }

    fn command_dwords(&self, kind: CommandKind) -> Option<u32> {
        use CommandKind::*;
        Some(match kind {
            MiNoop | MiBatchBufferEnd | MfxWait => 1,
            MiBatchBufferStart | MiLoadRegisterImm | MiLoadRegisterReg => 3,
            MiLoadRegisterMem | MiStoreRegisterMem | MiConditionalBatchBufferEnd => 4,
            MiStoreDataImm | MiCopyMemMem | MiSemaphoreWait | MiFlushDw => 5,
            MiAtomic => 11,
            VdPipelineFlush => 2,
            HcpPipeModeSelect => 7,
            HcpSurfaceState => 5,
            HcpPipeBufAddrState => 121,
            HcpIndObjBaseAddrState => 29,
            HcpQmState => 18,
            HcpFqmState => 34,
            HcpPicState => 41,
            HcpTileState => 17,
            HcpRefIdxState => 18,
            HcpWeightOffsetState => 42,
            HcpSliceState => 13,
            HcpTileCoding => 20,
            HcpBsdObject => 3,
            HcpPakInsertObject => 2,
            HcpRdoqState => 154,
            HcpVp9PicState => 42,
            HcpVp9SegmentState => 8,
            VdencCmd2 => 51,
        })
    }

    fn plan_row_store(&self, query: &RowStoreQuery, support: &RowStoreSupport) -> RowStorePlan {
        if !support.enabled {
            return RowStorePlan::default();
        }
        match query.codec {
            CodecKind::Hevc => Self::hevc_row_store(query, support),
            CodecKind::Vp9 => Self::vp9_row_store(query, support),
            CodecKind::Avc | CodecKind::Av1 => RowStorePlan::default(),
        }
    }

    fn quality_defaults(&self, tier: u8) -> Result<QualityDefaults> {
        let t = tier as usize;
        if t == 0 || t >= Self::IME_PREDICTORS.len() {
            return Err(MediaError::invalid(format!("quality tier {tier} outside 1..=7")));
        }
        Ok(QualityDefaults {
            merge_candidates: [
                Self::MERGE_CANDIDATES[0][t],
                Self::MERGE_CANDIDATES[1][t],
                Self::MERGE_CANDIDATES[2][t],
                Self::MERGE_CANDIDATES[3][t],
            ],
            ime_predictors: Self::IME_PREDICTORS[t],
            max_tu_size: Self::MAX_TU_SIZE,
            max_cu_size: Self::MAX_CU_SIZE,
        })
    }

    fn semaphore_wait(&self, tracker: &ResourceTracker, target: GpuRef, value: u32, op: CompareOp) -> Result<CommandDescriptor> {
        mi::semaphore_wait(self.dwords(CommandKind::MiSemaphoreWait)?, tracker, target, value, op, true)
    }

    fn vdenc_cmd2(&self, params: &VdencCmd2Params) -> Result<CommandDescriptor> {
        hcp::vdenc_cmd2(self.dwords(CommandKind::VdencCmd2)?, params)
    }
}
