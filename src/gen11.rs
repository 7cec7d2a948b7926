//! Gen11 Command Encoder
//!
//! Gen11 predates the VDENC HEVC path handled here and the semaphore wait
//! token. Row-store caching is decided by two width buckets.

use crate::cmdbuf::{CommandDescriptor, CommandKind};
use crate::encoder::{
    ChromaFormat, CodecKind, CommandEncoder, Generation, QualityDefaults, RowStoreCache, RowStorePlan, RowStoreQuery,
    RowStoreSupport,
};
use crate::error::{MediaError, Result};
use crate::hcp::VdencCmd2Params;
use crate::mi;
use crate::protocol::CompareOp;
use crate::resource::{GpuRef, ResourceTracker};

#[derive(Debug, Default, Clone, Copy)]
pub struct Gen11Encoder;

impl Gen11Encoder {
    /// Row-store width buckets, narrowest first.
    pub const ROW_STORE_WIDTH_BUCKETS: [u32; 2] = [1920, 3840];

    // Cache bases in cachelines for the narrow bucket.
    const HEVC_DF_NARROW: u32 = 64;
    const HEVC_SAO_NARROW: u32 = 320;
    const HEVC_SAO_NARROW_444_10BIT: u32 = 384;
    const VP9_DF_NARROW_420_8BIT: u32 = 384;
    const VP9_DAT_NARROW: u32 = 32;
    const VP9_DAT_WIDE: u32 = 128;

    pub fn new() -> Self {
        Self
    }

    /// Index of the narrowest bucket that holds `width`.
    fn bucket(width: u32) -> Option<usize> {
        Self::ROW_STORE_WIDTH_BUCKETS.iter().position(|&limit| width <= limit)
    }

    fn hevc_row_store(query: &RowStoreQuery, support: &RowStoreSupport) -> RowStorePlan {
        let is_444 = query.chroma == ChromaFormat::Yuv444;
        let high_depth = query.bit_depth_minus8 > 0;
        let mut plan = RowStorePlan::default();
        match Self::bucket(query.width) {
            Some(0) => {
                let (dat, df, sao) = match (high_depth, is_444) {
                    (true, true) => (Some(0), None, Some(Self::HEVC_SAO_NARROW_444_10BIT)),
                    (true, false) => (Some(0), Some(Self::HEVC_DF_NARROW), None),
                    (false, true) => (None, Some(0), Some(Self::HEVC_SAO_NARROW)),
                    (false, false) => (Some(0), Some(Self::HEVC_DF_NARROW), Some(Self::HEVC_SAO_NARROW)),
                };
                let gate = |entry: Option<u32>, supported: bool| match entry {
                    Some(address) => RowStoreCache::gated(true, address, supported),
                    None => RowStoreCache::DISABLED,
                };
                plan.dat = gate(dat, support.hevc_dat);
                plan.df = gate(df, support.hevc_df);
                plan.sao = gate(sao, support.hevc_sao);
            }
            Some(_) => plan.sao = RowStoreCache::gated(true, 0, support.hevc_sao),
            None => {}
        }
        plan
    }

    fn vp9_row_store(query: &RowStoreQuery, support: &RowStoreSupport) -> RowStorePlan {
        let Some(bucket) = Self::bucket(query.width) else {
            return RowStorePlan::default();
        };
        let mut plan = RowStorePlan {
            hvd: RowStoreCache::gated(true, 0, support.vp9_hvd),
            ..RowStorePlan::default()
        };
        let narrow_420_8bit = bucket == 0 && query.chroma == ChromaFormat::Yuv420 && query.bit_depth_minus8 == 0;
        if narrow_420_8bit {
            plan.df = RowStoreCache::gated(true, Self::VP9_DF_NARROW_420_8BIT, support.vp9_df);
        } else {
            let address = if bucket == 0 {
                Self::VP9_DAT_NARROW
            } else {
                Self::VP9_DAT_WIDE
            };
            plan.dat = RowStoreCache::gated(true, address, support.vp9_dat);
        }
        plan
    }
}

impl CommandEncoder for Gen11Encoder {
    fn generation(&self) -> Generation {
        Generation::Gen11
    }

    fn command_dwords(&self, kind: CommandKind) -> Option<u32> {
        use CommandKind::*;
        Some(match kind {
            MiNoop | MiBatchBufferEnd | MfxWait => 1,
            MiBatchBufferStart | MiLoadRegisterImm | MiLoadRegisterReg => 3,
            MiLoadRegisterMem | MiStoreRegisterMem | MiConditionalBatchBufferEnd | MiSemaphoreWait => 4,
            MiStoreDataImm | MiCopyMemMem | MiFlushDw => 5,
            MiAtomic => 11,
            VdPipelineFlush => 2,
            HcpPipeModeSelect => 6,
            HcpSurfaceState => 5,
            HcpPipeBufAddrState => 104,
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
            VdencCmd2 => return None,
        })
    }

    fn plan_row_store(&self, query: &RowStoreQuery, support: &RowStoreSupport) -> RowStorePlan {
        if !support.enabled || query.chroma == ChromaFormat::Monochrome {
            return RowStorePlan::default();
        }
        match query.codec {
            CodecKind::Hevc => Self::hevc_row_store(query, support),
            CodecKind::Vp9 => Self::vp9_row_store(query, support),
            CodecKind::Avc | CodecKind::Av1 => RowStorePlan::default(),
        }
    }

    fn quality_defaults(&self, tier: u8) -> Result<QualityDefaults> {
        Err(MediaError::unsupported(format!("VDENC quality tier {tier} on Gen11")))
    }

    fn semaphore_wait(&self, tracker: &ResourceTracker, target: GpuRef, value: u32, op: CompareOp) -> Result<CommandDescriptor> {
        mi::semaphore_wait(self.dwords(CommandKind::MiSemaphoreWait)?, tracker, target, value, op, false)
    }

    fn vdenc_cmd2(&self, _params: &VdencCmd2Params) -> Result<CommandDescriptor> {
        Err(MediaError::unsupported("VDENC_CMD2 on Gen11"))
    }
}
