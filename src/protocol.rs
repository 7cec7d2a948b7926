//! VDBOX Protocol
//!
//! Opcodes, register offsets, status flags and bit-field helpers for the
//! command streams consumed by the video box engines. Every value here is
//! part of the hardware wire format and must stay bit exact.

/// Size of one command dword in bytes.
pub const DWORD_SIZE: usize = 4;
/// Hardware addressing granularity for streamout and cache placement.
pub const CACHELINE_SIZE: u32 = 64;
pub const PAGE_SIZE: u64 = 0x1000;

/// Absolute ceiling for a single command buffer (8MB).
pub const MAX_COMMAND_BUFFER_SIZE: usize = 0x80_0000;
/// Upper bound on dynamic slice workaround flushes per picture.
pub const MAX_DYNAMIC_SLICE_WA: u32 = 16;
pub const MAX_PIPES: usize = 4;
pub const MAX_REFERENCE_FRAMES: usize = 8;

// =============================================================================
// Command Types
// =============================================================================

pub const COMMAND_TYPE_MI: u32 = 0;
pub const COMMAND_TYPE_PARALLEL_VIDEO_PIPE: u32 = 3;

/// Pipeline field of video commands (bits 27..28).
pub const PIPELINE_VIDEO_CODEC: u32 = 2;
pub const PIPELINE_VD: u32 = 2;

// MI opcodes (DW0 bits 23..28)
pub const MI_NOOP: u32 = 0x00;
pub const MI_BATCH_BUFFER_END: u32 = 0x0A;
pub const MI_SEMAPHORE_WAIT: u32 = 0x1C;
pub const MI_STORE_DATA_IMM: u32 = 0x20;
pub const MI_LOAD_REGISTER_IMM: u32 = 0x22;
pub const MI_STORE_REGISTER_MEM: u32 = 0x24;
pub const MI_FLUSH_DW: u32 = 0x26;
pub const MI_LOAD_REGISTER_MEM: u32 = 0x29;
pub const MI_LOAD_REGISTER_REG: u32 = 0x2A;
pub const MI_COPY_MEM_MEM: u32 = 0x2E;
pub const MI_ATOMIC: u32 = 0x2F;
pub const MI_BATCH_BUFFER_START: u32 = 0x31;
pub const MI_CONDITIONAL_BATCH_BUFFER_END: u32 = 0x36;

/// MFX_WAIT with the MFX sync control flag set.
pub const MFX_WAIT_DW0: u32 = 0x6800_0100;

// Media opcodes (DW0 bits 23..26)
pub const MEDIA_OPCODE_VDENC: u32 = 1;
pub const MEDIA_OPCODE_HCP: u32 = 7;
pub const MEDIA_OPCODE_VD_CONTROL: u32 = 15;

// HCP sub-opcodes (DW0 bits 16..22)
pub const HCP_PIPE_MODE_SELECT: u32 = 0;
pub const HCP_SURFACE_STATE: u32 = 1;
pub const HCP_PIPE_BUF_ADDR_STATE: u32 = 2;
pub const HCP_IND_OBJ_BASE_ADDR_STATE: u32 = 3;
pub const HCP_QM_STATE: u32 = 4;
pub const HCP_FQM_STATE: u32 = 5;
pub const HCP_PIC_STATE: u32 = 16;
pub const HCP_TILE_STATE: u32 = 17;
pub const HCP_REF_IDX_STATE: u32 = 18;
pub const HCP_WEIGHTOFFSET_STATE: u32 = 19;
pub const HCP_SLICE_STATE: u32 = 20;
pub const HCP_TILE_CODING: u32 = 21;
pub const HCP_BSD_OBJECT: u32 = 32;
pub const HCP_PAK_INSERT_OBJECT: u32 = 34;
pub const HCP_VP9_PIC_STATE: u32 = 48;
pub const HCP_VP9_SEGMENT_STATE: u32 = 50;

// VDENC sub-opcode B (DW0 bits 16..20)
pub const VDENC_CMD2: u32 = 9;

// =============================================================================
// MMIO Registers
// =============================================================================

/// Per-VDBOX MMIO base addresses.
pub const VDBOX_MMIO_BASE: [u32; MAX_PIPES] = [0x1C_0000, 0x1C_4000, 0x1D_0000, 0x1D_4000];

// Offsets relative to a VDBOX MMIO base
pub const CS_ENGINE_ID_OFFSET: u32 = 0x008C;
pub const CS_GPR0_OFFSET: u32 = 0x0600;
pub const HCP_DEC_STATUS_OFFSET: u32 = 0x2800;
pub const HCP_CABAC_STATUS_OFFSET: u32 = 0x2804;
pub const HCP_BITSTREAM_BYTECOUNT_FRAME_OFFSET: u32 = 0x28A0;
pub const HCP_FRAME_CRC_OFFSET: u32 = 0x2920;

// =============================================================================
// Status Report
// =============================================================================

pub const STATUS_QUERY_SKIPPED: u32 = 0x00;
pub const STATUS_QUERY_START_FLAG: u32 = 0x01;
pub const STATUS_QUERY_END_FLAG: u32 = 0xFF;

/// CABAC status bits that indicate a corrupted HEVC picture.
pub const HCP_CABAC_ERROR_MASK: u32 = 0x0879;
pub const HEVC_AFFECTED_CTB_MASK: u32 = 0xFFFC_0000;
pub const HEVC_AFFECTED_CTB_SHIFT: u32 = 18;
pub const VP9_AFFECTED_UNIT_MASK: u32 = 0xFFFF;

/// Value written into the delay buffer after a pipe rendezvous.
pub const SEMAPHORE_DELAY_TOKEN: u32 = 0xDE1A;

// =============================================================================
// Error Codes
// =============================================================================

pub const MEDIA_ERROR_SUCCESS: u32 = 0x0000;
pub const MEDIA_ERROR_INVALID_PARAMETER: u32 = 0x0001;
pub const MEDIA_ERROR_MISSING_RESOURCE: u32 = 0x0002;
pub const MEDIA_ERROR_UNSUPPORTED_MODE: u32 = 0x0003;
pub const MEDIA_ERROR_EXCEEDS_MAXIMUM_SIZE: u32 = 0x0004;
pub const MEDIA_ERROR_SYNC_CONTRACT: u32 = 0x0005;
pub const MEDIA_ERROR_HARDWARE_REPORTED: u32 = 0x0006;
pub const MEDIA_ERROR_CONFIG: u32 = 0x0007;

// =============================================================================
// Command Field Enums
// =============================================================================

/// MI_SEMAPHORE_WAIT compare operation (semaphore address data vs. inline data).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    GreaterThan = 0,
    GreaterOrEqual = 1,
    LessThan = 2,
    LessOrEqual = 3,
    Equal = 4,
    NotEqual = 5,
}

impl CompareOp {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => CompareOp::GreaterThan,
            1 => CompareOp::GreaterOrEqual,
            2 => CompareOp::LessThan,
            3 => CompareOp::LessOrEqual,
            4 => CompareOp::Equal,
            5 => CompareOp::NotEqual,
            _ => return None,
        })
    }

    /// Evaluate `memory <op> operand`.
    pub fn holds(self, memory: u32, operand: u32) -> bool {
        match self {
            CompareOp::GreaterThan => memory > operand,
            CompareOp::GreaterOrEqual => memory >= operand,
            CompareOp::LessThan => memory < operand,
            CompareOp::LessOrEqual => memory <= operand,
            CompareOp::Equal => memory == operand,
            CompareOp::NotEqual => memory != operand,
        }
    }
}

/// MI_ATOMIC opcode for dword-sized operands.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    And = 1,
    Or = 2,
    Xor = 3,
    Move = 4,
    Increment = 5,
    Decrement = 6,
    Add = 7,
    Subtract = 8,
}

impl AtomicOp {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => AtomicOp::And,
            2 => AtomicOp::Or,
            3 => AtomicOp::Xor,
            4 => AtomicOp::Move,
            5 => AtomicOp::Increment,
            6 => AtomicOp::Decrement,
            7 => AtomicOp::Add,
            8 => AtomicOp::Subtract,
            _ => return None,
        })
    }

    pub fn apply(self, current: u32, operand: u32) -> u32 {
        match self {
            AtomicOp::And => current & operand,
            AtomicOp::Or => current | operand,
            AtomicOp::Xor => current ^ operand,
            AtomicOp::Move => operand,
            AtomicOp::Increment => current.wrapping_add(1),
            AtomicOp::Decrement => current.wrapping_sub(1),
            AtomicOp::Add => current.wrapping_add(operand),
            AtomicOp::Subtract => current.wrapping_sub(operand),
        }
    }

    /// Inc/dec carry no inline operand.
    pub fn has_operand(self) -> bool {
        !matches!(self, AtomicOp::Increment | AtomicOp::Decrement)
    }
}

/// HCP_SURFACE_STATE surface format codes.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceFormat {
    Yuy2 = 0,
    Planar420_8 = 4,
    Y410 = 10,
    P010 = 13,
    Y216 = 15,
    Y416 = 16,
}

// =============================================================================
// Bit-field helpers
// =============================================================================

/// Mask covering bits `lo..=hi`.
#[inline]
pub const fn field_mask(lo: u32, hi: u32) -> u32 {
    let width = hi - lo + 1;
    if width >= 32 {
        u32::MAX
    } else {
        ((1u32 << width) - 1) << lo
    }
}

/// Pack `value` into bits `lo..=hi` of `dw`. Bits of `value` beyond the field
/// width are dropped; range clamping is the caller's job.
#[inline]
pub fn set_field(dw: &mut u32, lo: u32, hi: u32, value: u32) {
    let mask = field_mask(lo, hi);
    *dw = (*dw & !mask) | ((value << lo) & mask);
}

#[inline]
pub const fn get_field(dw: u32, lo: u32, hi: u32) -> u32 {
    (dw & field_mask(lo, hi)) >> lo
}

#[inline]
pub fn set_bit(dw: &mut u32, bit: u32, on: bool) {
    set_field(dw, bit, bit, on as u32);
}

#[inline]
pub const fn align_up(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

#[inline]
pub const fn align_up_usize(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// DW0 of an MI command. DwordLength excludes the first two dwords.
#[inline]
pub fn mi_header(opcode: u32, total_dwords: u32) -> u32 {
    let mut dw = 0;
    set_field(&mut dw, 0, 7, total_dwords.saturating_sub(2));
    set_field(&mut dw, 23, 28, opcode);
    set_field(&mut dw, 29, 31, COMMAND_TYPE_MI);
    dw
}

/// DW0 of a video pipe command (HCP, VDENC, VD control).
#[inline]
pub fn media_header(opcode: u32, subop: u32, total_dwords: u32) -> u32 {
    let mut dw = 0;
    set_field(&mut dw, 0, 11, total_dwords.saturating_sub(2));
    set_field(&mut dw, 16, 22, subop);
    set_field(&mut dw, 23, 26, opcode);
    set_field(&mut dw, 27, 28, PIPELINE_VIDEO_CODEC);
    set_field(&mut dw, 29, 31, COMMAND_TYPE_PARALLEL_VIDEO_PIPE);
    dw
}

/// Total dwords of a command from its header, if the header is decodable.
pub fn command_length(dw0: u32) -> Option<usize> {
    match get_field(dw0, 29, 31) {
        COMMAND_TYPE_MI => match get_field(dw0, 23, 28) {
            MI_NOOP | MI_BATCH_BUFFER_END => Some(1),
            // FLUSH_DW keeps flag bits directly above a 6-bit length
            MI_FLUSH_DW => Some(get_field(dw0, 0, 5) as usize + 2),
            _ => Some(get_field(dw0, 0, 7) as usize + 2),
        },
        COMMAND_TYPE_PARALLEL_VIDEO_PIPE => {
            if dw0 == MFX_WAIT_DW0 {
                Some(1)
            } else {
                Some(get_field(dw0, 0, 11) as usize + 2)
            }
        }
        _ => None,
    }
}
