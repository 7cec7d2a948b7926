//! MI Command Encoders
//!
//! Memory-interface commands shared by every engine: register and memory
//! stores, semaphores, atomics, flushes and batch control. The dword count
//! comes from the caller's generation table.

use crate::cmdbuf::{CommandDescriptor, CommandKind};
use crate::error::{MediaError, Result};
use crate::protocol::*;
use crate::resource::{GpuRef, ResourceTracker};

/// MI_FLUSH_DW options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushDwParams {
    pub video_pipeline_cache_invalidate: bool,
    pub tlb_invalidate: bool,
    /// Write an immediate dword to memory once the flush completes.
    pub post_sync_write: Option<(GpuRef, u32)>,
}

const POST_SYNC_WRITE_IMMEDIATE: u32 = 1;

fn check_register(register: u32) -> Result<()> {
    if register & 0x3 != 0 || register > 0x7F_FFFC {
        return Err(MediaError::invalid(format!(
            "register offset 0x{register:X} is not a dword-aligned MMIO offset"
        )));
    }
    Ok(())
}

pub fn noop() -> CommandDescriptor {
    CommandDescriptor::new(CommandKind::MiNoop, 1, mi_header(MI_NOOP, 1))
}

pub fn batch_buffer_end() -> CommandDescriptor {
    CommandDescriptor::new(CommandKind::MiBatchBufferEnd, 1, mi_header(MI_BATCH_BUFFER_END, 1))
}

pub fn mfx_wait() -> CommandDescriptor {
    CommandDescriptor::new(CommandKind::MfxWait, 1, MFX_WAIT_DW0)
}

pub fn batch_buffer_start(len: u32, tracker: &ResourceTracker, target: GpuRef) -> Result<CommandDescriptor> {
    let mut cmd = CommandDescriptor::new(
        CommandKind::MiBatchBufferStart,
        len,
        mi_header(MI_BATCH_BUFFER_START, len),
    );
    // Address space indicator: per-process GTT
    cmd.set_flag(0, 8, true);
    cmd.write_address(tracker, 1, target, false, 4)?;
    Ok(cmd)
}

pub fn load_register_imm(len: u32, register: u32, value: u32) -> Result<CommandDescriptor> {
    check_register(register)?;
    let mut cmd = CommandDescriptor::new(
        CommandKind::MiLoadRegisterImm,
        len,
        mi_header(MI_LOAD_REGISTER_IMM, len),
    );
    cmd.set(1, 0, 22, register);
    cmd.set(2, 0, 31, value);
    Ok(cmd)
}

pub fn load_register_mem(len: u32, tracker: &ResourceTracker, register: u32, source: GpuRef) -> Result<CommandDescriptor> {
    check_register(register)?;
    let mut cmd = CommandDescriptor::new(
        CommandKind::MiLoadRegisterMem,
        len,
        mi_header(MI_LOAD_REGISTER_MEM, len),
    );
    cmd.set(1, 0, 22, register);
    cmd.write_address(tracker, 2, source, false, 4)?;
    Ok(cmd)
}

pub fn load_register_reg(len: u32, source: u32, destination: u32) -> Result<CommandDescriptor> {
    check_register(source)?;
    check_register(destination)?;
    let mut cmd = CommandDescriptor::new(
        CommandKind::MiLoadRegisterReg,
        len,
        mi_header(MI_LOAD_REGISTER_REG, len),
    );
    cmd.set(1, 0, 22, source);
    cmd.set(2, 0, 22, destination);
    Ok(cmd)
}

pub fn store_register_mem(len: u32, tracker: &ResourceTracker, register: u32, target: GpuRef) -> Result<CommandDescriptor> {
    check_register(register)?;
    let mut cmd = CommandDescriptor::new(
        CommandKind::MiStoreRegisterMem,
        len,
        mi_header(MI_STORE_REGISTER_MEM, len),
    );
    cmd.set(1, 0, 22, register);
    cmd.write_address(tracker, 2, target, true, 4)?;
    Ok(cmd)
}

pub fn store_data_imm(len: u32, tracker: &ResourceTracker, target: GpuRef, value: u32) -> Result<CommandDescriptor> {
    let mut cmd = CommandDescriptor::new(CommandKind::MiStoreDataImm, len, mi_header(MI_STORE_DATA_IMM, len));
    cmd.write_address(tracker, 1, target, true, 4)?;
    cmd.set(3, 0, 31, value);
    Ok(cmd)
}

pub fn copy_mem_mem(len: u32, tracker: &ResourceTracker, source: GpuRef, target: GpuRef) -> Result<CommandDescriptor> {
    let mut cmd = CommandDescriptor::new(CommandKind::MiCopyMemMem, len, mi_header(MI_COPY_MEM_MEM, len));
    cmd.write_address(tracker, 1, target, true, 4)?;
    cmd.write_address(tracker, 3, source, false, 4)?;
    Ok(cmd)
}

/// MI_SEMAPHORE_WAIT in polling mode. `with_token` adds the trailing wait
/// token dword used from Gen12 on.
pub fn semaphore_wait(
    len: u32,
    tracker: &ResourceTracker,
    target: GpuRef,
    value: u32,
    op: CompareOp,
    with_token: bool,
) -> Result<CommandDescriptor> {
    let expected = if with_token { 5 } else { 4 };
    if len != expected {
        return Err(MediaError::invalid(format!(
            "semaphore wait of {len} dwords, layout needs {expected}"
        )));
    }
    let mut cmd = CommandDescriptor::new(CommandKind::MiSemaphoreWait, len, mi_header(MI_SEMAPHORE_WAIT, len));
    cmd.set(0, 12, 14, op as u32);
    cmd.set_flag(0, 15, true);
    cmd.set(1, 0, 31, value);
    cmd.write_address(tracker, 2, target, false, 4)?;
    Ok(cmd)
}

pub fn atomic(len: u32, tracker: &ResourceTracker, target: GpuRef, op: AtomicOp, operand: u32) -> Result<CommandDescriptor> {
    let mut cmd = CommandDescriptor::new(CommandKind::MiAtomic, len, mi_header(MI_ATOMIC, len));
    cmd.set(0, 8, 15, op as u32);
    cmd.set_flag(0, 17, true);
    cmd.set_flag(0, 18, op.has_operand());
    cmd.write_address(tracker, 1, target, true, 4)?;
    if op.has_operand() {
        cmd.set(3, 0, 31, operand);
    }
    Ok(cmd)
}

pub fn conditional_batch_buffer_end(
    len: u32,
    tracker: &ResourceTracker,
    target: GpuRef,
    compare: u32,
) -> Result<CommandDescriptor> {
    let mut cmd = CommandDescriptor::new(
        CommandKind::MiConditionalBatchBufferEnd,
        len,
        mi_header(MI_CONDITIONAL_BATCH_BUFFER_END, len),
    );
    cmd.set(1, 0, 31, compare);
    cmd.write_address(tracker, 2, target, false, 8)?;
    Ok(cmd)
}

pub fn flush_dw(len: u32, tracker: &ResourceTracker, params: &FlushDwParams) -> Result<CommandDescriptor> {
    let mut cmd = CommandDescriptor::new(CommandKind::MiFlushDw, len, mi_header(MI_FLUSH_DW, len));
    cmd.set_flag(0, 7, params.video_pipeline_cache_invalidate);
    cmd.set_flag(0, 18, params.tlb_invalidate);
    if let Some((target, value)) = params.post_sync_write {
        cmd.set(0, 14, 15, POST_SYNC_WRITE_IMMEDIATE);
        cmd.write_address(tracker, 1, target, true, 8)?;
        cmd.set(3, 0, 31, value);
    }
    Ok(cmd)
}
