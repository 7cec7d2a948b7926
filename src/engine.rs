//! Simulated Engine Module
//!
//! Executes recorded command buffers against host-visible resource memory.
//! Only the MI commands with memory or register side effects are acted on;
//! HCP and VDENC state is decoded for its length and skipped. Several pipe
//! buffers run round-robin so semaphore waits between pipes resolve the way
//! they would on parallel engines.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, trace, warn};

use crate::cmdbuf::CommandKind;
use crate::protocol::*;
use crate::resource::{HostMemory, ResourceTracker};

/// Result of executing one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Advance by this many dwords.
    Advance(usize),
    /// Semaphore not satisfied; retry later.
    Blocked,
    End,
}

/// Per-buffer execution cursor.
#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    dword: usize,
    done: bool,
}

/// Totals from one `run`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub commands: usize,
    pub semaphore_stalls: usize,
}

/// Software stand-in for a set of VDBOX engines sharing one address space.
pub struct SimulatedEngine<'a> {
    tracker: &'a ResourceTracker,
    registers: HashMap<u32, u32>,
    stats: EngineStats,
}

impl<'a> SimulatedEngine<'a> {
    pub fn new(tracker: &'a ResourceTracker) -> Self {
        Self {
            tracker,
            registers: HashMap::new(),
            stats: EngineStats::default(),
        }
    }

    /// Preload an MMIO register, e.g. a status register the hardware would set.
    pub fn set_register(&mut self, register: u32, value: u32) {
        self.registers.insert(register, value);
    }

    pub fn register(&self, register: u32) -> u32 {
        self.registers.get(&register).copied().unwrap_or(0)
    }

    /// Identify a command from its header dword.
    pub fn decode_kind(dw0: u32) -> Option<CommandKind> {
        use CommandKind::*;
        if dw0 == MFX_WAIT_DW0 {
            return Some(MfxWait);
        }
        match get_field(dw0, 29, 31) {
            COMMAND_TYPE_MI => Some(match get_field(dw0, 23, 28) {
                MI_NOOP => MiNoop,
                MI_BATCH_BUFFER_END => MiBatchBufferEnd,
                MI_BATCH_BUFFER_START => MiBatchBufferStart,
                MI_LOAD_REGISTER_IMM => MiLoadRegisterImm,
                MI_LOAD_REGISTER_MEM => MiLoadRegisterMem,
                MI_LOAD_REGISTER_REG => MiLoadRegisterReg,
                MI_STORE_REGISTER_MEM => MiStoreRegisterMem,
                MI_STORE_DATA_IMM => MiStoreDataImm,
                MI_COPY_MEM_MEM => MiCopyMemMem,
                MI_SEMAPHORE_WAIT => MiSemaphoreWait,
                MI_ATOMIC => MiAtomic,
                MI_CONDITIONAL_BATCH_BUFFER_END => MiConditionalBatchBufferEnd,
                MI_FLUSH_DW => MiFlushDw,
                _ => return None,
            }),
            COMMAND_TYPE_PARALLEL_VIDEO_PIPE => {
                let subop = get_field(dw0, 16, 22);
                match get_field(dw0, 23, 26) {
                    MEDIA_OPCODE_VD_CONTROL => Some(VdPipelineFlush),
                    MEDIA_OPCODE_VDENC if subop == VDENC_CMD2 => Some(VdencCmd2),
                    MEDIA_OPCODE_HCP => Some(match subop {
                        HCP_PIPE_MODE_SELECT => HcpPipeModeSelect,
                        HCP_SURFACE_STATE => HcpSurfaceState,
                        HCP_PIPE_BUF_ADDR_STATE => HcpPipeBufAddrState,
                        HCP_IND_OBJ_BASE_ADDR_STATE => HcpIndObjBaseAddrState,
                        HCP_QM_STATE => HcpQmState,
                        HCP_FQM_STATE => HcpFqmState,
                        HCP_PIC_STATE => HcpPicState,
                        HCP_TILE_STATE => HcpTileState,
                        HCP_REF_IDX_STATE => HcpRefIdxState,
                        HCP_WEIGHTOFFSET_STATE => HcpWeightOffsetState,
                        HCP_SLICE_STATE => HcpSliceState,
                        HCP_TILE_CODING => HcpTileCoding,
                        HCP_BSD_OBJECT => HcpBsdObject,
                        HCP_PAK_INSERT_OBJECT => HcpPakInsertObject,
                        HCP_VP9_PIC_STATE => HcpVp9PicState,
                        HCP_VP9_SEGMENT_STATE => HcpVp9SegmentState,
                        _ => return None,
                    }),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Kinds of every command in `bytes`, in order. Stops at the first
    /// undecodable header.
    pub fn command_kinds(bytes: &[u8]) -> Vec<CommandKind> {
        let dwords = to_dwords(bytes);
        let mut kinds = Vec::new();
        let mut at = 0;
        while at < dwords.len() {
            let Some(len) = command_length(dwords[at]) else { break };
            if let Some(kind) = Self::decode_kind(dwords[at]) {
                kinds.push(kind);
            }
            at += len;
        }
        kinds
    }

    /// Run every buffer to its batch end. Pipes advance one command per
    /// round so a semaphore wait is re-polled after every memory write, the
    /// way parallel engines observe each other. A round in which no buffer
    /// advances is a deadlock.
    pub fn run(&mut self, buffers: &[&[u8]]) -> Result<EngineStats> {
        let programs: Vec<Vec<u32>> = buffers.iter().map(|b| to_dwords(b)).collect();
        let mut cursors = vec![Cursor::default(); programs.len()];

        loop {
            let mut progressed = false;
            for (pipe, program) in programs.iter().enumerate() {
                let cursor = &mut cursors[pipe];
                if cursor.done {
                    continue;
                }
                if cursor.dword >= program.len() {
                    cursor.done = true;
                    progressed = true;
                    continue;
                }
                match self
                    .step(&program[cursor.dword..])
                    .with_context(|| format!("pipe {} at dword {}", pipe, cursor.dword))?
                {
                    Step::Advance(n) => {
                        cursor.dword += n;
                        progressed = true;
                    }
                    Step::End => {
                        cursor.done = true;
                        progressed = true;
                    }
                    Step::Blocked => self.stats.semaphore_stalls += 1,
                }
            }

            if cursors.iter().all(|c| c.done) {
                debug!(
                    "Engine finished {} buffer(s): {} commands, {} stalls",
                    programs.len(),
                    self.stats.commands,
                    self.stats.semaphore_stalls
                );
                return Ok(self.stats);
            }
            if !progressed {
                let blocked: Vec<usize> = (0..cursors.len()).filter(|&i| !cursors[i].done).collect();
                warn!("Semaphore deadlock, blocked pipes {:?}", blocked);
                bail!("semaphore deadlock on pipes {:?}", blocked);
            }
        }
    }

    fn memory(&self, lo: u32, hi: u32) -> Result<(HostMemory, u32)> {
        let address = lo as u64 | ((hi & 0xFFFF) as u64) << 32;
        let target = self
            .tracker
            .find_by_address(address)
            .ok_or_else(|| anyhow!("address 0x{address:X} maps to no resource"))?;
        let memory = self.tracker.host_memory(target.handle)?;
        Ok((memory, target.offset))
    }

    fn read(&self, lo: u32, hi: u32) -> Result<u32> {
        let (memory, offset) = self.memory(lo, hi)?;
        Ok(memory.read_u32(offset)?)
    }

    fn write(&self, lo: u32, hi: u32, value: u32) -> Result<()> {
        let (memory, offset) = self.memory(lo, hi)?;
        memory.write_u32(offset, value)?;
        Ok(())
    }

    fn step(&mut self, cmd: &[u32]) -> Result<Step> {
        let dw0 = cmd[0];
        let len = command_length(dw0).ok_or_else(|| anyhow!("undecodable header 0x{dw0:08X}"))?;
        if len > cmd.len() {
            bail!("command of {} dwords truncated at {}", len, cmd.len());
        }
        let Some(kind) = Self::decode_kind(dw0) else {
            trace!("Skipping unknown command 0x{:08X}", dw0);
            self.stats.commands += 1;
            return Ok(Step::Advance(len));
        };

        match kind {
            CommandKind::MiBatchBufferEnd => {
                self.stats.commands += 1;
                return Ok(Step::End);
            }
            CommandKind::MiSemaphoreWait => {
                let op = CompareOp::from_raw(get_field(dw0, 12, 14))
                    .ok_or_else(|| anyhow!("bad compare op in 0x{dw0:08X}"))?;
                let current = self.read(cmd[2], cmd[3])?;
                if !op.holds(current, cmd[1]) {
                    trace!("Semaphore {:?} {} not met (memory {})", op, cmd[1], current);
                    return Ok(Step::Blocked);
                }
            }
            CommandKind::MiStoreDataImm => self.write(cmd[1], cmd[2], cmd[3])?,
            CommandKind::MiCopyMemMem => {
                let value = self.read(cmd[3], cmd[4])?;
                self.write(cmd[1], cmd[2], value)?;
            }
            CommandKind::MiAtomic => {
                let op = AtomicOp::from_raw(get_field(dw0, 8, 15))
                    .ok_or_else(|| anyhow!("bad atomic op in 0x{dw0:08X}"))?;
                let current = self.read(cmd[1], cmd[2])?;
                self.write(cmd[1], cmd[2], op.apply(current, cmd[3]))?;
            }
            CommandKind::MiFlushDw => {
                if get_field(dw0, 14, 15) != 0 {
                    self.write(cmd[1], cmd[2], cmd[3])?;
                }
            }
            CommandKind::MiStoreRegisterMem => {
                let value = self.register(get_field(cmd[1], 0, 22));
                self.write(cmd[2], cmd[3], value)?;
            }
            CommandKind::MiLoadRegisterImm => {
                self.registers.insert(get_field(cmd[1], 0, 22), cmd[2]);
            }
            CommandKind::MiLoadRegisterMem => {
                let value = self.read(cmd[2], cmd[3])?;
                self.registers.insert(get_field(cmd[1], 0, 22), value);
            }
            CommandKind::MiLoadRegisterReg => {
                let value = self.register(get_field(cmd[1], 0, 22));
                self.registers.insert(get_field(cmd[2], 0, 22), value);
            }
            CommandKind::MiConditionalBatchBufferEnd => {
                if self.read(cmd[2], cmd[3])? <= cmd[1] {
                    self.stats.commands += 1;
                    return Ok(Step::End);
                }
            }
            other => trace!("{:?}: no memory side effects", other),
        }
        self.stats.commands += 1;
        Ok(Step::Advance(len))
    }
}

fn to_dwords(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(DWORD_SIZE)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdbuf::CommandBuffer;
    use crate::encoder::{create_encoder, Generation};
    use crate::mi::FlushDwParams;

    #[test]
    fn test_store_and_atomic() {
        let encoder = create_encoder(Generation::Gen12);
        let mut tracker = ResourceTracker::new();
        let buf = tracker.create_buffer("scratch", 64, true).unwrap();

        let mut cb = CommandBuffer::new(256, 8, MAX_COMMAND_BUFFER_SIZE);
        cb.append(&encoder.store_data_imm(&tracker, buf.at(0), 41).unwrap()).unwrap();
        cb.append(&encoder.atomic(&tracker, buf.at(0), AtomicOp::Increment, 0).unwrap())
            .unwrap();
        cb.append(
            &encoder
                .flush_dw(
                    &tracker,
                    &FlushDwParams {
                        post_sync_write: Some((buf.at(8), 7)),
                        ..FlushDwParams::default()
                    },
                )
                .unwrap(),
        )
        .unwrap();
        cb.append(&encoder.batch_buffer_end().unwrap()).unwrap();

        let mut engine = SimulatedEngine::new(&tracker);
        let stats = engine.run(&[cb.as_bytes()]).unwrap();
        assert_eq!(stats.commands, 4);
        let mem = tracker.host_memory(buf).unwrap();
        assert_eq!(mem.read_u32(0).unwrap(), 42);
        assert_eq!(mem.read_u32(8).unwrap(), 7);
    }

    #[test]
    fn test_semaphore_resolves_across_pipes() {
        let encoder = create_encoder(Generation::Gen12);
        let mut tracker = ResourceTracker::new();
        let sem = tracker.create_buffer("sem", 64, true).unwrap();

        let mut waiter = CommandBuffer::new(256, 8, MAX_COMMAND_BUFFER_SIZE);
        waiter
            .append(&encoder.semaphore_wait(&tracker, sem.at(0), 1, CompareOp::Equal).unwrap())
            .unwrap();
        waiter.append(&encoder.store_data_imm(&tracker, sem.at(4), 9).unwrap()).unwrap();

        let mut signaller = CommandBuffer::new(256, 8, MAX_COMMAND_BUFFER_SIZE);
        signaller.append(&encoder.store_data_imm(&tracker, sem.at(0), 1).unwrap()).unwrap();

        let mut engine = SimulatedEngine::new(&tracker);
        let stats = engine.run(&[waiter.as_bytes(), signaller.as_bytes()]).unwrap();
        assert_eq!(stats.semaphore_stalls, 1);
        assert_eq!(tracker.host_memory(sem).unwrap().read_u32(4).unwrap(), 9);
    }

    #[test]
    fn test_deadlock_detected() {
        let encoder = create_encoder(Generation::Gen11);
        let mut tracker = ResourceTracker::new();
        let sem = tracker.create_buffer("sem", 64, true).unwrap();
        let mut cb = CommandBuffer::new(256, 8, MAX_COMMAND_BUFFER_SIZE);
        cb.append(&encoder.semaphore_wait(&tracker, sem.at(0), 5, CompareOp::Equal).unwrap())
            .unwrap();

        let mut engine = SimulatedEngine::new(&tracker);
        let err = engine.run(&[cb.as_bytes()]).unwrap_err();
        assert!(err.to_string().contains("deadlock"));
    }

    #[test]
    fn test_register_store() {
        let encoder = create_encoder(Generation::Gen12);
        let mut tracker = ResourceTracker::new();
        let out = tracker.create_buffer("out", 16, true).unwrap();
        let mmio = encoder.mmio(0).unwrap();

        let mut cb = CommandBuffer::new(256, 8, MAX_COMMAND_BUFFER_SIZE);
        cb.append(&encoder.store_register_mem(&tracker, mmio.dec_status, out.at(4)).unwrap())
            .unwrap();
        let mut engine = SimulatedEngine::new(&tracker);
        engine.set_register(mmio.dec_status, 0xBEEF);
        engine.run(&[cb.as_bytes()]).unwrap();
        assert_eq!(tracker.host_memory(out).unwrap().read_u32(4).unwrap(), 0xBEEF);
    }

    #[test]
    fn test_command_kinds_skips_state() {
        let encoder = create_encoder(Generation::Gen12);
        let mut cb = CommandBuffer::new(256, 8, MAX_COMMAND_BUFFER_SIZE);
        cb.append(&encoder.noop().unwrap()).unwrap();
        cb.append(&encoder.mfx_wait().unwrap()).unwrap();
        cb.append(&encoder.bsd_object(0, 16).unwrap()).unwrap();
        cb.append(&encoder.batch_buffer_end().unwrap()).unwrap();
        assert_eq!(
            SimulatedEngine::command_kinds(cb.as_bytes()),
            vec![
                CommandKind::MiNoop,
                CommandKind::MfxWait,
                CommandKind::HcpBsdObject,
                CommandKind::MiBatchBufferEnd
            ]
        );
    }
}
