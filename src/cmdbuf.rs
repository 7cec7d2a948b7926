//! Command Buffer Module
//!
//! Fixed-size command descriptors, the append-only command buffer they are
//! recorded into, and the patch list that binds resource handles to the
//! address fields inside it.

use tracing::{debug, trace, warn};

use crate::error::{MediaError, Result};
use crate::protocol::*;
use crate::resource::{AccessIntent, CachePolicy, GpuRef, ResolvedAddress, ResourceHandle, ResourceTracker};

/// Every command kind the encoders emit or the sizer accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandKind {
    MiNoop,
    MiBatchBufferEnd,
    MiBatchBufferStart,
    MiLoadRegisterImm,
    MiLoadRegisterMem,
    MiLoadRegisterReg,
    MiStoreRegisterMem,
    MiStoreDataImm,
    MiCopyMemMem,
    MiSemaphoreWait,
    MiAtomic,
    MiConditionalBatchBufferEnd,
    MiFlushDw,
    MfxWait,
    VdPipelineFlush,
    HcpPipeModeSelect,
    HcpSurfaceState,
    HcpPipeBufAddrState,
    HcpIndObjBaseAddrState,
    HcpQmState,
    HcpFqmState,
    HcpPicState,
    HcpTileState,
    HcpRefIdxState,
    HcpWeightOffsetState,
    HcpSliceState,
    HcpTileCoding,
    HcpBsdObject,
    HcpPakInsertObject,
    HcpRdoqState,
    HcpVp9PicState,
    HcpVp9SegmentState,
    VdencCmd2,
}

/// A pending relocation inside a descriptor, keyed by dword index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub dword: usize,
    pub target: GpuRef,
    pub writable: bool,
    pub cache_policy: CachePolicy,
}

/// Patch-list entry: where in the buffer an address lives and what it binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchEntry {
    /// Byte offset of the low address dword inside the command buffer.
    pub offset: usize,
    pub handle: ResourceHandle,
    /// Byte offset inside the target resource.
    pub resource_offset: u32,
    pub writable: bool,
    pub cache_policy: CachePolicy,
}

/// One fully populated command, ready to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    kind: CommandKind,
    dwords: Vec<u32>,
    relocations: Vec<Relocation>,
}

impl CommandDescriptor {
    /// Zeroed command of `len` dwords with `header` as DW0.
    pub fn new(kind: CommandKind, len: u32, header: u32) -> Self {
        let mut dwords = vec![0u32; len as usize];
        if let Some(dw0) = dwords.first_mut() {
            *dw0 = header;
        }
        Self {
            kind,
            dwords,
            relocations: Vec::new(),
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn dwords(&self) -> &[u32] {
        &self.dwords
    }

    pub fn len_bytes(&self) -> usize {
        self.dwords.len() * DWORD_SIZE
    }

    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    pub fn dw(&self, index: usize) -> u32 {
        self.dwords[index]
    }

    /// Pack `value` into bits `lo..=hi` of dword `index`.
    pub fn set(&mut self, index: usize, lo: u32, hi: u32, value: u32) {
        set_field(&mut self.dwords[index], lo, hi, value);
    }

    pub fn set_flag(&mut self, index: usize, bit: u32, on: bool) {
        set_bit(&mut self.dwords[index], bit, on);
    }

    pub fn get(&self, index: usize, lo: u32, hi: u32) -> u32 {
        get_field(self.dwords[index], lo, hi)
    }

    /// Write a raw (already resolved) 48-bit address into `index`/`index+1`.
    pub fn set_raw_address(&mut self, index: usize, address: u64) {
        self.dwords[index] = address as u32;
        self.dwords[index + 1] = ((address >> 32) as u32) & 0xFFFF;
    }

    /// Resolve `target`, write its address into dwords `index`/`index+1`, and
    /// register a relocation for it. `alignment` is the granularity of the
    /// hardware address field.
    pub fn write_address(
        &mut self,
        tracker: &ResourceTracker,
        index: usize,
        target: GpuRef,
        writable: bool,
        alignment: u32,
    ) -> Result<ResolvedAddress> {
        let intent = if writable {
            AccessIntent::READ | AccessIntent::WRITE
        } else {
            AccessIntent::READ
        };
        let resolved = tracker.resolve(target, intent)?;
        if resolved.address % alignment as u64 != 0 {
            return Err(MediaError::invalid(format!(
                "{:?} address 0x{:X} is not {}-byte aligned",
                self.kind, resolved.address, alignment
            )));
        }
        self.set_raw_address(index, resolved.address);
        self.relocations.push(Relocation {
            dword: index,
            target,
            writable,
            cache_policy: resolved.cache_policy,
        });
        Ok(resolved)
    }

    /// Same as `write_address` for an optional resource; absent resources
    /// leave the field zero and register nothing.
    pub fn write_optional_address(
        &mut self,
        tracker: &ResourceTracker,
        index: usize,
        target: Option<GpuRef>,
        writable: bool,
        alignment: u32,
    ) -> Result<Option<ResolvedAddress>> {
        target
            .map(|t| self.write_address(tracker, index, t, writable, alignment))
            .transpose()
    }
}

/// Append-only byte arena plus its patch list.
#[derive(Debug)]
pub struct CommandBuffer {
    data: Vec<u8>,
    capacity: usize,
    patches: Vec<PatchEntry>,
    patch_capacity: usize,
    max_size: usize,
}

impl CommandBuffer {
    pub fn new(capacity: usize, patch_capacity: usize, max_size: usize) -> Self {
        let capacity = capacity.min(max_size);
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            patches: Vec::with_capacity(patch_capacity),
            patch_capacity,
            max_size,
        }
    }

    pub fn used(&self) -> usize {
        self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn patch_capacity(&self) -> usize {
        self.patch_capacity
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn patches(&self) -> &[PatchEntry] {
        &self.patches
    }

    pub fn read_dword(&self, offset: usize) -> Option<u32> {
        self.data
            .get(offset..offset + DWORD_SIZE)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Grow so that `extra_bytes` and `extra_patches` more fit. Capacity
    /// doubles until it is large enough; recorded bytes and patch offsets are
    /// left untouched.
    pub fn ensure_capacity(&mut self, extra_bytes: usize, extra_patches: usize) -> Result<()> {
        let required = self.used() + extra_bytes;
        if required > self.max_size {
            return Err(MediaError::ExceedsMaximumSize {
                requested: required,
                ceiling: self.max_size,
            });
        }

        if required > self.capacity {
            let mut grown = self.capacity.max(PAGE_SIZE as usize);
            while grown < required {
                grown *= 2;
            }
            let grown = grown.min(self.max_size);
            debug!("Growing command buffer {} -> {} bytes", self.capacity, grown);
            self.data.reserve(grown - self.data.len());
            self.capacity = grown;
        }

        let required_patches = self.patches.len() + extra_patches;
        if required_patches > self.patch_capacity {
            let mut grown = self.patch_capacity.max(16);
            while grown < required_patches {
                grown *= 2;
            }
            self.patches.reserve(grown - self.patches.len());
            self.patch_capacity = grown;
        }
        Ok(())
    }

    /// Append a command, returning the byte offset it starts at.
    pub fn append(&mut self, cmd: &CommandDescriptor) -> Result<usize> {
        let bytes = cmd.len_bytes();
        let relocs = cmd.relocations().len();
        if bytes > self.remaining() || self.patches.len() + relocs > self.patch_capacity {
            warn!(
                "{:?} does not fit (used {} of {}), growing past the estimate",
                cmd.kind(),
                self.used(),
                self.capacity
            );
            self.ensure_capacity(bytes, relocs)?;
        }

        let base = self.data.len();
        for dw in cmd.dwords() {
            self.data.extend_from_slice(&dw.to_le_bytes());
        }
        for reloc in cmd.relocations() {
            self.patches.push(PatchEntry {
                offset: base + reloc.dword * DWORD_SIZE,
                handle: reloc.target.handle,
                resource_offset: reloc.target.offset,
                writable: reloc.writable,
                cache_policy: reloc.cache_policy,
            });
        }
        trace!("Appended {:?} at 0x{:X} ({} bytes)", cmd.kind(), base, bytes);
        Ok(base)
    }

    /// Clear contents for reuse, keeping the allocation.
    pub fn reset(&mut self) {
        self.data.clear();
        self.patches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sdi(tracker: &ResourceTracker, target: GpuRef, value: u32) -> CommandDescriptor {
        let mut cmd = CommandDescriptor::new(CommandKind::MiStoreDataImm, 4, mi_header(MI_STORE_DATA_IMM, 4));
        cmd.write_address(tracker, 1, target, true, 4).unwrap();
        cmd.set(3, 0, 31, value);
        cmd
    }

    #[test]
    fn test_append_records_patch_offsets() {
        let mut tracker = ResourceTracker::new();
        let buf = tracker.create_buffer("sem", 64, true).unwrap();
        let mut cb = CommandBuffer::new(4096, 4, MAX_COMMAND_BUFFER_SIZE);

        let first = cb.append(&sdi(&tracker, buf.at(0), 1)).unwrap();
        let second = cb.append(&sdi(&tracker, buf.at(8), 2)).unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 16);
        assert_eq!(cb.used(), 32);

        let patches = cb.patches();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[1].offset, 20);
        assert_eq!(patches[1].resource_offset, 8);
        assert!(patches[1].writable);

        let va = tracker.get(buf).unwrap().gpu_address;
        assert_eq!(cb.read_dword(patches[1].offset), Some((va + 8) as u32));
    }

    #[test]
    fn test_misaligned_address_rejected_without_side_effects() {
        let mut tracker = ResourceTracker::new();
        let buf = tracker.create_buffer("buf", 256, false).unwrap();
        let mut cmd = CommandDescriptor::new(CommandKind::MiFlushDw, 5, mi_header(MI_FLUSH_DW, 5));
        let err = cmd.write_address(&tracker, 1, buf.at(4), true, 8).unwrap_err();
        assert!(matches!(err, MediaError::InvalidParameter(_)));
        assert!(cmd.relocations().is_empty());
    }

    #[test]
    fn test_append_grows_past_capacity() {
        let mut cb = CommandBuffer::new(8, 0, MAX_COMMAND_BUFFER_SIZE);
        let noop = CommandDescriptor::new(CommandKind::MiNoop, 1, 0);
        for _ in 0..3 {
            cb.append(&noop).unwrap();
        }
        assert_eq!(cb.used(), 12);
        assert!(cb.capacity() >= 12);
    }

    #[test]
    fn test_ensure_capacity_ceiling() {
        let mut cb = CommandBuffer::new(64, 0, 128);
        let err = cb.ensure_capacity(129, 0).unwrap_err();
        assert_eq!(
            err,
            MediaError::ExceedsMaximumSize {
                requested: 129,
                ceiling: 128
            }
        );
        cb.ensure_capacity(128, 0).unwrap();
        assert_eq!(cb.capacity(), 128);
    }
}
