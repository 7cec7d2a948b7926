//! Resource Tracker Module
//!
//! Tracks GPU-addressable buffers and surfaces, their residency and
//! compression state, and the read/write intent recorded against them by the
//! commands of the current frame. Resolves handles into addresses that can
//! be written into command dwords.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use bitflags::bitflags;
use tracing::{debug, trace, warn};

use crate::error::{MediaError, Result};
use crate::protocol::*;

/// Base of the simulated graphics virtual address space.
const GPU_VA_BASE: u64 = 0x1_0000_0000;
/// Planar surfaces are allocated in 32-row units.
const SURFACE_HEIGHT_ALIGNMENT: u32 = 32;

/// Opaque handle to a tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle(pub u32);

impl ResourceHandle {
    /// Reference a byte offset inside this resource.
    pub fn at(self, offset: u32) -> GpuRef {
        GpuRef {
            handle: self,
            offset,
        }
    }
}

impl std::fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A resource plus a byte offset inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuRef {
    pub handle: ResourceHandle,
    pub offset: u32,
}

impl From<ResourceHandle> for GpuRef {
    fn from(handle: ResourceHandle) -> Self {
        handle.at(0)
    }
}

bitflags! {
    /// Access intent recorded against a resource.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AccessIntent: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Resident,
    Evicted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Media,
    Render,
}

impl Compression {
    /// Memory-attribute compression-type bit (0 = media, 1 = render).
    pub fn type_bit(self) -> bool {
        matches!(self, Compression::Render)
    }

    pub fn enabled(self) -> bool {
        !matches!(self, Compression::None)
    }
}

/// Cache-policy tag carried in patch entries and memory attribute dwords.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    Uncached,
    WriteBack,
    Streaming,
}

impl CachePolicy {
    /// MOCS table index programmed into memory attribute dwords.
    pub fn mocs_index(self) -> u32 {
        match self {
            CachePolicy::Uncached => 1,
            CachePolicy::WriteBack => 2,
            CachePolicy::Streaming => 3,
        }
    }
}

/// Layout metadata of a surface resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceDesc {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub format: SurfaceFormat,
    pub tiled: bool,
}

impl SurfaceDesc {
    pub fn new(width: u32, height: u32, format: SurfaceFormat) -> Self {
        let bytes_per_pixel = match format {
            SurfaceFormat::Planar420_8 => 1,
            SurfaceFormat::P010 | SurfaceFormat::Yuy2 => 2,
            SurfaceFormat::Y410 | SurfaceFormat::Y216 => 4,
            SurfaceFormat::Y416 => 8,
        };
        Self {
            width,
            height,
            pitch: align_up(width * bytes_per_pixel, CACHELINE_SIZE),
            format,
            tiled: true,
        }
    }

    /// Row at which the Cb plane starts, zero for packed formats.
    pub fn y_offset_cb(&self) -> u32 {
        match self.format {
            SurfaceFormat::Planar420_8 | SurfaceFormat::P010 => {
                align_up(self.height, SURFACE_HEIGHT_ALIGNMENT)
            }
            _ => 0,
        }
    }

    pub fn size(&self) -> u64 {
        let luma_rows = align_up(self.height, SURFACE_HEIGHT_ALIGNMENT) as u64;
        let chroma_rows = if self.y_offset_cb() > 0 {
            luma_rows / 2
        } else {
            0
        };
        self.pitch as u64 * (luma_rows + chroma_rows)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Buffer,
    Surface(SurfaceDesc),
}

/// Host-visible backing store shared between the tracker, the status
/// report and the simulated engine.
#[derive(Debug, Clone, Default)]
pub struct HostMemory(Arc<RwLock<Vec<u8>>>);

impl HostMemory {
    pub fn zeroed(size: usize) -> Self {
        Self(Arc::new(RwLock::new(vec![0; size])))
    }

    pub fn len(&self) -> usize {
        self.0.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_u32(&self, offset: u32) -> Result<u32> {
        let mem = self
            .0
            .read()
            .map_err(|_| MediaError::missing("host memory lock poisoned"))?;
        let start = offset as usize;
        let bytes = mem
            .get(start..start + 4)
            .ok_or_else(|| MediaError::invalid(format!("host read at 0x{offset:X} out of range")))?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_u32(&self, offset: u32, value: u32) -> Result<()> {
        let mut mem = self
            .0
            .write()
            .map_err(|_| MediaError::missing("host memory lock poisoned"))?;
        let start = offset as usize;
        let bytes = mem
            .get_mut(start..start + 4)
            .ok_or_else(|| MediaError::invalid(format!("host write at 0x{offset:X} out of range")))?;
        bytes.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Copy `len` bytes starting at `offset`.
    pub fn read_bytes(&self, offset: u32, len: usize) -> Result<Vec<u8>> {
        let mem = self
            .0
            .read()
            .map_err(|_| MediaError::missing("host memory lock poisoned"))?;
        let start = offset as usize;
        mem.get(start..start + len)
            .map(|b| b.to_vec())
            .ok_or_else(|| MediaError::invalid(format!("host read at 0x{offset:X} out of range")))
    }

    pub fn write_bytes(&self, offset: u32, data: &[u8]) -> Result<()> {
        let mut mem = self
            .0
            .write()
            .map_err(|_| MediaError::missing("host memory lock poisoned"))?;
        let start = offset as usize;
        mem.get_mut(start..start + data.len())
            .ok_or_else(|| MediaError::invalid(format!("host write at 0x{offset:X} out of range")))?
            .copy_from_slice(data);
        Ok(())
    }

    pub fn fill(&self, offset: u32, len: usize, byte: u8) -> Result<()> {
        let mut mem = self
            .0
            .write()
            .map_err(|_| MediaError::missing("host memory lock poisoned"))?;
        let start = offset as usize;
        mem.get_mut(start..start + len)
            .ok_or_else(|| MediaError::invalid(format!("host fill at 0x{offset:X} out of range")))?
            .fill(byte);
        Ok(())
    }
}

/// A tracked GPU resource.
#[derive(Debug)]
pub struct Resource {
    pub name: String,
    pub kind: ResourceKind,
    pub size: u64,
    pub gpu_address: u64,
    pub residency: Residency,
    pub compression: Compression,
    pub cache_policy: CachePolicy,
    host: Option<HostMemory>,
}

impl Resource {
    pub fn surface(&self) -> Option<&SurfaceDesc> {
        match &self.kind {
            ResourceKind::Surface(desc) => Some(desc),
            ResourceKind::Buffer => None,
        }
    }
}

/// Address of a resolved reference, with the attributes that go into the
/// memory attribute dword next to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub address: u64,
    pub cache_policy: CachePolicy,
    pub compression: Compression,
    pub tiled: bool,
}

/// Tracks every resource known to one media context.
///
/// Resolution takes `&self` so several pipes can encode against the same
/// tracker; the per-frame access log is the only interior state.
#[derive(Debug)]
pub struct ResourceTracker {
    resources: HashMap<ResourceHandle, Resource>,
    next_handle: u32,
    next_address: u64,
    /// Bytes of GPU address space still available, `None` when unbounded.
    address_budget: Option<u64>,
    frame_access: Mutex<HashMap<ResourceHandle, AccessIntent>>,
}

impl Default for ResourceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self {
            resources: HashMap::new(),
            next_handle: 1,
            next_address: GPU_VA_BASE,
            address_budget: None,
            frame_access: Mutex::new(HashMap::new()),
        }
    }

    /// Tracker whose allocations fail once `bytes` of address space are used.
    pub fn with_address_budget(bytes: u64) -> Self {
        Self {
            address_budget: Some(bytes),
            ..Self::new()
        }
    }

    fn insert(&mut self, name: &str, kind: ResourceKind, size: u64, host: bool) -> Result<ResourceHandle> {
        let span = size.max(1).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        if let Some(budget) = self.address_budget.as_mut() {
            if *budget < span {
                warn!("Out of GPU address space allocating '{}' ({} bytes)", name, size);
                return Err(MediaError::missing(format!("no address space left for '{name}'")));
            }
            *budget -= span;
        }

        let handle = ResourceHandle(self.next_handle);
        self.next_handle += 1;

        let gpu_address = self.next_address;
        self.next_address += span;

        let resource = Resource {
            name: name.to_string(),
            kind,
            size,
            gpu_address,
            residency: Residency::Resident,
            compression: Compression::None,
            cache_policy: CachePolicy::WriteBack,
            host: host.then(|| HostMemory::zeroed(size as usize)),
        };
        self.resources.insert(handle, resource);
        debug!(
            "Created resource {} '{}' size={} va=0x{:X}",
            handle, name, size, gpu_address
        );
        Ok(handle)
    }

    /// Create a linear buffer. Host-visible buffers get CPU backing memory.
    pub fn create_buffer(&mut self, name: &str, size: u32, host_visible: bool) -> Result<ResourceHandle> {
        if size == 0 {
            return Err(MediaError::invalid(format!("buffer '{name}' has zero size")));
        }
        self.insert(name, ResourceKind::Buffer, size as u64, host_visible)
    }

    pub fn create_surface(&mut self, name: &str, desc: SurfaceDesc) -> Result<ResourceHandle> {
        if desc.width == 0 || desc.height == 0 {
            return Err(MediaError::invalid(format!("surface '{name}' has zero extent")));
        }
        self.insert(name, ResourceKind::Surface(desc), desc.size(), false)
    }

    /// Destroy a resource by handle.
    pub fn destroy(&mut self, handle: ResourceHandle) -> bool {
        if self.resources.remove(&handle).is_some() {
            debug!("Destroyed resource {}", handle);
            true
        } else {
            warn!("Attempted to destroy non-existent resource {}", handle);
            false
        }
    }

    pub fn get(&self, handle: ResourceHandle) -> Result<&Resource> {
        self.resources
            .get(&handle)
            .ok_or_else(|| MediaError::missing(format!("resource {handle} is not tracked")))
    }

    fn get_mut(&mut self, handle: ResourceHandle) -> Result<&mut Resource> {
        self.resources
            .get_mut(&handle)
            .ok_or_else(|| MediaError::missing(format!("resource {handle} is not tracked")))
    }

    pub fn set_compression(&mut self, handle: ResourceHandle, compression: Compression) -> Result<()> {
        self.get_mut(handle)?.compression = compression;
        Ok(())
    }

    pub fn set_cache_policy(&mut self, handle: ResourceHandle, policy: CachePolicy) -> Result<()> {
        self.get_mut(handle)?.cache_policy = policy;
        Ok(())
    }

    pub fn evict(&mut self, handle: ResourceHandle) -> Result<()> {
        self.get_mut(handle)?.residency = Residency::Evicted;
        Ok(())
    }

    pub fn make_resident(&mut self, handle: ResourceHandle) -> Result<()> {
        let resource = self.get_mut(handle)?;
        if resource.residency == Residency::Evicted {
            debug!("Paging in resource {}", handle);
        }
        resource.residency = Residency::Resident;
        Ok(())
    }

    /// Resolve a reference into an address usable inside a command and
    /// record the access intent for the current frame.
    pub fn resolve(&self, target: GpuRef, intent: AccessIntent) -> Result<ResolvedAddress> {
        let resource = self.get(target.handle)?;
        if resource.residency != Residency::Resident {
            return Err(MediaError::missing(format!(
                "resource {} '{}' is not resident",
                target.handle, resource.name
            )));
        }
        // One past the end is legal so upper-bound fields can be expressed.
        if target.offset as u64 > resource.size {
            return Err(MediaError::invalid(format!(
                "offset 0x{:X} outside resource {} of {} bytes",
                target.offset, target.handle, resource.size
            )));
        }

        if let Ok(mut log) = self.frame_access.lock() {
            *log.entry(target.handle).or_default() |= intent;
        }
        trace!("Resolved {} +0x{:X} ({:?})", target.handle, target.offset, intent);

        Ok(ResolvedAddress {
            address: resource.gpu_address + target.offset as u64,
            cache_policy: resource.cache_policy,
            compression: resource.compression,
            tiled: resource.surface().is_some_and(|s| s.tiled),
        })
    }

    /// Map a GPU address back to the resource and offset it falls in.
    pub fn find_by_address(&self, address: u64) -> Option<GpuRef> {
        self.resources.iter().find_map(|(handle, r)| {
            (address >= r.gpu_address && address < r.gpu_address + r.size)
                .then(|| handle.at((address - r.gpu_address) as u32))
        })
    }

    pub fn host_memory(&self, handle: ResourceHandle) -> Result<HostMemory> {
        self.get(handle)?
            .host
            .clone()
            .ok_or_else(|| MediaError::missing(format!("resource {handle} has no host mapping")))
    }

    /// Access intent accumulated since the last `begin_frame`.
    pub fn frame_access(&self, handle: ResourceHandle) -> AccessIntent {
        self.frame_access
            .lock()
            .ok()
            .and_then(|log| log.get(&handle).copied())
            .unwrap_or_default()
    }

    pub fn begin_frame(&self) {
        if let Ok(mut log) = self.frame_access.lock() {
            log.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
