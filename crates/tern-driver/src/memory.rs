//! Multi-ASID device memory manager.
//!
//! The NPU sees memory through up to four ASID windows: ASID0 carries
//! feature maps and everything shared, ASID1 carries weights, the rest
//! are optional. Each window is a contiguous physical range managed by a
//! first-fit free-extent list behind one mutex; allocation and free are
//! serialized (spec: the allocator is the single process-wide choke
//! point).
//!
//! A host backing store stands in for device-visible DRAM: the simulator
//! executes directly against it, the kernel back end treats it as the
//! UMD-side mirror.

use crate::error::{Result, UmdError};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tern_chip::arch::{align_page, align_up, PAGE_SIZE};

/// Number of ASID windows.
pub const ASID_MAX: usize = 4;

/// Address-space selector for allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemRegion {
    /// Let the manager choose (ASID0).
    #[default]
    Default,
    /// Feature-map / shared window.
    Asid0,
    /// Weight window.
    Asid1,
    /// Optional window 2.
    Asid2,
    /// Optional window 3.
    Asid3,
}

impl MemRegion {
    /// Window index of this selector.
    pub fn index(self) -> usize {
        match self {
            Self::Default | Self::Asid0 => 0,
            Self::Asid1 => 1,
            Self::Asid2 => 2,
            Self::Asid3 => 3,
        }
    }
}

/// One window's physical placement.
#[derive(Debug, Clone, Copy)]
pub struct RegionCfg {
    /// Window base physical address.
    pub base: u64,
    /// Window size in bytes; 0 disables the window.
    pub size: u64,
}

/// Physical layout of all windows.
#[derive(Debug, Clone)]
pub struct MemLayout {
    /// Per-window placement, indexed by ASID.
    pub regions: [RegionCfg; ASID_MAX],
}

impl Default for MemLayout {
    fn default() -> Self {
        Self {
            regions: [
                RegionCfg {
                    base: 0x1000_0000,
                    size: 64 << 20,
                },
                RegionCfg {
                    base: 0x2000_0000,
                    size: 32 << 20,
                },
                RegionCfg { base: 0, size: 0 },
                RegionCfg { base: 0, size: 0 },
            ],
        }
    }
}

/// A device memory region handed out by the manager.
///
/// Owning descriptors (`owned == true`) must go back through
/// [`MemoryManager::release`]; views carved from a larger owning buffer
/// release as a no-op and the backing extent returns when the owner does.
#[derive(Debug, Clone)]
pub struct BufferDesc {
    /// Base physical address.
    pub pa: u64,
    /// Page-aligned extent size.
    pub size: u64,
    /// Originally requested size.
    pub req_size: u64,
    /// Base of the owning ASID window.
    pub asid_base: u64,
    /// Page-aligned address relative to the window
    /// (`asid_base + align(pa - asid_base)`).
    pub align_asid_pa: u64,
    /// Window selector this buffer came from.
    pub region: MemRegion,
    /// Whether releasing this descriptor frees the extent.
    pub owned: bool,
    /// Debug name.
    pub name: String,
}

impl BufferDesc {
    /// Carve a non-owning view at `offset` into this buffer.
    pub fn view(&self, offset: u64, req_size: u64, name: impl Into<String>) -> Self {
        let pa = self.pa + offset;
        Self {
            pa,
            size: align_page(req_size),
            req_size,
            asid_base: self.asid_base,
            align_asid_pa: self.asid_base + align_up(pa - self.asid_base, PAGE_SIZE),
            region: self.region,
            owned: false,
            name: name.into(),
        }
    }

    /// A non-owning alias of the full buffer.
    pub fn alias(&self) -> Self {
        let mut b = self.clone();
        b.owned = false;
        b
    }

    /// Offset of this buffer within its ASID window.
    pub fn dev_offset(&self) -> u64 {
        self.pa - self.asid_base
    }
}

#[derive(Debug)]
struct Region {
    base: u64,
    size: u64,
    ram: Vec<u8>,
    /// Free extents `(start, len)`, sorted by start.
    free: Vec<(u64, u64)>,
    /// Live owning allocations `pa -> size`.
    live: HashMap<u64, u64>,
}

impl Region {
    fn new(cfg: RegionCfg) -> Self {
        let free = if cfg.size > 0 {
            vec![(cfg.base, cfg.size)]
        } else {
            Vec::new()
        };
        Self {
            base: cfg.base,
            size: cfg.size,
            ram: vec![0u8; cfg.size as usize],
            free,
            live: HashMap::new(),
        }
    }

    fn contains(&self, pa: u64, len: u64) -> bool {
        self.size > 0 && pa >= self.base && pa + len <= self.base + self.size
    }

    fn carve(&mut self, size: u64, align_bytes: u64) -> Option<u64> {
        for i in 0..self.free.len() {
            let (start, len) = self.free[i];
            let aligned = align_up(start, align_bytes);
            let lead = aligned - start;
            if lead + size > len {
                continue;
            }
            self.free.remove(i);
            if lead > 0 {
                self.free.insert(i, (start, lead));
            }
            let tail = len - lead - size;
            if tail > 0 {
                let at = self.free.partition_point(|&(s, _)| s < aligned + size);
                self.free.insert(at, (aligned + size, tail));
            }
            return Some(aligned);
        }
        None
    }

    fn give_back(&mut self, pa: u64, size: u64) {
        let at = self.free.partition_point(|&(s, _)| s < pa);
        self.free.insert(at, (pa, size));
        // coalesce neighbours
        let mut i = at.saturating_sub(1);
        while i + 1 < self.free.len() {
            let (s0, l0) = self.free[i];
            let (s1, l1) = self.free[i + 1];
            if s0 + l0 == s1 {
                self.free[i] = (s0, l0 + l1);
                self.free.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }
}

#[derive(Debug)]
struct GmWindow {
    size: u64,
    cursor: u64,
    backing: BufferDesc,
}

/// The process-wide device memory manager.
#[derive(Debug)]
pub struct MemoryManager {
    regions: [Mutex<Region>; ASID_MAX],
    gm: Mutex<Option<GmWindow>>,
    dmabufs: Mutex<HashMap<i32, BufferDesc>>,
}

impl MemoryManager {
    /// Create a manager over the given window layout.
    pub fn new(layout: MemLayout) -> Arc<Self> {
        Arc::new(Self {
            regions: layout.regions.map(|cfg| Mutex::new(Region::new(cfg))),
            gm: Mutex::new(None),
            dmabufs: Mutex::new(HashMap::new()),
        })
    }

    /// Allocate `size` bytes aligned to `align_in_page` pages (0 means
    /// page alignment) from `region`.
    ///
    /// # Errors
    ///
    /// `BufferAllocFailed` on exhaustion, a disabled window, or a
    /// zero-size request.
    pub fn alloc(
        &self,
        size: u64,
        align_in_page: u32,
        name: &str,
        region: MemRegion,
    ) -> Result<BufferDesc> {
        if size == 0 {
            return Err(UmdError::alloc_fail(name, 0));
        }
        let aligned_size = align_page(size);
        let align_bytes = u64::from(align_in_page.max(1)) * PAGE_SIZE;
        let idx = region.index();
        let mut r = self.regions[idx].lock().expect("region lock");
        let Some(pa) = r.carve(aligned_size, align_bytes) else {
            tracing::debug!("alloc {name}: {aligned_size:#x} bytes from ASID{idx} [fail]");
            return Err(UmdError::alloc_fail(name, size));
        };
        r.live.insert(pa, aligned_size);
        let base = r.base;
        drop(r);
        Ok(BufferDesc {
            pa,
            size: aligned_size,
            req_size: size,
            asid_base: base,
            align_asid_pa: base + align_up(pa - base, PAGE_SIZE),
            region,
            owned: true,
            name: name.to_string(),
        })
    }

    /// Return a buffer to its window. Views release as a no-op; the
    /// extent goes back when the owning buffer does.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` when an owning buffer is not a live
    /// allocation (double free).
    pub fn release(&self, buf: &BufferDesc) -> Result<()> {
        if !buf.owned {
            return Ok(());
        }
        let mut r = self.regions[buf.region.index()].lock().expect("region lock");
        match r.live.remove(&buf.pa) {
            Some(size) => {
                r.give_back(buf.pa, size);
                Ok(())
            }
            None => Err(UmdError::invalid_op(format!(
                "free of unknown buffer {} at {:#x}",
                buf.name, buf.pa
            ))),
        }
    }

    fn region_for(&self, pa: u64, len: u64) -> Result<usize> {
        for (idx, region) in self.regions.iter().enumerate() {
            let r = region.lock().expect("region lock");
            if r.contains(pa, len) {
                return Ok(idx);
            }
        }
        Err(UmdError::invalid_op(format!(
            "address {pa:#x} (+{len:#x}) outside every ASID window"
        )))
    }

    /// Copy host bytes into device memory.
    pub fn write(&self, pa: u64, data: &[u8]) -> Result<()> {
        let idx = self.region_for(pa, data.len() as u64)?;
        let mut r = self.regions[idx].lock().expect("region lock");
        let off = (pa - r.base) as usize;
        r.ram[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copy device memory into a host slice.
    pub fn read(&self, pa: u64, out: &mut [u8]) -> Result<()> {
        let idx = self.region_for(pa, out.len() as u64)?;
        let r = self.regions[idx].lock().expect("region lock");
        let off = (pa - r.base) as usize;
        out.copy_from_slice(&r.ram[off..off + out.len()]);
        Ok(())
    }

    /// Read `len` device bytes into a fresh vector.
    pub fn read_vec(&self, pa: u64, len: u64) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len as usize];
        self.read(pa, &mut out)?;
        Ok(out)
    }

    /// Read one little-endian word.
    pub fn read_u32(&self, pa: u64) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read(pa, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    /// Write one little-endian word.
    pub fn write_u32(&self, pa: u64, value: u32) -> Result<()> {
        self.write(pa, &value.to_le_bytes())
    }

    /// Zero a device range.
    pub fn zeroize(&self, pa: u64, size: u64) -> Result<()> {
        let idx = self.region_for(pa, size)?;
        let mut r = self.regions[idx].lock().expect("region lock");
        let off = (pa - r.base) as usize;
        r.ram[off..off + size as usize].fill(0);
        Ok(())
    }

    /// Base address of an ASID window.
    pub fn asid_base(&self, asid: usize) -> u64 {
        self.regions[asid.min(ASID_MAX - 1)]
            .lock()
            .expect("region lock")
            .base
    }

    /// Size of an ASID window.
    pub fn region_size(&self, asid: usize) -> u64 {
        self.regions[asid.min(ASID_MAX - 1)]
            .lock()
            .expect("region lock")
            .size
    }

    /// Override a window base before any allocation (debug aid).
    ///
    /// # Errors
    ///
    /// `InvalidOperation` once the window has live allocations.
    pub fn reset_asid_base(&self, region: MemRegion, base: u64) -> Result<()> {
        let mut r = self.regions[region.index()].lock().expect("region lock");
        if !r.live.is_empty() {
            return Err(UmdError::invalid_op(
                "ASID base override after allocations started",
            ));
        }
        tracing::warn!(
            "ASID{} base override {:#x} -> {:#x}",
            region.index(),
            r.base,
            base
        );
        r.base = base;
        if r.size > 0 {
            r.free = vec![(base, r.size)];
        }
        Ok(())
    }

    /// Persist a device range to a host file.
    pub fn dump_file(&self, pa: u64, path: &Path, size: u64) -> Result<()> {
        let data = self.read_vec(pa, size)?;
        std::fs::write(path, data).map_err(|source| UmdError::OpenFileFailed {
            path: path.to_path_buf(),
            source,
        })
    }

    // ── GM window ───────────────────────────────────────────────────────

    /// Reserve the on-chip GM backing window inside ASID0.
    pub fn gm_init(&self, size: u64) -> Result<()> {
        let backing = self.alloc(size, 0, "gm", MemRegion::Asid0)?;
        let mut gm = self.gm.lock().expect("gm lock");
        tracing::info!("GM window: {:#x} bytes at {:#x}", size, backing.pa);
        *gm = Some(GmWindow {
            size,
            cursor: 0,
            backing,
        });
        Ok(())
    }

    /// Whether a GM window is configured.
    pub fn gm_enabled(&self) -> bool {
        self.gm.lock().expect("gm lock").is_some()
    }

    /// GM window size (0 when disabled).
    pub fn gm_size(&self) -> u64 {
        self.gm.lock().expect("gm lock").as_ref().map_or(0, |g| g.size)
    }

    /// Bump-allocate from the GM window. Returned descriptors are views
    /// of the window; they release as a no-op.
    pub fn gm_alloc(&self, size: u64, name: &str) -> Result<BufferDesc> {
        let mut gm = self.gm.lock().expect("gm lock");
        let Some(win) = gm.as_mut() else {
            return Err(UmdError::alloc_fail(name, size));
        };
        let aligned = align_page(size);
        if win.cursor + aligned > win.size {
            return Err(UmdError::alloc_fail(name, size));
        }
        let view = win.backing.view(win.cursor, size, name);
        win.cursor += aligned;
        Ok(view)
    }

    // ── dma-buf registry (simulator environment) ────────────────────────

    /// Register an external dma-buf of `size` bytes under `fd`,
    /// reserving device pages for it. Returns the buffer's PA.
    pub fn register_dmabuf(&self, fd: i32, size: u64) -> Result<u64> {
        let buf = self.alloc(size, 0, &format!("dmabuf_{fd}"), MemRegion::Asid0)?;
        let pa = buf.pa;
        self.dmabufs.lock().expect("dmabuf lock").insert(fd, buf);
        Ok(pa)
    }

    /// Look up a registered dma-buf.
    pub fn dmabuf_info(&self, fd: i32) -> Option<(u64, u64)> {
        self.dmabufs
            .lock()
            .expect("dmabuf lock")
            .get(&fd)
            .map(|b| (b.pa, b.req_size))
    }

    /// Drop a registered dma-buf and free its pages.
    pub fn release_dmabuf(&self, fd: i32) -> Result<()> {
        let buf = self
            .dmabufs
            .lock()
            .expect("dmabuf lock")
            .remove(&fd)
            .ok_or_else(|| UmdError::invalid_op(format!("unknown dma-buf fd {fd}")))?;
        self.release(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_layout() -> MemLayout {
        MemLayout {
            regions: [
                RegionCfg {
                    base: 0x1000_0000,
                    size: 1 << 20,
                },
                RegionCfg {
                    base: 0x2000_0000,
                    size: 1 << 20,
                },
                RegionCfg { base: 0, size: 0 },
                RegionCfg { base: 0, size: 0 },
            ],
        }
    }

    #[test]
    fn alloc_respects_window_invariants() {
        let mem = MemoryManager::new(small_layout());
        let buf = mem.alloc(100, 0, "t", MemRegion::Default).unwrap();
        assert!(buf.pa >= buf.asid_base);
        assert!(buf.pa + buf.size <= buf.asid_base + mem.region_size(0));
        assert_eq!(buf.size, PAGE_SIZE);
        assert_eq!(buf.req_size, 100);
        assert_eq!(buf.align_asid_pa, buf.pa);
        mem.release(&buf).unwrap();
    }

    #[test]
    fn distinct_allocations_do_not_overlap() {
        let mem = MemoryManager::new(small_layout());
        let a = mem.alloc(0x2000, 0, "a", MemRegion::Default).unwrap();
        let b = mem.alloc(0x2000, 0, "b", MemRegion::Default).unwrap();
        assert!(a.pa + a.size <= b.pa || b.pa + b.size <= a.pa);
        mem.release(&a).unwrap();
        mem.release(&b).unwrap();
    }

    #[test]
    fn exhaustion_returns_alloc_fail() {
        let mem = MemoryManager::new(small_layout());
        assert!(matches!(
            mem.alloc(2 << 20, 0, "big", MemRegion::Default),
            Err(UmdError::BufferAllocFailed { .. })
        ));
    }

    #[test]
    fn free_coalesces_and_allows_reuse() {
        let mem = MemoryManager::new(small_layout());
        let a = mem.alloc(512 << 10, 0, "a", MemRegion::Default).unwrap();
        let b = mem.alloc(256 << 10, 0, "b", MemRegion::Default).unwrap();
        mem.release(&a).unwrap();
        mem.release(&b).unwrap();
        // whole window is back in one piece
        let c = mem.alloc(1 << 20, 0, "c", MemRegion::Default).unwrap();
        mem.release(&c).unwrap();
    }

    #[test]
    fn double_free_is_rejected() {
        let mem = MemoryManager::new(small_layout());
        let a = mem.alloc(0x1000, 0, "a", MemRegion::Default).unwrap();
        mem.release(&a).unwrap();
        assert!(mem.release(&a).is_err());
    }

    #[test]
    fn view_release_is_noop() {
        let mem = MemoryManager::new(small_layout());
        let a = mem.alloc(0x4000, 0, "a", MemRegion::Default).unwrap();
        let v = a.view(0x1000, 0x800, "v");
        assert_eq!(v.pa, a.pa + 0x1000);
        assert!(!v.owned);
        mem.release(&v).unwrap();
        mem.release(&v).unwrap(); // still fine
        mem.release(&a).unwrap();
    }

    #[test]
    fn write_read_roundtrip_and_zeroize() {
        let mem = MemoryManager::new(small_layout());
        let a = mem.alloc(0x1000, 0, "a", MemRegion::Default).unwrap();
        mem.write(a.pa, &[1, 2, 3, 4]).unwrap();
        let back = mem.read_vec(a.pa, 4).unwrap();
        assert_eq!(back, vec![1, 2, 3, 4]);
        mem.zeroize(a.pa, 4).unwrap();
        assert_eq!(mem.read_vec(a.pa, 4).unwrap(), vec![0; 4]);
        mem.release(&a).unwrap();
    }

    #[test]
    fn out_of_window_access_rejected() {
        let mem = MemoryManager::new(small_layout());
        assert!(mem.write(0x0fff_0000, &[0u8; 4]).is_err());
    }

    #[test]
    fn alignment_honored() {
        let mem = MemoryManager::new(small_layout());
        let _pad = mem.alloc(0x1000, 0, "pad", MemRegion::Default).unwrap();
        let a = mem.alloc(0x1000, 4, "aligned", MemRegion::Default).unwrap();
        assert_eq!(a.pa % (4 * PAGE_SIZE), 0);
    }

    #[test]
    fn reset_base_only_before_allocations() {
        let mem = MemoryManager::new(small_layout());
        mem.reset_asid_base(MemRegion::Asid0, 0x4000_0000).unwrap();
        assert_eq!(mem.asid_base(0), 0x4000_0000);
        let _a = mem.alloc(0x1000, 0, "a", MemRegion::Default).unwrap();
        assert!(mem.reset_asid_base(MemRegion::Asid0, 0x5000_0000).is_err());
    }

    #[test]
    fn gm_window_bump_allocates() {
        let mem = MemoryManager::new(small_layout());
        mem.gm_init(64 << 10).unwrap();
        assert!(mem.gm_enabled());
        let a = mem.gm_alloc(0x1000, "gm_a").unwrap();
        let b = mem.gm_alloc(0x1000, "gm_b").unwrap();
        assert_eq!(b.pa, a.pa + 0x1000);
        assert!(mem.gm_alloc(1 << 20, "too_big").is_err());
    }

    #[test]
    fn dmabuf_registry_roundtrip() {
        let mem = MemoryManager::new(small_layout());
        let pa = mem.register_dmabuf(7, 0x2000).unwrap();
        assert_eq!(mem.dmabuf_info(7), Some((pa, 0x2000)));
        mem.release_dmabuf(7).unwrap();
        assert!(mem.dmabuf_info(7).is_none());
        assert!(mem.release_dmabuf(7).is_err());
    }
}
