use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use util::{Error, Result};

/// Tagged allocator selection; each kind carries its own allocation,
/// free and set/copy primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Malloc,
    HugePages { page_size: Option<usize> },
    Gpu { device: u32 },
}

impl MemoryKind {
    pub fn is_host(&self) -> bool {
        !matches!(self, MemoryKind::Gpu { .. })
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryKind::Malloc => write!(f, "malloc"),
            MemoryKind::HugePages { .. } => write!(f, "huge"),
            MemoryKind::Gpu { device } => write!(f, "gpu{device}"),
        }
    }
}

/// Set/copy primitives matching a memory kind. GPU implementations
/// dispatch asynchronously through the registered runtime so the caller
/// never blocks on a device queue.
pub trait MemoryUtils: Send + Sync {
    /// # Safety
    /// `dst..dst+count` must lie inside an allocation of the matching
    /// kind with no concurrent readers.
    unsafe fn memory_set(&self, dst: *mut u8, value: u8, count: usize) -> Result<()>;

    /// # Safety
    /// Source and destination ranges must be valid and disjoint;
    /// `dst` must belong to an allocation of the matching kind.
    unsafe fn memory_copy(&self, dst: *mut u8, src: *const u8, count: usize) -> Result<()>;
}

struct HostMemoryUtils;

impl MemoryUtils for HostMemoryUtils {
    unsafe fn memory_set(&self, dst: *mut u8, value: u8, count: usize) -> Result<()> {
        std::ptr::write_bytes(dst, value, count);
        Ok(())
    }

    unsafe fn memory_copy(&self, dst: *mut u8, src: *const u8, count: usize) -> Result<()> {
        std::ptr::copy_nonoverlapping(src, dst, count);
        Ok(())
    }
}

enum Backing {
    Malloc { layout: Layout },
    HugePages { mapped_len: usize },
    Gpu { device: u32 },
}

/// One owned allocation. Freed on drop through the kind that produced it.
pub struct MemoryBlock {
    ptr: NonNull<u8>,
    len: usize,
    kind: MemoryKind,
    backing: Backing,
}

// A block is a region of raw bytes whose slots are written by exactly one
// producer thread at a time (ring discipline); the block object itself
// carries no interior state.
unsafe impl Send for MemoryBlock {}
unsafe impl Sync for MemoryBlock {}

impl MemoryBlock {
    pub(crate) fn from_gpu(ptr: NonNull<u8>, len: usize, device: u32) -> Self {
        MemoryBlock {
            ptr,
            len,
            kind: MemoryKind::Gpu { device },
            backing: Backing::Gpu { device },
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }
}

impl fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("len", &self.len)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        match self.backing {
            Backing::Malloc { layout } => unsafe {
                std::alloc::dealloc(self.ptr.as_ptr(), layout);
            },
            Backing::HugePages { mapped_len } => {
                #[cfg(not(windows))]
                unsafe {
                    libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, mapped_len);
                }
                #[cfg(windows)]
                let _ = mapped_len;
            }
            Backing::Gpu { device } => {
                crate::gpu::free_device_memory(device, self.ptr.as_ptr());
            }
        }
    }
}

/// Capability surface per memory kind.
pub trait Allocator: Send + Sync {
    fn kind(&self) -> MemoryKind;

    fn allocate(&self, len: usize, align: usize) -> Result<MemoryBlock>;

    /// Rounds a buffer requirement up to this allocator's granularity so
    /// per-stream slices of one big allocation stay page-aligned.
    fn align_length(&self, len: usize) -> usize;

    fn utils(&self) -> Arc<dyn MemoryUtils>;
}

pub fn new_allocator(kind: MemoryKind) -> Result<Box<dyn Allocator>> {
    match kind {
        MemoryKind::Malloc => Ok(Box::new(MallocAllocator)),
        MemoryKind::HugePages { page_size } => {
            Ok(Box::new(HugePagesAllocator::new(page_size)?))
        }
        MemoryKind::Gpu { device } => Ok(Box::new(crate::gpu::GpuAllocator::new(device))),
    }
}

/// Allocation with the one-shot malloc fallback of the receive apps:
/// a failed host allocation retries once with plain malloc, swapping the
/// allocator handle so later `align_length`/`utils` calls agree. GPU
/// allocations never fall back.
pub fn allocate_with_fallback(
    allocator: &mut Box<dyn Allocator>,
    len: usize,
    align: usize,
) -> Result<MemoryBlock> {
    match allocator.allocate(len, align) {
        Ok(block) => Ok(block),
        Err(e) if allocator.kind().is_host() && !matches!(allocator.kind(), MemoryKind::Malloc) => {
            log::info!("{} allocation failed ({e}), falling back to malloc", allocator.kind());
            *allocator = Box::new(MallocAllocator);
            allocator.allocate(len, align)
        }
        Err(e) => Err(e),
    }
}

struct MallocAllocator;

impl Allocator for MallocAllocator {
    fn kind(&self) -> MemoryKind {
        MemoryKind::Malloc
    }

    fn allocate(&self, len: usize, align: usize) -> Result<MemoryBlock> {
        if len == 0 {
            return Err(Error::invalid_argument("zero-length allocation"));
        }
        let align = align.max(std::mem::align_of::<usize>()).next_power_of_two();
        let layout = Layout::from_size_align(len, align)
            .map_err(|e| Error::invalid_argument(format!("bad layout: {e}")))?;
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| Error::Io(format!("malloc of {len} bytes failed")))?;
        Ok(MemoryBlock {
            ptr,
            len,
            kind: MemoryKind::Malloc,
            backing: Backing::Malloc { layout },
        })
    }

    fn align_length(&self, len: usize) -> usize {
        util::round_up(len, util::page_size())
    }

    fn utils(&self) -> Arc<dyn MemoryUtils> {
        Arc::new(HostMemoryUtils)
    }
}

const HUGE_PAGE_2M: usize = 2 * 1024 * 1024;
const HUGE_PAGE_512M: usize = 512 * 1024 * 1024;
const HUGE_PAGE_1G: usize = 1024 * 1024 * 1024;
#[cfg(target_os = "linux")]
const MAP_HUGE_SHIFT: i32 = 26;

struct HugePagesAllocator {
    page_size: usize,
}

impl HugePagesAllocator {
    fn new(explicit: Option<usize>) -> Result<Self> {
        let page_size = match explicit {
            Some(size) => {
                if ![HUGE_PAGE_2M, HUGE_PAGE_512M, HUGE_PAGE_1G].contains(&size) {
                    return Err(Error::invalid_argument(format!(
                        "unsupported huge page size {size}"
                    )));
                }
                size
            }
            // 64 KiB base-page kernels expose 512 MiB huge pages
            None if util::page_size() == 64 * 1024 => HUGE_PAGE_512M,
            None => HUGE_PAGE_2M,
        };
        Ok(HugePagesAllocator { page_size })
    }
}

impl Allocator for HugePagesAllocator {
    fn kind(&self) -> MemoryKind {
        MemoryKind::HugePages {
            page_size: Some(self.page_size),
        }
    }

    #[cfg(target_os = "linux")]
    fn allocate(&self, len: usize, _align: usize) -> Result<MemoryBlock> {
        if len == 0 {
            return Err(Error::invalid_argument("zero-length allocation"));
        }
        let mapped_len = util::round_up(len, self.page_size);
        let huge_flag = (self.page_size.trailing_zeros() as i32) << MAP_HUGE_SHIFT;
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB | huge_flag,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(Error::Io(format!(
                "mmap of {mapped_len} huge-page bytes failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        let ptr = NonNull::new(raw as *mut u8)
            .ok_or_else(|| Error::Io("mmap returned null".into()))?;
        Ok(MemoryBlock {
            ptr,
            len,
            kind: self.kind(),
            backing: Backing::HugePages { mapped_len },
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn allocate(&self, _len: usize, _align: usize) -> Result<MemoryBlock> {
        Err(Error::unsupported("huge pages on this platform"))
    }

    fn align_length(&self, len: usize) -> usize {
        util::round_up(len, self.page_size)
    }

    fn utils(&self) -> Arc<dyn MemoryUtils> {
        Arc::new(HostMemoryUtils)
    }
}

#[cfg(test)]
mod allocator_test {
    use super::*;

    #[test]
    fn test_malloc_allocate_and_zero() {
        let allocator = new_allocator(MemoryKind::Malloc).unwrap();
        let block = allocator.allocate(4096, 64).unwrap();
        assert_eq!(block.len(), 4096);
        assert_eq!(block.as_ptr() as usize % 64, 0);
        let first = unsafe { *block.as_ptr() };
        assert_eq!(first, 0);
    }

    #[test]
    fn test_zero_length_rejected() {
        let allocator = new_allocator(MemoryKind::Malloc).unwrap();
        assert!(allocator.allocate(0, 64).is_err());
    }

    #[test]
    fn test_align_length_is_page_multiple() {
        let allocator = new_allocator(MemoryKind::Malloc).unwrap();
        let aligned = allocator.align_length(1);
        assert_eq!(aligned % util::page_size(), 0);
        assert!(aligned >= 1);
    }

    #[test]
    fn test_huge_page_size_selection() {
        let allocator = HugePagesAllocator::new(None).unwrap();
        assert!(allocator.page_size == HUGE_PAGE_2M || allocator.page_size == HUGE_PAGE_512M);
        let allocator = HugePagesAllocator::new(Some(HUGE_PAGE_1G)).unwrap();
        assert_eq!(allocator.page_size, HUGE_PAGE_1G);
        assert!(HugePagesAllocator::new(Some(12345)).is_err());
    }

    #[test]
    fn test_fallback_to_malloc() {
        // huge pages are typically not reserved in CI; fallback must hand
        // back a malloc block and swap the allocator kind
        let mut allocator = new_allocator(MemoryKind::HugePages { page_size: None }).unwrap();
        let block = allocate_with_fallback(&mut allocator, 8192, 64).unwrap();
        assert_eq!(block.len(), 8192);
        assert!(matches!(
            block.kind(),
            MemoryKind::Malloc | MemoryKind::HugePages { .. }
        ));
        assert_eq!(block.kind(), allocator.kind());
    }

    #[test]
    fn test_host_utils_set_and_copy() {
        let allocator = new_allocator(MemoryKind::Malloc).unwrap();
        let block = allocator.allocate(64, 64).unwrap();
        let utils = allocator.utils();
        unsafe {
            utils.memory_set(block.as_ptr(), 0xAB, 64).unwrap();
            assert_eq!(*block.as_ptr().add(63), 0xAB);
            let src = [1u8, 2, 3, 4];
            utils.memory_copy(block.as_ptr(), src.as_ptr(), 4).unwrap();
            assert_eq!(*block.as_ptr(), 1);
            assert_eq!(*block.as_ptr().add(3), 4);
        }
    }
}
