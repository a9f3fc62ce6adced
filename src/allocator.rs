use crate::error::ProfilerError;
use crate::profiler::SamplingHeapProfiler;
use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Routes allocation events of the process to a profiler.
///
/// Called once per profiler, on its first `start()`. Installation cannot be
/// undone.
pub trait HookInstaller: Send + Sync {
    fn install(&self, profiler: Arc<SamplingHeapProfiler>) -> Result<(), ProfilerError>;
}

/// Installer for embedders that feed `on_alloc`/`on_free` themselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualHooks;

impl HookInstaller for ManualHooks {
    fn install(&self, _profiler: Arc<SamplingHeapProfiler>) -> Result<(), ProfilerError> {
        Ok(())
    }
}

/// Global allocator that forwards to `A` and reports to a profiler.
///
/// ```no_run
/// use sampling_heap_profiler::{ProfilerConfig, SamplingAllocator, SamplingHeapProfiler};
/// use std::sync::Arc;
///
/// #[global_allocator]
/// static GLOBAL: SamplingAllocator = SamplingAllocator::system();
///
/// fn main() {
///     let profiler =
///         Arc::new(SamplingHeapProfiler::new(ProfilerConfig::default()).with_hooks(&GLOBAL));
///     let watermark = profiler.start().expect("hooks available");
///     // ...
///     let samples = profiler.get_samples(watermark);
///     println!("{} live samples", samples.len());
/// }
/// ```
///
/// Until a profiler is installed it is a plain pass-through.
pub struct SamplingAllocator<A = System> {
    inner: A,
    profiler: AtomicPtr<SamplingHeapProfiler>,
}

impl SamplingAllocator<System> {
    pub const fn system() -> Self {
        Self::new(System)
    }
}

impl<A> SamplingAllocator<A> {
    pub const fn new(inner: A) -> Self {
        Self {
            inner,
            profiler: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn is_installed(&self) -> bool {
        !self.profiler.load(Ordering::Acquire).is_null()
    }

    #[inline]
    fn profiler(&self) -> Option<&SamplingHeapProfiler> {
        let profiler = self.profiler.load(Ordering::Acquire);
        // SAFETY: set once from Arc::into_raw and never released, so the
        // profiler lives for the rest of the process.
        unsafe { profiler.as_ref() }
    }
}

impl<A> HookInstaller for &'static SamplingAllocator<A>
where
    A: GlobalAlloc + Send + Sync,
{
    fn install(&self, profiler: Arc<SamplingHeapProfiler>) -> Result<(), ProfilerError> {
        let raw = Arc::as_ptr(&profiler).cast_mut();
        match self.profiler.compare_exchange(
            ptr::null_mut(),
            raw,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // The allocator keeps this reference for the rest of the process.
                let _ = Arc::into_raw(profiler);
                Ok(())
            }
            Err(existing) if ptr::eq(existing, raw) => Ok(()),
            Err(_) => Err(ProfilerError::AlreadyInstalled),
        }
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for SamplingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: forwarded with the caller's layout
        let ptr = unsafe { self.inner.alloc(layout) };
        if !ptr.is_null() {
            if let Some(profiler) = self.profiler() {
                profiler.on_alloc(ptr as usize, layout.size());
            }
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: forwarded with the caller's layout
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };
        if !ptr.is_null() {
            if let Some(profiler) = self.profiler() {
                profiler.on_alloc(ptr as usize, layout.size());
            }
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // Must run before the address can be handed out again.
        if let Some(profiler) = self.profiler() {
            profiler.on_free(ptr as usize);
        }
        // SAFETY: ptr/layout come from this allocator, which got them from inner
        unsafe { self.inner.dealloc(ptr, layout) };
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let profiler = self.profiler();
        if let Some(profiler) = profiler {
            profiler.on_free(ptr as usize);
        }
        // SAFETY: ptr/layout come from this allocator, which got them from inner
        let new_ptr = unsafe { self.inner.realloc(ptr, layout, new_size) };
        // On failure the old block stays live but unsampled from here on.
        if !new_ptr.is_null() {
            if let Some(profiler) = profiler {
                profiler.on_alloc(new_ptr as usize, new_size);
            }
        }
        new_ptr
    }
}
