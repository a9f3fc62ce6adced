use crate::allocator::HookInstaller;
use crate::config::ProfilerConfig;
use crate::error::ProfilerError;
use crate::guard::ReentrancyGuard;
use crate::interval::{IntervalGenerator, MIN_INTERVAL};
use crate::sample::Sample;
use crate::stack::{BacktraceCapture, StackCapture};
use crate::store::SampleStore;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tracing::{debug, error, info, warn};

/// Statistical sampling heap profiler.
///
/// Every allocation adds its size to a shared byte counter. Whenever the
/// counter crosses a randomized threshold, the allocation that crossed it is
/// recorded with its call stack, and the counter starts over. Sampled
/// allocations stay in the store until they are freed.
pub struct SamplingHeapProfiler {
    config: ProfilerConfig,
    running: AtomicUsize,
    cumulative_counter: AtomicUsize,
    threshold: AtomicUsize,
    sampling_interval: AtomicUsize,
    last_ordinal: AtomicU32,
    intervals: IntervalGenerator,
    store: SampleStore,
    stack_capture: Box<dyn StackCapture>,
    hooks: Option<Box<dyn HookInstaller>>,
    hooks_installed: OnceCell<Result<(), ProfilerError>>,
}

impl Default for SamplingHeapProfiler {
    fn default() -> Self {
        Self::new(ProfilerConfig::default())
    }
}

impl SamplingHeapProfiler {
    pub fn new(config: ProfilerConfig) -> Self {
        Self {
            running: AtomicUsize::new(0),
            cumulative_counter: AtomicUsize::new(0),
            threshold: AtomicUsize::new(config.sampling_interval.max(MIN_INTERVAL)),
            sampling_interval: AtomicUsize::new(config.sampling_interval),
            last_ordinal: AtomicU32::new(0),
            intervals: IntervalGenerator::new(config.deterministic),
            store: SampleStore::new(),
            stack_capture: Box::new(BacktraceCapture),
            hooks: None,
            hooks_installed: OnceCell::new(),
            config,
        }
    }

    /// Route allocation events to this profiler through `hooks` on first start.
    #[must_use]
    pub fn with_hooks<H>(mut self, hooks: H) -> Self
    where
        H: HookInstaller + 'static,
    {
        self.hooks = Some(Box::new(hooks));
        self
    }

    #[must_use]
    pub fn with_stack_capture<S>(mut self, capture: S) -> Self
    where
        S: StackCapture + 'static,
    {
        self.stack_capture = Box::new(capture);
        self
    }

    #[must_use]
    pub fn with_interval_seed(mut self, seed: u64) -> Self {
        self.intervals = IntervalGenerator::with_seed(self.config.deterministic, seed);
        self
    }

    /// Start sampling, installing the allocation hooks on first call.
    ///
    /// Starts are reference counted. Returns the last ordinal handed out so
    /// far; pass it to [`get_samples`](Self::get_samples) to see only samples
    /// taken after this call.
    ///
    /// # Errors
    ///
    /// Returns the hook installation error if the hooks could not be
    /// installed. Installation is attempted only once per profiler.
    pub fn start(self: &Arc<Self>) -> Result<u32, ProfilerError> {
        self.install_hooks_once()?;
        let previous = self.running.fetch_add(1, Ordering::SeqCst);
        if previous == 0 {
            info!(
                sampling_interval = self.sampling_interval(),
                deterministic = self.intervals.is_deterministic(),
                "sampling heap profiler started"
            );
        } else {
            debug!(running = previous + 1, "sampling heap profiler start nested");
        }
        Ok(self.last_ordinal())
    }

    /// Drop one start reference. Sampling goes inert at zero; hooks stay installed.
    ///
    /// # Errors
    ///
    /// Returns [`ProfilerError::NotRunning`] if there is no start to balance.
    pub fn stop(&self) -> Result<(), ProfilerError> {
        let previous = self
            .running
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |running| {
                running.checked_sub(1)
            })
            .map_err(|_| {
                warn!("sampling heap profiler stopped more often than started");
                ProfilerError::NotRunning
            })?;

        if previous == 1 {
            info!(
                samples = self.sample_count(),
                last_ordinal = self.last_ordinal(),
                "sampling heap profiler stopped"
            );
        } else {
            debug!(running = previous - 1, "sampling heap profiler stop nested");
        }
        Ok(())
    }

    /// Set the mean interval used for future thresholds.
    ///
    /// The threshold already in effect is left alone; the new mean applies
    /// from the next sample on.
    pub fn set_sampling_interval(&self, mean_bytes: usize) {
        self.sampling_interval.store(mean_bytes, Ordering::Release);
        debug!(sampling_interval = mean_bytes, "sampling interval updated");
    }

    pub fn set_deterministic_mode_for_testing(&self, deterministic: bool) {
        self.intervals.set_deterministic(deterministic);
        debug!(deterministic, "deterministic sampling mode toggled");
    }

    /// Called after every allocation of `size` bytes at `address`.
    #[inline]
    pub fn on_alloc(&self, address: usize, size: usize) {
        if self.running.load(Ordering::Relaxed) == 0 {
            return;
        }

        // Lock-free: the thread whose addition crosses the threshold is the
        // only one that records the sample and resets the counter.
        let threshold = self.threshold.load(Ordering::Acquire);
        let accumulated = self
            .cumulative_counter
            .fetch_add(size, Ordering::Relaxed)
            .saturating_add(size);
        if accumulated < threshold {
            return;
        }

        // Some other thread crossed the threshold and owns this sample.
        if accumulated >= threshold.saturating_add(size) {
            return;
        }

        let next_interval = self
            .intervals
            .next_interval(self.sampling_interval.load(Ordering::Acquire));
        self.threshold.store(next_interval, Ordering::Release);
        let total_allocated = self.cumulative_counter.swap(0, Ordering::Relaxed);

        self.record_alloc(total_allocated, size, address);
    }

    /// Called before the allocation at `address` is handed back to the allocator.
    ///
    /// Frees are honoured while stopped so that samples kept across a stop
    /// are still retired.
    #[inline]
    pub fn on_free(&self, address: usize) {
        if self.store.might_contain(address) {
            self.record_free(address);
        }
    }

    /// Copies of the live samples whose ordinal is greater than `min_ordinal`.
    ///
    /// Returns nothing when called from inside a stack capture on the
    /// recording thread.
    pub fn get_samples(&self, min_ordinal: u32) -> Vec<Sample> {
        let Some(_guard) = ReentrancyGuard::enter() else {
            return Vec::new();
        };
        self.store.snapshot(min_ordinal)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) > 0
    }

    pub fn last_ordinal(&self) -> u32 {
        self.last_ordinal.load(Ordering::Acquire)
    }

    pub fn sampling_interval(&self) -> usize {
        self.sampling_interval.load(Ordering::Acquire)
    }

    pub fn sample_count(&self) -> usize {
        let Some(_guard) = ReentrancyGuard::enter() else {
            return 0;
        };
        self.store.len()
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    fn install_hooks_once(self: &Arc<Self>) -> Result<(), ProfilerError> {
        self.hooks_installed
            .get_or_init(|| {
                let result = match &self.hooks {
                    Some(hooks) => hooks.install(Arc::clone(self)),
                    None => Err(ProfilerError::HooksUnavailable),
                };
                match &result {
                    Ok(()) => info!("allocation hooks installed"),
                    Err(e) => error!(error = %e, "failed to install allocation hooks"),
                }
                result
            })
            .clone()
    }

    fn record_alloc(&self, total_allocated: usize, size: usize, address: usize) {
        // A sample triggered while this thread is already recording one is dropped.
        let Some(_guard) = ReentrancyGuard::enter() else {
            return;
        };

        // Captured before taking the store lock: unwinders have locks of their
        // own, and `symbolize` allocates while holding them.
        let stack = self
            .stack_capture
            .capture(self.config.skip_frames, self.config.max_stack_depth);
        let count = (total_allocated.saturating_add(size / 2) / size.max(1)).max(1);

        self.store.insert_with(address, || {
            let ordinal = self.last_ordinal.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
            Sample::new(size, count, ordinal, stack)
        });
    }

    fn record_free(&self, address: usize) {
        let Some(_guard) = ReentrancyGuard::enter() else {
            return;
        };
        drop(self.store.remove(address));
    }
}
