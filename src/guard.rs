use std::cell::Cell;
use std::marker::PhantomData;

// Const-initialized so touching it never allocates or registers a destructor.
thread_local! {
    static RECORDING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as busy recording a sample.
///
/// While a guard is alive, allocations and frees made by the profiler on this
/// thread (stack capture, map growth, snapshot copies) are not recorded.
pub struct ReentrancyGuard {
    // Tied to the thread that set the flag.
    _not_send: PhantomData<*const ()>,
}

impl ReentrancyGuard {
    /// Returns `None` if this thread is already recording, or if its
    /// thread-local storage has been torn down.
    pub fn enter() -> Option<Self> {
        let entered = RECORDING
            .try_with(|flag| {
                if flag.get() {
                    false
                } else {
                    flag.set(true);
                    true
                }
            })
            .unwrap_or(false);

        entered.then(|| Self {
            _not_send: PhantomData,
        })
    }

    #[cfg(test)]
    pub(crate) fn is_recording() -> bool {
        RECORDING.try_with(Cell::get).unwrap_or(true)
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        let _ = RECORDING.try_with(|flag| flag.set(false));
    }
}
