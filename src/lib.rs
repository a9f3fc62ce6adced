//! Statistical sampling heap profiler.
//!
//! Install [`SamplingAllocator`] as the global allocator, hand it to a
//! [`SamplingHeapProfiler`] and call [`SamplingHeapProfiler::start`]. About one
//! allocation per `sampling_interval` bytes is recorded with its call stack;
//! [`SamplingHeapProfiler::get_samples`] returns the ones still alive.
//! Summing `size * count` over those samples estimates the live heap.

pub mod allocator;
pub mod config;
pub mod error;
pub mod guard;
pub mod interval;
pub mod profiler;
pub mod sample;
pub mod stack;
pub mod store;

pub use allocator::{HookInstaller, ManualHooks, SamplingAllocator};
pub use config::ProfilerConfig;
pub use error::ProfilerError;
pub use profiler::SamplingHeapProfiler;
pub use sample::Sample;
pub use stack::{BacktraceCapture, StackCapture, symbolize};
