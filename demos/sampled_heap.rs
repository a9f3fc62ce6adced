//! Sample a program's heap and print the biggest live allocation sites.
//!
//! Run with: SAMPLING_HEAP_PROFILER_INTERVAL=8192 cargo run --example sampled_heap

use sampling_heap_profiler::{
    ProfilerConfig, Sample, SamplingAllocator, SamplingHeapProfiler, symbolize,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: SamplingAllocator = SamplingAllocator::system();

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ProfilerConfig::from_env()?;
    let profiler = Arc::new(SamplingHeapProfiler::new(config).with_hooks(&GLOBAL));
    let watermark = profiler.start()?;

    // Vec without capacity - will reallocate
    let mut items = Vec::new();
    for i in 0..100_000u64 {
        items.push(i);
    }

    // Many small strings
    let strings: Vec<String> = (0..20_000).map(|i| format!("Item {}", i)).collect();

    // Short-lived buffers, freed before the snapshot
    for _ in 0..100 {
        let scratch = vec![0u8; 64 * 1024];
        std::hint::black_box(&scratch);
    }

    let samples = profiler.get_samples(watermark);
    profiler.stop()?;

    let estimated: usize = samples.iter().map(Sample::estimated_bytes).sum();
    info!(
        samples = samples.len(),
        estimated_live_bytes = estimated,
        "heap snapshot taken"
    );

    let mut sites: HashMap<&[usize], usize> = HashMap::new();
    for sample in &samples {
        *sites.entry(&*sample.stack).or_default() += sample.estimated_bytes();
    }
    let mut sites: Vec<_> = sites.into_iter().collect();
    sites.sort_by(|a, b| b.1.cmp(&a.1));

    for (stack, bytes) in sites.into_iter().take(5) {
        let frames = symbolize(stack);
        let frame = frames
            .iter()
            .find(|f| f.contains("sampled_heap"))
            .or(frames.first())
            .map(String::as_str)
            .unwrap_or("<unknown>");
        println!("{:>10.2} KB  {}", bytes as f64 / 1024.0, frame);
    }

    std::hint::black_box((items.len(), strings.len()));
    Ok(())
}
