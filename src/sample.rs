use serde::{Deserialize, Serialize};

/// One sampled, still-live allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Exact size of the sampled allocation in bytes.
    pub size: usize,
    /// How many allocations of `size` bytes this sample stands in for.
    pub count: usize,
    /// Capture order. Strictly increasing across the lifetime of a profiler.
    pub ordinal: u32,
    /// Raw return addresses, innermost frame first.
    pub stack: Box<[usize]>,
}

impl Sample {
    pub fn new(size: usize, count: usize, ordinal: u32, stack: Vec<usize>) -> Self {
        Self {
            size,
            count,
            ordinal,
            stack: stack.into_boxed_slice(),
        }
    }

    /// Bytes of live heap this sample accounts for.
    pub fn estimated_bytes(&self) -> usize {
        self.size.saturating_mul(self.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimated_bytes_scales_size_by_count() {
        let sample = Sample::new(100, 10, 1, vec![0x1000, 0x2000]);
        assert_eq!(sample.estimated_bytes(), 1000);
        assert_eq!(&*sample.stack, &[0x1000, 0x2000]);
    }

    #[test]
    fn serializes_flat_fields() {
        let sample = Sample::new(64, 2, 7, vec![0xabc]);
        let json = serde_json::to_value(&sample).unwrap();

        assert_eq!(json["size"], 64);
        assert_eq!(json["count"], 2);
        assert_eq!(json["ordinal"], 7);
        assert_eq!(json["stack"], serde_json::json!([0xabc]));
    }
}
