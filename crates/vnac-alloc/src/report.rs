//! Human-readable memory reporting.

use std::fmt;

use crate::Allocator;

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;

/// Formats a byte count with B/KB/MB/GB units (three decimals above 1 KB).
pub fn format_byte_size(bytes: u64) -> String {
    if bytes > GB {
        format!("{:.3}GB", bytes as f64 / GB as f64)
    } else if bytes > MB {
        format!("{:.3}MB", bytes as f64 / MB as f64)
    } else if bytes > KB {
        format!("{:.3}KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes}B")
    }
}

/// The memory outcome of a compilation run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryReport {
    /// Bytes occupied when emission finished.
    pub used: u64,
    /// Peak bytes required by the plan.
    pub needed: u64,
}

impl MemoryReport {
    /// Snapshots an allocator's usage counters.
    pub fn from_allocator(alloc: &dyn Allocator) -> Self {
        Self {
            used: alloc.memory_used(),
            needed: alloc.memory_needed(),
        }
    }
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} RAM used", format_byte_size(self.used))?;
        write!(f, "{} RAM needed", format_byte_size(self.needed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SequentialAllocator;
    use vnac_graph::ElementType;

    #[test]
    fn unit_boundaries() {
        assert_eq!(format_byte_size(0), "0B");
        assert_eq!(format_byte_size(512), "512B");
        assert_eq!(format_byte_size(1024), "1024B");
        assert_eq!(format_byte_size(1536), "1.500KB");
        assert_eq!(format_byte_size(2 * MB), "2.000MB");
        assert_eq!(format_byte_size(3 * GB / 2), "1.500GB");
    }

    #[test]
    fn report_snapshots_allocator() {
        let mut alloc = SequentialAllocator::new();
        alloc.allocate("a", &[100], ElementType::Float32).unwrap();
        let report = MemoryReport::from_allocator(&alloc);
        assert_eq!(report.used, 400);
        assert_eq!(report.needed, 400);
        let text = format!("{report}");
        assert!(text.contains("400B RAM used"));
        assert!(text.contains("400B RAM needed"));
    }
}
