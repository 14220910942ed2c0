// ============ Collector Metrics ============
// Read-only statistics about completed and in-progress cycles.

/// Timing and work counters of one collection cycle. Times are in seconds
/// relative to the collector clock, sizes in bytes.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GcCycleMetrics {
    pub start_total_bytes: usize,
    pub heap_trigger_bytes: usize,

    pub pause_time: f64,
    pub start_timestamp: f64,
    pub end_timestamp: f64,

    pub mark_time: f64,
    pub mark_assist_time: f64,
    pub mark_max_explicit_time: f64,
    pub mark_explicit_steps: usize,
    pub mark_work: usize,

    pub atomic_start_timestamp: f64,
    pub atomic_start_total_bytes: usize,
    pub atomic_time: f64,

    pub sweep_time: f64,
    pub sweep_assist_time: f64,
    pub sweep_max_explicit_time: f64,
    pub sweep_explicit_steps: usize,
    pub sweep_work: usize,

    pub assist_work: usize,
    pub explicit_work: usize,

    pub propagate_work: usize,
    pub propagate_again_work: usize,

    pub end_total_bytes: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GcMetrics {
    pub step_explicit_time_acc: f64,
    pub step_assist_time_acc: f64,
    /// When cycle is completed, last cycle values are updated
    pub completed_cycles: u64,
    pub last_cycle: GcCycleMetrics,
    pub curr_cycle: GcCycleMetrics,
}

impl GcMetrics {
    pub(crate) fn begin_cycle(&mut self, now: f64, total_bytes: usize, trigger: usize) {
        let pause_time = now - self.last_cycle.end_timestamp;
        self.curr_cycle = GcCycleMetrics {
            start_total_bytes: total_bytes,
            heap_trigger_bytes: trigger,
            pause_time,
            start_timestamp: now,
            ..Default::default()
        };
    }

    pub(crate) fn finish_cycle(&mut self, now: f64, total_bytes: usize) {
        self.curr_cycle.end_timestamp = now;
        self.curr_cycle.end_total_bytes = total_bytes;
        self.last_cycle = std::mem::take(&mut self.curr_cycle);
        self.completed_cycles += 1;
    }

    /// Short human readable report of the last completed cycle.
    pub fn summary(&self) -> String {
        let mut buf = itoa::Buffer::new();
        let cycle = &self.last_cycle;
        let mut out = String::with_capacity(160);
        out.push_str("cycles=");
        out.push_str(buf.format(self.completed_cycles));
        out.push_str(" start=");
        out.push_str(buf.format(cycle.start_total_bytes));
        out.push_str(" trigger=");
        out.push_str(buf.format(cycle.heap_trigger_bytes));
        out.push_str(" atomic=");
        out.push_str(buf.format(cycle.atomic_start_total_bytes));
        out.push_str(" end=");
        out.push_str(buf.format(cycle.end_total_bytes));
        out.push_str(" mark_work=");
        out.push_str(buf.format(cycle.mark_work));
        out.push_str(" sweep_work=");
        out.push_str(buf.format(cycle.sweep_work));
        out.push_str(" assist_work=");
        out.push_str(buf.format(cycle.assist_work));
        out.push_str(" explicit_work=");
        out.push_str(buf.format(cycle.explicit_work));
        out
    }

    #[cfg(feature = "serde")]
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_rollover() {
        let mut metrics = GcMetrics::default();
        metrics.begin_cycle(1.0, 4096, 4096);
        metrics.curr_cycle.mark_work = 100;
        metrics.finish_cycle(2.0, 1024);

        assert_eq!(metrics.completed_cycles, 1);
        assert_eq!(metrics.last_cycle.mark_work, 100);
        assert_eq!(metrics.last_cycle.end_total_bytes, 1024);
        assert_eq!(metrics.curr_cycle, GcCycleMetrics::default());

        let summary = metrics.summary();
        assert!(summary.starts_with("cycles=1 start=4096"));
        assert!(summary.contains("end=1024"));
    }
}
