//! Collector pacing.
//!
//! At the end of every cycle the controller picks the heap size at which the
//! next cycle starts. The starting point is the heap goal (live bytes times the
//! goal percentage). From it we subtract the growth expected while marking
//! runs, estimated from the allocation rate and the duration of the last mark
//! phase, and a proportional-integral correction driven by how far the
//! previous cycles overshot or undershot the goal.

use crate::lua_vm::lua_limits::GC_TRIGGER_TERMS;

// Ziegler-Nichols tuning of the PI controller
const KU: f64 = 0.9;
const TU: f64 = 2.5;
const KP: f64 = 0.45 * KU;
const TI: f64 = 0.8 * TU;
const KI: f64 = 0.54 * KU / TI;

/// Allocation intervals shorter than this give no usable rate estimate.
const DURATION_THRESHOLD: f64 = 1e-3;

const TERM_LIMIT: f64 = 1_000_000.0;

/// Live bytes scaled by the goal percentage.
#[inline]
fn heap_goal(total_bytes: usize, goal: u32) -> usize {
    total_bytes.saturating_mul(goal as usize) / 100
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PacingState {
    trigger_terms: [i32; GC_TRIGGER_TERMS],
    trigger_term_pos: usize,
    trigger_integral: i32,

    pub atomic_start_total_bytes: usize,
    pub end_total_bytes: usize,
    pub heap_goal_bytes: usize,

    pub start_timestamp: f64,
    pub atomic_start_timestamp: f64,
    pub end_timestamp: f64,
}

impl Default for PacingState {
    fn default() -> Self {
        Self::new()
    }
}

impl PacingState {
    pub fn new() -> Self {
        Self {
            trigger_terms: [0; GC_TRIGGER_TERMS],
            trigger_term_pos: 0,
            trigger_integral: 0,
            atomic_start_total_bytes: 0,
            end_total_bytes: 0,
            heap_goal_bytes: 0,
            start_timestamp: 0.0,
            atomic_start_timestamp: 0.0,
            end_timestamp: 0.0,
        }
    }

    pub fn begin_cycle(&mut self, now: f64) {
        self.start_timestamp = now;
    }

    pub fn enter_atomic(&mut self, now: f64, total_bytes: usize) {
        self.atomic_start_timestamp = now;
        self.atomic_start_total_bytes = total_bytes;
    }

    /// Close a cycle that left `total_bytes` live and return the threshold at
    /// which the next one should start.
    pub fn end_cycle(&mut self, now: f64, total_bytes: usize, goal: u32) -> usize {
        let heap_goal = heap_goal(total_bytes, goal);
        let trigger = self.heap_trigger(total_bytes, heap_goal, goal);

        self.heap_goal_bytes = heap_goal;
        self.end_total_bytes = total_bytes;
        self.end_timestamp = now;
        trigger
    }

    /// Record a cycle whose timing says nothing about the mutator, such as a
    /// forced full collection.
    pub fn end_forced_cycle(&mut self, now: f64, total_bytes: usize, goal: u32) {
        self.heap_goal_bytes = heap_goal(total_bytes, goal);
        self.end_total_bytes = total_bytes;
        self.end_timestamp = now;
        self.atomic_start_total_bytes = 0;
    }

    fn heap_trigger(&mut self, total_bytes: usize, heap_goal: usize, goal: u32) -> usize {
        let error_offset = self.trigger_error_offset(total_bytes, goal);

        let allocation_duration = self.atomic_start_timestamp - self.end_timestamp;
        let expected_growth =
            if self.has_observed_cycle() && allocation_duration >= DURATION_THRESHOLD {
                let allocated = self
                    .atomic_start_total_bytes
                    .saturating_sub(self.end_total_bytes) as f64;
                let allocation_rate = allocated / allocation_duration;
                let mark_duration = self.atomic_start_timestamp - self.start_timestamp;
                allocation_rate * mark_duration
            } else {
                0.0
            };

        let trigger = heap_goal as f64 - (expected_growth + error_offset);
        if trigger < total_bytes as f64 {
            total_bytes
        } else if trigger > heap_goal as f64 {
            heap_goal
        } else {
            trigger as usize
        }
    }

    #[inline]
    fn has_observed_cycle(&self) -> bool {
        self.atomic_start_total_bytes != 0 && self.end_total_bytes != 0
    }

    /// Push the error of the cycle that just ended and return the PI
    /// correction in bytes.
    fn trigger_error_offset(&mut self, total_bytes: usize, goal: u32) -> f64 {
        if !self.has_observed_cycle() {
            return 0.0;
        }

        // percentage points of growth over the goal, relative to the last cycle end
        let observed =
            self.atomic_start_total_bytes as f64 * 100.0 / self.end_total_bytes as f64;
        let term = (observed - goal as f64).round().clamp(-TERM_LIMIT, TERM_LIMIT) as i32;
        self.push_trigger_term(term);

        (KP * term as f64 + KI * self.trigger_integral as f64) * total_bytes as f64 / 100.0
    }

    fn push_trigger_term(&mut self, term: i32) {
        let displaced = self.trigger_terms[self.trigger_term_pos];
        self.trigger_terms[self.trigger_term_pos] = term;
        self.trigger_term_pos = (self.trigger_term_pos + 1) % GC_TRIGGER_TERMS;
        self.trigger_integral = self.trigger_integral - displaced + term;
    }

    pub fn trigger_integral(&self) -> i32 {
        self.trigger_integral
    }

    pub fn trigger_terms(&self) -> &[i32; GC_TRIGGER_TERMS] {
        &self.trigger_terms
    }
}
