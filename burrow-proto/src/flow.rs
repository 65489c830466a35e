//! Coarse pause/resume flow control for a tunnel session.
//!
//! This is deliberately not TCP-grade congestion control. The session adds
//! every transmitted packet's bytes to the gauge and subtracts bytes as the
//! peer acknowledges them; dequeuing of *new* outbound data stops at the
//! high-water mark and resumes only once the gauge falls back to the
//! strictly lower low-water mark. Control messages and retransmissions are
//! never gated. The two thresholds form a hysteresis band so steady
//! throughput near the limit flips the state once, not every packet.

/// Tracks a session's aggregate unacknowledged bytes against a high/low
/// water mark pair.
#[derive(Debug)]
pub struct FlowGauge {
    unacked_bytes: usize,
    paused: bool,
    high_water: usize,
    low_water: usize,
}

impl FlowGauge {
    /// Panics if `low_water` is not strictly below `high_water`; equal marks
    /// would turn the hysteresis band into an oscillator.
    pub fn new(high_water: usize, low_water: usize) -> Self {
        if low_water >= high_water {
            panic!("low water mark {low_water} must be strictly below high water mark {high_water}");
        }

        Self {
            unacked_bytes: 0,
            paused: false,
            high_water,
            low_water,
        }
    }

    pub fn unacked_bytes(&self) -> usize {
        self.unacked_bytes
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Accounts for a newly transmitted packet.
    pub fn on_sent(&mut self, bytes: usize) {
        self.unacked_bytes += bytes;
    }

    /// Accounts for packets released by a peer acknowledgement.
    pub fn on_released(&mut self, bytes: usize) {
        self.unacked_bytes = self.unacked_bytes.saturating_sub(bytes);
    }

    /// Checked before dequeuing each new outbound packet. Trips the pause at
    /// the high-water mark; once tripped, stays tripped until
    /// [`FlowGauge::try_resume`] succeeds, even if the gauge transiently
    /// dips back under the mark.
    pub fn should_pause(&mut self) -> bool {
        if !self.paused && self.unacked_bytes >= self.high_water {
            self.paused = true;
        }

        self.paused
    }

    /// Checked on the status tick. Clears the pause once the gauge is at or
    /// below the low-water mark; returns whether transmission just resumed.
    pub fn try_resume(&mut self) -> bool {
        if self.paused && self.unacked_bytes <= self.low_water {
            self.paused = false;
            return true;
        }

        false
    }
}
