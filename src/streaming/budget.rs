//! GPU memory budget for the residency cache
//!
//! A single byte counter covering resident grids and bytes reserved by
//! uploads that have not been published yet. The cache owns the budget and
//! only mutates it while holding its lock.

/// GPU byte budget with a configurable ceiling
#[derive(Debug, Clone)]
pub struct MemoryBudget {
    /// Maximum bytes allowed
    ceiling_bytes: u64,
    /// Bytes held by published entries and open reservations
    charged_bytes: u64,
}

impl MemoryBudget {
    /// Create a new budget
    ///
    /// # Arguments
    /// * `ceiling_bytes` - Maximum GPU bytes the cache may hold
    pub fn new(ceiling_bytes: u64) -> Self {
        Self {
            ceiling_bytes,
            charged_bytes: 0,
        }
    }

    // --- Tracking methods ---

    /// Charge bytes against the budget
    ///
    /// Callers check [`MemoryBudget::fits`] first; charging never fails.
    pub fn charge(&mut self, bytes: u64) {
        self.charged_bytes = self.charged_bytes.saturating_add(bytes);
    }

    /// Refund previously charged bytes
    pub fn refund(&mut self, bytes: u64) {
        self.charged_bytes = self.charged_bytes.saturating_sub(bytes);
    }

    /// Replace the ceiling
    pub fn set_ceiling(&mut self, ceiling_bytes: u64) {
        self.ceiling_bytes = ceiling_bytes;
    }

    // --- Query methods ---

    pub fn ceiling(&self) -> u64 {
        self.ceiling_bytes
    }

    pub fn charged(&self) -> u64 {
        self.charged_bytes
    }

    /// Bytes still available under the ceiling
    pub fn available(&self) -> u64 {
        self.ceiling_bytes.saturating_sub(self.charged_bytes)
    }

    /// Memory pressure (0.0 to 1.0+)
    ///
    /// Values above 0.9 indicate high pressure.
    /// Values above 1.0 indicate over-budget (only after the ceiling was lowered).
    pub fn pressure(&self) -> f32 {
        if self.ceiling_bytes == 0 {
            return 0.0;
        }
        self.charged_bytes as f32 / self.ceiling_bytes as f32
    }

    // --- Decision methods ---

    /// Whether `bytes` more can be charged without exceeding the ceiling
    pub fn fits(&self, bytes: u64) -> bool {
        self.available() >= bytes
    }

    /// Whether `bytes` could ever fit, with nothing else charged
    pub fn can_ever_fit(&self, bytes: u64) -> bool {
        bytes <= self.ceiling_bytes
    }

    /// Bytes that must be freed before `bytes` fit
    pub fn shortfall(&self, bytes: u64) -> u64 {
        self.charged_bytes
            .saturating_add(bytes)
            .saturating_sub(self.ceiling_bytes)
    }
}
