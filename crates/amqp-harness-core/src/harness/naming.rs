//! Collision-resistant names for per-test routing resources.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Generates `<prefix>-<16 hex digits>` names from its own random source.
///
/// Each harness owns one, so parallel tests never share generator state.
#[derive(Debug, Clone)]
pub struct NameGenerator {
    rng: StdRng,
}

impl NameGenerator {
    /// Generator seeded from the operating system.
    #[must_use]
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic generator, for reproducible tests.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Append a random 64-bit suffix, rendered as zero-padded lowercase hex.
    pub fn randomise(&mut self, prefix: &str) -> String {
        format!("{prefix}-{:016x}", self.rng.gen::<u64>())
    }
}

impl Default for NameGenerator {
    fn default() -> Self {
        Self::from_entropy()
    }
}
