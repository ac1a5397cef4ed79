//! Encryption-plan selection strategies.
//!
//! Each file written to an encrypted container gets its own *plan*: an
//! ordered list of symmetric stages, each applied over the output of the
//! previous one. Plans are chosen per file so that no two files in a
//! container need share a cipher chain.

use rand::Rng;
use rand::rngs::OsRng;

use super::SymAlgorithm;

/// Fewest stages a plan may carry.
pub const MIN_STAGES: usize = 2;

/// Most stages a plan may carry.
pub const MAX_STAGES: usize = 4;

/// Strategy for choosing a file's encryption plan.
///
/// Implementations must return between [`MIN_STAGES`] and [`MAX_STAGES`]
/// stages; the writer rejects plans outside that range.
pub trait StagePicker: Send {
    /// Chooses the stage chain for the next file.
    fn pick(&mut self) -> Vec<SymAlgorithm>;
}

/// The default picker: a uniform stage count and independent uniform
/// algorithm draws from the OS random source.
#[derive(Debug, Default)]
pub struct RandomPicker;

impl StagePicker for RandomPicker {
    fn pick(&mut self) -> Vec<SymAlgorithm> {
        let count = OsRng.gen_range(MIN_STAGES..=MAX_STAGES);
        (0..count)
            .map(|_| SymAlgorithm::ALL[OsRng.gen_range(0..SymAlgorithm::ALL.len())])
            .collect()
    }
}

/// A picker that returns the same plan for every file.
///
/// Intended for tests and for callers that need reproducible containers.
#[derive(Debug, Clone)]
pub struct FixedPicker {
    plan: Vec<SymAlgorithm>,
}

impl FixedPicker {
    /// Creates a picker that always returns `plan`.
    pub fn new(plan: Vec<SymAlgorithm>) -> Self {
        Self { plan }
    }
}

impl StagePicker for FixedPicker {
    fn pick(&mut self) -> Vec<SymAlgorithm> {
        self.plan.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_picker_stays_in_range() {
        let mut picker = RandomPicker;
        for _ in 0..200 {
            let plan = picker.pick();
            assert!((MIN_STAGES..=MAX_STAGES).contains(&plan.len()));
        }
    }

    #[test]
    fn test_random_picker_varies() {
        let mut picker = RandomPicker;
        let plans: Vec<_> = (0..32).map(|_| picker.pick()).collect();
        // 32 identical draws from a uniform picker would be astronomically
        // unlikely.
        assert!(plans.iter().any(|p| p != &plans[0]));
    }

    #[test]
    fn test_fixed_picker_repeats() {
        let plan = vec![SymAlgorithm::ChaCha20, SymAlgorithm::Aes256Cbc];
        let mut picker = FixedPicker::new(plan.clone());
        assert_eq!(picker.pick(), plan);
        assert_eq!(picker.pick(), plan);
    }
}
