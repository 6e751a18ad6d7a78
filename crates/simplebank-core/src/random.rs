//! Fixture data generator.
//!
//! Each test owns its generator, so runs are reproducible from a seed and no
//! process-wide random state is shared between tests.

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::models::Currency;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

pub struct RandomGen {
    rng: StdRng,
}

impl RandomGen {
    pub fn seeded(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }

    pub fn from_entropy() -> Self {
        Self { rng: StdRng::from_entropy() }
    }

    /// Integer in `min..=max`.
    pub fn int(&mut self, min: i64, max: i64) -> i64 {
        self.rng.gen_range(min..=max)
    }

    pub fn string(&mut self, len: usize) -> String {
        (0..len)
            .map(|_| ALPHABET[self.rng.gen_range(0..ALPHABET.len())] as char)
            .collect()
    }

    pub fn owner(&mut self) -> String {
        let len = self.int(6, 12) as usize;
        self.string(len)
    }

    pub fn money(&mut self) -> i64 {
        self.int(0, 1000)
    }

    pub fn currency(&mut self) -> Currency {
        Currency::ALL[self.rng.gen_range(0..Currency::ALL.len())]
    }

    pub fn email(&mut self) -> String {
        format!("{}@email.com", self.string(8))
    }
}
