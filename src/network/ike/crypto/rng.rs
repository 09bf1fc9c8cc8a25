//! Injectable randomness source for padding bytes, IVs, nonces and DH
//! private exponents (spec §9): cryptographically irrelevant which bytes
//! padding uses, but test vectors and reproducible fault-injection need the
//! source to be swappable.

/// Minimal CSPRNG contract. `ring::rand::SecureRandom` already has this
/// exact shape; this trait just lets test code substitute a fixed byte
/// stream without pulling `ring` into test-only code paths.
pub trait SecureRandomSource: Send + Sync {
    fn fill(&mut self, dest: &mut [u8]) -> Result<(), ()>;
}

/// Default production source, backed by `ring`'s OS CSPRNG.
pub struct SystemRandomSource(ring::rand::SystemRandom);

impl Default for SystemRandomSource {
    fn default() -> Self {
        SystemRandomSource(ring::rand::SystemRandom::new())
    }
}

impl SecureRandomSource for SystemRandomSource {
    fn fill(&mut self, dest: &mut [u8]) -> Result<(), ()> {
        use ring::rand::SecureRandom;
        self.0.fill(dest).map_err(|_| ())
    }
}

/// Deterministic source for tests: repeats a fixed byte pattern.
#[cfg(test)]
pub struct FixedRandomSource {
    pub pattern: Vec<u8>,
    pub cursor: usize,
}

#[cfg(test)]
impl FixedRandomSource {
    pub fn new(pattern: Vec<u8>) -> Self {
        FixedRandomSource { pattern, cursor: 0 }
    }
}

#[cfg(test)]
impl SecureRandomSource for FixedRandomSource {
    fn fill(&mut self, dest: &mut [u8]) -> Result<(), ()> {
        for b in dest.iter_mut() {
            *b = self.pattern[self.cursor % self.pattern.len()];
            self.cursor += 1;
        }
        Ok(())
    }
}
