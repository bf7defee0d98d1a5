//! Container base-name generation.

use rand::RngCore;
use std::fmt::Write as _;

/// Generates globally unique 32-character lowercase-hex object IDs for
/// container base names.
#[derive(Debug, Default)]
pub struct ObjectIdGenerator;

impl ObjectIdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// A fresh 32-character hex ID from 16 random bytes.
    #[must_use]
    pub fn next_id(&self) -> String {
        let mut bytes = [0_u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let mut out = String::with_capacity(32);
        for byte in bytes {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_canonical_hex() {
        let generator = ObjectIdGenerator::new();
        let id = generator.next_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }

    #[test]
    fn ids_do_not_collide_in_practice() {
        let generator = ObjectIdGenerator::new();
        let ids: HashSet<String> = (0..1000).map(|_| generator.next_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
