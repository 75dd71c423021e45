use std::collections::HashSet;
use std::ops::RangeInclusive;

use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{EngineError, EngineResult};

pub const PORT_RANGE: RangeInclusive<u16> = 3000..=63000;
pub const SHORT_ID_LEN: usize = 7;

const IMAGE_NAMESPACE: &str = "dockyard";
const RANDOM_ATTEMPTS: usize = 64;

fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (index, part) in parts.iter().enumerate() {
        if index > 0 {
            hasher.update([0_u8]);
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Identity of a `(repository, branch)` pair: 64 lowercase hex characters.
#[must_use]
pub fn service_id(repository: &str, branch: &str) -> String {
    sha256_hex(&[repository, branch])
}

/// Registry key of a repository's access key; shared by every branch.
#[must_use]
pub fn repository_key_id(repository: &str) -> String {
    sha256_hex(&[repository])
}

/// Container name and generated host label. Truncation collisions are not detected.
#[must_use]
pub fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID_LEN).unwrap_or(id)
}

#[must_use]
pub fn container_name(id: &str) -> String {
    short_id(id).to_string()
}

#[must_use]
pub fn image_name(id: &str) -> String {
    format!("{IMAGE_NAMESPACE}/{id}")
}

#[must_use]
pub fn default_domain(id: &str, base_domain: &str) -> String {
    format!("{}.{base_domain}", short_id(id))
}

#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(PORT_RANGE)
    }
}

impl PortAllocator {
    #[must_use]
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self { range }
    }

    #[must_use]
    pub fn range(&self) -> &RangeInclusive<u16> {
        &self.range
    }

    /// Picks a random port outside `in_use`, scanning the range when random picks keep colliding.
    ///
    /// # Errors
    /// Returns [`EngineError::ConfigurationError`] when every port in the range is taken.
    pub fn allocate(&self, in_use: &HashSet<u16>) -> EngineResult<u16> {
        let mut rng = rand::thread_rng();
        for _ in 0..RANDOM_ATTEMPTS {
            let candidate = rng.gen_range(self.range.clone());
            if !in_use.contains(&candidate) {
                return Ok(candidate);
            }
        }

        self.range
            .clone()
            .find(|candidate| !in_use.contains(candidate))
            .ok_or_else(|| {
                EngineError::ConfigurationError(format!(
                    "no free port left in {}..={}",
                    self.range.start(),
                    self.range.end()
                ))
            })
    }

    #[must_use]
    pub fn reserve(&self, in_use: HashSet<u16>) -> PortReservation<'_> {
        PortReservation {
            allocator: self,
            in_use,
        }
    }
}

/// Allocation session that also avoids ports handed out earlier in the same session.
#[derive(Debug)]
pub struct PortReservation<'a> {
    allocator: &'a PortAllocator,
    in_use: HashSet<u16>,
}

impl PortReservation<'_> {
    /// # Errors
    /// Returns an error when the allocation range is exhausted.
    pub fn next_port(&mut self) -> EngineResult<u16> {
        let port = self.allocator.allocate(&self.in_use)?;
        self.in_use.insert(port);
        Ok(port)
    }

    /// Marks a port already owned by the service being configured.
    pub fn keep(&mut self, port: u16) {
        self.in_use.insert(port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_id_is_deterministic_and_branch_sensitive() {
        let main = service_id("org/repo", "main");
        assert_eq!(main, service_id("org/repo", "main"));
        assert_eq!(main.len(), 64);
        assert!(main.chars().all(|ch| ch.is_ascii_hexdigit()));

        assert_ne!(main, service_id("org/repo", "develop"));
        assert_ne!(main, service_id("org/other", "main"));
    }

    #[test]
    fn service_id_separates_repository_from_branch() {
        assert_ne!(service_id("org/ab", "c"), service_id("org/a", "bc"));
    }

    #[test]
    fn repository_key_id_ignores_branch() {
        assert_eq!(repository_key_id("org/repo"), repository_key_id("org/repo"));
        assert_ne!(repository_key_id("org/repo"), service_id("org/repo", "main"));
    }

    #[test]
    fn names_derive_from_identity() {
        let id = service_id("org/repo", "main");
        assert_eq!(container_name(&id), &id[..7]);
        assert_eq!(image_name(&id), format!("dockyard/{id}"));
        assert_eq!(default_domain(&id, "local"), format!("{}.local", &id[..7]));
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn allocate_stays_in_range_and_avoids_used_ports() {
        let allocator = PortAllocator::new(4000..=4003);
        let in_use = HashSet::from([4000, 4001, 4003]);
        for _ in 0..20 {
            assert_eq!(allocator.allocate(&in_use).expect("port"), 4002);
        }
    }

    #[test]
    fn allocate_fails_when_range_is_exhausted() {
        let allocator = PortAllocator::new(4000..=4001);
        let in_use = HashSet::from([4000, 4001]);
        let error = allocator.allocate(&in_use).expect_err("exhausted");
        assert!(matches!(error, EngineError::ConfigurationError(_)));
    }

    #[test]
    fn reservation_never_repeats_a_port() {
        let allocator = PortAllocator::new(5000..=5009);
        let mut reservation = allocator.reserve(HashSet::new());
        reservation.keep(5000);

        let mut seen = HashSet::from([5000]);
        for _ in 0..9 {
            let port = reservation.next_port().expect("port");
            assert!(allocator.range().contains(&port));
            assert!(seen.insert(port), "port {port} handed out twice");
        }
        assert!(reservation.next_port().is_err());
    }
}
