// Canonical state vector and its hashing material.
// Everything here is plain data; transitions live in `transition`.

use crate::constants::Constants;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type Hash = [u8; 32];

/// Genesis marker: prev_hash = all-zeroes means no parent.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Ordered stability bands. Derived from entropy, never set directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stability {
    Stable,
    Warning,
    Unstable,
    Collapsed,
}

impl Stability {
    pub fn tag(self) -> u8 {
        match self {
            Stability::Stable => 0,
            Stability::Warning => 1,
            Stability::Unstable => 2,
            Stability::Collapsed => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stability::Stable => "stable",
            Stability::Warning => "warning",
            Stability::Unstable => "unstable",
            Stability::Collapsed => "collapsed",
        }
    }
}

impl std::fmt::Display for Stability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Draft execution mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Private staging copy; the only mode the gate lets through.
    Sim,
    /// Already promoted; re-submitting it is rejected.
    Live,
    /// Sandbox used while re-deriving history.
    Replay,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub tick: u64,
    pub cycle: u64,
    pub entropy: f64,
    pub boundary: f64,
    pub stability: Stability,
}

impl State {
    pub fn genesis(constants: &Constants) -> Self {
        State {
            tick: 0,
            cycle: 0,
            entropy: 0.0,
            boundary: constants.b2,
            stability: Stability::Stable,
        }
    }

    /// Byte layout fed to the state hash:
    /// version(1) | tick(8) | cycle(8) | entropy bits(8) | boundary bits(8) | stability(1)
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 8 + 8 + 8 + 8 + 1);
        out.push(crate::PROTOCOL_VERSION);
        out.extend_from_slice(&self.tick.to_le_bytes());
        out.extend_from_slice(&self.cycle.to_le_bytes());
        out.extend_from_slice(&self.entropy.to_bits().to_le_bytes());
        out.extend_from_slice(&self.boundary.to_bits().to_le_bytes());
        out.push(self.stability.tag());
        out
    }

    /// Bitwise equality; `PartialEq` on f64 would treat -0.0 and 0.0 as equal
    /// while their hashes differ.
    pub fn same_bits(&self, other: &State) -> bool {
        self.canonical_bytes() == other.canonical_bytes()
    }
}

pub fn state_hash(state: &State) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(state.canonical_bytes());
    hasher.finalize().into()
}

/// Serde adapter that writes hashes as lowercase hex.
pub mod hex_hash {
    use super::Hash;
    use hex::FromHex;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &Hash, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Hash, D::Error> {
        let raw = String::deserialize(d)?;
        <[u8; 32]>::from_hex(raw.as_str())
            .map_err(|_| serde::de::Error::custom("invalid hash hex (expected 32 bytes)"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_is_stable_with_full_boundary() {
        let c = Constants::default();
        let g = State::genesis(&c);
        assert_eq!(g.tick, 0);
        assert_eq!(g.cycle, 0);
        assert_eq!(g.stability, Stability::Stable);
        assert_eq!(g.boundary, c.b2);
    }

    #[test]
    fn hash_covers_every_field() {
        let c = Constants::default();
        let base = State::genesis(&c);
        let h = state_hash(&base);

        let mut s = base;
        s.tick = 1;
        assert_ne!(state_hash(&s), h);

        let mut s = base;
        s.entropy = 0.12;
        assert_ne!(state_hash(&s), h);

        let mut s = base;
        s.stability = Stability::Warning;
        assert_ne!(state_hash(&s), h);
    }

    #[test]
    fn negative_zero_differs_bitwise() {
        let c = Constants::default();
        let a = State::genesis(&c);
        let mut b = a;
        b.entropy = -0.0;
        assert_eq!(a, b);
        assert!(!a.same_bits(&b));
    }

    #[test]
    fn stability_orders_by_severity() {
        assert!(Stability::Stable < Stability::Warning);
        assert!(Stability::Warning < Stability::Unstable);
        assert!(Stability::Unstable < Stability::Collapsed);
    }
}
