// Hash-chained commit ledger (single parent, append-only).
// Each marker links to the previous marker's state hash; the first links to ZERO_HASH.

use crate::pipeline::StageResult;
use crate::state::{hex_hash, state_hash, Hash, State, ZERO_HASH};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("state hash mismatch at marker {sequence}")]
    HashMismatch { sequence: u64 },
    #[error("prev_hash does not link to predecessor at marker {sequence}")]
    ChainBroken { sequence: u64 },
    #[error("sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },
    #[error("range {start}..={end} outside ledger of {len} markers")]
    RangeOutOfBounds { start: u64, end: u64, len: u64 },
}

impl LedgerError {
    /// Range errors are caller mistakes; everything else means tampering or a bug.
    pub fn is_integrity_fault(&self) -> bool {
        !matches!(self, LedgerError::RangeOutOfBounds { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitMarker {
    pub sequence: u64,
    #[serde(with = "hex_hash")]
    pub prev_hash: Hash,
    #[serde(with = "hex_hash")]
    pub state_hash: Hash,
    pub stage_results: Vec<StageResult>,
    pub timestamp_ms: u64,
}

/// A marker plus the state it finalised, so hashes can be recomputed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub marker: CommitMarker,
    pub state: State,
}

#[derive(Debug, Default, Clone)]
pub struct HashChainLedger {
    records: Vec<LedgerRecord>,
}

impl HashChainLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted records; the whole chain must verify.
    pub fn from_records(records: Vec<LedgerRecord>) -> Result<Self, LedgerError> {
        let ledger = Self { records };
        if !ledger.is_empty() {
            ledger.verify_detailed(1..=ledger.len())?;
        }
        Ok(ledger)
    }

    /// Load records without checking them. Audit tooling only: nothing loaded
    /// this way should be trusted before `verify` passes.
    pub fn load_unverified(records: Vec<LedgerRecord>) -> Self {
        Self { records }
    }

    pub fn append(
        &mut self,
        state: State,
        stage_results: Vec<StageResult>,
        timestamp_ms: u64,
    ) -> CommitMarker {
        let marker = CommitMarker {
            sequence: self.len() + 1,
            prev_hash: self.tip_hash(),
            state_hash: state_hash(&state),
            stage_results,
            timestamp_ms,
        };
        self.records.push(LedgerRecord {
            marker: marker.clone(),
            state,
        });
        marker
    }

    pub fn len(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn tip(&self) -> Option<&CommitMarker> {
        self.records.last().map(|r| &r.marker)
    }

    /// State hash of the tip, or the genesis constant when empty.
    pub fn tip_hash(&self) -> Hash {
        self.tip().map(|m| m.state_hash).unwrap_or(ZERO_HASH)
    }

    pub fn get(&self, sequence: u64) -> Option<&LedgerRecord> {
        if sequence == 0 {
            return None;
        }
        self.records.get((sequence - 1) as usize)
    }

    pub fn records(&self) -> &[LedgerRecord] {
        &self.records
    }

    pub fn markers(&self) -> impl Iterator<Item = &CommitMarker> {
        self.records.iter().map(|r| &r.marker)
    }

    pub fn verify(&self, range: RangeInclusive<u64>) -> bool {
        self.verify_detailed(range).is_ok()
    }

    pub fn verify_all(&self) -> Result<(), LedgerError> {
        if self.is_empty() {
            return Ok(());
        }
        self.verify_detailed(1..=self.len())
    }

    /// Recompute each state hash in the range and check every back-link,
    /// including the link from the first marker in the range to its predecessor.
    pub fn verify_detailed(&self, range: RangeInclusive<u64>) -> Result<(), LedgerError> {
        let (start, end) = (*range.start(), *range.end());
        if start == 0 || start > end || end > self.len() {
            return Err(LedgerError::RangeOutOfBounds {
                start,
                end,
                len: self.len(),
            });
        }

        let mut expected_prev = if start == 1 {
            ZERO_HASH
        } else {
            self.records[(start - 2) as usize].marker.state_hash
        };

        for seq in start..=end {
            let record = &self.records[(seq - 1) as usize];
            let marker = &record.marker;
            if marker.sequence != seq {
                return Err(LedgerError::SequenceGap {
                    expected: seq,
                    found: marker.sequence,
                });
            }
            if marker.prev_hash != expected_prev {
                return Err(LedgerError::ChainBroken { sequence: seq });
            }
            if state_hash(&record.state) != marker.state_hash {
                return Err(LedgerError::HashMismatch { sequence: seq });
            }
            expected_prev = marker.state_hash;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn flip_hash_byte(&mut self, sequence: u64, byte: usize) {
        self.records[(sequence - 1) as usize].marker.state_hash[byte] ^= 0x01;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::Constants;
    use crate::transition::{apply, Event};

    fn ledger_of(n: usize) -> HashChainLedger {
        let c = Constants::default();
        let mut ledger = HashChainLedger::new();
        let mut s = State::genesis(&c);
        for i in 0..n {
            s = apply(s, Event::Release, &c).unwrap();
            ledger.append(s, Vec::new(), 1_000 + i as u64);
        }
        ledger
    }

    #[test]
    fn first_marker_links_to_genesis() {
        let ledger = ledger_of(1);
        let m = ledger.tip().unwrap();
        assert_eq!(m.sequence, 1);
        assert_eq!(m.prev_hash, ZERO_HASH);
        assert_eq!(m.state_hash, state_hash(&ledger.get(1).unwrap().state));
    }

    #[test]
    fn markers_chain_by_state_hash() {
        let ledger = ledger_of(4);
        let markers: Vec<_> = ledger.markers().collect();
        for w in markers.windows(2) {
            assert_eq!(w[1].prev_hash, w[0].state_hash);
        }
        assert!(ledger.verify(1..=4));
        assert!(ledger.verify(2..=3));
    }

    #[test]
    fn flipping_a_historical_hash_byte_is_detected() {
        for byte in [0usize, 13, 31] {
            let mut ledger = ledger_of(5);
            ledger.records[2].marker.state_hash[byte] ^= 0x01;
            assert!(!ledger.verify(1..=5));
            assert!(!ledger.verify(3..=3));
            assert_eq!(
                ledger.verify_detailed(1..=5),
                Err(LedgerError::HashMismatch { sequence: 3 })
            );
            // A range starting right after still sees the broken back-link.
            assert_eq!(
                ledger.verify_detailed(4..=5),
                Err(LedgerError::ChainBroken { sequence: 4 })
            );
            assert!(ledger.verify(1..=2));
        }
    }

    #[test]
    fn altered_state_is_detected() {
        let mut ledger = ledger_of(3);
        ledger.records[0].state.entropy = 0.5;
        assert_eq!(
            ledger.verify_detailed(1..=3),
            Err(LedgerError::HashMismatch { sequence: 1 })
        );
    }

    #[test]
    fn out_of_range_is_not_verified() {
        let ledger = ledger_of(2);
        assert!(!ledger.verify(0..=1));
        assert!(!ledger.verify(1..=3));
        let err = ledger.verify_detailed(2..=1).unwrap_err();
        assert!(!err.is_integrity_fault());
    }

    #[test]
    fn from_records_refuses_tampered_chain() {
        let ledger = ledger_of(3);
        let mut records = ledger.records().to_vec();
        assert!(HashChainLedger::from_records(records.clone()).is_ok());
        records[1].marker.prev_hash = ZERO_HASH;
        assert_eq!(
            HashChainLedger::from_records(records).unwrap_err(),
            LedgerError::ChainBroken { sequence: 2 }
        );
    }

    #[test]
    fn marker_json_uses_hex_hashes() {
        let ledger = ledger_of(1);
        let json = serde_json::to_value(ledger.tip().unwrap()).unwrap();
        assert_eq!(json["prev_hash"], "0".repeat(64));
        let back: CommitMarker = serde_json::from_value(json).unwrap();
        assert_eq!(&back, ledger.tip().unwrap());
    }
}
