// src/consensus/quorum.rs
// BFT quorum arithmetic and agreement collection.

use super::PeerStatus;
use crate::chain::{Address, Blockchain};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};

/// Agreements needed to tolerate `f` byzantine validators: 2f + 1.
pub fn quorum_for(f: usize) -> usize {
    2 * f + 1
}

/// Round-robin pick: `candidates[index mod len]`.
pub fn round_robin(candidates: &[Address], index: u64) -> Option<&Address> {
    if candidates.is_empty() {
        return None;
    }
    candidates.get((index % candidates.len() as u64) as usize)
}

/// Source of peer agreements on the local head.
pub trait AgreementCollector: Send + Sync {
    /// Distinct peers agreeing with the tip of `chain`.
    fn collect_agreements(&self, chain: &Blockchain, peers: &[PeerStatus]) -> Vec<String>;
}

/// Agreement votes keyed by block hash.
///
/// Empty until votes are recorded, so a PBFT strategy backed by a fresh
/// book never reaches quorum on its own.
#[derive(Default)]
pub struct VoteBook {
    votes: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl VoteBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `voter`'s agreement on `block_hash`. Returns the number of
    /// distinct voters now on that hash; repeated votes are not counted.
    pub fn record_vote(&self, block_hash: &str, voter: &str) -> usize {
        let mut votes = self.votes.write();
        let voters = votes.entry(block_hash.to_string()).or_default();
        voters.insert(voter.to_string());
        voters.len()
    }

    pub fn votes_for(&self, block_hash: &str) -> usize {
        self.votes.read().get(block_hash).map_or(0, |v| v.len())
    }

    /// Drop votes for every hash not in `keep`.
    pub fn retain_hashes(&self, keep: &[&str]) {
        self.votes.write().retain(|hash, _| keep.contains(&hash.as_str()));
    }
}

impl AgreementCollector for VoteBook {
    fn collect_agreements(&self, chain: &Blockchain, _peers: &[PeerStatus]) -> Vec<String> {
        let Some(tip) = chain.last() else {
            return Vec::new();
        };
        self.votes
            .read()
            .get(&tip.hash)
            .map(|voters| voters.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Block;
    use chrono::{DateTime, Utc};

    #[test]
    fn test_quorum_math() {
        assert_eq!(quorum_for(0), 1);
        assert_eq!(quorum_for(1), 3);
    }

    #[test]
    fn test_round_robin() {
        let c: Vec<Address> = vec!["a".into(), "b".into(), "c".into()];
        assert_eq!(round_robin(&c, 4).unwrap(), "b");
        assert!(round_robin(&[], 4).is_none());
    }

    #[test]
    fn test_vote_book_counts_distinct_voters_on_tip() {
        let t0 = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let chain = Blockchain::new(Block::genesis(t0, 1));
        let tip = chain.last().unwrap().hash.clone();

        let book = VoteBook::new();
        assert!(book.collect_agreements(&chain, &[]).is_empty());

        book.record_vote(&tip, "p1");
        assert_eq!(book.record_vote(&tip, "p1"), 1);
        book.record_vote(&tip, "p2");
        book.record_vote("other", "p3");
        assert_eq!(book.collect_agreements(&chain, &[]).len(), 2);

        book.retain_hashes(&[tip.as_str()]);
        assert_eq!(book.votes_for("other"), 0);
    }
}
