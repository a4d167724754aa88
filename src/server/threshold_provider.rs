//! Threshold key material for reconfiguration (spec.md §4.3: "each replica
//! reads its own new share from a well-defined index"). Regenerating a
//! threshold key set is a trusted-dealer operation — the new shares must be
//! delivered to each replica privately, never over the consensus wire, so
//! this is deliberately a pluggable out-of-band contract rather than
//! something `NodeManager`'s message flow carries.
//!
//! `StaticThresholdKeyProvider` is the dealer for same-process clusters (the
//! scenario tests and the in-process demo harness): one dealer instance is
//! constructed once, handed a clone per replica, and each clone answers only
//! for its own index. A networked deployment would instead back this trait
//! with a keystore file an operator's dealer tool populates ahead of the
//! ceremony (see DESIGN.md).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::OsRng;

use crate::crypto::{generate_shares, ThresholdPublicKey, ThresholdSecretShare};
use crate::error::{OrdererError, Result};

pub trait ThresholdKeyProvider: Send + Sync {
    /// Returns this replica's share of the key set sized for `total_nodes`,
    /// generating and caching that key set the first time any replica asks
    /// for a given size.
    fn share_for(&self, total_nodes: usize) -> Result<(ThresholdSecretShare, ThresholdPublicKey)>;
}

struct Dealt {
    public_key: ThresholdPublicKey,
    shares: Vec<ThresholdSecretShare>,
}

/// Shared among every in-process replica; each replica's `StaticThresholdKeyProvider`
/// handle knows only its own index and defers generation to whichever replica
/// asks first for a given cluster size.
pub struct StaticThresholdKeyProvider {
    self_index: usize,
    dealt: Arc<Mutex<HashMap<usize, Dealt>>>,
}

impl StaticThresholdKeyProvider {
    /// Builds `total_nodes` handles sharing one dealer; the key set itself is
    /// dealt lazily on the first `share_for` call for a given size.
    pub fn bootstrap(total_nodes: usize) -> Result<Vec<Arc<Self>>> {
        let dealt = Arc::new(Mutex::new(HashMap::new()));
        Ok((0..total_nodes)
            .map(|i| {
                Arc::new(Self {
                    self_index: i,
                    dealt: dealt.clone(),
                })
            })
            .collect())
    }
}

impl ThresholdKeyProvider for StaticThresholdKeyProvider {
    fn share_for(&self, total_nodes: usize) -> Result<(ThresholdSecretShare, ThresholdPublicKey)> {
        let mut dealt = self.dealt.lock();
        if !dealt.contains_key(&total_nodes) {
            let mut rng = OsRng;
            let f = total_nodes.saturating_sub(1) / 3;
            let threshold = 2 * f + 1;
            let (public_key, shares) = generate_shares(&mut rng, threshold, total_nodes)?;
            dealt.insert(total_nodes, Dealt { public_key, shares });
        }
        let entry = dealt.get(&total_nodes).expect("just inserted above");
        let share = entry
            .shares
            .get(self.self_index)
            .copied()
            .ok_or_else(|| OrdererError::Configuration(format!("no threshold share for index {}", self.self_index)))?;
        Ok((share, entry.public_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ThresholdSigner;

    #[test]
    fn same_total_returns_same_dealt_key_set_across_replicas() {
        let providers = StaticThresholdKeyProvider::bootstrap(4).unwrap();
        let (share_a, pk_a) = providers[0].share_for(4).unwrap();
        let (share_b, pk_b) = providers[1].share_for(4).unwrap();
        assert!(pk_a == pk_b);
        assert_ne!(share_a.index(), share_b.index());

        let signer_a = ThresholdSigner::new(share_a, pk_a);
        let signer_b = ThresholdSigner::new(share_b, pk_b);
        assert_ne!(signer_a.signer_index(), signer_b.signer_index());
    }

    #[test]
    fn resized_total_deals_a_fresh_key_set() {
        let providers = StaticThresholdKeyProvider::bootstrap(4).unwrap();
        let (_, pk4) = providers[0].share_for(4).unwrap();
        let (_, pk5) = providers[0].share_for(5).unwrap();
        assert!(pk4 != pk5);
    }
}
