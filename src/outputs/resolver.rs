//! Unspent Output Resolver
//!
//! Effective spendable set of an address: what the chain reader reports as
//! unspent, minus everything the output ledger currently excludes. Upstream
//! failures are surfaced, never papered over with older data.

use crate::chain::ChainGateway;
use crate::core::{sort_for_selection, total_value, EngineResult, Output};
use crate::outputs::ledger::OutputLedger;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;

pub struct UnspentOutputResolver {
    chain: ChainGateway,
    ledger: Arc<OutputLedger>,
}

impl UnspentOutputResolver {
    pub fn new(chain: ChainGateway, ledger: Arc<OutputLedger>) -> Self {
        Self { chain, ledger }
    }

    /// Effective unspent outputs of `address` with at least
    /// `min_confirmations`, ordered value descending then outpoint ascending
    pub async fn resolve(&self, address: &str, min_confirmations: u32) -> EngineResult<Vec<Output>> {
        let reported = self.chain.unspent_outputs(address, min_confirmations).await?;
        let excluded = self.ledger.excluded_outpoints(Utc::now()).await?;

        let mut seen = HashSet::new();
        let mut outputs: Vec<Output> = reported
            .into_iter()
            .filter(|o| o.confirmations >= min_confirmations)
            .filter(|o| o.is_owned_by(address))
            .filter(|o| seen.insert(o.outpoint.clone()))
            .filter(|o| !excluded.contains(&o.outpoint))
            .collect();

        sort_for_selection(&mut outputs);
        Ok(outputs)
    }

    /// Sum of the effective unspent set
    pub async fn balance(&self, address: &str, min_confirmations: u32) -> EngineResult<u64> {
        Ok(total_value(&self.resolve(address, min_confirmations).await?))
    }

    pub fn chain(&self) -> &ChainGateway {
        &self.chain
    }

    pub fn ledger(&self) -> &Arc<OutputLedger> {
        &self.ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::core::EngineError;
    use crate::outputs::ledger::RetentionPolicy;
    use crate::storage::MemoryOutputRecords;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn setup(policy: RetentionPolicy) -> (Arc<MemoryChain>, Arc<OutputLedger>, UnspentOutputResolver) {
        let chain = Arc::new(MemoryChain::new(100));
        let ledger = Arc::new(OutputLedger::new(
            Arc::new(MemoryOutputRecords::new()),
            Arc::new(MemoryOutputRecords::new()),
            policy,
        ));
        let gateway = ChainGateway::new(chain.clone(), Duration::from_secs(1));
        let resolver = UnspentOutputResolver::new(gateway, ledger.clone());
        (chain, ledger, resolver)
    }

    #[tokio::test]
    async fn test_resolve_filters_and_orders() {
        let (chain, _, resolver) = setup(RetentionPolicy::default());
        let small = chain.fund("A", 100, 6).await;
        let big = chain.fund("A", 900, 6).await;
        chain.fund("A", 5_000, 0).await;
        chain.fund("B", 7_000, 6).await;

        let outputs = resolver.resolve("A", 1).await.unwrap();
        assert_eq!(outputs, vec![big, small]);
        assert_eq!(resolver.balance("A", 1).await.unwrap(), 1_000);
        assert_eq!(resolver.balance("A", 0).await.unwrap(), 6_000);
    }

    #[tokio::test]
    async fn test_ledger_entries_never_resolved() {
        let (chain, ledger, resolver) = setup(RetentionPolicy::default());
        let broadcast = chain.fund("A", 100, 6).await;
        let external = chain.fund("A", 200, 6).await;
        let free = chain.fund("A", 300, 6).await;

        ledger.mark_broadcasted(&[broadcast.clone()], "spend").await.unwrap();
        ledger.mark_externally_spent(&external).await.unwrap();

        for min_conf in [0, 1, 6] {
            let outputs = resolver.resolve("A", min_conf).await.unwrap();
            assert_eq!(outputs, vec![free.clone()]);
        }
    }

    #[tokio::test]
    async fn test_duplicate_reports_collapsed() {
        let (chain, _, resolver) = setup(RetentionPolicy::default());
        chain.fund("A", 100, 6).await;
        chain.set_report_duplicates(true).await;

        assert_eq!(resolver.resolve("A", 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upstream_failure_surfaces() {
        let (chain, _, resolver) = setup(RetentionPolicy::default());
        chain.fund("A", 100, 6).await;
        chain.set_unavailable(true).await;

        let err = resolver.resolve("A", 0).await.unwrap_err();
        assert!(matches!(err, EngineError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn test_abandoned_broadcast_self_heals() {
        let (chain, ledger, resolver) = setup(RetentionPolicy::from_days(2, 7, false));
        let out = chain.fund("A", 500, 6).await;
        let t = Utc::now() - ChronoDuration::days(3);

        ledger.mark_broadcasted_at(&[out.clone()], "never-mined", t).await.unwrap();
        let report = ledger.sweep_expired(Utc::now()).await.unwrap();
        assert_eq!(report.expired_broadcasts, vec![out.outpoint.clone()]);

        assert_eq!(resolver.resolve("A", 0).await.unwrap(), vec![out]);
    }
}
