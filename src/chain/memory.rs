//! In-memory chain reader
//!
//! Holds a tiny transaction graph with block heights so confirmation depth,
//! reorgs, indexer lag and outages can be reproduced without a node. Raw
//! transactions submitted here are the hex-encoded canonical payload of an
//! [`UnsignedTransaction`], which is what [`crate::sign::PassthroughSigner`]
//! produces.

use crate::chain::{ChainError, ChainReader, TransactionInfo};
use crate::core::{
    double_sha256_hex, tagged_id, OutPoint, Output, TransactionOutput, UnsignedTransaction,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;

// =============================================================================
// Fixture
// =============================================================================

/// Highest output index a fixture may use
pub const MAX_FIXTURE_OUTPUT_INDEX: u32 = 1_023;

/// Serializable starting state for a [`MemoryChain`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainFixture {
    pub height: u64,
    #[serde(default)]
    pub outputs: Vec<FixtureOutput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureOutput {
    pub tx_id: String,
    #[serde(default)]
    pub output_index: u32,
    pub address: String,
    pub value: u64,
    #[serde(default)]
    pub confirmations: u32,
}

// =============================================================================
// Chain State
// =============================================================================

#[derive(Debug, Clone)]
struct ChainTx {
    /// `None` while in the mempool
    block_height: Option<u64>,
    inputs: Vec<OutPoint>,
    outputs: Vec<TransactionOutput>,
}

#[derive(Debug, Default)]
struct ChainState {
    height: u64,
    /// Ordered so unspent scans are deterministic
    txs: BTreeMap<String, ChainTx>,
    /// Spent outpoint -> spending transaction id
    spent: HashMap<OutPoint, String>,
    next_id: u64,
    unavailable: bool,
    /// Addresses whose unspent queries fail
    failing_addresses: HashSet<String>,
    latency: Option<Duration>,
    /// Keep reporting outputs spent by unconfirmed transactions as unspent
    indexer_lag: bool,
    report_duplicates: bool,
    /// Accept the next submission but fail to return its response
    drop_next_submit_response: bool,
}

impl ChainState {
    fn confirmations(&self, tx: &ChainTx) -> u32 {
        match tx.block_height {
            Some(h) if h <= self.height => (self.height - h + 1).min(u32::MAX as u64) as u32,
            _ => 0,
        }
    }

    fn block_for_depth(&self, confirmations: u32) -> Option<u64> {
        if confirmations == 0 {
            None
        } else {
            Some((self.height + 1).saturating_sub(confirmations as u64))
        }
    }

    fn is_reported_spent(&self, outpoint: &OutPoint) -> bool {
        match self.spent.get(outpoint) {
            None => false,
            Some(spender) => {
                if !self.indexer_lag {
                    return true;
                }
                // lagging indexers only see confirmed spends
                self.txs
                    .get(spender)
                    .map(|tx| tx.block_height.is_some())
                    .unwrap_or(true)
            }
        }
    }
}

// =============================================================================
// Memory Chain
// =============================================================================

/// In-memory [`ChainReader`]
#[derive(Debug, Default)]
pub struct MemoryChain {
    state: RwLock<ChainState>,
}

impl MemoryChain {
    /// Create an empty chain at the given height
    pub fn new(height: u64) -> Self {
        Self {
            state: RwLock::new(ChainState {
                height,
                ..Default::default()
            }),
        }
    }

    /// Build a chain from a fixture. Output indexes are bounded by
    /// [`MAX_FIXTURE_OUTPUT_INDEX`].
    pub fn from_fixture(fixture: &ChainFixture) -> Result<Self, ChainError> {
        let mut state = ChainState {
            height: fixture.height,
            ..Default::default()
        };

        for out in &fixture.outputs {
            if out.output_index > MAX_FIXTURE_OUTPUT_INDEX {
                return Err(ChainError::Rejected(format!(
                    "fixture output {}:{} exceeds index limit {}",
                    out.tx_id, out.output_index, MAX_FIXTURE_OUTPUT_INDEX
                )));
            }
            let block_height = state.block_for_depth(out.confirmations);
            let tx = state.txs.entry(out.tx_id.clone()).or_insert_with(|| ChainTx {
                block_height,
                inputs: Vec::new(),
                outputs: Vec::new(),
            });
            let index = out.output_index as usize;
            if tx.outputs.len() <= index {
                tx.outputs.resize(
                    index + 1,
                    TransactionOutput {
                        amount: 0,
                        recipient: String::new(),
                    },
                );
            }
            tx.outputs[index] = TransactionOutput {
                amount: out.value,
                recipient: out.address.clone(),
            };
        }

        Ok(Self {
            state: RwLock::new(state),
        })
    }

    /// Credit `address` with a new single-output transaction
    pub async fn fund(&self, address: &str, value: u64, confirmations: u32) -> Output {
        let mut state = self.state.write().await;
        state.next_id += 1;
        let tx_id = tagged_id("fund", &[address, state.next_id.to_string().as_str()]);
        let block_height = state.block_for_depth(confirmations);
        state.txs.insert(
            tx_id.clone(),
            ChainTx {
                block_height,
                inputs: Vec::new(),
                outputs: vec![TransactionOutput {
                    amount: value,
                    recipient: address.to_string(),
                }],
            },
        );
        Output::new(tx_id, 0, address, value, confirmations)
    }

    /// Advance the chain, confirming every mempool transaction in the first
    /// new block
    pub async fn mine(&self, blocks: u64) {
        if blocks == 0 {
            return;
        }
        let mut state = self.state.write().await;
        let next = state.height + 1;
        for tx in state.txs.values_mut() {
            if tx.block_height.is_none() {
                tx.block_height = Some(next);
            }
        }
        state.height += blocks;
    }

    /// Move a transaction so it has exactly `confirmations` at the current height
    pub async fn set_confirmations(&self, tx_id: &str, confirmations: u32) {
        let mut state = self.state.write().await;
        let block_height = state.block_for_depth(confirmations);
        if let Some(tx) = state.txs.get_mut(tx_id) {
            tx.block_height = block_height;
        }
    }

    /// Drop a transaction as a reorg would, un-spending its inputs
    pub async fn remove_transaction(&self, tx_id: &str) {
        let mut state = self.state.write().await;
        if state.txs.remove(tx_id).is_some() {
            state.spent.retain(|_, spender| spender != tx_id);
        }
    }

    /// Spend an output from outside this system
    pub async fn spend_externally(&self, outpoint: &OutPoint) -> String {
        let mut state = self.state.write().await;
        state.next_id += 1;
        let tx_id = tagged_id(
            "external",
            &[outpoint.to_string().as_str(), state.next_id.to_string().as_str()],
        );
        let block_height = Some(state.height);
        state.txs.insert(
            tx_id.clone(),
            ChainTx {
                block_height,
                inputs: vec![outpoint.clone()],
                outputs: Vec::new(),
            },
        );
        state.spent.insert(outpoint.clone(), tx_id.clone());
        tx_id
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.write().await.unavailable = unavailable;
    }

    /// Fail unspent queries for one address only
    pub async fn set_address_unavailable(&self, address: &str, unavailable: bool) {
        let mut state = self.state.write().await;
        if unavailable {
            state.failing_addresses.insert(address.to_string());
        } else {
            state.failing_addresses.remove(address);
        }
    }

    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.write().await.latency = latency;
    }

    pub async fn set_indexer_lag(&self, lag: bool) {
        self.state.write().await.indexer_lag = lag;
    }

    pub async fn set_report_duplicates(&self, duplicates: bool) {
        self.state.write().await.report_duplicates = duplicates;
    }

    pub async fn drop_next_submit_response(&self) {
        self.state.write().await.drop_next_submit_response = true;
    }

    pub async fn height(&self) -> u64 {
        self.state.read().await.height
    }

    pub async fn contains(&self, tx_id: &str) -> bool {
        self.state.read().await.txs.contains_key(tx_id)
    }

    async fn gate(&self) -> Result<(), ChainError> {
        let (unavailable, latency) = {
            let state = self.state.read().await;
            (state.unavailable, state.latency)
        };
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
        if unavailable {
            return Err(ChainError::Unavailable("memory chain offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainReader for MemoryChain {
    async fn get_unspent_outputs(
        &self,
        address: &str,
        min_confirmations: u32,
    ) -> Result<Vec<Output>, ChainError> {
        self.gate().await?;
        let state = self.state.read().await;
        if state.failing_addresses.contains(address) {
            return Err(ChainError::Unavailable(format!("no index for {}", address)));
        }

        let mut outputs = Vec::new();
        for (tx_id, tx) in &state.txs {
            let confirmations = state.confirmations(tx);
            if confirmations < min_confirmations {
                continue;
            }
            for (index, out) in tx.outputs.iter().enumerate() {
                if out.recipient != address {
                    continue;
                }
                let outpoint = OutPoint::new(tx_id.clone(), index as u32);
                if state.is_reported_spent(&outpoint) {
                    continue;
                }
                let output = Output {
                    outpoint,
                    address: address.to_string(),
                    value: out.amount,
                    confirmations,
                };
                if state.report_duplicates {
                    outputs.push(output.clone());
                }
                outputs.push(output);
            }
        }
        Ok(outputs)
    }

    async fn get_transaction(&self, tx_id: &str) -> Result<Option<TransactionInfo>, ChainError> {
        self.gate().await?;
        let state = self.state.read().await;
        Ok(state.txs.get(tx_id).map(|tx| TransactionInfo {
            tx_id: tx_id.to_string(),
            confirmations: state.confirmations(tx),
            inputs: tx.inputs.clone(),
            outputs: tx.outputs.clone(),
        }))
    }

    async fn get_best_height(&self) -> Result<u64, ChainError> {
        self.gate().await?;
        Ok(self.state.read().await.height)
    }

    async fn submit(&self, raw_hex: &str) -> Result<String, ChainError> {
        self.gate().await?;
        let raw = hex::decode(raw_hex).map_err(|e| ChainError::Rejected(e.to_string()))?;
        let payload: UnsignedTransaction = serde_json::from_slice(&raw)
            .map_err(|e| ChainError::Rejected(format!("undecodable transaction: {}", e)))?;
        let tx_id = double_sha256_hex(&raw);

        let mut state = self.state.write().await;
        if state.txs.contains_key(&tx_id) {
            return Err(ChainError::AlreadyKnown(tx_id));
        }

        for input in &payload.inputs {
            let outpoint = &input.outpoint;
            let exists = state
                .txs
                .get(&outpoint.tx_id)
                .map(|tx| (outpoint.output_index as usize) < tx.outputs.len())
                .unwrap_or(false);
            if !exists {
                return Err(ChainError::Rejected(format!("unknown input {}", outpoint)));
            }
            if state.spent.contains_key(outpoint) {
                return Err(ChainError::DoubleSpend(outpoint.to_string()));
            }
        }

        for input in &payload.inputs {
            state.spent.insert(input.outpoint.clone(), tx_id.clone());
        }
        state.txs.insert(
            tx_id.clone(),
            ChainTx {
                block_height: None,
                inputs: payload.outpoints(),
                outputs: payload.outputs.clone(),
            },
        );

        if state.drop_next_submit_response {
            state.drop_next_submit_response = false;
            return Err(ChainError::Unavailable("connection reset".to_string()));
        }
        Ok(tx_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TransactionBuilder;

    #[tokio::test]
    async fn test_fund_and_confirmations() {
        let chain = MemoryChain::new(100);
        let out = chain.fund("A", 500, 3).await;

        let unspent = chain.get_unspent_outputs("A", 0).await.unwrap();
        assert_eq!(unspent, vec![out.clone()]);
        assert!(chain.get_unspent_outputs("A", 4).await.unwrap().is_empty());

        chain.mine(2).await;
        let info = chain.get_transaction(&out.outpoint.tx_id).await.unwrap().unwrap();
        assert_eq!(info.confirmations, 5);
    }

    #[tokio::test]
    async fn test_submit_spends_and_rejects_double_spend() {
        let chain = MemoryChain::new(10);
        let out = chain.fund("A", 10_000, 6).await;

        let tx = TransactionBuilder::new()
            .add_input(&out)
            .add_output("B", 5_000)
            .fee(5_000)
            .build();
        let tx_id = chain.submit(&tx.to_hex().unwrap()).await.unwrap();
        assert!(chain.contains(&tx_id).await);
        assert!(chain.get_unspent_outputs("A", 0).await.unwrap().is_empty());

        // same bytes again: already known
        let again = chain.submit(&tx.to_hex().unwrap()).await;
        assert_eq!(again, Err(ChainError::AlreadyKnown(tx_id)));

        // different transaction over the same input
        let conflicting = TransactionBuilder::new()
            .add_input(&out)
            .add_output("C", 1_000)
            .build();
        let result = chain.submit(&conflicting.to_hex().unwrap()).await;
        assert!(matches!(result, Err(ChainError::DoubleSpend(_))));
    }

    #[tokio::test]
    async fn test_indexer_lag_reports_stale_unspent() {
        let chain = MemoryChain::new(10);
        let out = chain.fund("A", 10_000, 6).await;
        chain.set_indexer_lag(true).await;

        let tx = TransactionBuilder::new().add_input(&out).add_output("B", 1).build();
        chain.submit(&tx.to_hex().unwrap()).await.unwrap();
        assert_eq!(chain.get_unspent_outputs("A", 0).await.unwrap().len(), 1);

        chain.mine(1).await;
        assert!(chain.get_unspent_outputs("A", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reorg_removes_transaction() {
        let chain = MemoryChain::new(10);
        let out = chain.fund("A", 700, 2).await;
        chain.remove_transaction(&out.outpoint.tx_id).await;
        assert!(chain.get_transaction(&out.outpoint.tx_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fixture() {
        let fixture = ChainFixture {
            height: 50,
            outputs: vec![FixtureOutput {
                tx_id: "aa".into(),
                output_index: 1,
                address: "A".into(),
                value: 900,
                confirmations: 10,
            }],
        };
        let chain = MemoryChain::from_fixture(&fixture).unwrap();
        let unspent = chain.get_unspent_outputs("A", 1).await.unwrap();
        assert_eq!(unspent.len(), 1);
        assert_eq!(unspent[0].outpoint, OutPoint::new("aa", 1));
        assert_eq!(unspent[0].confirmations, 10);
    }

    #[test]
    fn test_fixture_rejects_huge_output_index() {
        let fixture = ChainFixture {
            height: 5,
            outputs: vec![FixtureOutput {
                tx_id: "bb".into(),
                output_index: u32::MAX - 1,
                address: "A".into(),
                value: 1,
                confirmations: 1,
            }],
        };
        assert!(matches!(
            MemoryChain::from_fixture(&fixture),
            Err(ChainError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_address_scoped_outage() {
        let chain = MemoryChain::new(10);
        chain.fund("A", 700, 2).await;
        chain.fund("B", 800, 2).await;
        chain.set_address_unavailable("A", true).await;

        assert!(chain.get_unspent_outputs("A", 0).await.is_err());
        assert_eq!(chain.get_unspent_outputs("B", 0).await.unwrap().len(), 1);

        chain.set_address_unavailable("A", false).await;
        assert_eq!(chain.get_unspent_outputs("A", 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_outage() {
        let chain = MemoryChain::new(1);
        chain.set_unavailable(true).await;
        assert!(matches!(
            chain.get_best_height().await,
            Err(ChainError::Unavailable(_))
        ));
    }
}
