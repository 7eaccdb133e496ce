//! Cash-out detector
//!
//! Follows every broadcast payment until its transaction reaches the
//! cash-out threshold, then claims the settlement and completes the
//! operation. A transaction the chain reader does not know (yet, or any
//! more after a reorg) is simply unseen for this poll.

use crate::chain::ChainGateway;
use crate::core::EngineResult;
use crate::detector::{deliver, redeliver_pending, InFlightKeys, PollReport, SettlementSink};
use crate::storage::{
    OperationStatus, OperationStore, PaymentOperation, SettlementKind, SettlementRecord,
    SettlementStage, SettlementStore,
};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;

pub struct CashOutDetector {
    chain: ChainGateway,
    operations: Arc<dyn OperationStore>,
    settlements: Arc<dyn SettlementStore>,
    sink: Arc<dyn SettlementSink>,
    threshold: u32,
    in_flight: InFlightKeys,
    concurrency: usize,
}

impl CashOutDetector {
    pub fn new(
        chain: ChainGateway,
        operations: Arc<dyn OperationStore>,
        settlements: Arc<dyn SettlementStore>,
        sink: Arc<dyn SettlementSink>,
        threshold: u32,
    ) -> Self {
        Self {
            chain,
            operations,
            settlements,
            sink,
            threshold,
            in_flight: InFlightKeys::new(),
            concurrency: 4,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// One poll cycle over every broadcast operation
    pub async fn poll(&self) -> EngineResult<PollReport> {
        let mut report = redeliver_pending(
            self.settlements.as_ref(),
            self.sink.as_ref(),
            SettlementKind::CashOut,
        )
        .await?;

        let pending = self.operations.list_broadcasted().await?;
        let results: Vec<(String, EngineResult<PollReport>)> = stream::iter(pending)
            .map(|operation| async move {
                let id = operation.operation_id.clone();
                (id, self.poll_operation(operation).await)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (operation_id, result) in results {
            match result {
                Ok(op_report) => report.merge(op_report),
                Err(e) => {
                    log::warn!("Cash-out poll for operation {} failed: {}", operation_id, e);
                    report.failures += 1;
                }
            }
        }

        log::debug!("Cash-out poll: {:?}", report);
        Ok(report)
    }

    async fn poll_operation(&self, operation: PaymentOperation) -> EngineResult<PollReport> {
        let mut report = PollReport::default();
        let _guard = match self.in_flight.try_enter(&operation.operation_id).await {
            Some(guard) => guard,
            None => {
                report.keys_skipped += 1;
                return Ok(report);
            }
        };
        report.keys_polled += 1;

        let tx_id = match &operation.status {
            OperationStatus::Broadcasted { tx_id } => tx_id.clone(),
            _ => return Ok(report),
        };

        let info = match self.chain.transaction(&tx_id).await? {
            Some(info) => info,
            None => {
                log::debug!("Cash-out {} not visible yet", tx_id);
                return Ok(report);
            }
        };
        if info.confirmations < self.threshold {
            return Ok(report);
        }

        let record = SettlementRecord {
            tx_id: tx_id.clone(),
            operation_id: operation.operation_id.clone(),
            kind: SettlementKind::CashOut,
            stage: SettlementStage::Final,
            address: operation.source.clone(),
            amount: operation.amount,
            confirmations: info.confirmations,
            delivered: false,
            detected_at: Utc::now(),
        };
        if self.settlements.insert_if_absent(record.clone()).await? {
            if deliver(self.settlements.as_ref(), self.sink.as_ref(), &record).await? {
                report.settled += 1;
            } else {
                report.failures += 1;
            }
        }

        let operation_id = operation.operation_id.clone();
        self.operations
            .upsert(PaymentOperation {
                status: OperationStatus::Completed { tx_id },
                ..operation
            })
            .await?;
        self.in_flight.forget(&operation_id).await;
        Ok(report)
    }
}
