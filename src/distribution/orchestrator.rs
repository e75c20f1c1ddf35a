// Batch orchestrator - drives one vault at a time through the relay
//
// Vault run:
// 1. Snapshot recipient balances (once, before any submission)
// 2. Partition the vault's recipients into numbered batches
// 3. Submit each batch, isolating failures, quoting the rate after each
// 4. Snapshot balances again
// 5. Deposit mode: split each batch's minted total pro-rata (floor) to get
//    the shares each recipient is owed and the batch dust
// 6. Reconcile every recipient and append one audit row each

use std::collections::HashMap;

use stellar_xdr::curr::ScVal;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::allocation::{allocate, Allocation};
use crate::audit::{self, AuditSink};
use crate::config::Settings;
use crate::distribution::batch::{partition, Batch, BatchState};
use crate::distribution::models::*;
use crate::error::{AllocationError, AppResult, GatewayError};
use crate::execution::contracts::decode_distribution;
use crate::execution::{ContractCall, ContractClient, TxOutcome};
use crate::input::{AccountId, DistributionMode, VaultGroup};
use crate::oracle::ConversionOracle;

#[derive(Debug, Clone)]
pub struct DistributionConfig {
    pub mode: DistributionMode,
    pub max_batch_size: usize,
}

impl From<&Settings> for DistributionConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            mode: settings.mode,
            max_batch_size: settings.max_batch_size,
        }
    }
}

type Snapshot = HashMap<AccountId, Option<i128>>;

pub struct Orchestrator {
    config: DistributionConfig,
    contracts: ContractClient,
    oracle: ConversionOracle,
    sink: AuditSink,
    run_id: Uuid,
}

impl Orchestrator {
    pub fn new(config: DistributionConfig, contracts: ContractClient, sink: AuditSink, run_id: Uuid) -> Self {
        Self {
            config,
            oracle: ConversionOracle::new(contracts.clone()),
            contracts,
            sink,
            run_id,
        }
    }

    pub fn sink(&self) -> &AuditSink {
        &self.sink
    }

    /// Run every vault in input order. A vault whose batches fail does not
    /// stop the run; audit I/O and allocation violations do.
    pub async fn run(&mut self, groups: &[VaultGroup]) -> AppResult<RunSummary> {
        info!(
            "🚀 Run {} starting: {} vault(s), mode {}, batch size {}",
            self.run_id,
            groups.len(),
            self.config.mode,
            self.config.max_batch_size
        );

        let mut summary = RunSummary::new(self.run_id);
        for group in groups {
            let report = self.run_vault(group).await?;
            summary.vaults.push(report);
        }

        Ok(summary)
    }

    #[instrument(skip(self, group), fields(vault = %group.vault, asset = %group.asset, recipients = group.len()))]
    async fn run_vault(&mut self, group: &VaultGroup) -> AppResult<VaultRunReport> {
        match group.total_requested() {
            Some(total) => info!("📦 Vault {}: {} recipient(s), {} requested", group.vault, group.len(), total),
            None => warn!("⚠️ Vault {}: {} recipient(s), requested total overflows", group.vault, group.len()),
        }

        // underlying estimates are rendered at the asset's decimals
        let asset_decimals = match self.oracle.decimals(&group.asset).await {
            Ok(decimals) => Some(decimals),
            Err(e) => {
                warn!("⚠️ Could not read decimals of asset {}: {}", group.asset, e);
                None
            }
        };

        let before = self.snapshot(&group.vault, &group.recipients).await;

        let mut report = VaultRunReport {
            vault: group.vault.clone(),
            asset: group.asset.clone(),
            recipients: group.len(),
            ..Default::default()
        };

        let batches = partition(&group.recipients, self.config.max_batch_size);
        let mut outcomes = Vec::with_capacity(batches.len());
        for batch in &batches {
            let outcome = self.run_batch(&group.vault, batch, batches.len()).await;
            report.batches_attempted += 1;
            if let BatchConfirmation::Failed(reason) = &outcome.confirmation {
                report.batches_failed += 1;
                report.failed_batches.push((batch.number, reason.clone()));
            }
            outcomes.push(outcome);
        }

        let after = self.snapshot(&group.vault, &group.recipients).await;

        let mut results = Vec::with_capacity(group.len());
        for (batch, outcome) in batches.iter().zip(&outcomes) {
            let split = match self.config.mode {
                DistributionMode::Transfer => None,
                DistributionMode::Deposit => expected_split(batch, outcome, &before, &after)?,
            };
            if let Some(allocation) = &split {
                report.dust = Some(report.dust.unwrap_or(0).saturating_add(allocation.dust));
                if let BatchConfirmation::Confirmed(declared) = &outcome.confirmation {
                    let deviating = split_deviations(allocation, declared);
                    for recipient in &deviating {
                        warn!(
                            "⚠️ Batch {}: {} received {:?}, pro-rata floor is {:?}",
                            batch.number,
                            recipient,
                            declared.get(recipient),
                            allocation.shares.iter().find(|(who, _)| who == recipient).map(|(_, s)| s)
                        );
                    }
                    report.split_deviations += deviating.len();
                }
            }

            for (idx, (recipient, requested)) in batch.recipients.iter().enumerate() {
                let shares_expected = match (&self.config.mode, &split) {
                    (DistributionMode::Transfer, _) => *requested,
                    (DistributionMode::Deposit, Some(allocation)) => {
                        allocation.shares.get(idx).map(|(_, share)| *share).unwrap_or(0)
                    }
                    (DistributionMode::Deposit, None) => 0,
                };
                let result = build_result(
                    group,
                    batch.number,
                    recipient,
                    *requested,
                    shares_expected,
                    outcome,
                    &before,
                    &after,
                );

                if result.reconciliation == ReconcileStatus::Mismatch {
                    warn!(
                        "⚠️ MISMATCH for {}: confirmed {}, balance delta {:?}",
                        result.recipient,
                        result.share_tokens_confirmed,
                        result.delta()
                    );
                }
                if result.status.is_failed() && result.delta().map_or(false, |d| d != 0) {
                    warn!(
                        "⚠️ {} failed but its balance moved by {:?}",
                        result.recipient,
                        result.delta()
                    );
                }

                self.sink.record(&result, asset_decimals)?;
                results.push(result);
            }
        }

        let totals = audit::totals(&results);
        report.paid = results.iter().filter(|r| r.status.was_paid()).count();
        report.failed = results.iter().filter(|r| r.status.is_failed()).count();
        report.mismatches = totals.mismatches;
        report.total_confirmed = totals.total_confirmed;
        report.total_delta = totals.total_delta;
        report.discrepancy = totals.discrepancy;

        info!(
            "✓ Vault {} done: {}/{} batches ok, {} paid, {} failed, discrepancy {}",
            group.vault,
            report.batches_attempted - report.batches_failed,
            report.batches_attempted,
            report.paid,
            report.failed,
            report.discrepancy
        );

        Ok(report)
    }

    /// Share-token balances of `recipients`; an unreadable balance is recorded as unknown
    async fn snapshot(&self, token: &str, recipients: &[(AccountId, u128)]) -> Snapshot {
        let mut balances = HashMap::with_capacity(recipients.len());
        for (recipient, _) in recipients {
            let balance = match self.contracts.balance(token, recipient).await {
                Ok(balance) => Some(balance),
                Err(e) => {
                    warn!("⚠️ Balance of {} unavailable: {}", recipient, e);
                    None
                }
            };
            balances.insert(recipient.clone(), balance);
        }
        balances
    }

    /// Drive one batch BUILDING -> SUBMITTED -> CONFIRMED | FAILED. Never
    /// returns an error: every failure becomes a failed confirmation for the
    /// whole batch.
    async fn run_batch(&mut self, vault: &str, batch: &Batch, of: usize) -> BatchOutcome {
        let mut state = BatchState::Building;
        let mut call: Option<ContractCall> = None;
        let mut confirmation = BatchConfirmation::Unconfirmed;

        while !state.is_terminal() {
            debug!("Batch {}/{} {} ({} recipients)", batch.number, of, state, batch.recipients.len());
            let (next, settled) = match state {
                BatchState::Building => match self.contracts.distribute_call(vault, &batch.recipients) {
                    Ok(built) => {
                        call = Some(built);
                        (BatchState::Submitted, None)
                    }
                    Err(e) => failed(&e),
                },
                BatchState::Submitted => {
                    let submitted = match call.take() {
                        Some(call) => self.contracts.submit(&call).await,
                        None => Err(GatewayError::Codec("batch submitted without a built call".to_string())),
                    };
                    match submitted.and_then(TxOutcome::require_success) {
                        Ok(outcome) => confirm(outcome),
                        Err(e) => failed(&e),
                    }
                }
                terminal => (terminal, None),
            };
            state = next;
            if let Some(settled) = settled {
                confirmation = settled;
            }
        }

        let tx_hash = match &state {
            BatchState::Confirmed { hash } => {
                info!("✅ Batch {}/{} {} (tx: {})", batch.number, of, state, hash);
                if let BatchConfirmation::Confirmed(declared) = &confirmation {
                    // the run log keeps per-recipient amounts even if the
                    // process dies before the vault's audit rows are written
                    for (recipient, amount) in &batch.recipients {
                        debug!(
                            "Batch {} {}: requested {}, declared {:?}",
                            batch.number,
                            recipient,
                            amount,
                            declared.get(recipient)
                        );
                    }
                }
                Some(hash.clone())
            }
            BatchState::Unconfirmed { hash } => {
                warn!("⚠️ Batch {}/{} {} (tx: {})", batch.number, of, state, hash);
                Some(hash.clone())
            }
            BatchState::Failed { hash, reason } => {
                error!(
                    "❌ Batch {}/{} {} (tx: {}): {}",
                    batch.number,
                    of,
                    state,
                    hash.as_deref().unwrap_or("-"),
                    reason
                );
                hash.clone()
            }
            BatchState::Building | BatchState::Submitted => None,
        };

        let rate = match self.oracle.fetch_rate(vault).await {
            Ok(rate) => Some(rate),
            Err(e) => {
                warn!("⚠️ Rate for {} unavailable after batch {}: {}", vault, batch.number, e);
                None
            }
        };

        BatchOutcome {
            number: batch.number,
            tx_hash,
            confirmation,
            rate,
        }
    }
}

fn failure_hash(error: &GatewayError) -> Option<String> {
    match error {
        GatewayError::ExecutionFailed { hash, .. } | GatewayError::TransactionExpired { hash, .. } => {
            Some(hash.clone())
        }
        _ => None,
    }
}

fn failed(error: &GatewayError) -> (BatchState, Option<BatchConfirmation>) {
    let reason = error.to_string();
    (
        BatchState::Failed {
            hash: failure_hash(error),
            reason: reason.clone(),
        },
        Some(BatchConfirmation::Failed(reason)),
    )
}

/// Per-recipient amounts declared by the relay's return value
fn declared_amounts(value: &ScVal) -> Result<HashMap<AccountId, u128>, GatewayError> {
    let mut amounts: HashMap<AccountId, u128> = HashMap::new();
    for (who, amount) in decode_distribution(value)? {
        let amount = u128::try_from(amount)
            .map_err(|_| GatewayError::UnexpectedReturn(format!("negative amount {} for {}", amount, who)))?;
        let entry = amounts.entry(who).or_default();
        *entry = entry.saturating_add(amount);
    }
    Ok(amounts)
}

fn confirm(outcome: TxOutcome) -> (BatchState, Option<BatchConfirmation>) {
    match outcome.return_value.as_ref().map(declared_amounts) {
        Some(Ok(amounts)) => (
            BatchState::Confirmed { hash: outcome.hash },
            Some(BatchConfirmation::Confirmed(amounts)),
        ),
        Some(Err(e)) => {
            warn!("⚠️ Relay return value unusable: {}", e);
            (
                BatchState::Unconfirmed { hash: outcome.hash },
                Some(BatchConfirmation::Unconfirmed),
            )
        }
        None => (
            BatchState::Unconfirmed { hash: outcome.hash },
            Some(BatchConfirmation::Unconfirmed),
        ),
    }
}

fn delta_of(recipient: &str, before: &Snapshot, after: &Snapshot) -> Option<i128> {
    let before = before.get(recipient).copied().flatten()?;
    let after = after.get(recipient).copied().flatten()?;
    after.checked_sub(before)
}

/// Pro-rata floor split of a deposit batch's minted total over the batch's
/// requested underlying amounts. The minted total is the sum the relay
/// declared, or the sum of balance deltas when it declared nothing.
fn expected_split(
    batch: &Batch,
    outcome: &BatchOutcome,
    before: &Snapshot,
    after: &Snapshot,
) -> Result<Option<Allocation>, AllocationError> {
    let minted = match &outcome.confirmation {
        BatchConfirmation::Confirmed(declared) => declared
            .values()
            .try_fold(0u128, |acc, amount| acc.checked_add(*amount))
            .ok_or(AllocationError::Overflow("declared batch total"))?,
        BatchConfirmation::Unconfirmed => {
            let deltas: Option<Vec<i128>> = batch
                .recipients
                .iter()
                .map(|(recipient, _)| delta_of(recipient, before, after))
                .collect();
            match deltas {
                Some(deltas) => deltas
                    .into_iter()
                    .map(|d| u128::try_from(d).unwrap_or(0))
                    .try_fold(0u128, |acc, d| acc.checked_add(d))
                    .ok_or(AllocationError::Overflow("observed batch total"))?,
                None => return Ok(None),
            }
        }
        BatchConfirmation::Failed(_) => return Ok(None),
    };

    let total = batch
        .total()
        .ok_or(AllocationError::Overflow("batch requested total"))?;
    allocate(minted, total, &batch.recipients).map(Some)
}

/// Recipients whose declared shares differ from the floor split. The relay
/// hands the truncation remainder to the last recipient of the call, so
/// `floor + dust` is accepted there.
fn split_deviations(allocation: &Allocation, declared: &HashMap<AccountId, u128>) -> Vec<AccountId> {
    let last = allocation.shares.len().saturating_sub(1);
    allocation
        .shares
        .iter()
        .enumerate()
        .filter(|(idx, (recipient, floor))| {
            let got = declared.get(recipient).copied().unwrap_or(0);
            let absorbed = *idx == last && Some(got) == floor.checked_add(allocation.dust);
            got != *floor && !absorbed
        })
        .map(|(_, (recipient, _))| recipient.clone())
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn build_result(
    group: &VaultGroup,
    batch_number: usize,
    recipient: &str,
    requested: u128,
    shares_expected: u128,
    outcome: &BatchOutcome,
    before: &Snapshot,
    after: &Snapshot,
) -> TransferResult {
    let balance_before = before.get(recipient).copied().flatten();
    let balance_after = after.get(recipient).copied().flatten();
    let delta = delta_of(recipient, before, after);

    let (status, confirmed) = match &outcome.confirmation {
        BatchConfirmation::Confirmed(amounts) => {
            (TransferStatus::Success, amounts.get(recipient).copied().unwrap_or(0))
        }
        // no declared amount: the balance delta stands in
        BatchConfirmation::Unconfirmed => (
            TransferStatus::Unconfirmed,
            delta.and_then(|d| u128::try_from(d).ok()).unwrap_or(0),
        ),
        BatchConfirmation::Failed(reason) => (TransferStatus::Failed(reason.clone()), 0),
    };

    let underlying_estimate = if status.was_paid() {
        outcome.rate.and_then(|r| r.to_underlying(confirmed))
    } else {
        None
    };

    TransferResult {
        vault: group.vault.clone(),
        asset: group.asset.clone(),
        recipient: recipient.to_string(),
        batch_number: Some(batch_number),
        amount_requested: requested,
        shares_expected,
        share_tokens_confirmed: confirmed,
        balance_before,
        balance_after,
        underlying_estimate,
        tx_hash: outcome.tx_hash.clone(),
        reconciliation: audit::reconcile(&status, confirmed, delta),
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::execution::gateway::{LedgerGateway, TerminalStatus};
    use crate::execution::scval::{self, test_support::{account, contract}};

    const RELAY_METHOD: &str = "distribute";

    #[derive(Debug, Clone, Copy)]
    enum Script {
        Reject,
        FailStatus,
        Expire,
        NoReturn,
    }

    /// How the relay treats `distribute(caller, vault, recipients)`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Relay {
        /// Share tokens move from the caller as-is
        Transfer,
        /// Σamount of underlying is deposited, minted shares are split
        /// floor-wise with the remainder to the last recipient
        DepositAndSplit { minted_per_100: u128 },
    }

    struct Ledger {
        relay: Relay,
        asset: String,
        balances: HashMap<(String, String), i128>,
        submitted: Vec<String>,
        relay_calls: usize,
        scripts: HashMap<usize, Script>,
        fee_per_transfer: i128,
    }

    impl Ledger {
        fn new(relay: Relay) -> Self {
            Self {
                relay,
                asset: contract(100),
                balances: HashMap::new(),
                submitted: Vec::new(),
                relay_calls: 0,
                scripts: HashMap::new(),
                fee_per_transfer: 0,
            }
        }

        fn credit(&mut self, token: &str, who: &str, amount: i128) {
            *self.balances.entry((token.to_string(), who.to_string())).or_default() += amount;
        }
    }

    /// In-memory ledger: one share token per vault, a fixed 1.05 rate,
    /// 7-decimal share tokens and a 6-decimal underlying asset
    struct MockGateway {
        caller: String,
        ledger: Mutex<Ledger>,
    }

    impl MockGateway {
        fn new(ledger: Ledger) -> Self {
            Self {
                caller: account(250),
                ledger: Mutex::new(ledger),
            }
        }

        fn outcome(hash: String, status: TerminalStatus, return_value: Option<ScVal>) -> TxOutcome {
            TxOutcome {
                hash,
                status,
                return_value,
                diagnostics: vec!["txFailed".to_string()],
                ledger: Some(1),
                waited_secs: 30,
            }
        }
    }

    #[async_trait]
    impl LedgerGateway for MockGateway {
        fn caller(&self) -> &str {
            &self.caller
        }

        async fn simulate(&self, call: &ContractCall) -> Result<ScVal, GatewayError> {
            let ledger = self.ledger.lock().unwrap();
            match call.function.as_str() {
                "balance" => {
                    let who = scval::to_address(&call.args[0])?;
                    let balance = ledger
                        .balances
                        .get(&(call.contract.clone(), who))
                        .copied()
                        .unwrap_or(0);
                    Ok(scval::i128_val(balance))
                }
                "decimals" if call.contract == ledger.asset => Ok(ScVal::U32(6)),
                "decimals" => Ok(ScVal::U32(7)),
                "get_asset_amounts_per_shares" => {
                    let shares = scval::to_i128(&call.args[0])?;
                    scval::vec(vec![scval::i128_val(shares * 105 / 100)])
                }
                other => Err(GatewayError::Simulation(format!("unknown function {}", other))),
            }
        }

        async fn submit(&self, call: &ContractCall) -> Result<TxOutcome, GatewayError> {
            let mut ledger = self.ledger.lock().unwrap();
            ledger.submitted.push(call.function.clone());
            if call.function != RELAY_METHOD {
                return Err(GatewayError::Simulation(format!("unexpected {}", call.function)));
            }

            ledger.relay_calls += 1;
            let hash = format!("tx{}", ledger.relay_calls);
            match ledger.scripts.get(&ledger.relay_calls).copied() {
                Some(Script::Reject) => {
                    return Err(GatewayError::Rejected {
                        status: "ERROR".into(),
                        detail: "txBadSeq".into(),
                    })
                }
                Some(Script::FailStatus) => return Ok(Self::outcome(hash, TerminalStatus::Failed, None)),
                Some(Script::Expire) => return Ok(Self::outcome(hash, TerminalStatus::Expired, None)),
                _ => {}
            }

            let vault = scval::to_address(&call.args[1])?;
            let mut entries = Vec::new();
            for entry in scval::to_vec(&call.args[2])? {
                let who = scval::to_address(scval::field(entry, "address")?)?;
                let amount = scval::to_i128(scval::field(entry, "amount")?)?;
                entries.push((who, amount));
            }

            let relay = ledger.relay;
            let paid: Vec<(String, i128)> = match relay {
                Relay::Transfer => entries,
                Relay::DepositAndSplit { minted_per_100 } => {
                    let total: i128 = entries.iter().map(|(_, a)| a).sum();
                    let asset = ledger.asset.clone();
                    let caller = self.caller.clone();
                    ledger.credit(&asset, &caller, -total);
                    let minted = total * minted_per_100 as i128 / 100;
                    ledger.credit(&vault, &caller, minted);

                    let mut distributed = 0;
                    let last = entries.len() - 1;
                    entries
                        .into_iter()
                        .enumerate()
                        .map(|(idx, (who, amount))| {
                            let share = if idx == last { minted - distributed } else { amount * minted / total };
                            distributed += share;
                            (who, share)
                        })
                        .collect()
                }
            };

            let fee = ledger.fee_per_transfer;
            let caller = self.caller.clone();
            for (who, amount) in &paid {
                ledger.credit(&vault, &caller, -amount);
                ledger.credit(&vault, who, amount - fee);
            }

            let value = match ledger.scripts.get(&ledger.relay_calls) {
                Some(Script::NoReturn) => None,
                _ => Some(scval::address_amounts(&paid)?),
            };
            Ok(Self::outcome(hash, TerminalStatus::Success, value))
        }
    }

    fn group(vault: &str, recipients: Vec<(AccountId, u128)>) -> VaultGroup {
        VaultGroup {
            vault: vault.to_string(),
            asset: contract(100),
            recipients,
        }
    }

    fn orchestrator(gateway: Arc<MockGateway>, mode: DistributionMode, batch_size: usize, dir: &Path) -> Orchestrator {
        let contracts = ContractClient::new(gateway, contract(99), RELAY_METHOD);
        let sink = AuditSink::create(dir, Utc::now(), Uuid::new_v4()).unwrap();
        Orchestrator::new(
            DistributionConfig {
                mode,
                max_batch_size: batch_size,
            },
            contracts,
            sink,
            Uuid::new_v4(),
        )
    }

    fn audit_rows(path: &Path) -> Vec<HashMap<String, String>> {
        csv::Reader::from_path(path)
            .unwrap()
            .deserialize()
            .map(|row| row.unwrap())
            .collect()
    }

    /// `n` recipients requesting 100 * i, with seeded balances of 1000 + i
    fn seeded(vault: &str, n: u8) -> (Ledger, Vec<(AccountId, u128)>) {
        let mut ledger = Ledger::new(Relay::Transfer);
        ledger.credit(vault, &account(250), 1_000_000_000);
        let recipients: Vec<(AccountId, u128)> = (1..=n).map(|i| (account(i), 100 * i as u128)).collect();
        for (i, (who, _)) in recipients.iter().enumerate() {
            ledger.credit(vault, who, 1_000 + i as i128);
        }
        (ledger, recipients)
    }

    #[tokio::test]
    async fn test_full_transfer_run_reconciles() {
        let dir = tempfile::tempdir().unwrap();
        let vault = contract(1);
        let (ledger, recipients) = seeded(&vault, 23);
        let gateway = Arc::new(MockGateway::new(ledger));
        let mut orch = orchestrator(gateway.clone(), DistributionMode::Transfer, 10, dir.path());

        let summary = orch.run(&[group(&vault, recipients.clone())]).await.unwrap();

        assert_eq!(gateway.ledger.lock().unwrap().relay_calls, 3);
        let report = &summary.vaults[0];
        assert_eq!(report.batches_attempted, 3);
        assert_eq!(report.batches_failed, 0);
        assert_eq!(report.paid, 23);
        assert_eq!(report.mismatches, 0);
        assert_eq!(report.discrepancy, 0);
        assert_eq!(report.dust, None);
        assert_eq!(report.total_confirmed, recipients.iter().map(|(_, a)| a).sum::<u128>());

        let rows = audit_rows(orch.sink().path());
        assert_eq!(rows.len(), 23);
        assert!(rows.iter().all(|r| r["reconciliation"] == "MATCH" && r["status"] == "success"));
        let batches: Vec<&str> = rows.iter().map(|r| r["batch"].as_str()).collect();
        assert_eq!(batches[9], "1");
        assert_eq!(batches[10], "2");
        assert_eq!(batches[22], "3");
        assert_eq!(rows[22]["tx_hash"], "tx3");
        assert_eq!(rows[22]["shares_expected"], "2300");
        // 2300 shares at 1.05, shown at the asset's 6 decimals
        assert_eq!(rows[22]["underlying_estimate"], "2415");
        assert_eq!(rows[22]["underlying_display"], "0.002415");
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_stop_later_batches() {
        let dir = tempfile::tempdir().unwrap();
        let vault = contract(1);
        let (mut ledger, recipients) = seeded(&vault, 23);
        ledger.scripts.insert(2, Script::Reject);
        let gateway = Arc::new(MockGateway::new(ledger));
        let mut orch = orchestrator(gateway.clone(), DistributionMode::Transfer, 10, dir.path());

        let summary = orch.run(&[group(&vault, recipients)]).await.unwrap();

        assert_eq!(gateway.ledger.lock().unwrap().relay_calls, 3);
        let report = &summary.vaults[0];
        assert_eq!(report.batches_failed, 1);
        assert_eq!(report.failed, 10);
        assert_eq!(report.paid, 13);
        assert_eq!(summary.failed_batches().len(), 1);
        assert_eq!(summary.failed_batches()[0].1, 2);

        let rows = audit_rows(orch.sink().path());
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row["balance_before"], (1_000 + i).to_string());
            if (10..20).contains(&i) {
                assert!(row["status"].starts_with("failed:"));
                assert_eq!(row["df_tokens_confirmed"], "0");
                assert_eq!(row["reconciliation"], "N/A");
                assert_eq!(row["delta"], "0");
            } else {
                assert_eq!(row["status"], "success");
                assert_eq!(row["reconciliation"], "MATCH");
            }
        }
    }

    #[tokio::test]
    async fn test_failed_and_expired_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let vault = contract(1);
        let (mut ledger, recipients) = seeded(&vault, 20);
        ledger.scripts.insert(1, Script::FailStatus);
        ledger.scripts.insert(2, Script::Expire);
        let gateway = Arc::new(MockGateway::new(ledger));
        let mut orch = orchestrator(gateway, DistributionMode::Transfer, 10, dir.path());

        let summary = orch.run(&[group(&vault, recipients)]).await.unwrap();
        assert_eq!(summary.vaults[0].batches_failed, 2);

        let rows = audit_rows(orch.sink().path());
        assert_eq!(rows[0]["tx_hash"], "tx1");
        assert!(rows[0]["status"].contains("failed on-chain"));
        assert_eq!(rows[10]["tx_hash"], "tx2");
        assert!(rows[10]["status"].contains("TransactionExpired"));
    }

    #[tokio::test]
    async fn test_unbuildable_batch_fails_before_submission() {
        let dir = tempfile::tempdir().unwrap();
        let vault = contract(1);
        let (ledger, mut recipients) = seeded(&vault, 3);
        recipients.push(("not-a-strkey".to_string(), 5));
        let gateway = Arc::new(MockGateway::new(ledger));
        let mut orch = orchestrator(gateway.clone(), DistributionMode::Transfer, 2, dir.path());

        let summary = orch.run(&[group(&vault, recipients)]).await.unwrap();

        // batch 2 never leaves BUILDING; batch 1 is unaffected
        assert_eq!(gateway.ledger.lock().unwrap().relay_calls, 1);
        assert_eq!(summary.vaults[0].batches_failed, 1);
        let rows = audit_rows(orch.sink().path());
        assert_eq!(rows[0]["status"], "success");
        assert!(rows[3]["status"].contains("invalid address"));
        assert_eq!(rows[3]["tx_hash"], "");
    }

    #[tokio::test]
    async fn test_missing_return_value_falls_back_to_delta() {
        let dir = tempfile::tempdir().unwrap();
        let vault = contract(1);
        let (mut ledger, recipients) = seeded(&vault, 3);
        ledger.scripts.insert(1, Script::NoReturn);
        let gateway = Arc::new(MockGateway::new(ledger));
        let mut orch = orchestrator(gateway, DistributionMode::Transfer, 10, dir.path());

        let summary = orch.run(&[group(&vault, recipients)]).await.unwrap();
        assert_eq!(summary.vaults[0].paid, 3);
        assert_eq!(summary.discrepancy(), 0);

        let rows = audit_rows(orch.sink().path());
        assert_eq!(rows[1]["status"], "unconfirmed");
        assert_eq!(rows[1]["reconciliation"], "UNVERIFIED");
        assert_eq!(rows[1]["df_tokens_confirmed"], "200");
    }

    #[tokio::test]
    async fn test_fee_on_transfer_is_flagged_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let vault = contract(1);
        let (mut ledger, recipients) = seeded(&vault, 12);
        ledger.fee_per_transfer = 1;
        let gateway = Arc::new(MockGateway::new(ledger));
        let mut orch = orchestrator(gateway, DistributionMode::Transfer, 10, dir.path());

        let summary = orch.run(&[group(&vault, recipients)]).await.unwrap();

        assert_eq!(summary.mismatches(), 12);
        assert_eq!(summary.discrepancy(), -12);
        let rows = audit_rows(orch.sink().path());
        assert!(rows.iter().all(|r| r["reconciliation"] == "MISMATCH"));
    }

    fn deposit_ledger(vault: &str) -> Ledger {
        let mut ledger = Ledger::new(Relay::DepositAndSplit { minted_per_100: 97 });
        let asset = ledger.asset.clone();
        ledger.credit(&asset, &account(250), 1_000);
        ledger.credit(vault, &account(250), 0);
        ledger
    }

    #[tokio::test]
    async fn test_deposit_batch_splits_minted_shares_once() {
        let dir = tempfile::tempdir().unwrap();
        let vault = contract(1);
        let gateway = Arc::new(MockGateway::new(deposit_ledger(&vault)));
        let mut orch = orchestrator(gateway.clone(), DistributionMode::Deposit, 10, dir.path());

        let recipients = vec![(account(1), 40), (account(2), 35), (account(3), 25)];
        let summary = orch.run(&[group(&vault, recipients)]).await.unwrap();

        let report = &summary.vaults[0];
        assert_eq!(report.dust, Some(2));
        assert_eq!(report.total_confirmed, 97);
        assert_eq!(report.mismatches, 0);
        // the last recipient absorbing the remainder is not a deviation
        assert_eq!(report.split_deviations, 0);

        let ledger = gateway.ledger.lock().unwrap();
        // one relay call, no separate vault deposit
        assert_eq!(ledger.submitted, vec![RELAY_METHOD.to_string()]);
        // 100 underlying pulled exactly once, every minted share handed out
        assert_eq!(ledger.balances[&(ledger.asset.clone(), account(250))], 900);
        assert_eq!(ledger.balances[&(vault.clone(), account(250))], 0);
        drop(ledger);

        let rows = audit_rows(orch.sink().path());
        let expected: Vec<&str> = rows.iter().map(|r| r["shares_expected"].as_str()).collect();
        let confirmed: Vec<&str> = rows.iter().map(|r| r["df_tokens_confirmed"].as_str()).collect();
        assert_eq!(expected, vec!["38", "33", "24"]);
        assert_eq!(confirmed, vec!["38", "33", "26"]);
        assert_eq!(rows[0]["amount_requested"], "40");
        assert!(rows.iter().all(|r| r["reconciliation"] == "MATCH"));
    }

    #[tokio::test]
    async fn test_deposit_split_is_computed_per_batch() {
        let dir = tempfile::tempdir().unwrap();
        let vault = contract(1);
        let gateway = Arc::new(MockGateway::new(deposit_ledger(&vault)));
        let mut orch = orchestrator(gateway.clone(), DistributionMode::Deposit, 2, dir.path());

        let recipients = vec![(account(1), 40), (account(2), 35), (account(3), 25)];
        let summary = orch.run(&[group(&vault, recipients)]).await.unwrap();

        // batch 1: 75 -> 72 minted, floors 38 + 33, dust 1; batch 2: 25 -> 24, dust 0
        assert_eq!(summary.vaults[0].dust, Some(1));
        assert_eq!(gateway.ledger.lock().unwrap().relay_calls, 2);

        let rows = audit_rows(orch.sink().path());
        let expected: Vec<&str> = rows.iter().map(|r| r["shares_expected"].as_str()).collect();
        let confirmed: Vec<&str> = rows.iter().map(|r| r["df_tokens_confirmed"].as_str()).collect();
        assert_eq!(expected, vec!["38", "33", "24"]);
        assert_eq!(confirmed, vec!["38", "34", "24"]);
    }

    #[tokio::test]
    async fn test_deposit_without_return_splits_observed_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let vault = contract(1);
        let mut ledger = deposit_ledger(&vault);
        ledger.scripts.insert(1, Script::NoReturn);
        let gateway = Arc::new(MockGateway::new(ledger));
        let mut orch = orchestrator(gateway, DistributionMode::Deposit, 10, dir.path());

        let recipients = vec![(account(1), 3), (account(2), 1), (account(3), 96)];
        let summary = orch.run(&[group(&vault, recipients)]).await.unwrap();

        // 97 minted: relay pays 2, 0, 95; floor split of 97 is 2, 0, 93
        let report = &summary.vaults[0];
        assert_eq!(report.paid, 3);
        assert_eq!(report.dust, Some(2));

        let rows = audit_rows(orch.sink().path());
        assert!(rows.iter().all(|r| r["status"] == "unconfirmed"));
        assert_eq!(rows[1]["df_tokens_confirmed"], "0");
        assert_eq!(rows[2]["shares_expected"], "93");
        assert_eq!(rows[2]["df_tokens_confirmed"], "95");
    }

    #[tokio::test]
    async fn test_failed_deposit_batch_and_next_vault_runs() {
        let dir = tempfile::tempdir().unwrap();
        let broken = contract(1);
        let healthy = contract(2);
        let mut ledger = deposit_ledger(&broken);
        ledger.scripts.insert(1, Script::FailStatus);
        let gateway = Arc::new(MockGateway::new(ledger));
        let mut orch = orchestrator(gateway.clone(), DistributionMode::Deposit, 10, dir.path());

        let summary = orch
            .run(&[
                group(&broken, vec![(account(1), 10), (account(2), 20)]),
                group(&healthy, vec![(account(3), 50)]),
            ])
            .await
            .unwrap();

        assert_eq!(summary.vaults[0].failed, 2);
        assert_eq!(summary.vaults[0].dust, None);
        assert_eq!(summary.vaults[1].paid, 1);
        assert_eq!(gateway.ledger.lock().unwrap().relay_calls, 2);

        let rows = audit_rows(orch.sink().path());
        assert_eq!(rows.len(), 3);
        assert!(rows[0]["status"].starts_with("failed:"));
        assert_eq!(rows[0]["shares_expected"], "0");
        assert_eq!(rows[0]["tx_hash"], "tx1");
        assert_eq!(rows[2]["status"], "success");
        assert_eq!(rows[2]["df_tokens_confirmed"], "48");
    }

    #[test]
    fn test_split_deviation_outside_the_remainder_rule() {
        let allocation = allocate(97, 100, &[(account(1), 40), (account(2), 35), (account(3), 25)]).unwrap();

        let relay_split: HashMap<AccountId, u128> =
            [(account(1), 38), (account(2), 33), (account(3), 26)].into_iter().collect();
        assert!(split_deviations(&allocation, &relay_split).is_empty());

        let skewed: HashMap<AccountId, u128> =
            [(account(1), 39), (account(2), 32), (account(3), 26)].into_iter().collect();
        assert_eq!(split_deviations(&allocation, &skewed), vec![account(1), account(2)]);
    }
}
