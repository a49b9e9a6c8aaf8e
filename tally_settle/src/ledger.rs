//! In-memory store of settlement records with the cross-record lookups
//! that statuses need.
use std::collections::BTreeMap;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::debug;

use crate::error::{Result, SettleError};
use crate::records::{
    check_positive, luck, AlgoTable, Block, BlockPayout, BlockStatus, NewAggregate, NewPayout, Payout,
    PayoutAggregate, PayoutStatus, TradeKind, TradeRequest, TradeStatus, Transaction,
};

/// Figures derived for one block from its per-chain payouts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockSummary {
    /// Block hash.
    pub hash: String,
    /// Confirmation state.
    pub status: BlockStatus,
    /// Fees and donations kept.
    pub contributed: f64,
    /// Bonuses paid.
    pub bonus_paid: f64,
    /// Shares spent finding the block.
    pub shares_to_solve: f64,
    /// Luck in percent.
    pub luck: f64,
    /// Seconds from start of work to the find.
    pub duration_secs: i64,
}

/// Settlement ledger.
#[derive(Debug, Default)]
pub struct Ledger {
    next_id: u64,
    trades: BTreeMap<u64, TradeRequest>,
    blocks: BTreeMap<String, Block>,
    block_payouts: BTreeMap<(String, u32), BlockPayout>,
    transactions: BTreeMap<String, Transaction>,
    payouts: BTreeMap<u64, Payout>,
    aggregates: BTreeMap<u64, PayoutAggregate>,
}

impl Ledger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Open a trade request in status 0.
    pub fn create_trade(&mut self, currency: &str, quantity: f64, kind: TradeKind, at: OffsetDateTime) -> u64 {
        let id = self.alloc();
        self.trades.insert(
            id,
            TradeRequest {
                id,
                currency: currency.to_string(),
                quantity,
                created_at: at,
                kind,
                exchanged_quantity: None,
                fees: None,
                status_code: 0,
            },
        );
        id
    }

    /// Record progress reported by the trader.
    pub fn update_trade(&mut self, id: u64, status_code: i16, exchanged: Option<f64>, fees: Option<f64>) -> Result<()> {
        let trade = self.trades.get_mut(&id).ok_or_else(|| SettleError::not_found("trade request", id))?;
        trade.status_code = status_code;
        trade.exchanged_quantity = exchanged.or(trade.exchanged_quantity);
        trade.fees = fees.or(trade.fees);
        debug!(id, status = %trade.status(), "trade updated");
        Ok(())
    }

    /// Trade request by id.
    pub fn trade(&self, id: u64) -> Result<&TradeRequest> {
        self.trades.get(&id).ok_or_else(|| SettleError::not_found("trade request", id))
    }

    /// Record a found block.
    pub fn add_block(&mut self, block: Block) -> Result<()> {
        if self.blocks.contains_key(&block.hash) {
            return Err(SettleError::Duplicate {
                what: "block",
                id: block.hash,
            });
        }
        self.blocks.insert(block.hash.clone(), block);
        Ok(())
    }

    /// Block by hash.
    pub fn block(&self, hash: &str) -> Result<&Block> {
        self.blocks.get(hash).ok_or_else(|| SettleError::not_found("block", hash))
    }

    /// Mark a block mature or orphaned.
    pub fn set_block_state(&mut self, hash: &str, mature: bool, orphan: bool) -> Result<()> {
        let block = self.blocks.get_mut(hash).ok_or_else(|| SettleError::not_found("block", hash))?;
        block.mature = mature;
        block.orphan = orphan;
        Ok(())
    }

    /// Attach one share chain's part to a block.
    pub fn add_block_payout(&mut self, part: BlockPayout) -> Result<()> {
        self.block(&part.block_hash)?;
        let key = (part.block_hash.clone(), part.chain_id);
        if self.block_payouts.contains_key(&key) {
            return Err(SettleError::Duplicate {
                what: "block payout",
                id: format!("{}/{}", key.0, key.1),
            });
        }
        self.block_payouts.insert(key, part);
        Ok(())
    }

    /// Per-chain parts of a block.
    pub fn block_payouts<'a>(&'a self, hash: &'a str) -> impl Iterator<Item = &'a BlockPayout> + 'a {
        self.block_payouts
            .range((hash.to_string(), 0)..=(hash.to_string(), u32::MAX))
            .map(|(_, part)| part)
    }

    /// Derived figures for a block.
    pub fn block_summary(&self, hash: &str, algos: &AlgoTable) -> Result<BlockSummary> {
        let block = self.block(hash)?;
        let (mut contributed, mut bonus_paid, mut shares) = (0.0, 0.0, 0.0);
        for part in self.block_payouts(hash) {
            contributed += part.contributed.unwrap_or(0.0);
            bonus_paid += part.bonus_paid.unwrap_or(0.0);
            shares += part.shares;
        }
        let hps = algos.hashes_per_share(&block.algo)?;
        Ok(BlockSummary {
            hash: block.hash.clone(),
            status: block.status(),
            contributed,
            bonus_paid,
            shares_to_solve: shares,
            luck: luck(block.difficulty, shares, hps),
            duration_secs: block.duration().whole_seconds(),
        })
    }

    /// Record a broadcast transaction.
    pub fn add_transaction(&mut self, txid: &str, currency: &str, at: OffsetDateTime) -> Result<()> {
        if self.transactions.contains_key(txid) {
            return Err(SettleError::Duplicate {
                what: "transaction",
                id: txid.to_string(),
            });
        }
        self.transactions.insert(
            txid.to_string(),
            Transaction {
                txid: txid.to_string(),
                confirmed: false,
                created_at: at,
                currency: currency.to_string(),
            },
        );
        Ok(())
    }

    /// Mark a transaction confirmed.
    pub fn confirm_transaction(&mut self, txid: &str) -> Result<()> {
        self.transactions
            .get_mut(txid)
            .ok_or_else(|| SettleError::not_found("transaction", txid))?
            .confirmed = true;
        Ok(())
    }

    /// Credit a user from a block. The amount must be positive and the
    /// block known.
    pub fn create_payout(&mut self, new: NewPayout) -> Result<u64> {
        check_positive("payout", new.amount)?;
        self.block(&new.block_hash)?;
        for trade in new.exchange.iter().flat_map(|leg| leg.sell_req.iter().chain(leg.buy_req.iter())) {
            self.trade(*trade)?;
        }
        let id = self.alloc();
        let payout_address = new.payout_address.unwrap_or_else(|| new.user.clone());
        self.payouts.insert(
            id,
            Payout {
                id,
                block_hash: new.block_hash,
                user: new.user,
                sharechain_id: new.sharechain_id,
                payout_address,
                payout_currency: new.payout_currency,
                amount: new.amount,
                fee_perc: new.fee_perc,
                pd_perc: new.pd_perc,
                payable: false,
                aggregate_id: None,
                exchange: new.exchange,
            },
        );
        Ok(id)
    }

    /// Payout by id.
    pub fn payout(&self, id: u64) -> Result<&Payout> {
        self.payouts.get(&id).ok_or_else(|| SettleError::not_found("payout", id))
    }

    fn payout_mut(&mut self, id: u64) -> Result<&mut Payout> {
        self.payouts.get_mut(&id).ok_or_else(|| SettleError::not_found("payout", id))
    }

    /// Clear a payout for batching.
    pub fn mark_payable(&mut self, id: u64) -> Result<()> {
        self.payout_mut(id)?.payable = true;
        Ok(())
    }

    /// Record the buy leg's outcome on an exchanged payout.
    pub fn set_exchange(&mut self, id: u64, buy_req: Option<u64>, buy_amount: Option<f64>) -> Result<()> {
        if let Some(trade) = buy_req {
            self.trade(trade)?;
        }
        let payout = self.payout_mut(id)?;
        let leg = payout.exchange.get_or_insert_with(Default::default);
        leg.buy_req = buy_req.or(leg.buy_req);
        leg.buy_amount = buy_amount.or(leg.buy_amount);
        Ok(())
    }

    /// Batch payouts into a new aggregate.
    pub fn create_aggregate(&mut self, new: NewAggregate, payouts: &[u64], at: OffsetDateTime) -> Result<u64> {
        check_positive("aggregate", new.amount)?;
        for id in payouts {
            self.payout(*id)?;
        }
        let id = self.alloc();
        self.aggregates.insert(
            id,
            PayoutAggregate {
                id,
                transaction_id: None,
                user: new.user,
                payout_address: new.payout_address,
                currency: new.currency,
                created_at: at,
                amount: new.amount,
                count: new.count,
            },
        );
        for payout in payouts {
            self.payout_mut(*payout)?.aggregate_id = Some(id);
        }
        debug!(id, payouts = payouts.len(), "aggregate created");
        Ok(id)
    }

    /// Aggregate by id.
    pub fn aggregate(&self, id: u64) -> Result<&PayoutAggregate> {
        self.aggregates.get(&id).ok_or_else(|| SettleError::not_found("aggregate", id))
    }

    /// Attach the transaction that paid an aggregate.
    pub fn attach_transaction(&mut self, aggregate: u64, txid: &str) -> Result<()> {
        if !self.transactions.contains_key(txid) {
            return Err(SettleError::not_found("transaction", txid));
        }
        self.aggregates
            .get_mut(&aggregate)
            .ok_or_else(|| SettleError::not_found("aggregate", aggregate))?
            .transaction_id = Some(txid.to_string());
        Ok(())
    }

    /// Status of the aggregate's transaction, if the payout is batched.
    /// `None` inside means batched but not yet sent.
    fn batch_state(&self, payout: &Payout) -> Result<Option<Option<PayoutStatus>>> {
        let Some(agg_id) = payout.aggregate_id else {
            return Ok(None);
        };
        let aggregate = self.aggregate(agg_id)?;
        let Some(txid) = &aggregate.transaction_id else {
            return Ok(Some(None));
        };
        let tx = self
            .transactions
            .get(txid)
            .ok_or_else(|| SettleError::not_found("transaction", txid))?;
        Ok(Some(Some(if tx.confirmed {
            PayoutStatus::TransactionConfirmed(txid.clone())
        } else {
            PayoutStatus::TransactionPending(txid.clone())
        })))
    }

    /// Where payout `id` stands.
    pub fn payout_status(&self, id: u64) -> Result<PayoutStatus> {
        let payout = self.payout(id)?;
        let block = self.block(&payout.block_hash)?;
        if block.orphan {
            return Ok(PayoutStatus::BlockOrphaned);
        }
        if !block.mature {
            return Ok(PayoutStatus::PendingBlockConfirmation);
        }

        let batch = self.batch_state(payout)?;
        if payout.payable {
            return Ok(match batch {
                Some(Some(sent)) => sent,
                Some(None) => PayoutStatus::PayoutPending,
                None => PayoutStatus::PendingBatching,
            });
        }

        let Some(leg) = &payout.exchange else {
            return Ok(PayoutStatus::AwaitingPayable);
        };
        match batch {
            Some(Some(sent)) => return Ok(sent),
            Some(None) => return Ok(PayoutStatus::PendingBatching),
            None => {}
        }

        // BTC buyers are paid straight from the sale; no purchase step.
        let btc = payout.payout_currency.eq_ignore_ascii_case("BTC");
        if leg.buy_req.is_some() && !btc {
            return Ok(PayoutStatus::Purchasing);
        }
        let sold = match leg.sell_req {
            Some(sell) => self.trade(sell)?.status() == TradeStatus::Complete,
            None => false,
        };
        if sold {
            return Ok(if btc {
                PayoutStatus::PendingPayout
            } else {
                PayoutStatus::SoldPendingPurchase
            });
        }
        Ok(PayoutStatus::PendingSale)
    }

    /// Payouts credited to `user`, oldest first.
    pub fn payouts_for<'a>(&'a self, user: &'a str) -> impl Iterator<Item = &'a Payout> + 'a {
        self.payouts.values().filter(move |p| p.user == user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{AggregateStatus, ExchangeLeg};
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-03-01 12:00 UTC);

    fn block(hash: &str) -> Block {
        Block {
            hash: hash.into(),
            height: 100,
            user: "finder".into(),
            worker: "rig".into(),
            found_at: datetime!(2024-03-01 12:30 UTC),
            time_started: T0,
            orphan: false,
            mature: false,
            total_value: 25.0,
            transaction_fees: 0.5,
            difficulty: 2.0,
            currency: "LTC".into(),
            merged: false,
            algo: "scrypt".into(),
        }
    }

    fn new_payout(currency: &str, exchange: Option<ExchangeLeg>) -> NewPayout {
        NewPayout {
            block_hash: "b1".into(),
            user: "alice".into(),
            sharechain_id: 1,
            payout_address: None,
            payout_currency: currency.into(),
            amount: 5.0,
            fee_perc: 0.01,
            pd_perc: 0.0,
            exchange,
        }
    }

    fn aggregate(amount: f64) -> NewAggregate {
        NewAggregate {
            user: "alice".into(),
            payout_address: "alice".into(),
            currency: "LTC".into(),
            amount,
            count: Some(1),
        }
    }

    fn ledger() -> Ledger {
        let mut ledger = Ledger::new();
        ledger.add_block(block("b1")).unwrap();
        ledger
    }

    #[test]
    fn block_summary_sums_chains() {
        let mut ledger = ledger();
        for (chain, shares) in [(1, 30_000.0), (2, 35_536.0)] {
            ledger
                .add_block_payout(BlockPayout {
                    chain_id: chain,
                    block_hash: "b1".into(),
                    solve_slice: None,
                    shares,
                    contributed: Some(0.25),
                    bonus_paid: None,
                    paid: false,
                })
                .unwrap();
        }
        let algos = AlgoTable::new([("scrypt", 65_536.0)]);
        let summary = ledger.block_summary("b1", &algos).unwrap();
        assert_eq!(summary.shares_to_solve, 65_536.0);
        assert_eq!(summary.contributed, 0.5);
        assert_eq!(summary.bonus_paid, 0.0);
        assert!((summary.luck - 200.0).abs() < 1e-9);
        assert_eq!(summary.duration_secs, 1_800);
        assert_eq!(summary.status, BlockStatus::PendingConfirmation);
        assert!(ledger.add_block(block("b1")).is_err());
        assert!(matches!(
            ledger.block_summary("b1", &AlgoTable::default()),
            Err(SettleError::UnknownAlgo(_))
        ));
    }

    #[test]
    fn direct_payout_lifecycle() {
        let mut ledger = ledger();
        let id = ledger.create_payout(new_payout("LTC", None)).unwrap();
        assert_eq!(ledger.payout(id).unwrap().payout_address, "alice");
        assert_eq!(ledger.payout_status(id).unwrap(), PayoutStatus::PendingBlockConfirmation);

        ledger.set_block_state("b1", true, false).unwrap();
        assert_eq!(ledger.payout_status(id).unwrap(), PayoutStatus::AwaitingPayable);
        ledger.mark_payable(id).unwrap();
        assert_eq!(ledger.payout_status(id).unwrap(), PayoutStatus::PendingBatching);

        let agg = ledger.create_aggregate(aggregate(5.0), &[id], T0).unwrap();
        assert_eq!(ledger.payout_status(id).unwrap(), PayoutStatus::PayoutPending);
        assert_eq!(ledger.aggregate(agg).unwrap().status(), AggregateStatus::PayoutPending);

        ledger.add_transaction("tx1", "LTC", T0).unwrap();
        ledger.attach_transaction(agg, "tx1").unwrap();
        assert_eq!(ledger.payout_status(id).unwrap().to_string(), "Payout Transaction tx1 Pending");
        ledger.confirm_transaction("tx1").unwrap();
        assert_eq!(ledger.payout_status(id).unwrap().to_string(), "Payout Transaction tx1 Confirmed");
        assert_eq!(ledger.aggregate(agg).unwrap().status().to_string(), "Complete");
    }

    #[test]
    fn orphan_trumps_everything() {
        let mut ledger = ledger();
        let id = ledger.create_payout(new_payout("LTC", None)).unwrap();
        ledger.mark_payable(id).unwrap();
        ledger.set_block_state("b1", false, true).unwrap();
        assert_eq!(ledger.payout_status(id).unwrap(), PayoutStatus::BlockOrphaned);
    }

    #[test]
    fn exchanged_payout_walks_trades() {
        let mut ledger = ledger();
        ledger.set_block_state("b1", true, false).unwrap();
        let sell = ledger.create_trade("LTC", 5.0, TradeKind::Sell, T0);
        let leg = ExchangeLeg {
            sell_req: Some(sell),
            sell_amount: Some(5.0),
            ..Default::default()
        };
        let doge = ledger.create_payout(new_payout("DOGE", Some(leg.clone()))).unwrap();
        let btc = ledger.create_payout(new_payout("BTC", Some(leg))).unwrap();
        assert_eq!(ledger.payout_status(doge).unwrap(), PayoutStatus::PendingSale);

        ledger.update_trade(sell, 6, Some(0.02), Some(0.0001)).unwrap();
        assert_eq!(ledger.trade(sell).unwrap().status(), TradeStatus::Complete);
        assert_eq!(ledger.payout_status(doge).unwrap(), PayoutStatus::SoldPendingPurchase);
        assert_eq!(ledger.payout_status(btc).unwrap(), PayoutStatus::PendingPayout);

        let buy = ledger.create_trade("DOGE", 0.02, TradeKind::Buy, T0);
        ledger.set_exchange(doge, Some(buy), None).unwrap();
        ledger.set_exchange(btc, Some(buy), None).unwrap();
        assert_eq!(ledger.payout_status(doge).unwrap(), PayoutStatus::Purchasing);
        assert_eq!(ledger.payout_status(btc).unwrap(), PayoutStatus::PendingPayout);
        assert_eq!(ledger.payout(doge).unwrap().final_amount(), None);

        ledger.set_exchange(doge, None, Some(1_000.0)).unwrap();
        assert_eq!(ledger.payout(doge).unwrap().final_amount(), Some(1_000.0));
        ledger.create_aggregate(aggregate(1_000.0), &[doge], T0).unwrap();
        assert_eq!(ledger.payout_status(doge).unwrap(), PayoutStatus::PendingBatching);
    }

    #[test]
    fn rejects_bad_references_and_amounts() {
        let mut ledger = ledger();
        let mut zero = new_payout("LTC", None);
        zero.amount = 0.0;
        assert!(matches!(
            ledger.create_payout(zero),
            Err(SettleError::NonPositiveAmount { .. })
        ));
        let mut orphaned = new_payout("LTC", None);
        orphaned.block_hash = "missing".into();
        assert!(matches!(ledger.create_payout(orphaned), Err(SettleError::NotFound { .. })));
        assert!(ledger.create_aggregate(aggregate(-1.0), &[], T0).is_err());
        assert!(ledger.create_aggregate(aggregate(1.0), &[99], T0).is_err());
        assert!(ledger.attach_transaction(1, "nope").is_err());
        assert_eq!(ledger.payouts_for("alice").count(), 0);
    }
}
