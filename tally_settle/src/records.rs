//! Settlement records and the statuses derived from them.
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{Result, SettleError};

/// Smallest currency unit; percentages applied to payouts round to it.
pub const SATOSHI: f64 = 1e-8;

/// Direction of an exchange trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeKind {
    /// Sell mined currency.
    Sell,
    /// Buy the payout currency.
    Buy,
}

/// Progress of a trade request, as reported by the external trader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TradeStatus {
    /// Waiting for coins to reach the exchange.
    PendingDeposit,
    /// Order is live.
    Selling,
    /// Waiting for coins to leave the exchange.
    PendingWithdrawal,
    /// Done.
    Complete,
    /// Any other status code.
    Error,
}

impl TradeStatus {
    /// Code written by the trader for a finished trade.
    pub const COMPLETE_CODE: i16 = 6;

    /// Decode a stored status code.
    pub fn from_code(code: i16) -> Self {
        match code {
            0 => TradeStatus::PendingDeposit,
            2 => TradeStatus::Selling,
            4 => TradeStatus::PendingWithdrawal,
            Self::COMPLETE_CODE => TradeStatus::Complete,
            _ => TradeStatus::Error,
        }
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TradeStatus::PendingDeposit => "Pending Exchange Deposit",
            TradeStatus::Selling => "Selling on Exchange",
            TradeStatus::PendingWithdrawal => "Pending Exchange Withdrawal",
            TradeStatus::Complete => "Complete",
            TradeStatus::Error => "Error",
        })
    }
}

/// Request for the external trader to sell or buy a currency.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRequest {
    /// Ledger id.
    pub id: u64,
    /// Currency code.
    pub currency: String,
    /// Quantity to trade.
    pub quantity: f64,
    /// Creation time.
    pub created_at: OffsetDateTime,
    /// Sell or buy.
    pub kind: TradeKind,
    /// Filled quantity, once known.
    pub exchanged_quantity: Option<f64>,
    /// Exchange fees, once known.
    pub fees: Option<f64>,
    /// Raw status code.
    pub status_code: i16,
}

impl TradeRequest {
    /// Decoded status.
    pub fn status(&self) -> TradeStatus {
        TradeStatus::from_code(self.status_code)
    }
}

/// One share chain's part of a found block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockPayout {
    /// Share chain id.
    pub chain_id: u32,
    /// Block this belongs to.
    pub block_hash: String,
    /// Slice at which the block was solved on this chain.
    pub solve_slice: Option<u64>,
    /// Shares on this chain.
    pub shares: f64,
    /// Fees and donations kept by the pool.
    pub contributed: Option<f64>,
    /// Bonuses paid out.
    pub bonus_paid: Option<f64>,
    /// Whether this part has been paid.
    pub paid: bool,
}

/// Confirmation state of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlockStatus {
    /// Matured.
    Mature,
    /// Orphaned.
    Orphan,
    /// Neither yet.
    PendingConfirmation,
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BlockStatus::Mature => "Mature",
            BlockStatus::Orphan => "Orphan",
            BlockStatus::PendingConfirmation => "Pending confirmation",
        })
    }
}

/// A block found by the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// Block hash.
    pub hash: String,
    /// Chain height.
    pub height: u64,
    /// Finder.
    pub user: String,
    /// Finder's worker.
    pub worker: String,
    /// When the block was found.
    pub found_at: OffsetDateTime,
    /// When work on the block started.
    pub time_started: OffsetDateTime,
    /// Orphaned by the network.
    pub orphan: bool,
    /// Matured.
    pub mature: bool,
    /// Total value including fees.
    pub total_value: f64,
    /// Transaction fees part of `total_value`.
    pub transaction_fees: f64,
    /// Network difficulty when solved.
    pub difficulty: f64,
    /// Currency code.
    pub currency: String,
    /// Merge mined.
    pub merged: bool,
    /// Hashing algorithm.
    pub algo: String,
}

impl Block {
    /// Confirmation state; maturity wins over the orphan flag.
    pub fn status(&self) -> BlockStatus {
        if self.mature {
            BlockStatus::Mature
        } else if self.orphan {
            BlockStatus::Orphan
        } else {
            BlockStatus::PendingConfirmation
        }
    }

    /// Time from start of work to the find, rounded to whole seconds.
    pub fn duration(&self) -> time::Duration {
        let elapsed = self.found_at - self.time_started;
        time::Duration::seconds((elapsed.as_seconds_f64()).round() as i64)
    }
}

/// Hashes represented by one share, per algorithm.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct AlgoTable {
    hashes_per_share: HashMap<String, f64>,
}

impl AlgoTable {
    /// Table from `(algo, hashes_per_share)` pairs.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self {
            hashes_per_share: entries.into_iter().map(|(a, h)| (a.into(), h)).collect(),
        }
    }

    /// Hashes per share for `algo`.
    pub fn hashes_per_share(&self, algo: &str) -> Result<f64> {
        self.hashes_per_share
            .get(algo)
            .copied()
            .ok_or_else(|| SettleError::UnknownAlgo(algo.to_string()))
    }
}

/// Luck of a block in percent: expected hashes over hashes spent.
/// Zero shares count as one.
pub fn luck(difficulty: f64, shares_to_solve: f64, hashes_per_share: f64) -> f64 {
    let shares = if shares_to_solve == 0.0 { 1.0 } else { shares_to_solve };
    difficulty * 2f64.powi(32) / (shares * hashes_per_share) * 100.0
}

/// A broadcast payout transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    /// Transaction id.
    pub txid: String,
    /// Seen confirmed on chain.
    pub confirmed: bool,
    /// Creation time.
    pub created_at: OffsetDateTime,
    /// Currency code.
    pub currency: String,
}

/// Sell/buy trades a payout goes through when the user wants a currency
/// other than the one mined.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExchangeLeg {
    /// Sell trade request.
    pub sell_req: Option<u64>,
    /// Amount sold.
    pub sell_amount: Option<f64>,
    /// Buy trade request.
    pub buy_req: Option<u64>,
    /// Amount bought; the final payout amount.
    pub buy_amount: Option<f64>,
}

/// Fields needed to create a payout.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPayout {
    /// Block the credit comes from.
    pub block_hash: String,
    /// Credited user.
    pub user: String,
    /// Share chain.
    pub sharechain_id: u32,
    /// Destination address; defaults to the user.
    pub payout_address: Option<String>,
    /// Currency paid.
    pub payout_currency: String,
    /// Credited amount after fees.
    pub amount: f64,
    /// Pool fee fraction.
    pub fee_perc: f64,
    /// Donation fraction; negative for a bonus.
    pub pd_perc: f64,
    /// Exchange trades, for exchanged payouts.
    pub exchange: Option<ExchangeLeg>,
}

/// A credit to a user's balance from one block.
#[derive(Debug, Clone, PartialEq)]
pub struct Payout {
    /// Ledger id.
    pub id: u64,
    /// Block the credit comes from.
    pub block_hash: String,
    /// Credited user.
    pub user: String,
    /// Share chain.
    pub sharechain_id: u32,
    /// Destination address.
    pub payout_address: String,
    /// Currency paid.
    pub payout_currency: String,
    /// Credited amount after fees.
    pub amount: f64,
    /// Pool fee fraction.
    pub fee_perc: f64,
    /// Donation fraction.
    pub pd_perc: f64,
    /// Cleared for batching.
    pub payable: bool,
    /// Aggregate this payout was batched into.
    pub aggregate_id: Option<u64>,
    /// Exchange trades, for exchanged payouts.
    pub exchange: Option<ExchangeLeg>,
}

impl Payout {
    /// Fee plus donation fraction.
    pub fn cut_perc(&self) -> f64 {
        self.pd_perc + self.fee_perc
    }

    /// Amount before the cut.
    pub fn mined(&self) -> f64 {
        self.amount / (1.0 - self.cut_perc())
    }

    /// Amount taken (or added, when negative) by the cut, in whole units
    /// of [`SATOSHI`].
    pub fn perc_applied(&self) -> f64 {
        (self.cut_perc() * self.mined() / SATOSHI).round() * SATOSHI
    }

    /// Cut as displayed: a bonus is labelled, a fee is shown negative.
    pub fn perc_applied_label(&self) -> String {
        if self.cut_perc() < 0.0 {
            format!("BONUS {}", self.perc_applied())
        } else {
            format!("{}", -self.perc_applied())
        }
    }

    /// Amount the user finally receives. Exchanged payouts pay out what
    /// the buy leg returned, unknown until it fills.
    pub fn final_amount(&self) -> Option<f64> {
        match &self.exchange {
            Some(leg) => leg.buy_amount,
            None => Some(self.amount),
        }
    }
}

/// Where a payout stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PayoutStatus {
    /// Source block orphaned.
    BlockOrphaned,
    /// Source block not mature yet.
    PendingBlockConfirmation,
    /// Paid in a confirmed transaction.
    TransactionConfirmed(String),
    /// Paid in a broadcast, unconfirmed transaction.
    TransactionPending(String),
    /// Batched, transaction not sent.
    PayoutPending,
    /// Waiting to be batched.
    PendingBatching,
    /// Direct payout on a mature block not yet marked payable.
    AwaitingPayable,
    /// Buy leg in progress.
    Purchasing,
    /// Sold into the pool's base currency; waiting for the payout.
    PendingPayout,
    /// Sold, buy leg not started.
    SoldPendingPurchase,
    /// Sale not complete.
    PendingSale,
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayoutStatus::BlockOrphaned => f.write_str("Block Orphaned"),
            PayoutStatus::PendingBlockConfirmation => f.write_str("Pending Block Confirmation"),
            PayoutStatus::TransactionConfirmed(txid) => write!(f, "Payout Transaction {txid} Confirmed"),
            PayoutStatus::TransactionPending(txid) => write!(f, "Payout Transaction {txid} Pending"),
            PayoutStatus::PayoutPending => f.write_str("Payout Pending"),
            PayoutStatus::PendingBatching => f.write_str("Pending batching for payout"),
            PayoutStatus::AwaitingPayable => f.write_str("Awaiting payable"),
            PayoutStatus::Purchasing => f.write_str("Purchasing desired currency"),
            PayoutStatus::PendingPayout => f.write_str("Pending Payout"),
            PayoutStatus::SoldPendingPurchase => f.write_str("Sold on exchange, pending purchase"),
            PayoutStatus::PendingSale => f.write_str("Pending sale on exchange"),
        }
    }
}

/// Fields needed to create an aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAggregate {
    /// User paid.
    pub user: String,
    /// Destination address.
    pub payout_address: String,
    /// Currency code.
    pub currency: String,
    /// Total amount.
    pub amount: f64,
    /// Number of payouts batched.
    pub count: Option<u32>,
}

/// Payouts batched into one outgoing transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct PayoutAggregate {
    /// Ledger id.
    pub id: u64,
    /// Transaction carrying the batch, once sent.
    pub transaction_id: Option<String>,
    /// User paid.
    pub user: String,
    /// Destination address.
    pub payout_address: String,
    /// Currency code.
    pub currency: String,
    /// Creation time.
    pub created_at: OffsetDateTime,
    /// Total amount.
    pub amount: f64,
    /// Number of payouts batched.
    pub count: Option<u32>,
}

/// Whether an aggregate has been sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AggregateStatus {
    /// Transaction attached.
    Complete,
    /// No transaction yet.
    PayoutPending,
}

impl fmt::Display for AggregateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AggregateStatus::Complete => "Complete",
            AggregateStatus::PayoutPending => "Payout pending",
        })
    }
}

impl PayoutAggregate {
    /// Sent or not.
    pub fn status(&self) -> AggregateStatus {
        if self.transaction_id.is_some() {
            AggregateStatus::Complete
        } else {
            AggregateStatus::PayoutPending
        }
    }
}

pub(crate) fn check_positive(what: &'static str, amount: f64) -> Result<()> {
    if amount > 0.0 {
        Ok(())
    } else {
        Err(SettleError::NonPositiveAmount { what, amount })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn payout(fee: f64, pd: f64) -> Payout {
        Payout {
            id: 1,
            block_hash: "h".into(),
            user: "u".into(),
            sharechain_id: 1,
            payout_address: "u".into(),
            payout_currency: "LTC".into(),
            amount: 9.0,
            fee_perc: fee,
            pd_perc: pd,
            payable: false,
            aggregate_id: None,
            exchange: None,
        }
    }

    #[test]
    fn trade_status_codes() {
        let names: Vec<String> = [0, 2, 4, 6, 1, 7].into_iter().map(|c| TradeStatus::from_code(c).to_string()).collect();
        assert_eq!(
            names,
            vec![
                "Pending Exchange Deposit",
                "Selling on Exchange",
                "Pending Exchange Withdrawal",
                "Complete",
                "Error",
                "Error"
            ]
        );
    }

    #[test]
    fn payout_cut_math() {
        let p = payout(0.05, 0.05);
        assert!((p.cut_perc() - 0.1).abs() < 1e-12);
        assert!((p.mined() - 10.0).abs() < 1e-9);
        assert!((p.perc_applied() - 1.0).abs() < 1e-9);
        assert_eq!(p.final_amount(), Some(9.0));

        let bonus = payout(0.0, -0.1);
        assert!(bonus.perc_applied_label().starts_with("BONUS"));

        let mut exchanged = payout(0.0, 0.0);
        exchanged.exchange = Some(ExchangeLeg::default());
        assert_eq!(exchanged.final_amount(), None);
    }

    #[test]
    fn block_status_and_duration() {
        let mut block = Block {
            hash: "h".into(),
            height: 10,
            user: "u".into(),
            worker: "w".into(),
            found_at: datetime!(2024-01-01 00:10:00.6 UTC),
            time_started: datetime!(2024-01-01 00:00:00 UTC),
            orphan: true,
            mature: true,
            total_value: 50.0,
            transaction_fees: 0.1,
            difficulty: 1.0,
            currency: "LTC".into(),
            merged: false,
            algo: "scrypt".into(),
        };
        assert_eq!(block.status(), BlockStatus::Mature);
        block.mature = false;
        assert_eq!(block.status().to_string(), "Orphan");
        block.orphan = false;
        assert_eq!(block.status().to_string(), "Pending confirmation");
        assert_eq!(block.duration(), time::Duration::seconds(601));
    }

    #[test]
    fn luck_against_algo_table() {
        let algos = AlgoTable::new([("scrypt", 65_536.0)]);
        let hps = algos.hashes_per_share("scrypt").unwrap();
        // 65536 shares of 65536 hashes at difficulty 1 is exactly expected work.
        assert!((luck(1.0, 65_536.0, hps) - 100.0).abs() < 1e-9);
        assert!((luck(1.0, 0.0, hps) - 6_553_600.0).abs() < 1e-6);
        assert!(matches!(algos.hashes_per_share("x11"), Err(SettleError::UnknownAlgo(_))));
    }

    #[test]
    fn positivity() {
        assert!(check_positive("payout", 0.1).is_ok());
        assert!(matches!(
            check_positive("payout", 0.0),
            Err(SettleError::NonPositiveAmount { what: "payout", .. })
        ));
    }
}
