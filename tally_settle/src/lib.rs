//! Settlement records that sit on top of the share rollups: trades,
//! blocks, payouts and their batching, plus per-user credit computed from
//! the `shares` series.
#![deny(missing_docs)]

pub mod credit;
pub mod error;
pub mod ledger;
pub mod records;

pub use credit::{credit_for_period, SHARES_SERIES};
pub use error::{Result, SettleError};
pub use ledger::{BlockSummary, Ledger};
pub use records::{
    luck, AggregateStatus, AlgoTable, Block, BlockPayout, BlockStatus, ExchangeLeg, NewAggregate, NewPayout,
    Payout, PayoutAggregate, PayoutStatus, TradeKind, TradeRequest, TradeStatus, Transaction, SATOSHI,
};
