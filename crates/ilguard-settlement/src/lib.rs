//! Settlement Dispatcher: drives consensus results to a confirmed on-chain
//! settlement or rejection, retrying failed submissions a bounded number of
//! times.

mod dispatcher;
mod error;
mod events;
mod transaction;

pub use dispatcher::{BatchReport, SettlementDispatcher};
pub use error::SettlementError;
pub use events::SettlementEvent;
pub use transaction::{SettlementKey, SettlementStats, SettlementStatus, SettlementTransaction};

/// Reason recorded on chain for rejected claims.
pub const REJECTION_REASON: &str = "no compensable loss";
