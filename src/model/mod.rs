mod balance;
mod candle;
mod fee_override;
mod market;
mod order;
mod trade;
mod transaction;

pub use balance::Balance;
pub use candle::{Candle, CandleUnit, AVAILABLE_CANDLE_UNITS};
pub use fee_override::FeeOverride;
pub use market::Market;
pub use order::{Order, OrderSide};
pub use trade::Trade;
pub use transaction::{Transaction, TransactionType};

/// The distinguished account that receives every fee transaction.
/// All-zero UUID.
pub fn fee_user_id() -> uuid::Uuid {
    uuid::Uuid::nil()
}

/// An ordered `base/quote` trading pair, e.g. `BTC/USDT`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pair {
    pub base: String,
    pub quote: String,
}

impl Pair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self { base: base.into(), quote: quote.into() }
    }

    /// The lowercase `base/quote` form used to derive queue/bus channel names,
    /// e.g. `btc/usdt` -> stream `order_book.btc/usdt`.
    pub fn lowercase(&self) -> String {
        format!("{}/{}", self.base.to_lowercase(), self.quote.to_lowercase())
    }
}

impl std::fmt::Display for Pair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}
