use rust_decimal::Decimal;

use super::Pair;

/// A trading pair's configuration. Owned by the market registry; the engine
/// only ever mutates `current_price`, after the last trade of a batch.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Market {
    pub base_currency: String,
    pub quote_currency: String,
    pub current_price: Decimal,
    pub maker_fee: Decimal,
    pub taker_fee: Decimal,
    pub min_order_amount: Decimal,
}

impl Market {
    pub fn pair(&self) -> Pair {
        Pair::new(self.base_currency.clone(), self.quote_currency.clone())
    }
}
