use rust_decimal::Decimal;
use uuid::Uuid;

/// A per-account fee exception, consulted before a trade falls back to the
/// market's default `maker_fee`/`taker_fee`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FeeOverride {
    pub user_id: Uuid,
    pub base_currency: String,
    pub quote_currency: String,
    pub maker_fee: Option<Decimal>,
    pub taker_fee: Option<Decimal>,
}
