use rust_decimal::Decimal;
use uuid::Uuid;

/// A (user, currency) balance row. Lazily materialized on first reference;
/// mutated only inside a settlement or cancellation transaction.
///
/// Invariant: `amount >= locked_amount >= 0` (`ck_balance_amount`).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Balance {
    pub user_id: Uuid,
    pub currency: String,
    pub amount: Decimal,
    pub locked_amount: Decimal,
}

impl Balance {
    pub fn zero(user_id: Uuid, currency: &str) -> Self {
        Self {
            user_id,
            currency: currency.to_string(),
            amount: Decimal::ZERO,
            locked_amount: Decimal::ZERO,
        }
    }

    /// The portion of `amount` not backing an open order.
    pub fn usable_amount(&self) -> Decimal {
        self.amount - self.locked_amount
    }

    pub fn is_valid(&self) -> bool {
        self.amount >= self.locked_amount && self.locked_amount >= Decimal::ZERO
    }
}
