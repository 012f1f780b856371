use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Trade,
    Blockchain,
}

/// An append-only balance movement. `Σ Transaction.amount` for a
/// (user, currency) pair always equals `Balance.amount` for that pair
/// (`ck_transaction_amount` forbids `amount == 0`).
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub r#type: TransactionType,
    pub user_id: Uuid,
    pub currency: String,
    pub amount: Decimal,
    /// Set when `type == Trade`; links back to the trade that produced it.
    pub trade_id: Option<Uuid>,
}
