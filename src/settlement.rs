//! Settlement: turns a batch of trades into six transactions per trade,
//! updates balances in place, and adjusts locked amounts for the incoming
//! order and any maker it filled.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::decimal::{notional, round_amount};
use crate::matcher::maker_release_amount;
use crate::model::{
    fee_user_id, Balance, FeeOverride, Market, Order, OrderSide, Trade, Transaction,
    TransactionType,
};

/// An in-memory view of the balances touched by one command, keyed by
/// `(user_id, currency)`. The worker loads this from storage with
/// `SELECT ... FOR UPDATE` before calling into settlement and persists it
/// back inside the same transaction.
#[derive(Debug, Default)]
pub struct BalanceSheet {
    balances: HashMap<(Uuid, String), Balance>,
}

impl BalanceSheet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a balance row loaded from storage.
    pub fn put(&mut self, balance: Balance) {
        self.balances.insert((balance.user_id, balance.currency.clone()), balance);
    }

    pub fn get_or_create(&mut self, user_id: Uuid, currency: &str) -> &mut Balance {
        self.balances
            .entry((user_id, currency.to_string()))
            .or_insert_with(|| Balance::zero(user_id, currency))
    }

    pub fn get(&self, user_id: Uuid, currency: &str) -> Option<&Balance> {
        self.balances.get(&(user_id, currency.to_string()))
    }

    pub fn apply_amount(&mut self, user_id: Uuid, currency: &str, delta: Decimal) {
        self.get_or_create(user_id, currency).amount += delta;
    }

    pub fn adjust_locked(&mut self, user_id: Uuid, currency: &str, delta: Decimal) {
        self.get_or_create(user_id, currency).locked_amount += delta;
    }

    /// §8 invariant 1: every touched balance must satisfy
    /// `amount >= locked_amount >= 0`.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        for ((user_id, currency), balance) in &self.balances {
            if !balance.is_valid() {
                return Err(crate::error::Error::NotEnoughBalance {
                    user_id: *user_id,
                    currency: currency.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn into_touched(self) -> Vec<((Uuid, String), Balance)> {
        self.balances.into_iter().collect()
    }
}

/// Lock the incoming order's remaining (post-match) notional in its locking
/// currency. Call once per placement, after matching, with the order's
/// *final* state — a fully-filled order locks nothing.
pub fn lock_incoming_order(sheet: &mut BalanceSheet, order: &Order) {
    let amount = order.remaining_locked_amount();
    if !amount.is_zero() {
        sheet.adjust_locked(order.user_id, order.locking_currency(), amount);
    }
}

/// Release the locked amount a filled maker order no longer needs.
pub fn release_maker_fill(
    sheet: &mut BalanceSheet,
    maker_user_id: Uuid,
    maker_side: OrderSide,
    maker_locking_currency: &str,
    trade_volume: Decimal,
    trade_price: Decimal,
) {
    let amount = maker_release_amount(maker_side, trade_volume, trade_price);
    sheet.adjust_locked(maker_user_id, maker_locking_currency, -amount);
}

/// Per-account maker/taker overrides, keyed by user id, consulted before
/// falling back to the market's default fees. Absent either field, the
/// market default applies for that role.
#[derive(Debug, Default)]
pub struct FeeSchedule {
    overrides: HashMap<Uuid, FeeOverride>,
}

impl FeeSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, fee_override: FeeOverride) {
        self.overrides.insert(fee_override.user_id, fee_override);
    }

    fn maker_fee(&self, user_id: Uuid, market: &Market) -> Decimal {
        self.overrides
            .get(&user_id)
            .and_then(|o| o.maker_fee)
            .unwrap_or(market.maker_fee)
    }

    fn taker_fee(&self, user_id: Uuid, market: &Market) -> Decimal {
        self.overrides
            .get(&user_id)
            .and_then(|o| o.taker_fee)
            .unwrap_or(market.taker_fee)
    }
}

/// Produce and apply the six transactions for one trade (§4.3). The maker
/// is whichever counterparty did not trigger the match: for a buy-side
/// aggressor that's the seller, and vice versa.
pub fn settle_trade(
    trade: &Trade,
    market: &Market,
    buyer_id: Uuid,
    seller_id: Uuid,
    fees: &FeeSchedule,
    sheet: &mut BalanceSheet,
) -> Vec<Transaction> {
    let (maker_id, taker_id) = match trade.side {
        OrderSide::Sell => (buyer_id, seller_id),
        OrderSide::Buy => (seller_id, buyer_id),
    };
    let maker_fee = fees.maker_fee(maker_id, market);
    let taker_fee = fees.taker_fee(taker_id, market);
    let (fee_sell, fee_buy) = match trade.side {
        OrderSide::Sell => (taker_fee, maker_fee),
        OrderSide::Buy => (maker_fee, taker_fee),
    };
    let fee_user = fee_user_id();
    let gross_quote = notional(trade.volume, trade.price);
    let seller_quote_amount = round_amount(gross_quote * (Decimal::ONE - fee_sell));
    let sell_fee_amount = round_amount(gross_quote * fee_sell);
    let buyer_base_amount = round_amount(trade.volume * (Decimal::ONE - fee_buy));
    let buy_fee_amount = round_amount(trade.volume * fee_buy);

    let mut push = |user_id: Uuid, currency: &str, amount: Decimal, sheet: &mut BalanceSheet| {
        sheet.apply_amount(user_id, currency, amount);
        Transaction {
            id: Uuid::new_v4(),
            created_at: trade.created_at,
            r#type: TransactionType::Trade,
            user_id,
            currency: currency.to_string(),
            amount,
            trade_id: Some(trade.id),
        }
    };

    vec![
        push(seller_id, &trade.quote_currency, seller_quote_amount, sheet),
        push(fee_user, &trade.quote_currency, sell_fee_amount, sheet),
        push(seller_id, &trade.base_currency, -trade.volume, sheet),
        push(buyer_id, &trade.quote_currency, -gross_quote, sheet),
        push(buyer_id, &trade.base_currency, buyer_base_amount, sheet),
        push(fee_user, &trade.base_currency, buy_fee_amount, sheet),
    ]
}

/// Returns `(base, quote)` total deltas across a trade's six transactions;
/// §8 invariant 4 requires both to be exactly zero.
pub fn conservation_check(trade: &Trade, transactions: &[Transaction]) -> (Decimal, Decimal) {
    let mut base_total = Decimal::ZERO;
    let mut quote_total = Decimal::ZERO;
    for tx in transactions {
        if tx.currency == trade.base_currency {
            base_total += tx.amount;
        } else if tx.currency == trade.quote_currency {
            quote_total += tx.amount;
        }
    }
    (base_total, quote_total)
}

/// Settle a whole batch of trades produced by one matcher invocation plus
/// the incoming order's entry lock and every filled maker's lock release.
pub fn settle_batch(
    trades: &[Trade],
    market: &Market,
    incoming_after_match: &Order,
    maker_orders: &HashMap<Uuid, Order>,
    fees: &FeeSchedule,
    sheet: &mut BalanceSheet,
) -> Result<Vec<Transaction>, crate::error::Error> {
    let mut transactions = Vec::new();
    for trade in trades {
        let (buyer_id, seller_id, maker_order) = if trade.side == OrderSide::Buy {
            // incoming is the buyer; the maker is the seller.
            let maker = maker_orders
                .get(&trade.sell_order_id)
                .expect("sell maker missing from snapshot");
            (incoming_after_match.user_id, maker.user_id, maker)
        } else {
            let maker = maker_orders
                .get(&trade.buy_order_id)
                .expect("buy maker missing from snapshot");
            (maker.user_id, incoming_after_match.user_id, maker)
        };
        transactions.extend(settle_trade(trade, market, buyer_id, seller_id, fees, sheet));
        release_maker_fill(
            sheet,
            maker_order.user_id,
            maker_order.side,
            maker_order.locking_currency(),
            trade.volume,
            trade.price,
        );
    }
    lock_incoming_order(sheet, incoming_after_match);
    sheet.validate()?;
    Ok(transactions)
}

pub fn created_at_now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    use super::*;
    use crate::model::OrderSide;

    fn market() -> Market {
        Market {
            base_currency: "BTC".to_string(),
            quote_currency: "USDT".to_string(),
            current_price: dec!(10000),
            maker_fee: dec!(0.001),
            taker_fee: dec!(0.002),
            min_order_amount: dec!(0.0001),
        }
    }

    fn trade(buy_order_id: Uuid, sell_order_id: Uuid, side: OrderSide) -> Trade {
        Trade {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            base_currency: "BTC".to_string(),
            quote_currency: "USDT".to_string(),
            buy_order_id,
            sell_order_id,
            side,
            volume: dec!(1),
            price: dec!(10000),
            index: 0,
        }
    }

    /// §8 invariant 4: the six transactions for one trade net to zero in
    /// both legs, fees included — they only move value between the two
    /// counterparties and the fee account.
    #[test]
    fn settle_trade_conserves_base_and_quote() {
        let buyer = Uuid::new_v4();
        let seller = Uuid::new_v4();
        let trade = trade(Uuid::new_v4(), Uuid::new_v4(), OrderSide::Buy);
        let mut sheet = BalanceSheet::new();
        let transactions = settle_trade(&trade, &market(), buyer, seller, &FeeSchedule::new(), &mut sheet);

        assert_eq!(transactions.len(), 6);
        let (base_total, quote_total) = conservation_check(&trade, &transactions);
        assert!(base_total.is_zero(), "base leg did not net to zero: {base_total}");
        assert!(quote_total.is_zero(), "quote leg did not net to zero: {quote_total}");
    }

    /// S3: a buyer with insufficient quote balance is rejected before any
    /// transaction is produced, leaving the sheet's invariant violated only
    /// in-memory — the caller must discard the transaction, not persist it.
    #[test]
    fn settle_batch_rejects_when_balance_would_go_negative() {
        let market = market();
        let buyer = Uuid::new_v4();
        let seller = Uuid::new_v4();
        let incoming_id = Uuid::new_v4();
        let maker_id = Uuid::new_v4();
        let trade = trade(incoming_id, maker_id, OrderSide::Buy);

        let mut sheet = BalanceSheet::new();
        sheet.put(Balance {
            user_id: buyer,
            currency: "USDT".to_string(),
            amount: dec!(100),
            locked_amount: dec!(0),
        });
        sheet.put(Balance {
            user_id: seller,
            currency: "BTC".to_string(),
            amount: dec!(10),
            locked_amount: dec!(0),
        });

        let incoming_after_match = Order {
            id: incoming_id,
            user_id: buyer,
            created_at: Utc::now(),
            side: OrderSide::Buy,
            base_currency: "BTC".to_string(),
            quote_currency: "USDT".to_string(),
            volume: dec!(1),
            remaining_volume: dec!(0),
            price: dec!(10000),
            filled_at: Some(Utc::now()),
            canceled_at: None,
        };
        let maker = Order {
            id: maker_id,
            user_id: seller,
            created_at: Utc::now(),
            side: OrderSide::Sell,
            base_currency: "BTC".to_string(),
            quote_currency: "USDT".to_string(),
            volume: dec!(1),
            remaining_volume: dec!(0),
            price: dec!(10000),
            filled_at: Some(Utc::now()),
            canceled_at: None,
        };
        let mut maker_orders = HashMap::new();
        maker_orders.insert(maker_id, maker);

        let result = settle_batch(
            &[trade],
            &market,
            &incoming_after_match,
            &maker_orders,
            &FeeSchedule::new(),
            &mut sheet,
        );

        assert!(matches!(result, Err(crate::error::Error::NotEnoughBalance { .. })));
    }

    /// A per-account override takes priority over the market default; a role
    /// with no override set still falls back to it.
    #[test]
    fn fee_schedule_prefers_override_over_market_default() {
        let market = market();
        let user_id = Uuid::new_v4();
        let mut fees = FeeSchedule::new();
        fees.put(FeeOverride {
            user_id,
            base_currency: market.base_currency.clone(),
            quote_currency: market.quote_currency.clone(),
            maker_fee: Some(dec!(0)),
            taker_fee: None,
        });

        assert_eq!(fees.maker_fee(user_id, &market), dec!(0));
        assert_eq!(fees.taker_fee(user_id, &market), market.taker_fee);
        assert_eq!(fees.maker_fee(Uuid::new_v4(), &market), market.maker_fee);
    }
}
