//! The matcher: walks the opposite side of the book head-first and produces
//! trades for one incoming order, per strict price-time priority.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::book::Book;
use crate::decimal::notional;
use crate::error::Error;
use crate::model::{Market, Order, OrderSide, Trade};

/// The effect of matching one incoming order.
pub struct MatchOutcome {
    /// Trades produced, in execution order (`index` 0, 1, 2, ...).
    pub trades: Vec<Trade>,
    /// Every resting order whose `remaining_volume` changed, in fill order,
    /// each carrying its post-fill state (`is_active()` tells partial from
    /// fully-filled). The caller persists each one's new remaining_volume
    /// and, if filled, `filled_at`.
    pub touched_makers: Vec<Order>,
    /// The incoming order's final state: either resting in the book with
    /// `remaining_volume > 0`, or fully filled.
    pub incoming: Order,
}

/// Match `incoming` against `book`, mutating the book in place.
///
/// Returns `Ok(None)` for the two silent-drop cases: notional below
/// `min_order_amount`, and an already-resident id (idempotent retry of an
/// at-least-once redelivery).
pub fn match_order(
    book: &mut Book,
    market: &Market,
    mut incoming: Order,
    now: DateTime<Utc>,
) -> Result<Option<MatchOutcome>, Error> {
    if notional(incoming.volume, incoming.price) < market.min_order_amount {
        return Ok(None);
    }
    if book.is_resident(incoming.id) {
        return Ok(None);
    }

    let mut trades = Vec::new();
    let mut touched_makers = Vec::new();

    loop {
        if incoming.remaining_volume.is_zero() {
            break;
        }
        let (resting_id, resting_price, resting_remaining, buy_order_id, sell_order_id) = {
            let resting = match incoming.side {
                OrderSide::Buy => book.best_ask(),
                OrderSide::Sell => book.best_bid(),
            };
            let Some(resting) = resting else { break };
            if incoming.side.price_exceeds(resting.price, incoming.price) {
                break;
            }
            let (buy_id, sell_id) = match incoming.side {
                OrderSide::Buy => (incoming.id, resting.id),
                OrderSide::Sell => (resting.id, incoming.id),
            };
            (resting.id, resting.price, resting.remaining_volume, buy_id, sell_id)
        };

        let trade_volume = resting_remaining.min(incoming.remaining_volume);
        if trade_volume.is_zero() {
            return Err(Error::ZeroTradeVolume(incoming.id));
        }

        let trade = Trade {
            id: Uuid::new_v4(),
            created_at: now,
            base_currency: incoming.base_currency.clone(),
            quote_currency: incoming.quote_currency.clone(),
            buy_order_id,
            sell_order_id,
            side: incoming.side,
            volume: trade_volume,
            price: resting_price,
            index: trades.len() as i32,
        };

        incoming.remaining_volume -= trade_volume;
        let maker_filled = book.apply_fill(resting_id, trade_volume);
        let maker_snapshot = if maker_filled {
            let mut removed = book.remove(resting_id).ok_or(Error::MissingMaker(resting_id))?;
            removed.mark_filled(now);
            removed
        } else {
            book.get(resting_id).ok_or(Error::MissingMaker(resting_id))?.clone()
        };
        touched_makers.push(maker_snapshot);

        trades.push(trade);
    }

    if incoming.remaining_volume.is_zero() {
        incoming.mark_filled(now);
    } else {
        book.insert(incoming.clone());
    }

    Ok(Some(MatchOutcome { trades, touched_makers, incoming }))
}

/// Used by settlement to decide how much locked balance to release for a
/// maker fill: `trade_volume * price` for the buy side, `trade_volume` for
/// the sell side.
pub fn maker_release_amount(side: OrderSide, trade_volume: Decimal, price: Decimal) -> Decimal {
    match side {
        OrderSide::Buy => notional(trade_volume, price),
        OrderSide::Sell => trade_volume,
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    use super::*;

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

    fn resting(side: OrderSide, price: Decimal, volume: Decimal, created_at: DateTime<Utc>) -> Order {
        Order {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            created_at,
            side,
            base_currency: "BTC".to_string(),
            quote_currency: "USDT".to_string(),
            volume,
            remaining_volume: volume,
            price,
            filled_at: None,
            canceled_at: None,
        }
    }

    fn incoming(side: OrderSide, price: Decimal, volume: Decimal, at: DateTime<Utc>) -> Order {
        resting(side, price, volume, at)
    }

    /// S1: a marketable buy sweeps two resting asks at the same price,
    /// partially filling the second, and leaves the third ask untouched.
    #[test]
    fn partial_match_across_two_price_levels() {
        let now = Utc::now();
        let mut book = Book::new();
        let ask_a = resting(OrderSide::Sell, dec!(10000), dec!(20), now);
        let ask_a_id = ask_a.id;
        book.insert(ask_a);
        let ask_b = resting(OrderSide::Sell, dec!(10000), dec!(25), now);
        let ask_b_id = ask_b.id;
        book.insert(ask_b);
        book.insert(resting(OrderSide::Sell, dec!(11000), dec!(30), now));

        let buy = incoming(OrderSide::Buy, dec!(10000), dec!(30), now);
        let outcome = match_order(&mut book, &market(), buy, now).unwrap().unwrap();

        assert_eq!(outcome.trades.len(), 2);
        assert_eq!(outcome.trades[0].volume, dec!(20));
        assert_eq!(outcome.trades[1].volume, dec!(10));
        assert!(outcome.incoming.remaining_volume.is_zero());
        assert!(!book.is_resident(ask_a_id));
        assert!(book.is_resident(ask_b_id));
        assert_eq!(book.get(ask_b_id).unwrap().remaining_volume, dec!(15));
    }

    /// S6: replaying the same id while it's still resident in the book is a
    /// silent no-op, not a duplicate trade.
    #[test]
    fn idempotent_retry_of_a_resident_order_is_a_no_op() {
        let now = Utc::now();
        let mut book = Book::new();
        let order = resting(OrderSide::Buy, dec!(9000), dec!(10), now);
        book.insert(order.clone());

        let outcome = match_order(&mut book, &market(), order, now).unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn below_minimum_notional_is_silently_dropped() {
        let now = Utc::now();
        let mut book = Book::new();
        let tiny = incoming(OrderSide::Buy, dec!(10000), dec!(0.000001), now);
        let outcome = match_order(&mut book, &market(), tiny, now).unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn non_marketable_order_rests_without_trading() {
        let now = Utc::now();
        let mut book = Book::new();
        book.insert(resting(OrderSide::Sell, dec!(10000), dec!(20), now));

        let buy = incoming(OrderSide::Buy, dec!(9000), dec!(5), now);
        let outcome = match_order(&mut book, &market(), buy, now).unwrap().unwrap();
        assert!(outcome.trades.is_empty());
        assert!(book.is_resident(outcome.incoming.id));
    }
}
