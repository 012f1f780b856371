//! The priority book: two price-ordered, time-secondary structures holding
//! resting orders for one trading pair, plus the price -> aggregate-volume
//! maps used for order-book snapshots.
//!
//! Asks are ordered `(price asc, created_at asc)`; bids `(price desc,
//! created_at asc)`. Both orderings are expressed as `BTreeMap` keys so
//! insert/remove/best are all `O(log n)`, including removal by id, which a
//! plain per-side heap can't do without a linear scan.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::model::{Order, OrderSide};

/// Ask-side sort key: ascending by price, then by insertion sequence.
type AskKey = (Decimal, u64);
/// Bid-side sort key: descending by price (via `Reverse`), then ascending by
/// insertion sequence.
type BidKey = (Reverse<Decimal>, u64);

#[derive(Debug, Default)]
pub struct Book {
    asks: BTreeMap<AskKey, Order>,
    bids: BTreeMap<BidKey, Order>,
    /// `price -> sum(remaining_volume)`, maintained inline on every mutation.
    ask_aggregate: BTreeMap<Decimal, Decimal>,
    bid_aggregate: BTreeMap<Decimal, Decimal>,
    /// `order id -> (price, sequence)` so `remove` doesn't need to scan.
    locations: HashMap<Uuid, (OrderSide, Decimal, u64)>,
    resident: HashSet<Uuid>,
    next_sequence: u64,
}

impl Book {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_resident(&self, id: Uuid) -> bool {
        self.resident.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.asks.len() + self.bids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load a resting order back into the book at a caller-supplied
    /// sequence (used when rehydrating from storage at startup/reload,
    /// where `created_at` ordering must be preserved).
    pub fn insert_with_sequence(&mut self, order: Order, sequence: u64) {
        let side = order.side;
        let price = order.price;
        let id = order.id;
        let remaining = order.remaining_volume;
        match side {
            OrderSide::Sell => {
                self.asks.insert((price, sequence), order);
            }
            OrderSide::Buy => {
                self.bids.insert((Reverse(price), sequence), order);
            }
        }
        self.add_to_aggregate(side, price, remaining);
        self.locations.insert(id, (side, price, sequence));
        self.resident.insert(id);
        self.next_sequence = self.next_sequence.max(sequence + 1);
    }

    /// Insert a freshly-arrived order, assigning it the next sequence number.
    pub fn insert(&mut self, order: Order) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let remaining = order.remaining_volume;
        let side = order.side;
        let price = order.price;
        let id = order.id;
        match side {
            OrderSide::Sell => {
                self.asks.insert((price, sequence), order);
            }
            OrderSide::Buy => {
                self.bids.insert((Reverse(price), sequence), order);
            }
        }
        self.add_to_aggregate(side, price, remaining);
        self.locations.insert(id, (side, price, sequence));
        self.resident.insert(id);
    }

    pub fn remove(&mut self, id: Uuid) -> Option<Order> {
        let (side, price, sequence) = self.locations.remove(&id)?;
        self.resident.remove(&id);
        let order = match side {
            OrderSide::Sell => self.asks.remove(&(price, sequence)),
            OrderSide::Buy => self.bids.remove(&(Reverse(price), sequence)),
        };
        if let Some(order) = &order {
            self.subtract_from_aggregate(side, price, order.remaining_volume);
        }
        order
    }

    /// Decrement the resident order's `remaining_volume` by `trade_volume`
    /// and keep the aggregate map in sync. Returns whether the order is now
    /// fully filled.
    pub fn apply_fill(&mut self, id: Uuid, trade_volume: Decimal) -> bool {
        let (side, price, sequence) = *self
            .locations
            .get(&id)
            .expect("apply_fill on a non-resident order");
        let order = match side {
            OrderSide::Sell => self.asks.get_mut(&(price, sequence)),
            OrderSide::Buy => self.bids.get_mut(&(Reverse(price), sequence)),
        }
        .expect("location map out of sync with side map");
        order.remaining_volume -= trade_volume;
        let is_zero = order.remaining_volume.is_zero();
        self.subtract_from_aggregate(side, price, trade_volume);
        is_zero
    }

    /// The current state of a resident order, for callers that need to
    /// snapshot it without removing it (e.g. a partial fill).
    pub fn get(&self, id: Uuid) -> Option<&Order> {
        let (side, price, sequence) = *self.locations.get(&id)?;
        match side {
            OrderSide::Sell => self.asks.get(&(price, sequence)),
            OrderSide::Buy => self.bids.get(&(Reverse(price), sequence)),
        }
    }

    pub fn best_ask(&self) -> Option<&Order> {
        self.asks.values().next()
    }

    pub fn best_bid(&self) -> Option<&Order> {
        self.bids.values().next()
    }

    /// Opposite-side orders in priority order, head first, for the matcher
    /// to walk.
    pub fn opposite_side(&self, side: OrderSide) -> Box<dyn Iterator<Item = &Order> + '_> {
        match side.opposite() {
            OrderSide::Sell => Box::new(self.asks.values()),
            OrderSide::Buy => Box::new(self.bids.values()),
        }
    }

    /// `(price, aggregate_volume)` pairs for one side, best-priority first,
    /// capped at `limit`.
    pub fn top_n(&self, side: OrderSide, limit: usize) -> Vec<(Decimal, Decimal)> {
        match side {
            OrderSide::Sell => self
                .ask_aggregate
                .iter()
                .take(limit)
                .map(|(p, v)| (*p, *v))
                .collect(),
            OrderSide::Buy => self
                .bid_aggregate
                .iter()
                .rev()
                .take(limit)
                .map(|(p, v)| (*p, *v))
                .collect(),
        }
    }

    /// The aggregate volume resident at `(side, price)`, 0 if none.
    pub fn aggregate_at(&self, side: OrderSide, price: Decimal) -> Decimal {
        let map = match side {
            OrderSide::Sell => &self.ask_aggregate,
            OrderSide::Buy => &self.bid_aggregate,
        };
        map.get(&price).copied().unwrap_or(Decimal::ZERO)
    }

    fn add_to_aggregate(&mut self, side: OrderSide, price: Decimal, volume: Decimal) {
        let map = match side {
            OrderSide::Sell => &mut self.ask_aggregate,
            OrderSide::Buy => &mut self.bid_aggregate,
        };
        *map.entry(price).or_insert(Decimal::ZERO) += volume;
    }

    fn subtract_from_aggregate(&mut self, side: OrderSide, price: Decimal, volume: Decimal) {
        let map = match side {
            OrderSide::Sell => &mut self.ask_aggregate,
            OrderSide::Buy => &mut self.bid_aggregate,
        };
        if let Some(entry) = map.get_mut(&price) {
            *entry -= volume;
            if entry.is_zero() {
                map.remove(&price);
            }
        }
    }

    /// Remove everything; used when a worker reloads the book from storage
    /// after a rolled-back command.
    pub fn clear(&mut self) {
        self.asks.clear();
        self.bids.clear();
        self.ask_aggregate.clear();
        self.bid_aggregate.clear();
        self.locations.clear();
        self.resident.clear();
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    use super::*;

    fn resting(side: OrderSide, price: Decimal, volume: Decimal) -> Order {
        Order {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            created_at: Utc::now(),
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

    #[test]
    fn asks_are_priced_ascending_and_bids_descending() {
        let mut book = Book::new();
        book.insert(resting(OrderSide::Sell, dec!(11000), dec!(30)));
        book.insert(resting(OrderSide::Sell, dec!(10000), dec!(20)));
        book.insert(resting(OrderSide::Buy, dec!(8000), dec!(5)));
        book.insert(resting(OrderSide::Buy, dec!(9000), dec!(15)));

        assert_eq!(book.best_ask().unwrap().price, dec!(10000));
        assert_eq!(book.best_bid().unwrap().price, dec!(9000));
    }

    #[test]
    fn ties_at_the_same_price_resolve_oldest_first() {
        let mut book = Book::new();
        let first = resting(OrderSide::Sell, dec!(10000), dec!(20));
        let first_id = first.id;
        book.insert(first);
        book.insert(resting(OrderSide::Sell, dec!(10000), dec!(25)));

        assert_eq!(book.best_ask().unwrap().id, first_id);
    }

    #[test]
    fn remove_updates_the_aggregate_and_drops_zeroed_price_levels() {
        let mut book = Book::new();
        let order = resting(OrderSide::Sell, dec!(10000), dec!(20));
        let id = order.id;
        book.insert(order);
        assert_eq!(book.aggregate_at(OrderSide::Sell, dec!(10000)), dec!(20));

        book.remove(id);
        assert_eq!(book.aggregate_at(OrderSide::Sell, dec!(10000)), dec!(0));
        assert!(book.is_empty());
    }

    #[test]
    fn apply_fill_reports_whether_the_order_is_now_empty() {
        let mut book = Book::new();
        let order = resting(OrderSide::Sell, dec!(10000), dec!(20));
        let id = order.id;
        book.insert(order);

        assert!(!book.apply_fill(id, dec!(5)));
        assert_eq!(book.aggregate_at(OrderSide::Sell, dec!(10000)), dec!(15));
        assert!(book.apply_fill(id, dec!(15)));
    }

    #[test]
    fn top_n_is_best_priority_first_on_both_sides() {
        let mut book = Book::new();
        book.insert(resting(OrderSide::Sell, dec!(11000), dec!(30)));
        book.insert(resting(OrderSide::Sell, dec!(10000), dec!(20)));
        book.insert(resting(OrderSide::Buy, dec!(8000), dec!(5)));
        book.insert(resting(OrderSide::Buy, dec!(9000), dec!(15)));

        assert_eq!(book.top_n(OrderSide::Sell, 10), vec![(dec!(10000), dec!(20)), (dec!(11000), dec!(30))]);
        assert_eq!(book.top_n(OrderSide::Buy, 10), vec![(dec!(9000), dec!(15)), (dec!(8000), dec!(5))]);
    }
}
