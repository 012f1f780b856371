//! Postgres persistence via `sqlx`. Queries are written as runtime
//! `query`/`query_as` (not the `query!` macro) so the crate builds without a
//! live database reachable at compile time; the column lists still mirror
//! the `Numeric(36,18)` schema migrated in `migrations/`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction as SqlxTransaction};
use uuid::Uuid;

use crate::error::Error;
use crate::model::{
    Balance, Candle, CandleUnit, FeeOverride, Market, Order, OrderSide, Pair, Trade, Transaction,
    TransactionType,
};

pub type Db = SqlxTransaction<'static, Postgres>;

/// Acquire the exclusive per-pair ownership lock (§4.6, §5): `SELECT ...
/// FOR UPDATE SKIP LOCKED` on the Market row. Returns `None` if another
/// worker already holds it.
pub async fn try_lock_market(pool: &PgPool, pair: &Pair) -> Result<Option<Market>, Error> {
    let row = sqlx::query(
        "SELECT base_currency, quote_currency, current_price, maker_fee, taker_fee, \
         min_order_amount FROM market WHERE base_currency = $1 AND quote_currency = $2 \
         FOR UPDATE SKIP LOCKED",
    )
    .bind(&pair.base)
    .bind(&pair.quote)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| market_from_row(&r)))
}

fn market_from_row(row: &PgRow) -> Market {
    Market {
        base_currency: row.get("base_currency"),
        quote_currency: row.get("quote_currency"),
        current_price: row.get("current_price"),
        maker_fee: row.get("maker_fee"),
        taker_fee: row.get("taker_fee"),
        min_order_amount: row.get("min_order_amount"),
    }
}

/// Load every still-active order for a pair, in `(price, created_at)`
/// priority order per side — the order the book wants them inserted in.
pub async fn load_active_orders(pool: &PgPool, pair: &Pair) -> Result<Vec<Order>, Error> {
    let rows = sqlx::query(
        "SELECT id, user_id, created_at, side, base_currency, quote_currency, volume, \
         remaining_volume, price, filled_at, canceled_at FROM \"order\" \
         WHERE base_currency = $1 AND quote_currency = $2 \
         AND filled_at IS NULL AND canceled_at IS NULL \
         ORDER BY created_at ASC",
    )
    .bind(&pair.base)
    .bind(&pair.quote)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(order_from_row).collect())
}

fn order_from_row(row: &PgRow) -> Order {
    let side: String = row.get("side");
    Order {
        id: row.get("id"),
        user_id: row.get("user_id"),
        created_at: row.get("created_at"),
        side: if side == "buy" { OrderSide::Buy } else { OrderSide::Sell },
        base_currency: row.get("base_currency"),
        quote_currency: row.get("quote_currency"),
        volume: row.get("volume"),
        remaining_volume: row.get("remaining_volume"),
        price: row.get("price"),
        filled_at: row.get("filled_at"),
        canceled_at: row.get("canceled_at"),
    }
}

/// `SELECT ... FOR UPDATE`, materializing any `(user_id, currency)` key with
/// no existing row as a zero balance — the "get-or-create with for-update"
/// primitive §9 calls for.
pub async fn load_balances_for_update(
    db: &mut Db,
    keys: &[(Uuid, String)],
) -> Result<HashMap<(Uuid, String), Balance>, Error> {
    let mut out = HashMap::new();
    for (user_id, currency) in keys {
        let row = sqlx::query(
            "SELECT user_id, currency, amount, locked_amount FROM balance \
             WHERE user_id = $1 AND currency = $2 FOR UPDATE",
        )
        .bind(user_id)
        .bind(currency)
        .fetch_optional(&mut **db)
        .await?;
        let balance = match row {
            Some(row) => Balance {
                user_id: row.get("user_id"),
                currency: row.get("currency"),
                amount: row.get("amount"),
                locked_amount: row.get("locked_amount"),
            },
            None => Balance::zero(*user_id, currency),
        };
        out.insert((*user_id, currency.clone()), balance);
    }
    Ok(out)
}

pub async fn upsert_balance(db: &mut Db, balance: &Balance) -> Result<(), Error> {
    sqlx::query(
        "INSERT INTO balance (user_id, currency, amount, locked_amount) VALUES ($1, $2, $3, $4) \
         ON CONFLICT (user_id, currency) DO UPDATE SET amount = $3, locked_amount = $4",
    )
    .bind(balance.user_id)
    .bind(&balance.currency)
    .bind(balance.amount)
    .bind(balance.locked_amount)
    .execute(&mut **db)
    .await?;
    Ok(())
}

pub async fn insert_order(db: &mut Db, order: &Order) -> Result<(), Error> {
    sqlx::query(
        "INSERT INTO \"order\" (id, user_id, created_at, side, base_currency, quote_currency, \
         volume, remaining_volume, price, filled_at, canceled_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .bind(order.id)
    .bind(order.user_id)
    .bind(order.created_at)
    .bind(order.side.to_string())
    .bind(&order.base_currency)
    .bind(&order.quote_currency)
    .bind(order.volume)
    .bind(order.remaining_volume)
    .bind(order.price)
    .bind(order.filled_at)
    .bind(order.canceled_at)
    .execute(&mut **db)
    .await?;
    Ok(())
}

pub async fn update_order_fill(db: &mut Db, order: &Order) -> Result<(), Error> {
    sqlx::query(
        "UPDATE \"order\" SET remaining_volume = $2, filled_at = $3 WHERE id = $1",
    )
    .bind(order.id)
    .bind(order.remaining_volume)
    .bind(order.filled_at)
    .execute(&mut **db)
    .await?;
    Ok(())
}

pub async fn insert_trade(db: &mut Db, trade: &Trade) -> Result<(), Error> {
    sqlx::query(
        "INSERT INTO trade (id, created_at, base_currency, quote_currency, buy_order_id, \
         sell_order_id, side, volume, price, index) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(trade.id)
    .bind(trade.created_at)
    .bind(&trade.base_currency)
    .bind(&trade.quote_currency)
    .bind(trade.buy_order_id)
    .bind(trade.sell_order_id)
    .bind(trade.side.to_string())
    .bind(trade.volume)
    .bind(trade.price)
    .bind(trade.index)
    .execute(&mut **db)
    .await?;
    Ok(())
}

pub async fn insert_transaction(db: &mut Db, tx: &Transaction) -> Result<(), Error> {
    let type_str = match tx.r#type {
        TransactionType::Trade => "trade",
        TransactionType::Blockchain => "blockchain",
    };
    sqlx::query(
        "INSERT INTO transaction (id, created_at, type, user_id, currency, amount, trade_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(tx.id)
    .bind(tx.created_at)
    .bind(type_str)
    .bind(tx.user_id)
    .bind(&tx.currency)
    .bind(tx.amount)
    .bind(tx.trade_id)
    .execute(&mut **db)
    .await?;
    Ok(())
}

pub async fn update_market_current_price(
    db: &mut Db,
    pair: &Pair,
    price: Decimal,
) -> Result<(), Error> {
    sqlx::query(
        "UPDATE market SET current_price = $3 WHERE base_currency = $1 AND quote_currency = $2",
    )
    .bind(&pair.base)
    .bind(&pair.quote)
    .bind(price)
    .execute(&mut **db)
    .await?;
    Ok(())
}

/// §4.4 step 1: atomically cancel every still-active id in `order_ids`,
/// returning what settlement needs to release the lock for each.
pub async fn cancel_active_orders(
    db: &mut Db,
    order_ids: &[Uuid],
    now: DateTime<Utc>,
) -> Result<Vec<(Uuid, Uuid, String, Decimal)>, Error> {
    let rows = sqlx::query(
        "UPDATE \"order\" SET canceled_at = $2 \
         WHERE id = ANY($1) AND filled_at IS NULL AND canceled_at IS NULL \
         RETURNING id, user_id, side, base_currency, quote_currency, remaining_volume, price",
    )
    .bind(order_ids)
    .bind(now)
    .fetch_all(&mut **db)
    .await?;
    Ok(rows
        .iter()
        .map(|row| {
            let side: String = row.get("side");
            let base: String = row.get("base_currency");
            let quote: String = row.get("quote_currency");
            let remaining_volume: Decimal = row.get("remaining_volume");
            let price: Decimal = row.get("price");
            let (locking_currency, remaining_locked_amount) = if side == "buy" {
                (quote, remaining_volume * price)
            } else {
                (base, remaining_volume)
            };
            (row.get("id"), row.get("user_id"), locking_currency, remaining_locked_amount)
        })
        .collect())
}

/// Cold start (§4.5): the most recently persisted candle per bucket.
pub async fn fetch_last_candles(
    pool: &PgPool,
    pair: &Pair,
) -> Result<HashMap<CandleUnit, Candle>, Error> {
    let mut out = HashMap::new();
    for unit in crate::model::AVAILABLE_CANDLE_UNITS {
        let row = sqlx::query(
            "SELECT base_currency, quote_currency, unit, timestamp, updated_at, open, high, \
             low, close, volume, quote_volume FROM candle \
             WHERE base_currency = $1 AND quote_currency = $2 AND unit = $3 \
             ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(&pair.base)
        .bind(&pair.quote)
        .bind(unit as i32)
        .fetch_optional(pool)
        .await?;
        if let Some(row) = row {
            out.insert(CandleUnit(unit), candle_from_row(&row));
        }
    }
    Ok(out)
}

fn candle_from_row(row: &PgRow) -> Candle {
    Candle {
        base_currency: row.get("base_currency"),
        quote_currency: row.get("quote_currency"),
        unit: row.get("unit"),
        timestamp: row.get("timestamp"),
        updated_at: row.get("updated_at"),
        open: row.get("open"),
        high: row.get("high"),
        low: row.get("low"),
        close: row.get("close"),
        volume: row.get("volume"),
        quote_volume: row.get("quote_volume"),
    }
}

pub async fn upsert_candle(db: &mut Db, candle: &Candle) -> Result<(), Error> {
    sqlx::query(
        "INSERT INTO candle (base_currency, quote_currency, unit, timestamp, updated_at, open, \
         high, low, close, volume, quote_volume) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11) \
         ON CONFLICT (base_currency, quote_currency, unit, timestamp) DO UPDATE SET \
         updated_at = $5, high = $7, low = $8, close = $9, volume = $10, quote_volume = $11",
    )
    .bind(&candle.base_currency)
    .bind(&candle.quote_currency)
    .bind(candle.unit)
    .bind(candle.timestamp)
    .bind(candle.updated_at)
    .bind(candle.open)
    .bind(candle.high)
    .bind(candle.low)
    .bind(candle.close)
    .bind(candle.volume)
    .bind(candle.quote_volume)
    .execute(&mut **db)
    .await?;
    Ok(())
}

/// The most recent trade for a pair, used to detect a candle gap at startup.
pub async fn fetch_last_trade(pool: &PgPool, pair: &Pair) -> Result<Option<Trade>, Error> {
    let row = sqlx::query(
        "SELECT id, created_at, base_currency, quote_currency, buy_order_id, sell_order_id, \
         side, volume, price, index FROM trade WHERE base_currency = $1 AND quote_currency = $2 \
         ORDER BY created_at DESC, index DESC LIMIT 1",
    )
    .bind(&pair.base)
    .bind(&pair.quote)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(trade_from_row))
}

/// Trades newer than `since`, ordered `(created_at, index)`, for gap-repair
/// synthesis (§4.5).
pub async fn fetch_trades_since(
    pool: &PgPool,
    pair: &Pair,
    since: DateTime<Utc>,
) -> Result<Vec<Trade>, Error> {
    let rows = sqlx::query(
        "SELECT id, created_at, base_currency, quote_currency, buy_order_id, sell_order_id, \
         side, volume, price, index FROM trade \
         WHERE base_currency = $1 AND quote_currency = $2 AND created_at > $3 \
         ORDER BY created_at ASC, index ASC",
    )
    .bind(&pair.base)
    .bind(&pair.quote)
    .bind(since)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(trade_from_row).collect())
}

fn trade_from_row(row: &PgRow) -> Trade {
    let side: String = row.get("side");
    Trade {
        id: row.get("id"),
        created_at: row.get("created_at"),
        base_currency: row.get("base_currency"),
        quote_currency: row.get("quote_currency"),
        buy_order_id: row.get("buy_order_id"),
        sell_order_id: row.get("sell_order_id"),
        side: if side == "buy" { OrderSide::Buy } else { OrderSide::Sell },
        volume: row.get("volume"),
        price: row.get("price"),
        index: row.get("index"),
    }
}

/// Per-account fee overrides for a pair, keyed by user id, loaded once at
/// worker startup and refreshed on reload (they change rarely, so the
/// worker does not reload them per command).
pub async fn load_fee_overrides(
    pool: &PgPool,
    pair: &Pair,
) -> Result<Vec<FeeOverride>, Error> {
    let rows = sqlx::query(
        "SELECT user_id, base_currency, quote_currency, maker_fee, taker_fee FROM fee_override \
         WHERE base_currency = $1 AND quote_currency = $2",
    )
    .bind(&pair.base)
    .bind(&pair.quote)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| FeeOverride {
            user_id: row.get("user_id"),
            base_currency: row.get("base_currency"),
            quote_currency: row.get("quote_currency"),
            maker_fee: row.get("maker_fee"),
            taker_fee: row.get("taker_fee"),
        })
        .collect())
}

/// Every `Market` row, used to spawn one worker per market at startup.
pub async fn list_markets(pool: &PgPool) -> Result<Vec<Market>, Error> {
    let rows = sqlx::query(
        "SELECT base_currency, quote_currency, current_price, maker_fee, taker_fee, \
         min_order_amount FROM market",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(market_from_row).collect())
}
