//! §4.7/§5: the publisher must never block or panic the caller, even once
//! its drain task has exited (bad transport URL standing in for "bus
//! unreachable").

use iu_matching_engine::model::Pair;
use iu_matching_engine::publisher::{BookSnapshot, Event};

#[tokio::test]
async fn publish_after_drain_task_exits_does_not_panic() {
    let pair = Pair::new("BTC", "USDT");
    let handle = iu_matching_engine::publisher::spawn("not-a-redis-url", &pair);

    // give the drain task a chance to fail Client::open and return.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    handle.publish(Event::Order {
        pair: pair.to_string(),
        book: BookSnapshot { sell: vec![], buy: vec![] },
    });
    handle.publish_global(Event::Market(vec![]));
}
