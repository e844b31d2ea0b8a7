use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

use pair_matching::domain::services::orderbook::keys::{book_key, quarantine_key};
use pair_matching::domain::services::orderbook::store::ScoredMember;
use pair_matching::inbounds::order_consumer::{Handled, handle_notification};
use pair_matching::outbounds::BusEventPublisher;
use pair_matching::{
    EventBus, EventGateway, GatewaySettings, MatchingEngine, MatchingEngineEvent, MemoryStore, Order, OrderBookStore,
    OrderId, OrderedStore, OrderbookError, Side, Trade, UpdateOutcome,
};

const PAIR: &str = "BTCUSD";

fn order(side: Side, price: &str, priority: &str, time: &str, amount: &str, id: &str) -> Order {
    Order::new(
        side,
        Decimal::from_str(price).unwrap(),
        Decimal::from_str(priority).unwrap(),
        Decimal::from_str(time).unwrap(),
        Decimal::from_str(amount).unwrap(),
        OrderId::new(id).unwrap(),
    )
    .unwrap()
}

fn new_book() -> Arc<OrderBookStore> {
    Arc::new(OrderBookStore::new(PAIR, Arc::new(MemoryStore::new())))
}

fn engine(book: &Arc<OrderBookStore>) -> (MatchingEngine, UnboundedReceiver<Trade>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MatchingEngine::new(book.clone(), tx), rx)
}

fn drain(rx: &mut UnboundedReceiver<Trade>) -> Vec<Trade> {
    let mut trades = Vec::new();
    while let Ok(trade) = rx.try_recv() {
        trades.push(trade);
    }
    trades
}

#[tokio::test]
async fn test_equal_orders_fill_completely() {
    let book = new_book();
    book.insert(order(Side::Bid, "240", "0", "1", "0.1", "A")).await.unwrap();
    book.insert(order(Side::Ask, "240", "0", "1", "0.1", "B")).await.unwrap();

    let (engine, mut rx) = engine(&book);
    let summary = engine.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(summary.trades, 1);

    let trades = drain(&mut rx);
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].price, dec!(240));
    assert_eq!(trades[0].amount, dec!(0.1));
    assert_eq!(trades[0].bid_id.as_str(), "A");
    assert_eq!(trades[0].ask_id.as_str(), "B");
    assert_eq!(book.len(Side::Bid).await.unwrap(), 0);
    assert_eq!(book.len(Side::Ask).await.unwrap(), 0);
}

#[tokio::test]
async fn test_partial_fill_leaves_residual_bid() {
    let book = new_book();
    book.insert(order(Side::Bid, "240", "0", "1", "0.2", "A")).await.unwrap();
    book.insert(order(Side::Ask, "240", "0", "1", "0.1", "B")).await.unwrap();

    let (engine, mut rx) = engine(&book);
    engine.run_pass(&CancellationToken::new()).await.unwrap();

    let trades = drain(&mut rx);
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].amount, dec!(0.1));
    assert_eq!(trades[0].price, dec!(240));

    let residual = book.peek_best(Side::Bid).await.unwrap().unwrap();
    assert_eq!(residual.id.as_str(), "A");
    assert_eq!(residual.amount, dec!(0.1));
    assert!(book.peek_best(Side::Ask).await.unwrap().is_none());
}

#[tokio::test]
async fn test_execution_price_follows_smaller_priority() {
    let book = new_book();
    book.insert(order(Side::Bid, "242", "1.0", "1", "0.1", "A")).await.unwrap();
    book.insert(order(Side::Ask, "240", "0.0", "1", "0.1", "B")).await.unwrap();

    let (engine, mut rx) = engine(&book);
    engine.run_pass(&CancellationToken::new()).await.unwrap();

    let trades = drain(&mut rx);
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].price, dec!(240));
}

#[tokio::test]
async fn test_uncrossed_book_publishes_ticker() {
    let book = new_book();
    book.insert(order(Side::Bid, "239", "0", "1", "1", "A")).await.unwrap();
    book.insert(order(Side::Ask, "241", "0", "1", "1", "B")).await.unwrap();

    let bus = EventBus::new(16);
    let mut events = bus.subscribe();
    let gateway = EventGateway::new(book.clone(), Arc::new(BusEventPublisher::new(bus)), GatewaySettings::default());
    let cancel = CancellationToken::new();
    let handle = gateway.start(cancel.clone()).unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("ticker published")
        .unwrap();
    assert!(matches!(event, MatchingEngineEvent::TickerUpdated { .. }));

    cancel.cancel();
    handle.join().await;

    assert_eq!(book.len(Side::Bid).await.unwrap(), 1);
    assert_eq!(book.len(Side::Ask).await.unwrap(), 1);
    let ticker = book.get_ticker().await.unwrap();
    assert_eq!(ticker.best_bid, Some(dec!(239)));
    assert_eq!(ticker.best_ask, Some(dec!(241)));
    assert_eq!(ticker.last_trade_price, None);
}

#[tokio::test]
async fn test_ticker_unavailable_before_first_pass() {
    let book = new_book();
    assert_eq!(
        book.get_ticker().await.unwrap_err(),
        OrderbookError::TickerUnavailable(PAIR.to_string())
    );
}

#[tokio::test]
async fn test_extraction_order_ignores_insertion_order() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut orders: Vec<Order> = (0..200)
        .map(|i| {
            let price = rng.gen_range(90..110).to_string();
            let priority = rng.gen_range(0..5).to_string();
            let time = rng.gen_range(0..1_000).to_string();
            order(Side::Ask, &price, &priority, &time, "1", &format!("ask-{i}"))
        })
        .collect();
    let mut expected = orders.clone();
    expected.sort_by(|a, b| {
        (a.priority, a.price, a.time, a.id.as_str()).cmp(&(b.priority, b.price, b.time, b.id.as_str()))
    });

    let mut extracted = Vec::new();
    for _ in 0..3 {
        orders.shuffle(&mut rng);
        let book = new_book();
        book.insert_many(orders.clone()).await.unwrap();
        let mut run = Vec::new();
        while let Some(order) = book.pop_best(Side::Ask).await.unwrap() {
            run.push(order.id);
        }
        extracted.push(run);
    }

    let expected: Vec<OrderId> = expected.into_iter().map(|o| o.id).collect();
    assert!(extracted.iter().all(|run| run == &expected));
}

#[tokio::test]
async fn test_pass_leaves_book_uncrossed_and_conserves_amounts() {
    let mut rng = StdRng::seed_from_u64(7);
    let book = new_book();
    let mut orders = Vec::new();
    for i in 0..60 {
        let side = if i % 2 == 0 { Side::Bid } else { Side::Ask };
        let price = rng.gen_range(95..106).to_string();
        let amount = Decimal::new(rng.gen_range(1..50), 1).to_string();
        orders.push(order(side, &price, "0", &i.to_string(), &amount, &format!("o-{i}")));
    }
    book.insert_many(orders).await.unwrap();
    let bids_before = book.total_amount(Side::Bid).await.unwrap();
    let asks_before = book.total_amount(Side::Ask).await.unwrap();

    let (engine, mut rx) = engine(&book);
    let summary = engine.run_pass(&CancellationToken::new()).await.unwrap();
    let trades = drain(&mut rx);
    assert_eq!(summary.trades, trades.len());

    let traded: Decimal = trades.iter().map(|t| t.amount).sum();
    assert_eq!(book.total_amount(Side::Bid).await.unwrap() + traded, bids_before);
    assert_eq!(book.total_amount(Side::Ask).await.unwrap() + traded, asks_before);

    if let (Some(bid), Some(ask)) = (
        book.peek_best(Side::Bid).await.unwrap(),
        book.peek_best(Side::Ask).await.unwrap(),
    ) {
        assert!(ask.price > bid.price);
    }
    assert!(trades.iter().all(|t| t.amount > Decimal::ZERO));
}

#[tokio::test]
async fn test_remove_is_idempotent() {
    let book = new_book();
    let bid = order(Side::Bid, "100", "0", "1", "1", "A");
    book.insert(bid.clone()).await.unwrap();

    assert!(book.remove(Side::Bid, &bid).await.unwrap());
    assert!(!book.remove(Side::Bid, &bid).await.unwrap());
    assert_eq!(book.len(Side::Bid).await.unwrap(), 0);
}

#[tokio::test]
async fn test_concurrent_updates_keep_one_entry() {
    let book = new_book();
    book.insert(order(Side::Ask, "100", "0", "1", "5", "A")).await.unwrap();

    let updates = (1..=10).map(|i| {
        let book = book.clone();
        async move {
            let update = order(Side::Ask, "100", "0", "1", &i.to_string(), "A");
            book.update(&update, false).await
        }
    });
    let outcomes = join_all(updates).await;
    assert!(outcomes.iter().all(|o| matches!(o, Ok(UpdateOutcome::Replaced))));

    let entries = book.entries(Side::Ask).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id.as_str(), "A");
    assert!(entries[0].amount >= dec!(1) && entries[0].amount <= dec!(10));
}

#[tokio::test]
async fn test_corrupt_best_bid_does_not_block_matching() {
    let store = Arc::new(MemoryStore::new());
    store
        .add(
            &book_key(PAIR, Side::Bid),
            vec![
                ScoredMember::new(dec!(0), "240|1|0.1|A"),
                ScoredMember::new(
                    dec!(5),
                    "00000000000000240.000000000000|00000000000000001.000000000000|0.1000000000001|A2",
                ),
            ],
        )
        .await
        .unwrap();
    let book = Arc::new(OrderBookStore::new(PAIR, store.clone()));
    book.insert(order(Side::Bid, "240", "0", "1", "0.1", "C")).await.unwrap();
    book.insert(order(Side::Ask, "240", "0", "1", "0.1", "B")).await.unwrap();

    let (engine, mut rx) = engine(&book);
    let summary = tokio::time::timeout(Duration::from_secs(2), engine.run_pass(&CancellationToken::new()))
        .await
        .expect("pass finishes")
        .unwrap();
    assert_eq!(summary.trades, 1);

    let trades = drain(&mut rx);
    assert_eq!(trades[0].bid_id.as_str(), "C");
    assert_eq!(book.len(Side::Bid).await.unwrap(), 0);
    assert_eq!(book.len(Side::Ask).await.unwrap(), 0);
    assert_eq!(store.len(&quarantine_key(PAIR, Side::Bid)).await.unwrap(), 2);
}

#[tokio::test]
async fn test_redelivered_funding_adds_liquidity_once() {
    let book = new_book();
    let gateway = EventGateway::new(
        book.clone(),
        Arc::new(BusEventPublisher::new(EventBus::new(16))),
        GatewaySettings::default(),
    );
    let body = br#"{"order": {"side": "ask", "price": "240", "amount": "1", "id": "B"}}"#;

    assert!(matches!(handle_notification(body, &gateway).await.unwrap(), Handled::Inserted(_)));
    for _ in 0..3 {
        assert!(matches!(handle_notification(body, &gateway).await.unwrap(), Handled::Duplicate(_)));
    }

    let asks = book.entries(Side::Ask).await.unwrap();
    assert_eq!(asks.len(), 1);
    assert_eq!(book.total_amount(Side::Ask).await.unwrap(), dec!(1));
}
