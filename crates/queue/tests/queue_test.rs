//! End-to-end tests against a real etcd. These require an etcd reachable
//! at `localhost:2379` (the same "test against the real backing store,
//! don't mock it" approach `automations`' tests take with a fixed Postgres
//! connection string).

use std::collections::HashSet;
use std::time::Duration;

use etcd_client::Client;
use queue::{Queue, QueueConfig};
use tokio_util::sync::CancellationToken;

const ETCD_ENDPOINT: &str = "localhost:2379";

fn init_tracing() {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::DEBUG.into())
                .from_env_lossy(),
        )
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

async fn connect() -> Client {
    init_tracing();
    Client::connect([ETCD_ENDPOINT], None)
        .await
        .expect("connect to etcd (requires a running etcd reachable at localhost:2379)")
}

fn unique_name(test: &str) -> String {
    format!("{test}-{}", rand::random::<u32>())
}

fn fast_config(item_timeout: Duration) -> QueueConfig {
    QueueConfig {
        item_timeout,
        keepalive_interval: Duration::from_millis(200),
        root: "/sensu.io/queue-tests".to_string(),
    }
}

// Round-trip: enqueue one item, dequeue it, ack it.
#[tokio::test]
async fn round_trip() {
    let client = connect().await;
    let queue = Queue::with_config(unique_name("round-trip"), client, fast_config(Duration::from_secs(30)));
    let cancel = CancellationToken::new();

    queue.enqueue(&cancel, "a").await.expect("enqueue");

    let item = queue.dequeue(&cancel).await.expect("dequeue");
    assert_eq!(item.value(), b"a");

    item.ack(&cancel).await.expect("ack");
    // A second ack is a no-op, not an error.
    item.ack(&cancel).await.expect("second ack is idempotent");
}

// FIFO order: three serial enqueues come back in the same order.
#[tokio::test]
async fn fifo_order() {
    let client = connect().await;
    let queue = Queue::with_config(unique_name("fifo"), client, fast_config(Duration::from_secs(30)));
    let cancel = CancellationToken::new();

    for value in ["a", "b", "c"] {
        queue.enqueue(&cancel, value).await.expect("enqueue");
    }

    for expected in ["a", "b", "c"] {
        let item = queue.dequeue(&cancel).await.expect("dequeue");
        assert_eq!(item.value(), expected.as_bytes());
        item.ack(&cancel).await.expect("ack");
    }
}

// Nack returns an item to the work lane; both values are eventually
// delivered to some consumer.
#[tokio::test]
async fn nack_redelivers_the_item() {
    let client = connect().await;
    let queue = Queue::with_config(unique_name("nack"), client, fast_config(Duration::from_secs(30)));
    let cancel = CancellationToken::new();

    queue.enqueue(&cancel, "x").await.expect("enqueue x");
    queue.enqueue(&cancel, "y").await.expect("enqueue y");

    let first = queue.dequeue(&cancel).await.expect("dequeue");
    assert!(first.value() == b"x" || first.value() == b"y");
    first.nack(&cancel).await.expect("nack");

    let mut seen = HashSet::new();
    for _ in 0..2 {
        let item = queue.dequeue(&cancel).await.expect("dequeue");
        seen.insert(item.value().to_vec());
        item.ack(&cancel).await.expect("ack");
    }

    assert_eq!(seen, HashSet::from([b"x".to_vec(), b"y".to_vec()]));
}

// An item whose consumer "crashes" (its keepalive scope is cancelled)
// reappears in the work lane after item_timeout.
#[tokio::test]
async fn reap_redelivers_after_a_crashed_consumer() {
    let client = connect().await;
    let item_timeout = Duration::from_millis(500);
    let queue = Queue::with_config(unique_name("reap"), client, fast_config(item_timeout));

    let consumer_scope = CancellationToken::new();
    queue.enqueue(&consumer_scope, "z").await.expect("enqueue");

    let item = queue.dequeue(&consumer_scope).await.expect("dequeue");
    assert_eq!(item.value(), b"z");

    // Simulate a crash: stop the keepalive without acking or nacking.
    consumer_scope.cancel();
    drop(item);

    tokio::time::sleep(item_timeout + Duration::from_millis(750)).await;

    let new_scope = CancellationToken::new();
    let redelivered = queue.dequeue(&new_scope).await.expect("dequeue after reap");
    assert_eq!(redelivered.value(), b"z");
    redelivered.ack(&new_scope).await.expect("ack");
}

// 10 concurrent consumers dequeue-and-ack 40 payloads enqueued by 4
// concurrent producers; each payload is delivered and acked exactly once.
#[tokio::test]
async fn competing_consumers_deliver_each_payload_exactly_once() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 10;
    const CONSUMERS: usize = 10;
    const TOTAL: usize = PRODUCERS * PER_PRODUCER;

    let name = unique_name("competing");
    let cancel = CancellationToken::new();

    let producers = (0..PRODUCERS).map(|p| {
        let name = name.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let client = connect().await;
            let queue = Queue::with_config(name, client, fast_config(Duration::from_secs(30)));
            for i in 0..PER_PRODUCER {
                queue
                    .enqueue(&cancel, format!("p{p}-i{i}"))
                    .await
                    .expect("enqueue");
            }
        })
    });
    futures::future::join_all(producers).await;

    let acked = std::sync::Arc::new(tokio::sync::Mutex::new(Vec::<Vec<u8>>::new()));
    let consumers = (0..CONSUMERS).map(|_| {
        let name = name.clone();
        let acked = acked.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let client = connect().await;
            let queue = Queue::with_config(name, client, fast_config(Duration::from_secs(30)));
            loop {
                // Bound each dequeue so a consumer that drains the work
                // lane before its peers do doesn't block forever on the
                // watch waiting for work that will never arrive.
                let item = match tokio::time::timeout(Duration::from_millis(500), queue.dequeue(&cancel)).await {
                    Ok(Ok(item)) => item,
                    Ok(Err(_)) | Err(_) => return,
                };
                let value = item.value().to_vec();
                item.ack(&cancel).await.expect("ack");
                acked.lock().await.push(value);
            }
        })
    });
    futures::future::join_all(consumers).await;

    let acked = acked.lock().await;
    assert_eq!(acked.len(), TOTAL);

    let unique: HashSet<_> = acked.iter().cloned().collect();
    assert_eq!(unique.len(), TOTAL, "no payload was delivered more than once");
}

// A consumer blocked on an empty queue wakes up when a producer
// enqueues, within a bounded delay.
#[tokio::test]
async fn watch_wakes_a_blocked_consumer() {
    let client = connect().await;
    let name = unique_name("watch-wakeup");
    let queue = std::sync::Arc::new(Queue::with_config(name, client, fast_config(Duration::from_secs(30))));
    let cancel = CancellationToken::new();

    let consumer = {
        let queue = queue.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { queue.dequeue(&cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    queue.enqueue(&cancel, "late").await.expect("enqueue");

    let item = tokio::time::timeout(Duration::from_secs(5), consumer)
        .await
        .expect("dequeue completed within the bounded delay")
        .expect("dequeue task did not panic")
        .expect("dequeue");

    assert_eq!(item.value(), b"late");
    item.ack(&cancel).await.expect("ack");
}
