use std::time::Duration;

use flowstream::queue::{Queue, QueueError};
use futures_util::StreamExt;

#[tokio::test]
async fn test_bounded_queue_basic() {
    let queue = Queue::bounded(2);

    assert!(queue.push(1).await.is_ok());
    assert!(queue.push(2).await.is_ok());

    // Non-blocking push on a full queue
    assert!(matches!(queue.try_push(3), Err(QueueError::Full)));

    assert_eq!(queue.pop().await, Some(1));
    assert_eq!(queue.pop().await, Some(2));

    // Space freed up again
    assert!(queue.push(3).await.is_ok());
    assert_eq!(queue.pop().await, Some(3));
}

#[tokio::test]
async fn test_push_after_close_is_rejected() {
    let queue = Queue::bounded(5);

    queue.push(1).await.unwrap();
    queue.push(2).await.unwrap();

    queue.close();
    assert!(queue.is_closed());

    assert!(matches!(queue.push(3).await, Err(QueueError::Closed)));
    assert!(matches!(queue.try_push(3), Err(QueueError::Closed)));

    // Already-queued elements survive the close
    assert_eq!(queue.pop().await, Some(1));
    assert_eq!(queue.pop().await, Some(2));

    // Drained and closed: end of sequence, not a hang
    assert_eq!(queue.pop().await, None);
}

#[tokio::test]
async fn test_close_wakes_blocked_pusher() {
    let queue = Queue::bounded(1);
    queue.push(1).await.unwrap();

    let producer = queue.clone();
    let pusher = tokio::spawn(async move { producer.push(2).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.close();
    // Idempotent
    queue.close();

    let result = pusher.await.unwrap();
    assert_eq!(result, Err(QueueError::Closed));
}

#[tokio::test]
async fn test_close_wakes_blocked_popper() {
    let queue: Queue<i32> = Queue::bounded(4);

    let consumer = queue.clone();
    let popper = tokio::spawn(async move { consumer.pop().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.close();

    assert_eq!(popper.await.unwrap(), None);
}

#[tokio::test]
async fn test_unbounded_queue() {
    let queue = Queue::unbounded();
    assert_eq!(queue.capacity(), None);

    for i in 0..1000 {
        queue.push(i).await.unwrap();
    }
    queue.close();

    let items: Vec<_> = queue.into_stream().collect().await;
    assert_eq!(items, (0..1000).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_concurrent_producer_consumer() {
    let queue = Queue::bounded(8);

    let producer_queue = queue.clone();
    let producer = tokio::spawn(async move {
        for i in 0..50 {
            producer_queue.push(i).await.unwrap();
        }
        producer_queue.close();
    });

    let consumer = tokio::spawn(async move {
        let mut items = Vec::new();
        while let Some(item) = queue.pop().await {
            items.push(item);
        }
        items
    });

    let (_, items) = tokio::join!(producer, consumer);
    assert_eq!(items.unwrap(), (0..50).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_queue_len() {
    let queue = Queue::bounded(10);
    assert!(queue.is_empty());

    queue.push(1).await.unwrap();
    queue.push(2).await.unwrap();
    assert_eq!(queue.len(), 2);

    queue.pop().await;
    assert_eq!(queue.len(), 1);
}
