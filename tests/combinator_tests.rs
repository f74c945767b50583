use std::time::Duration;

use flowstream::Pipeline;
use rand::rngs::StdRng;
use rand::SeedableRng;

#[tokio::test]
async fn test_limit_while_stops_before_breaking_element() {
    let result = Pipeline::of(vec![1, 2, 3, 4, 1])
        .limit_while(|&x| x < 4)
        .to_vec()
        .await
        .unwrap();
    assert_eq!(result, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_limit_while_cursor_then_end_of_sequence() {
    let mut cursor = Pipeline::of(vec![1, 2, 3, 4, 1])
        .limit_while(|&x| x < 4)
        .into_cursor();

    assert_eq!(cursor.next().await.unwrap().unwrap(), 1);
    assert_eq!(cursor.next().await.unwrap().unwrap(), 2);
    assert_eq!(cursor.next().await.unwrap().unwrap(), 3);

    // Exhausted: end of sequence, not an error, and repeatably so.
    assert!(cursor.next().await.is_none());
    assert!(cursor.next().await.is_none());
}

#[tokio::test]
async fn test_limit_while_closes_infinite_upstream() {
    let pipeline = Pipeline::iterate(1, |x| x + 1);
    let upstream = pipeline.subscription();

    let result = pipeline.limit_while(|&x| x < 4).to_vec().await.unwrap();

    assert_eq!(result, vec![1, 2, 3]);
    assert!(upstream.is_closed());
}

#[tokio::test]
async fn test_limit_until_is_exclusive() {
    let result = Pipeline::of(1..=5)
        .limit_until(|&x| x == 3)
        .to_vec()
        .await
        .unwrap();
    assert_eq!(result, vec![1, 2]);
}

#[tokio::test]
async fn test_skip_while_passes_first_failing_element() {
    let result = Pipeline::of(vec![1, 2, 3, 4, 1])
        .skip_while(|&x| x < 3)
        .to_vec()
        .await
        .unwrap();
    assert_eq!(result, vec![3, 4, 1]);
}

#[tokio::test]
async fn test_skip_until_includes_triggering_element() {
    let result = Pipeline::of(vec![1, 2, 3, 4, 5])
        .skip_until(|&x| x == 3)
        .to_vec()
        .await
        .unwrap();
    assert_eq!(result, vec![3, 4, 5]);
}

#[tokio::test]
async fn test_limit_for_zero_delivers_nothing() {
    let result = Pipeline::of(1..=5)
        .limit_for(Duration::ZERO)
        .to_vec()
        .await
        .unwrap();
    assert!(result.is_empty());
}

#[tokio::test]
async fn test_limit_for_generous_window_delivers_all() {
    let result = Pipeline::of(1..=5)
        .limit_for(Duration::from_secs(10))
        .to_vec()
        .await
        .unwrap();
    assert_eq!(result, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_skip_for_zero_passes_everything() {
    let result = Pipeline::of(1..=5)
        .skip_for(Duration::ZERO)
        .to_vec()
        .await
        .unwrap();
    assert_eq!(result, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_skip_for_generous_window_discards_all() {
    let result = Pipeline::of(1..=5)
        .skip_for(Duration::from_secs(10))
        .to_vec()
        .await
        .unwrap();
    assert!(result.is_empty());
}

#[tokio::test]
async fn test_zip_pairs_in_order() {
    let result = Pipeline::of(vec![1, 2, 3])
        .zip(Pipeline::of(vec!["a", "b", "c"]))
        .to_vec()
        .await
        .unwrap();
    assert_eq!(result, vec![(1, "a"), (2, "b"), (3, "c")]);
}

#[tokio::test]
async fn test_zip_length_is_shorter_side() {
    let result = Pipeline::of(vec![1, 2, 3, 4, 5])
        .zip(Pipeline::of(vec!["a", "b"]))
        .to_vec()
        .await
        .unwrap();
    assert_eq!(result.len(), 2);
}

#[tokio::test]
async fn test_zip_closes_infinite_side() {
    let infinite = Pipeline::iterate(0, |x| x + 1);
    let infinite_sub = infinite.subscription();

    let result = infinite
        .zip(Pipeline::of(vec![10, 20, 30]))
        .to_vec()
        .await
        .unwrap();

    assert_eq!(result, vec![(0, 10), (1, 20), (2, 30)]);
    assert!(infinite_sub.is_closed());
}

#[tokio::test]
async fn test_zip_with_combines_pairs() {
    let result = Pipeline::of(vec![1, 2, 3])
        .zip_with(Pipeline::of(vec![10, 20, 30]), |a, b| a + b)
        .to_vec()
        .await
        .unwrap();
    assert_eq!(result, vec![11, 22, 33]);
}

#[tokio::test]
async fn test_zip_with_index() {
    let result = Pipeline::of(vec!["a", "b", "c"])
        .zip_with_index()
        .to_vec()
        .await
        .unwrap();
    assert_eq!(result, vec![("a", 0), ("b", 1), ("c", 2)]);
}

#[tokio::test]
async fn test_window_while_has_inclusive_boundary() {
    let result = Pipeline::of(vec![1, 2, 3, 1, 2, 5, 1])
        .window_while(|&x| x < 3)
        .to_vec()
        .await
        .unwrap();
    // Each run includes the element that broke the predicate; the final
    // run is shorter because the source ended mid-run.
    assert_eq!(result, vec![vec![1, 2, 3], vec![1, 2, 5], vec![1]]);
}

#[tokio::test]
async fn test_window_while_single_run() {
    let result = Pipeline::of(vec![1, 1, 1])
        .window_while(|&x| x < 3)
        .to_vec()
        .await
        .unwrap();
    assert_eq!(result, vec![vec![1, 1, 1]]);
}

#[tokio::test]
async fn test_duplicate_runs_upstream_once() {
    let counter = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let executions = std::sync::Arc::clone(&counter);

    let (left, right) = Pipeline::of(1..=5)
        .map(move |x| {
            executions.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            x * 2
        })
        .duplicate();

    let left_values = left.to_vec().await.unwrap();
    let right_values = right.to_vec().await.unwrap();

    assert_eq!(left_values, vec![2, 4, 6, 8, 10]);
    assert_eq!(right_values, vec![2, 4, 6, 8, 10]);
    // One execution per element, not per fork
    assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_partition_routes_by_predicate() {
    let (evens, odds) = Pipeline::of(1..=6).partition(|&x| x % 2 == 0);

    assert_eq!(evens.to_vec().await.unwrap(), vec![2, 4, 6]);
    assert_eq!(odds.to_vec().await.unwrap(), vec![1, 3, 5]);
}

#[tokio::test]
async fn test_reverse() {
    let result = Pipeline::of(1..=3).reverse().to_vec().await.unwrap();
    assert_eq!(result, vec![3, 2, 1]);
}

#[tokio::test]
async fn test_shuffle_is_a_permutation() {
    let mut result = Pipeline::of(1..=20).shuffle().to_vec().await.unwrap();
    result.sort();
    assert_eq!(result, (1..=20).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_shuffle_with_seeded_rng() {
    let rng = StdRng::seed_from_u64(42);
    let mut result = Pipeline::of(1..=10)
        .shuffle_with(rng)
        .to_vec()
        .await
        .unwrap();
    result.sort();
    assert_eq!(result, (1..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_intersperse() {
    let result = Pipeline::of(vec![1, 2, 3])
        .intersperse(0)
        .to_vec()
        .await
        .unwrap();
    assert_eq!(result, vec![1, 0, 2, 0, 3]);
}

#[tokio::test]
async fn test_distinct_keeps_first_occurrence() {
    let result = Pipeline::of(vec![1, 2, 1, 3, 2, 4])
        .distinct()
        .to_vec()
        .await
        .unwrap();
    assert_eq!(result, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_scan_left_emits_seed_and_intermediates() {
    let words: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
    let result = Pipeline::of(words)
        .scan_left(String::new(), |acc, s| acc + &s)
        .to_vec()
        .await
        .unwrap();
    assert_eq!(result, vec!["", "a", "ab", "abc"]);
}

#[tokio::test]
async fn test_slice() {
    let result = Pipeline::of(1..=6).slice(2, 4).to_vec().await.unwrap();
    assert_eq!(result, vec![3, 4]);
}
