use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use flowstream::{Panicked, Pipeline, RetryPolicy, StageError};
use tokio::runtime::Runtime;

#[derive(Debug, Clone, thiserror::Error)]
#[error("flaky: {0}")]
struct Flaky(String);

#[test]
fn test_retry_succeeds_within_budget() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        // Fails on attempts 1 and 2, succeeds on attempt 3.
        let result = Pipeline::of(vec![7])
            .with_retry(RetryPolicy::Fixed {
                max_retries: 2,
                delay: Duration::from_millis(1),
            })
            .try_map(move |x| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(Flaky(format!("attempt {}", n)))
                } else {
                    Ok(x * 2)
                }
            })
            .to_vec()
            .await
            .unwrap();

        assert_eq!(result, vec![14]);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    });
}

#[test]
fn test_retry_exhaustion_preserves_input() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        // Same transformation, but only one retry: attempts 1 and 2 fail
        // and the element becomes a terminal failure.
        let result = Pipeline::of(vec![7])
            .with_retry(RetryPolicy::Fixed {
                max_retries: 1,
                delay: Duration::from_millis(1),
            })
            .try_map(move |x: i32| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(Flaky(format!("attempt {}", n)))
                } else {
                    Ok(x * 2)
                }
            })
            .to_vec()
            .await;

        match result {
            Err(StageError::Element(failure)) => {
                assert_eq!(failure.input_ref::<i32>(), Some(&7));
                assert_eq!(failure.attempts(), 2);
                assert!(failure.cause_ref::<Flaky>().is_some());
            }
            other => panic!("expected element failure, got {:?}", other),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    });
}

#[test]
fn test_retry_immediate_policy() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        let result = Pipeline::of(vec![1])
            .with_retry(RetryPolicy::Immediate { max_retries: 5 })
            .try_map(move |x| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 4 {
                    Err(Flaky("not yet".into()))
                } else {
                    Ok(x + 100)
                }
            })
            .to_vec()
            .await
            .unwrap();

        assert_eq!(result, vec![101]);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    });
}

#[test]
fn test_retry_fixed_delay_backs_off() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        let start = Instant::now();
        let result = Pipeline::of(vec![1])
            .with_retry(RetryPolicy::Fixed {
                max_retries: 2,
                delay: Duration::from_millis(30),
            })
            .try_map(move |x| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(Flaky("not yet".into()))
                } else {
                    Ok(x)
                }
            })
            .to_vec()
            .await
            .unwrap();

        // Two failed attempts means two backoff sleeps.
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert_eq!(result, vec![1]);
    });
}

#[test]
fn test_no_retry_by_default() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        let result = Pipeline::of(vec![1])
            .try_map(move |_: i32| -> Result<i32, Flaky> {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Flaky("always".into()))
            })
            .to_vec()
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn test_on_fail_recovers_with_input() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let result = Pipeline::of(vec![1, 2, 3])
            .try_map(|x| {
                if x == 2 {
                    Err(Flaky("two".into()))
                } else {
                    Ok(x * 10)
                }
            })
            .on_fail(|failure| failure.input_ref::<i32>().map(|x| x * 100))
            .to_vec()
            .await
            .unwrap();

        assert_eq!(result, vec![10, 200, 30]);
    });
}

#[test]
fn test_on_fail_for_matches_cause_type() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let result = Pipeline::of(vec![1, 2, 3])
            .try_map(|x| {
                if x == 2 {
                    Err(Flaky("two".into()))
                } else {
                    Ok(x)
                }
            })
            .on_fail_for::<Flaky, _>(|_cause, _failure| -1)
            .to_vec()
            .await
            .unwrap();

        assert_eq!(result, vec![1, -1, 3]);
    });
}

#[test]
fn test_on_fail_for_ignores_other_causes() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let result = Pipeline::of(vec![1, 2])
            .try_map(|x| {
                if x == 2 {
                    Err(io::Error::new(io::ErrorKind::Other, "io"))
                } else {
                    Ok(x)
                }
            })
            .on_fail_for::<Flaky, _>(|_cause, _failure| -1)
            .to_vec()
            .await;

        // The io failure is not of type Flaky, so it survives recovery.
        assert!(matches!(result, Err(StageError::Element(_))));
    });
}

#[test]
fn test_capture_routes_failures_to_side_channel() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let captured: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);

        let result = Pipeline::of(1..=4)
            .try_map(|x| {
                if x % 2 == 0 {
                    Err(Flaky("even".into()))
                } else {
                    Ok(x * 10)
                }
            })
            .capture(move |failure| {
                if let Some(input) = failure.input_ref::<i32>() {
                    sink.lock().unwrap().push(*input);
                }
            })
            .to_vec()
            .await
            .unwrap();

        // Captured elements drop out of the main sequence.
        assert_eq!(result, vec![10, 30]);
        assert_eq!(*captured.lock().unwrap(), vec![2, 4]);
    });
}

#[test]
fn test_panic_becomes_element_failure() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let result = Pipeline::of(vec![1, 2, 3])
            .map(|x| {
                if x == 2 {
                    panic!("boom on {}", x);
                }
                x
            })
            .to_vec()
            .await;

        match result {
            Err(StageError::Element(failure)) => {
                assert_eq!(failure.input_ref::<i32>(), Some(&2));
                let cause = failure.cause_ref::<Panicked>().expect("panicked cause");
                assert!(cause.0.contains("boom"));
            }
            other => panic!("expected element failure, got {:?}", other),
        }
    });
}

#[test]
fn test_first_failure_in_index_order_wins() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let result = Pipeline::of(vec![1, 2, 3, 4])
            .try_map(|x| {
                if x >= 3 {
                    Err(Flaky(format!("bad {}", x)))
                } else {
                    Ok(x)
                }
            })
            .to_vec()
            .await;

        match result {
            Err(StageError::Element(failure)) => {
                assert_eq!(failure.input_ref::<i32>(), Some(&3));
            }
            other => panic!("expected element failure, got {:?}", other),
        }
    });
}
