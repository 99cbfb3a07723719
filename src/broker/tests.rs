use super::{Broker, Message, SubscriptionState};
use crate::utils::error::BrokerError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(2);

fn collect(rx: &mpsc::Receiver<i32>, n: usize) -> Vec<i32> {
    (0..n)
        .map(|_| rx.recv_timeout(WAIT).expect("message not delivered"))
        .collect()
}

#[test]
fn test_publish_subscribe_order() {
    let broker = Broker::new();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();

    broker
        .subscribe("topic", move |msg: i32| sink.lock().unwrap().push(msg))
        .unwrap();

    for i in 0..5 {
        broker.publish("topic", i).unwrap();
    }

    thread::sleep(Duration::from_millis(100));
    assert_eq!(*received.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_many_messages_arrive_once_in_order() {
    let broker = Broker::new();
    let (tx, rx) = mpsc::channel();
    broker
        .subscribe("numbers", move |msg: i32| tx.send(msg).unwrap())
        .unwrap();

    for i in 0..1000 {
        broker.publish("numbers", i).unwrap();
    }

    assert_eq!(collect(&rx, 1000), (0..1000).collect::<Vec<_>>());
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn test_slow_subscriber_does_not_block_fast_one() {
    let broker = Broker::new();
    let (slow_tx, slow_rx) = mpsc::channel();
    let (fast_tx, fast_rx) = mpsc::channel();

    broker
        .subscribe("topic", move |msg: i32| {
            thread::sleep(Duration::from_millis(300));
            slow_tx.send(msg).unwrap();
        })
        .unwrap();
    broker
        .subscribe("topic", move |msg: i32| fast_tx.send(msg).unwrap())
        .unwrap();

    let start = Instant::now();
    broker.publish("topic", 1).unwrap();
    assert!(start.elapsed() < Duration::from_millis(100), "publish waited on a handler");

    assert_eq!(fast_rx.recv_timeout(Duration::from_millis(150)), Ok(1));
    assert!(start.elapsed() < Duration::from_millis(250));
    assert_eq!(slow_rx.recv_timeout(WAIT), Ok(1));
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let broker = Broker::new();
    let (tx, rx) = mpsc::channel();
    let sub = broker
        .subscribe("topic", move |msg: i32| tx.send(msg).unwrap())
        .unwrap();

    sub.unsubscribe();
    broker.publish("topic", 42).unwrap();

    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(broker.subscriber_count("topic"), 0);
    assert!(broker.subjects().is_empty());
}

#[test]
fn test_unsubscribe_delivers_already_queued_messages() {
    let broker = Broker::new();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let (tx, rx) = mpsc::channel();
    let sub = broker
        .subscribe("topic", move |msg: i32| {
            if msg == 0 {
                gate_rx.recv().unwrap();
            }
            tx.send(msg).unwrap();
        })
        .unwrap();

    for i in 0..3 {
        broker.publish("topic", i).unwrap();
    }
    sub.unsubscribe();
    assert_eq!(sub.state(), SubscriptionState::Draining);
    broker.publish("topic", 99).unwrap();
    gate_tx.send(()).unwrap();

    assert_eq!(collect(&rx, 3), vec![0, 1, 2]);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn test_unsubscribe_is_idempotent() {
    let broker = Broker::new();
    let (tx, rx) = mpsc::channel();
    let kept = broker
        .subscribe("topic", move |msg: i32| tx.send(msg).unwrap())
        .unwrap();
    let dropped = broker.subscribe("topic", |_: i32| {}).unwrap();
    assert_eq!(broker.subscriber_count("topic"), 2);

    dropped.unsubscribe();
    dropped.unsubscribe();
    assert_eq!(broker.subscriber_count("topic"), 1);

    broker.publish("topic", 7).unwrap();
    assert_eq!(rx.recv_timeout(WAIT), Ok(7));
    assert_eq!(kept.state(), SubscriptionState::Running);
}

#[test]
fn test_subscription_reaches_terminated() {
    let broker = Broker::new();
    let sub = broker.subscribe("topic", |_: i32| {}).unwrap();
    assert_eq!(sub.subject(), "topic");
    assert_eq!(sub.state(), SubscriptionState::Running);
    assert_eq!(broker.outstanding(), 1);

    sub.unsubscribe();
    let deadline = Instant::now() + WAIT;
    while sub.state() != SubscriptionState::Terminated {
        assert!(Instant::now() < deadline, "worker never terminated");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(broker.outstanding(), 0);
}

#[test]
fn test_publish_without_subscribers_is_ok() {
    let broker: Broker<i32> = Broker::new();
    assert!(broker.publish("nobody", 1).is_ok());
}

#[test]
fn test_subjects_are_isolated() {
    let broker = Broker::new();
    let (a_tx, a_rx) = mpsc::channel();
    let (b_tx, b_rx) = mpsc::channel();
    broker
        .subscribe("a", move |msg: i32| a_tx.send(msg).unwrap())
        .unwrap();
    broker
        .subscribe("b", move |msg: i32| b_tx.send(msg).unwrap())
        .unwrap();

    broker.publish("a", 1).unwrap();
    broker.publish("b", 2).unwrap();

    assert_eq!(a_rx.recv_timeout(WAIT), Ok(1));
    assert_eq!(b_rx.recv_timeout(WAIT), Ok(2));
    assert!(a_rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(broker.subjects(), vec!["a".to_string(), "b".to_string()]);
}

#[test]
fn test_panicking_handler_keeps_receiving() {
    let broker = Broker::new();
    let (tx, rx) = mpsc::channel();
    broker
        .subscribe("topic", move |msg: i32| {
            if msg == 1 {
                panic!("boom");
            }
            tx.send(msg).unwrap();
        })
        .unwrap();

    for i in 0..3 {
        broker.publish("topic", i).unwrap();
    }

    assert_eq!(collect(&rx, 2), vec![0, 2]);
    assert_eq!(broker.outstanding(), 1);
}

#[test]
fn test_brokers_are_independent() {
    let first = Broker::new();
    let second = Broker::new();
    let (tx, rx) = mpsc::channel();
    second
        .subscribe("topic", move |msg: i32| tx.send(msg).unwrap())
        .unwrap();

    first.publish("topic", 1).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(first.outstanding(), 0);
    assert_eq!(second.outstanding(), 1);
}

#[test]
fn test_message_carries_subject_and_timestamp() {
    let broker = Broker::new();
    let (tx, rx) = mpsc::channel();
    broker
        .subscribe("chat", move |msg: Message| tx.send(msg).unwrap())
        .unwrap();

    broker.publish("chat", Message::new("chat", "hello")).unwrap();

    let got = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(got.subject, "chat");
    assert_eq!(got.payload, "hello");
    assert!(got.timestamp > 0);
}

#[tokio::test]
async fn test_close_waits_for_queued_messages() {
    let broker = Broker::new();
    let processed = Arc::new(AtomicBool::new(false));
    let flag = processed.clone();
    broker
        .subscribe("topic", move |_: &'static str| {
            thread::sleep(Duration::from_millis(100));
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

    broker.publish("topic", "data").unwrap();
    broker.close(None).await.unwrap();

    assert!(processed.load(Ordering::SeqCst));
    assert_eq!(broker.outstanding(), 0);
}

#[tokio::test]
async fn test_close_drains_every_subscription() {
    let broker = Broker::new();
    let delivered = Arc::new(AtomicUsize::new(0));
    for subject in ["a", "b", "c"] {
        let counter = delivered.clone();
        broker
            .subscribe(subject, move |_: i32| {
                thread::sleep(Duration::from_millis(10));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    for i in 0..5 {
        for subject in ["a", "b", "c"] {
            broker.publish(subject, i).unwrap();
        }
    }

    broker.close(Some(WAIT)).await.unwrap();
    assert_eq!(delivered.load(Ordering::SeqCst), 15);
}

#[tokio::test]
async fn test_close_deadline_returns_promptly() {
    let broker = Broker::new();
    broker
        .subscribe("topic", |_: &'static str| {
            thread::sleep(Duration::from_millis(500));
        })
        .unwrap();
    broker.publish("topic", "data").unwrap();

    let start = Instant::now();
    let err = broker
        .close(Some(Duration::from_millis(100)))
        .await
        .unwrap_err();

    assert!(start.elapsed() < Duration::from_millis(200));
    match err {
        BrokerError::DeadlineExceeded {
            deadline,
            outstanding,
        } => {
            assert_eq!(deadline, Duration::from_millis(100));
            assert_eq!(outstanding, 1);
        }
        other => panic!("expected DeadlineExceeded, got {other:?}"),
    }
}

#[tokio::test]
async fn test_abandoned_worker_finishes_in_background() {
    let broker = Broker::new();
    let (tx, rx) = mpsc::channel();
    broker
        .subscribe("topic", move |msg: i32| {
            thread::sleep(Duration::from_millis(150));
            tx.send(msg).unwrap();
        })
        .unwrap();
    broker.publish("topic", 1).unwrap();
    broker.publish("topic", 2).unwrap();

    assert!(broker.close(Some(Duration::from_millis(10))).await.is_err());

    assert_eq!(collect(&rx, 2), vec![1, 2]);
    let deadline = Instant::now() + WAIT;
    while broker.outstanding() != 0 {
        assert!(Instant::now() < deadline, "abandoned worker never exited");
        thread::sleep(Duration::from_millis(5));
    }
}

#[tokio::test]
async fn test_close_with_cancel_signal() {
    let broker = Broker::new();
    broker
        .subscribe("topic", |_: i32| thread::sleep(Duration::from_millis(300)))
        .unwrap();
    broker.publish("topic", 1).unwrap();

    let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel::<()>();
    cancel_tx.send(()).unwrap();

    let err = broker.close_with(cancel_rx).await.unwrap_err();
    assert!(matches!(err, BrokerError::Cancelled { outstanding: 1 }));
}

#[tokio::test]
async fn test_operations_fail_after_close() {
    let broker = Broker::new();
    broker.subscribe("topic", |_: i32| {}).unwrap();
    broker.close(None).await.unwrap();

    assert!(broker.is_closed());
    assert!(matches!(
        broker.subscribe("topic", |_: i32| {}),
        Err(BrokerError::Closed)
    ));
    assert!(matches!(broker.publish("topic", 1), Err(BrokerError::Closed)));
    assert!(broker.subjects().is_empty());
}

#[tokio::test]
async fn test_operations_fail_after_failed_close() {
    let broker = Broker::new();
    broker
        .subscribe("topic", |_: i32| thread::sleep(Duration::from_millis(200)))
        .unwrap();
    broker.publish("topic", 1).unwrap();

    assert!(broker.close(Some(Duration::from_millis(1))).await.is_err());
    assert!(matches!(broker.publish("topic", 2), Err(BrokerError::Closed)));
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let broker = Broker::new();
    broker
        .subscribe("topic", |_: i32| thread::sleep(Duration::from_millis(300)))
        .unwrap();
    broker.publish("topic", 1).unwrap();
    let _ = broker.close(Some(Duration::from_millis(1))).await;

    let start = Instant::now();
    broker.close(None).await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[tokio::test]
async fn test_unsubscribe_after_close_is_noop() {
    let broker = Broker::new();
    let sub = broker.subscribe("topic", |_: i32| {}).unwrap();
    broker.close(None).await.unwrap();

    sub.unsubscribe();
    assert_eq!(sub.state(), SubscriptionState::Terminated);
}

#[test]
fn test_unsubscribe_after_broker_dropped_drains_worker() {
    let broker = Broker::new();
    let (tx, rx) = mpsc::channel();
    let sub = broker
        .subscribe("topic", move |msg: i32| tx.send(msg).unwrap())
        .unwrap();
    broker.publish("topic", 5).unwrap();
    drop(broker);

    sub.unsubscribe();
    assert_eq!(rx.recv_timeout(WAIT), Ok(5));
    // Sender side of the test channel is dropped with the handler once the worker exits.
    assert_eq!(
        rx.recv_timeout(WAIT),
        Err(mpsc::RecvTimeoutError::Disconnected)
    );
}

#[test]
fn test_clone_shares_state() {
    let broker = Broker::new();
    let handle = broker.clone();
    let (tx, rx) = mpsc::channel();
    broker
        .subscribe("topic", move |msg: i32| tx.send(msg).unwrap())
        .unwrap();

    handle.publish("topic", 3).unwrap();
    assert_eq!(rx.recv_timeout(WAIT), Ok(3));
    assert_eq!(handle.subscriber_count("topic"), 1);
}

#[tokio::test]
async fn test_close_after_drain_succeeds_with_ready_signal() {
    for _ in 0..200 {
        let broker = Broker::new();
        let sub = broker.subscribe("topic", |_: i32| {}).unwrap();
        sub.unsubscribe();

        let deadline = Instant::now() + WAIT;
        while broker.outstanding() != 0 {
            assert!(Instant::now() < deadline, "worker never terminated");
            thread::sleep(Duration::from_millis(1));
        }

        assert!(broker.close_with(std::future::ready(())).await.is_ok());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_publish_subscribe_and_close() {
    const PUBLISHERS: usize = 4;
    const PER_PUBLISHER: u32 = 2000;

    let broker: Broker<(usize, u32)> = Broker::new();
    let logs: Arc<Mutex<Vec<Arc<Mutex<Vec<(usize, u32)>>>>>> = Arc::default();

    let publishers: Vec<_> = (0..PUBLISHERS)
        .map(|p| {
            let broker = broker.clone();
            thread::spawn(move || {
                for seq in 0..PER_PUBLISHER {
                    if broker.publish("shared", (p, seq)).is_err() {
                        break;
                    }
                }
            })
        })
        .collect();

    let churn = {
        let broker = broker.clone();
        let logs = logs.clone();
        thread::spawn(move || {
            loop {
                let log = Arc::new(Mutex::new(Vec::new()));
                let sink = log.clone();
                let sub = match broker
                    .subscribe("shared", move |msg: (usize, u32)| sink.lock().unwrap().push(msg))
                {
                    Ok(sub) => sub,
                    Err(e) => {
                        assert!(e.is_closed());
                        break;
                    }
                };
                logs.lock().unwrap().push(log);
                thread::sleep(Duration::from_millis(1));
                sub.unsubscribe();
            }
        })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    broker.close(Some(WAIT)).await.unwrap();

    for handle in publishers {
        handle.join().unwrap();
    }
    churn.join().unwrap();

    assert!(matches!(
        broker.publish("shared", (0, 0)),
        Err(BrokerError::Closed)
    ));
    assert!(matches!(
        broker.subscribe("shared", |_: (usize, u32)| {}),
        Err(BrokerError::Closed)
    ));

    let logs = logs.lock().unwrap();
    assert!(!logs.is_empty());
    for log in logs.iter() {
        let log = log.lock().unwrap();
        for p in 0..PUBLISHERS {
            let seqs: Vec<u32> = log.iter().filter(|(from, _)| *from == p).map(|(_, s)| *s).collect();
            assert!(
                seqs.windows(2).all(|w| w[0] < w[1]),
                "publisher {p} delivered out of order or twice: {seqs:?}"
            );
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subscribe_racing_close_leaves_no_workers() {
    let broker: Broker<i32> = Broker::new();
    let accepted = Arc::new(AtomicUsize::new(0));

    let subscribers: Vec<_> = (0..4)
        .map(|_| {
            let broker = broker.clone();
            let accepted = accepted.clone();
            thread::spawn(move || {
                loop {
                    match broker.subscribe("race", |_: i32| {}) {
                        Ok(_) => {
                            accepted.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => {
                            assert!(e.is_closed(), "unexpected error: {e}");
                            break;
                        }
                    }
                }
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(20)).await;
    broker.close(Some(WAIT)).await.unwrap();
    for handle in subscribers {
        handle.join().unwrap();
    }

    assert!(accepted.load(Ordering::SeqCst) > 0);
    assert!(broker.subjects().is_empty());

    // A subscribe rejected after its worker started must still stop that worker.
    let deadline = Instant::now() + WAIT;
    while broker.outstanding() != 0 {
        assert!(Instant::now() < deadline, "rejected worker never terminated");
        thread::sleep(Duration::from_millis(1));
    }
}
