use super::message::{MessageState, NewMessage, Priority, RetryPolicy, UserData};
use super::queue::{DeliveryConfig, DeliveryQueue, MAX_QUEUED_MESSAGES};
use super::sink::{ChannelSink, DeliverySink, sink_fn};
use super::worker::DeliveryWorker;
use crate::utils::{Error, ManualClock};

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

fn always(result: bool) -> Arc<dyn DeliverySink> {
    sink_fn(move |_topic, _payload, _qos, _user_data| result)
}

fn recording_sink(log: Arc<Mutex<Vec<String>>>) -> Arc<dyn DeliverySink> {
    sink_fn(move |topic, _payload, _qos, _user_data| {
        log.lock().unwrap().push(topic.to_string());
        true
    })
}

fn queue_at(start_ms: u64, sink: Option<Arc<dyn DeliverySink>>) -> (DeliveryQueue, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(start_ms));
    let config = DeliveryConfig {
        sink,
        ..Default::default()
    };
    (DeliveryQueue::with_clock(config, clock.clone()), clock)
}

#[test]
fn test_backoff_delays() {
    let policy = RetryPolicy::default();
    let delays: Vec<_> = (0..6).map(|n| policy.backoff_delay_ms(n)).collect();
    assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000]);

    let critical = RetryPolicy::critical();
    assert_eq!(critical.backoff_delay_ms(0), 500);
    assert_eq!(critical.backoff_delay_ms(1), 750);
    assert_eq!(critical.backoff_delay_ms(2), 1125);
    assert_eq!(critical.backoff_delay_ms(20), 10_000);

    let flat = RetryPolicy {
        exponential_backoff: false,
        ..RetryPolicy::default()
    };
    assert_eq!(flat.backoff_delay_ms(3), 1000);
}

#[test]
fn test_failing_delivery_retries_then_fails() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let sink = sink_fn(move |_, _, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        false
    });
    let (queue, clock) = queue_at(10_000, Some(sink));

    let id = queue
        .enqueue(NewMessage::new("device/status", "{}").retry_policy(RetryPolicy::default()))
        .unwrap();

    let report = queue.process_once().unwrap();
    assert_eq!((report.attempted, report.retried), (1, 1));
    let message = queue.get(id).unwrap();
    assert_eq!(message.retry_count, 1);
    assert_eq!(message.state, MessageState::Pending);
    assert_eq!(message.last_attempt_at_ms, 10_000);
    assert_eq!(message.next_retry_at_ms, 11_000);

    clock.set(10_999);
    assert_eq!(queue.process_once().unwrap().attempted, 0);

    clock.set(11_000);
    queue.process_once().unwrap();
    assert_eq!(queue.get(id).unwrap().next_retry_at_ms, 13_000);

    clock.set(13_000);
    queue.process_once().unwrap();
    let message = queue.get(id).unwrap();
    assert_eq!(message.next_retry_at_ms, 17_000);
    assert_eq!(message.retry_count, 3);

    clock.set(17_000);
    let report = queue.process_once().unwrap();
    assert_eq!(report.failed, 1);
    assert!(matches!(queue.get(id), Err(Error::NotFound(_))));

    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    let stats = queue.get_stats().unwrap();
    assert_eq!(stats.messages_failed, 1);
    assert_eq!(stats.total_retries_attempted, 3);
    assert_eq!(stats.messages_delivered, 0);
    assert_eq!(stats.current_queue_size, 0);
}

#[test]
fn test_ttl_expiry_by_cleanup() {
    let (queue, clock) = queue_at(1_000, None);
    let id = queue
        .enqueue(NewMessage::new("device/chime", "ding").ttl_ms(500))
        .unwrap();
    queue.enqueue(NewMessage::new("device/keep", "{}")).unwrap();

    clock.set(1_499);
    assert_eq!(queue.cleanup_expired().unwrap(), 0);
    assert!(queue.get(id).is_ok());

    clock.set(1_500);
    assert_eq!(queue.cleanup_expired().unwrap(), 1);
    assert!(queue.get(id).is_err());
    assert_eq!(queue.len().unwrap(), 1);

    let stats = queue.get_stats().unwrap();
    assert_eq!(stats.messages_expired, 1);
    assert_eq!(stats.current_queue_size, 1);
}

#[test]
fn test_ttl_expiry_during_processing_overrides_retry() {
    let (queue, clock) = queue_at(0, Some(always(false)));
    let id = queue
        .enqueue(NewMessage::new("device/status", "{}").ttl_ms(500))
        .unwrap();

    queue.process_once().unwrap();
    assert_eq!(queue.get(id).unwrap().retry_count, 1);

    clock.set(500);
    let report = queue.process_once().unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.attempted, 0);
    assert!(queue.is_empty().unwrap());
}

#[test]
fn test_priority_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (queue, _clock) = queue_at(0, Some(recording_sink(Arc::clone(&log))));

    for (topic, priority) in [
        ("low", Priority::Low),
        ("urgent", Priority::Urgent),
        ("normal", Priority::Normal),
        ("high", Priority::High),
        ("urgent2", Priority::Urgent),
    ] {
        queue
            .enqueue(NewMessage::new(topic, "{}").priority(priority))
            .unwrap();
    }

    let report = queue.process_once().unwrap();
    assert_eq!(report.delivered, 5);
    assert_eq!(
        *log.lock().unwrap(),
        vec!["urgent", "urgent2", "high", "normal", "low"]
    );
}

#[test]
fn test_fifo_order_without_priority() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let clock = Arc::new(ManualClock::new(0));
    let config = DeliveryConfig {
        priority_based_processing: false,
        ..Default::default()
    }
    .with_sink(recording_sink(Arc::clone(&log)));
    let queue = DeliveryQueue::with_clock(config, clock);

    queue
        .enqueue(NewMessage::new("first", "{}").priority(Priority::Low))
        .unwrap();
    queue
        .enqueue(NewMessage::new("second", "{}").priority(Priority::Urgent))
        .unwrap();

    queue.process_once().unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
}

#[test]
fn test_capacity_and_rejections() {
    let (queue, _clock) = queue_at(0, Some(always(true)));
    for i in 0..MAX_QUEUED_MESSAGES {
        queue
            .enqueue(NewMessage::new(format!("t/{i}"), "{}"))
            .unwrap();
    }

    assert!(matches!(
        queue.enqueue(NewMessage::new("t/overflow", "{}")),
        Err(Error::ResourceExhausted { capacity: 64, .. })
    ));
    let stats = queue.get_stats().unwrap();
    assert_eq!(stats.queue_full_rejections, 1);
    assert_eq!(stats.peak_queue_size, 64);
    assert_eq!(stats.total_messages_queued, 64);

    assert_eq!(queue.process_once().unwrap().delivered, 64);
    assert_eq!(queue.enqueue(NewMessage::new("t/again", "{}")).unwrap(), 65);
}

#[test]
fn test_enqueue_rejects_bad_input() {
    let (queue, _clock) = queue_at(0, None);
    let long_topic = "t".repeat(128);
    let long_payload = "p".repeat(1024);

    for message in [
        NewMessage::new("", "{}"),
        NewMessage::new(long_topic, "{}"),
        NewMessage::new("t", long_payload),
        NewMessage::new("t", "{}").qos(3),
    ] {
        assert!(matches!(
            queue.enqueue(message),
            Err(Error::InvalidArgument(_))
        ));
    }
    assert!(queue.enqueue(NewMessage::new("t", "{}").qos(2)).is_ok());
}

#[test]
fn test_concurrent_enqueue_ids_are_unique_and_increasing() {
    let queue = Arc::new(DeliveryQueue::new(DeliveryConfig::default()));

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                (0..8)
                    .map(|i| {
                        queue
                            .enqueue(NewMessage::new(format!("w{worker}/{i}"), "{}"))
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut all = HashSet::new();
    for handle in handles {
        let ids = handle.join().unwrap();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
        all.extend(ids);
    }

    assert_eq!(all.len(), 64);
    assert_eq!(all, (1..=64).collect::<HashSet<u32>>());
    assert_eq!(queue.len().unwrap(), 64);
}

#[test]
fn test_clear_is_idempotent_and_ids_continue() {
    let (queue, _clock) = queue_at(0, None);
    queue.enqueue(NewMessage::new("a", "{}")).unwrap();
    queue.enqueue(NewMessage::new("b", "{}")).unwrap();

    queue.clear().unwrap();
    queue.clear().unwrap();
    assert!(queue.list().unwrap().is_empty());
    assert_eq!(queue.get_stats().unwrap().current_queue_size, 0);

    assert_eq!(queue.enqueue(NewMessage::new("c", "{}")).unwrap(), 3);
}

#[test]
fn test_remove_get_and_list() {
    let (queue, _clock) = queue_at(0, None);
    let a = queue.enqueue(NewMessage::new("a", "1")).unwrap();
    let b = queue.enqueue(NewMessage::new("b", "2").retain(true)).unwrap();
    let c = queue.enqueue(NewMessage::new("c", "3")).unwrap();

    queue.remove(b).unwrap();
    assert!(matches!(queue.remove(b), Err(Error::NotFound(_))));

    let ids: Vec<_> = queue.list().unwrap().iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![a, c]);

    // the freed slot is reused but the id is not
    let d = queue.enqueue(NewMessage::new("d", "4")).unwrap();
    assert_eq!(d, 4);
    let ids: Vec<_> = queue.list().unwrap().iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![a, c, d]);

    let message = queue.get(a).unwrap();
    assert_eq!(message.payload, "1");
    assert_eq!(message.retry_policy, RetryPolicy::default());
}

#[test]
fn test_average_delivery_time() {
    let (queue, clock) = queue_at(1_000, Some(always(true)));

    queue.enqueue(NewMessage::new("a", "{}")).unwrap();
    clock.set(1_100);
    queue.process_once().unwrap();
    let stats = queue.get_stats().unwrap();
    assert_eq!(stats.average_delivery_time_ms, 100.0);
    assert_eq!(stats.last_delivery_time_ms, 1_100);

    queue.enqueue(NewMessage::new("b", "{}")).unwrap();
    clock.set(1_600);
    queue.process_once().unwrap();
    let stats = queue.get_stats().unwrap();
    assert!((stats.average_delivery_time_ms - 180.0).abs() < 1e-9);
    assert_eq!(stats.messages_delivered, 2);
}

#[test]
fn test_reset_stats_keeps_queue_sizes() {
    let (queue, _clock) = queue_at(0, None);
    for topic in ["a", "b", "c"] {
        queue.enqueue(NewMessage::new(topic, "{}")).unwrap();
    }
    queue.remove(1).unwrap();

    queue.reset_stats().unwrap();
    let stats = queue.get_stats().unwrap();
    assert_eq!(stats.total_messages_queued, 0);
    assert_eq!(stats.current_queue_size, 2);
    assert_eq!(stats.peak_queue_size, 3);
}

#[test]
fn test_process_without_sink_is_invalid_state() {
    let (queue, _clock) = queue_at(0, None);
    queue.enqueue(NewMessage::new("a", "{}")).unwrap();
    assert!(matches!(queue.process_once(), Err(Error::InvalidState(_))));

    queue.set_delivery_callback(always(true)).unwrap();
    assert_eq!(queue.process_once().unwrap().delivered, 1);
}

#[test]
fn test_sink_receives_message_user_data() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let sink = sink_fn(move |_, _, qos, user_data: Option<&UserData>| {
        let tag = user_data.and_then(|data| data.downcast_ref::<u32>()).copied();
        record.lock().unwrap().push((qos, tag));
        true
    });
    let (queue, _clock) = queue_at(0, Some(sink));

    queue
        .enqueue(NewMessage::new("a", "{}").qos(1).user_data(Arc::new(7u32)))
        .unwrap();
    queue.enqueue(NewMessage::new("b", "{}")).unwrap();
    queue.process_once().unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![(1, Some(7)), (0, None)]);
}

#[test]
fn test_sink_can_use_queue_while_delivering() {
    let (queue, _clock) = queue_at(0, None);
    let queue = Arc::new(queue);

    let weak = Arc::downgrade(&queue);
    queue
        .set_delivery_callback(sink_fn(move |_, payload, _, _| {
            let Some(queue) = weak.upgrade() else {
                return false;
            };
            // cancel the in-flight message and queue a follow-up
            let id: u32 = payload.parse().unwrap_or(0);
            assert_eq!(queue.get(id).unwrap().state, MessageState::Sending);
            queue.remove(id).unwrap();
            queue.enqueue(NewMessage::new("follow-up", "{}")).unwrap();
            false
        }))
        .unwrap();

    queue.enqueue(NewMessage::new("first", "1")).unwrap();
    let report = queue.process_once().unwrap();

    assert_eq!(report.attempted, 1);
    assert_eq!(report.retried, 0);
    assert_eq!(report.failed, 0);
    let remaining = queue.list().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].topic, "follow-up");
    assert_eq!(remaining[0].state, MessageState::Pending);
}

#[test]
fn test_enqueue_times_out_when_queue_is_held() {
    let queue = Arc::new(
        DeliveryQueue::new(DeliveryConfig::default()).with_lock_timeout(Duration::from_millis(20)),
    );
    let held = queue.hold_lock();

    let other = Arc::clone(&queue);
    let result = std::thread::spawn(move || other.enqueue(NewMessage::new("a", "{}")))
        .join()
        .unwrap();
    drop(held);

    assert!(matches!(
        result,
        Err(Error::Timeout {
            resource: "delivery queue",
            ..
        })
    ));
}

#[tokio::test]
async fn test_channel_sink_fails_after_receiver_drops() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = ChannelSink::new(tx);

    assert!(sink.deliver("device/status", "up", 1, None));
    let message = rx.recv().await.unwrap();
    assert_eq!(message.topic, "device/status");
    assert_eq!(message.payload, "up");
    assert_eq!(message.qos, 1);

    drop(rx);
    assert!(!sink.deliver("device/status", "down", 1, None));
}

#[tokio::test]
async fn test_worker_drains_queue_through_channel() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = DeliveryConfig {
        queue_check_interval: Duration::from_millis(10),
        ..Default::default()
    }
    .with_sink(Arc::new(ChannelSink::new(tx)));
    let queue = Arc::new(DeliveryQueue::new(config));

    queue
        .enqueue(NewMessage::new("reply/1", "ok").priority(Priority::High))
        .unwrap();
    queue.enqueue(NewMessage::new("reply/2", "ok")).unwrap();

    let worker = DeliveryWorker::spawn(Arc::clone(&queue));

    let mut topics = Vec::new();
    for _ in 0..2 {
        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        topics.push(message.topic);
    }
    assert_eq!(topics, vec!["reply/1", "reply/2"]);

    worker.shutdown().await;
    assert_eq!(queue.get_stats().unwrap().messages_delivered, 2);
}

#[tokio::test]
async fn test_worker_sweeps_expired_messages() {
    let config = DeliveryConfig {
        queue_check_interval: Duration::from_millis(5),
        cleanup_interval: Duration::ZERO,
        ..Default::default()
    };
    let queue = Arc::new(DeliveryQueue::new(config));
    queue
        .enqueue(NewMessage::new("stale", "{}").ttl_ms(1))
        .unwrap();

    let worker = DeliveryWorker::spawn(Arc::clone(&queue));
    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        while !queue.is_empty().unwrap() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    worker.shutdown().await;

    assert!(drained.is_ok());
    assert_eq!(queue.get_stats().unwrap().messages_expired, 1);
}

#[test]
fn test_outcome_missed_by_lock_timeout_is_booked_next_pass() {
    let (queue, clock) = queue_at(0, None);
    let queue = Arc::new(queue.with_lock_timeout(Duration::from_millis(20)));

    // On the first attempt another thread grabs the queue for longer than
    // the lock timeout, so the failure cannot be booked right away.
    let holder: Arc<Mutex<Option<std::thread::JoinHandle<()>>>> = Arc::new(Mutex::new(None));
    let attempts = Arc::new(AtomicUsize::new(0));
    let weak = Arc::downgrade(&queue);
    let (slot, counter) = (Arc::clone(&holder), Arc::clone(&attempts));
    queue
        .set_delivery_callback(sink_fn(move |_, _, _, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                let Some(queue) = weak.upgrade() else {
                    return false;
                };
                let (locked_tx, locked_rx) = std::sync::mpsc::channel();
                let handle = std::thread::spawn(move || {
                    let guard = queue.hold_lock();
                    locked_tx.send(()).unwrap();
                    std::thread::sleep(Duration::from_millis(100));
                    drop(guard);
                });
                locked_rx.recv().unwrap();
                *slot.lock().unwrap() = Some(handle);
            }
            false
        }))
        .unwrap();

    let id = queue.enqueue(NewMessage::new("device/status", "{}")).unwrap();

    let report = queue.process_once().unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(report.retried, 0);
    holder.lock().unwrap().take().unwrap().join().unwrap();
    assert_eq!(queue.get(id).unwrap().state, MessageState::Sending);

    clock.set(500);
    let report = queue.process_once().unwrap();
    assert_eq!(report.retried, 1);
    assert_eq!(report.attempted, 0);
    let message = queue.get(id).unwrap();
    assert_eq!(message.state, MessageState::Pending);
    assert_eq!(message.retry_count, 1);
    assert_eq!(message.next_retry_at_ms, 1500);

    // the message keeps going through the normal retry path afterwards
    for _ in 0..3 {
        clock.advance(60_000);
        queue.process_once().unwrap();
    }
    assert!(queue.is_empty().unwrap());
    let stats = queue.get_stats().unwrap();
    assert_eq!(stats.messages_failed, 1);
    assert_eq!(stats.total_retries_attempted, 3);
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
}

#[test]
fn test_panicking_sink_counts_as_failed_delivery() {
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&delivered);
    let sink = sink_fn(move |topic, _, _, _| {
        if topic == "bad" {
            panic!("transport exploded");
        }
        log.lock().unwrap().push(topic.to_string());
        true
    });
    let (queue, clock) = queue_at(0, Some(sink));

    let bad = queue
        .enqueue(NewMessage::new("bad", "{}").priority(Priority::Urgent))
        .unwrap();
    queue.enqueue(NewMessage::new("good/1", "{}")).unwrap();
    queue.enqueue(NewMessage::new("good/2", "{}")).unwrap();

    let report = queue.process_once().unwrap();
    assert_eq!(report.attempted, 3);
    assert_eq!(report.delivered, 2);
    assert_eq!(report.retried, 1);
    assert_eq!(*delivered.lock().unwrap(), vec!["good/1", "good/2"]);

    let message = queue.get(bad).unwrap();
    assert_eq!(message.state, MessageState::Pending);
    assert_eq!(message.retry_count, 1);

    queue.set_delivery_callback(always(true)).unwrap();
    clock.advance(60_000);
    assert_eq!(queue.process_once().unwrap().delivered, 1);
    assert!(queue.is_empty().unwrap());
}

#[tokio::test]
async fn test_worker_survives_panicking_sink() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let channel = ChannelSink::new(tx);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let sink = sink_fn(move |topic, payload, qos, user_data| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("transport exploded");
        }
        channel.deliver(topic, payload, qos, user_data)
    });

    let config = DeliveryConfig {
        queue_check_interval: Duration::from_millis(5),
        default_retry_policy: RetryPolicy {
            base_delay_ms: 10,
            ..RetryPolicy::default()
        },
        ..Default::default()
    }
    .with_sink(sink);
    let queue = Arc::new(DeliveryQueue::new(config));
    queue.enqueue(NewMessage::new("reply/1", "ok")).unwrap();

    let worker = DeliveryWorker::spawn(Arc::clone(&queue));
    let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.topic, "reply/1");
    assert!(!worker.is_finished());
    worker.shutdown().await;

    let stats = queue.get_stats().unwrap();
    assert_eq!(stats.messages_delivered, 1);
    assert_eq!(stats.total_retries_attempted, 1);
}
