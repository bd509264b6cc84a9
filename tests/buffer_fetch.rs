use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use notifwd::{
    buffer::{BufferError, EventBuffer, FetchRequest},
    namespace::local::LocalNamespace,
    notification::{Notification, SequencedEvent, TargetedEvent},
    types::{ObjectId, SeqNum},
};

fn buffer(capacity: usize, first_seq: SeqNum) -> Arc<EventBuffer> {
    EventBuffer::starting_at(Arc::new(LocalNamespace::new("root")), capacity, first_seq).expect("buffer")
}

fn event(kind: &str, n: u64) -> SequencedEvent {
    let src = ObjectId::new("sensor");
    SequencedEvent::new(src.clone(), Notification::new(kind, src, n, format!("#{n}")))
}

fn accept_all(event: &SequencedEvent, out: &mut Vec<TargetedEvent>) {
    out.push(TargetedEvent {
        listener_id: 1,
        notification: Arc::clone(&event.notification),
    });
}

fn hits_only(event: &SequencedEvent, out: &mut Vec<TargetedEvent>) {
    if event.notification.kind == "hit" {
        accept_all(event, out);
    }
}

fn sequences(events: &[TargetedEvent]) -> Vec<u64> {
    events.iter().map(|e| e.notification.sequence).collect()
}

#[tokio::test]
async fn retains_only_the_newest_capacity_events() {
    let buf = buffer(3, 100);
    for n in 0..5 {
        buf.append(event("tick", n));
    }

    let gap = buf
        .fetch(&accept_all, FetchRequest::new(100, Duration::ZERO, 10))
        .await
        .expect("fetch");
    assert!(gap.events.is_empty());
    assert_eq!(gap.earliest_seq, 102);
    assert_eq!(gap.next_seq, 102);
    assert_eq!(gap.missed_since(100), 2);

    let rest = buf
        .fetch(&accept_all, FetchRequest::new(gap.next_seq, Duration::ZERO, 10))
        .await
        .expect("fetch");
    assert_eq!(sequences(&rest.events), vec![2, 3, 4]);
    assert_eq!(rest.next_seq, 105);
    assert_eq!(rest.missed_since(102), 0);
}

#[tokio::test]
async fn walkthrough_of_ten_events_through_five_slots() {
    let buf = buffer(5, 100);
    for n in 100..110 {
        buf.append(event("tick", n));
    }
    assert_eq!(buf.earliest_seq(), 105);
    assert_eq!(buf.next_seq(), 110);

    let gap = buf
        .fetch(&accept_all, FetchRequest::new(100, Duration::ZERO, 10))
        .await
        .expect("fetch");
    assert!(gap.events.is_empty());
    assert_eq!((gap.earliest_seq, gap.next_seq), (105, 105));
    assert_eq!(gap.missed_since(100), 5);

    let two = buf
        .fetch(&accept_all, FetchRequest::new(107, Duration::ZERO, 2))
        .await
        .expect("fetch");
    assert_eq!(sequences(&two.events), vec![107, 108]);
    assert_eq!(two.next_seq, 109);
    assert!(two.earliest_seq <= 107);
}

#[tokio::test]
async fn zero_timeout_returns_immediately_when_nothing_matches() {
    let buf = buffer(4, 10);
    buf.append(event("tick", 0));

    let started = Instant::now();
    let res = buf
        .fetch(&hits_only, FetchRequest::new(10, Duration::ZERO, 5))
        .await
        .expect("fetch");
    assert!(started.elapsed() < Duration::from_millis(50));
    assert!(res.events.is_empty());
    assert_eq!(res.next_seq, 11);
}

#[tokio::test]
async fn fetch_waits_at_most_the_timeout() {
    let buf = buffer(4, 10);
    let started = Instant::now();
    let res = buf
        .fetch(&accept_all, FetchRequest::new(10, Duration::from_millis(100), 5))
        .await
        .expect("fetch");
    let waited = started.elapsed();
    assert!(res.events.is_empty());
    assert_eq!(res.next_seq, 10);
    assert!(waited >= Duration::from_millis(90), "returned after {waited:?}");
    assert!(waited < Duration::from_secs(2), "returned after {waited:?}");
}

#[tokio::test]
async fn blocked_fetch_wakes_on_append() {
    let buf = buffer(4, 10);
    let fetcher = {
        let buf = Arc::clone(&buf);
        tokio::spawn(async move {
            buf.fetch(&accept_all, FetchRequest::new(10, Duration::MAX, 5))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    buf.append(event("tick", 7));

    let res = tokio::time::timeout(Duration::from_secs(2), fetcher)
        .await
        .expect("fetch woke")
        .expect("join")
        .expect("fetch");
    assert_eq!(sequences(&res.events), vec![7]);
    assert_eq!(res.next_seq, 11);
}

#[tokio::test]
async fn dispose_wakes_blocked_fetch_with_disposed_result() {
    let buf = buffer(4, 10);
    let fetcher = {
        let buf = Arc::clone(&buf);
        tokio::spawn(async move {
            buf.fetch(&accept_all, FetchRequest::new(10, Duration::from_secs(30), 5))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    buf.dispose();

    let res = tokio::time::timeout(Duration::from_secs(2), fetcher)
        .await
        .expect("fetch woke")
        .expect("join")
        .expect("fetch");
    assert!(res.disposed);
    assert!(res.events.is_empty());

    buf.append(event("late", 1));
    let after = buf
        .fetch(&accept_all, FetchRequest::new(10, Duration::from_secs(30), 5))
        .await
        .expect("fetch");
    assert!(after.disposed);
}

#[tokio::test]
async fn rejected_candidates_do_not_count_against_max() {
    let buf = buffer(16, 0);
    for (n, kind) in ["miss", "hit", "miss", "miss", "hit", "hit", "miss"].iter().enumerate() {
        buf.append(event(kind, n as u64));
    }

    let res = buf
        .fetch(&hits_only, FetchRequest::new(0, Duration::ZERO, 2))
        .await
        .expect("fetch");
    assert_eq!(sequences(&res.events), vec![1, 4]);
    assert_eq!(res.next_seq, 5);

    let rest = buf
        .fetch(&hits_only, FetchRequest::new(res.next_seq, Duration::ZERO, 2))
        .await
        .expect("fetch");
    assert_eq!(sequences(&rest.events), vec![5]);
    assert_eq!(rest.next_seq, 7);
}

#[tokio::test]
async fn zero_max_count_skips_to_first_match_without_consuming_it() {
    let buf = buffer(8, 0);
    for (n, kind) in ["miss", "miss", "hit", "miss"].iter().enumerate() {
        buf.append(event(kind, n as u64));
    }

    let skip = buf
        .fetch(&hits_only, FetchRequest::new(0, Duration::from_secs(30), 0))
        .await
        .expect("fetch");
    assert!(skip.events.is_empty());
    assert_eq!(skip.next_seq, 2);

    let one = buf
        .fetch(&hits_only, FetchRequest::new(skip.next_seq, Duration::ZERO, 1))
        .await
        .expect("fetch");
    assert_eq!(sequences(&one.events), vec![2]);
    assert_eq!(one.next_seq, 3);
}

#[tokio::test]
async fn zero_max_count_at_the_head_returns_at_once() {
    let buf = buffer(4, 10);
    buf.append(event("tick", 0));
    let head = buf.next_seq();

    let started = Instant::now();
    let res = buf
        .fetch(&accept_all, FetchRequest::new(head, Duration::ZERO, 0))
        .await
        .expect("fetch");
    assert!(started.elapsed() < Duration::from_millis(100));
    assert!(res.events.is_empty());
    assert!(!res.disposed);
    assert_eq!(res.next_seq, head);
    assert_eq!(res.earliest_seq, 10);
    assert_eq!(res.missed_since(head), 0);
}

#[tokio::test]
async fn out_of_range_and_bounds_only_starts() {
    let buf = buffer(4, 50);
    buf.append(event("tick", 0));

    let err = buf
        .fetch(&accept_all, FetchRequest::new(52, Duration::ZERO, 1))
        .await
        .expect_err("start past next");
    assert!(matches!(err, BufferError::InvalidArgument(_)));

    let bounds = buf
        .fetch(&accept_all, FetchRequest::new(-1, Duration::from_secs(30), 1))
        .await
        .expect("bounds");
    assert!(bounds.events.is_empty());
    assert_eq!((bounds.earliest_seq, bounds.next_seq), (50, 51));
}

#[test]
fn shrinking_evicts_exactly_the_overflow() {
    let buf = buffer(5, 0);
    for n in 0..5 {
        buf.append(event("tick", n));
    }

    buf.set_capacity(2).expect("shrink");
    assert_eq!(buf.len(), 2);
    assert_eq!(buf.earliest_seq(), 3);
    assert_eq!(buf.next_seq(), 5);

    buf.set_capacity(10).expect("grow");
    assert_eq!(buf.len(), 2);
    assert_eq!(buf.earliest_seq(), 3);
    assert!(matches!(buf.set_capacity(0), Err(BufferError::InvalidArgument(_))));
}
