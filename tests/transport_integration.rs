//! End-to-end transport tests: ports wired through the daemon registry,
//! delivery, history replay, overflow accounting, and wake paths.

use axon::config::{PoolConfig, RuntimeConfig};
use axon::daemon::{
    DaemonReply, PortRegistry, RuntimeRequest, frame_request, unframe_request,
};
use axon::memory::{MemoryManager, recv_segment, send_segment};
use axon::port::{
    PublisherOptions, PublisherPort, ServiceDescription, SubscribeState, SubscriberOptions,
    SubscriberPort,
};
use axon::queue::ChunkQueueKind;
use axon::sync::WakeSemaphore;
use axon::waitset::{SubscriberState, WaitSet};
use std::sync::Arc;
use std::time::Duration;

fn memory(tag: &str) -> Arc<MemoryManager> {
    let config = RuntimeConfig::new(tag, vec![PoolConfig::new(128, 64), PoolConfig::new(1024, 16)]);
    Arc::new(MemoryManager::create(&config).unwrap())
}

fn service() -> ServiceDescription {
    ServiceDescription::new("perception", "front", "tracks")
}

fn wire(
    registry: &PortRegistry,
    publisher: &Arc<PublisherPort>,
    subscriber: &Arc<SubscriberPort>,
) {
    registry
        .register_publisher(Arc::clone(publisher), "producer")
        .unwrap();
    registry
        .register_subscriber(Arc::clone(subscriber), "consumer")
        .unwrap();
    publisher.offer();
    subscriber.subscribe().unwrap();
    registry.process_matches();
    assert_eq!(subscriber.state(), SubscribeState::Subscribed);
}

#[test]
fn test_publish_take_roundtrip() {
    let memory = memory("roundtrip");
    let registry = PortRegistry::new();
    let publisher = Arc::new(
        PublisherPort::new(service(), Arc::clone(&memory), PublisherOptions::default()).unwrap(),
    );
    let subscriber =
        Arc::new(SubscriberPort::new(service(), SubscriberOptions::default()).unwrap());
    wire(&registry, &publisher, &subscriber);

    let mut sample = publisher.loan(16, 8).unwrap();
    sample.payload_mut().unwrap()[..5].copy_from_slice(b"track");
    publisher.publish(sample).unwrap();

    let received = subscriber.take().unwrap();
    assert_eq!(&received.payload().unwrap()[..5], b"track");
    assert_eq!(received.header().unwrap().originator_id, publisher.id().0);

    drop(received);
    assert_eq!(memory.total_in_use(), 0);
    assert_eq!(memory.mgmt_in_use(), 0);
}

#[test]
fn test_fan_out_to_three_subscribers() {
    let memory = memory("fanout");
    let registry = PortRegistry::new();
    let publisher = Arc::new(
        PublisherPort::new(service(), Arc::clone(&memory), PublisherOptions::default()).unwrap(),
    );
    registry
        .register_publisher(Arc::clone(&publisher), "producer")
        .unwrap();
    publisher.offer();

    let subscribers: Vec<Arc<SubscriberPort>> = (0..3)
        .map(|_| {
            let subscriber =
                Arc::new(SubscriberPort::new(service(), SubscriberOptions::default()).unwrap());
            registry
                .register_subscriber(Arc::clone(&subscriber), "consumer")
                .unwrap();
            subscriber.subscribe().unwrap();
            subscriber
        })
        .collect();
    registry.process_matches();
    assert_eq!(publisher.subscriber_count(), 3);

    let mut sample = publisher.loan(8, 8).unwrap();
    sample.payload_mut().unwrap().copy_from_slice(b"for-all!");
    publisher.publish(sample).unwrap();

    // Every subscriber observes the same chunk, not a copy.
    let received: Vec<_> = subscribers.iter().map(|s| s.take().unwrap()).collect();
    assert!(received[0].ptr_eq(&received[1]));
    assert!(received[1].ptr_eq(&received[2]));
    for chunk in &received {
        assert_eq!(chunk.payload().unwrap(), b"for-all!");
    }

    // The chunk returns to the pool exactly once, after the last drop.
    drop(received);
    assert_eq!(memory.total_in_use(), 0);
}

#[test]
fn test_fifo_overflow_records_missed_data() {
    let memory = memory("overflow");
    let registry = PortRegistry::new();
    let publisher = Arc::new(
        PublisherPort::new(service(), Arc::clone(&memory), PublisherOptions::default()).unwrap(),
    );
    let subscriber = Arc::new(
        SubscriberPort::new(
            service(),
            SubscriberOptions {
                queue_kind: ChunkQueueKind::Fifo,
                queue_capacity: 4,
                requested_history: 0,
            },
        )
        .unwrap(),
    );
    wire(&registry, &publisher, &subscriber);

    // Capacity pushes succeed, the fifth is dropped and counted.
    for _ in 0..5 {
        let sample = publisher.loan(8, 8).unwrap();
        publisher.publish(sample).unwrap();
    }

    assert!(subscriber.has_data());
    assert!(subscriber.has_missed_data());
    assert!(!subscriber.has_missed_data());

    let mut taken = 0;
    while subscriber.take().is_ok() {
        taken += 1;
    }
    assert_eq!(taken, 4);
    assert_eq!(memory.total_in_use(), 0);
}

#[test]
fn test_sofi_keeps_freshest_under_pressure() {
    let memory = memory("sofi");
    let registry = PortRegistry::new();
    let publisher = Arc::new(
        PublisherPort::new(service(), Arc::clone(&memory), PublisherOptions::default()).unwrap(),
    );
    let subscriber = Arc::new(
        SubscriberPort::new(
            service(),
            SubscriberOptions {
                queue_kind: ChunkQueueKind::Sofi,
                queue_capacity: 4,
                requested_history: 0,
            },
        )
        .unwrap(),
    );
    wire(&registry, &publisher, &subscriber);

    // Twice the capacity: every publish succeeds, old samples evict.
    for i in 0..8u8 {
        let mut sample = publisher.loan(1, 1).unwrap();
        sample.payload_mut().unwrap()[0] = i;
        publisher.publish(sample).unwrap();
    }

    let mut values = Vec::new();
    while let Ok(chunk) = subscriber.take() {
        values.push(chunk.payload().unwrap()[0]);
    }
    assert_eq!(values, vec![4, 5, 6, 7]);
    assert_eq!(memory.total_in_use(), 0);
}

#[test]
fn test_history_replay_to_late_subscriber() {
    let memory = memory("history");
    let registry = PortRegistry::new();
    let publisher = Arc::new(
        PublisherPort::new(
            service(),
            Arc::clone(&memory),
            PublisherOptions {
                history_capacity: 3,
            },
        )
        .unwrap(),
    );
    registry
        .register_publisher(Arc::clone(&publisher), "producer")
        .unwrap();
    publisher.offer();

    for name in [b"sample-A", b"sample-B", b"sample-C", b"sample-D"] {
        let mut sample = publisher.loan(8, 8).unwrap();
        sample.payload_mut().unwrap().copy_from_slice(name);
        publisher.publish(sample).unwrap();
    }

    // Late joiner asking for two historical samples receives C then D.
    let subscriber = Arc::new(
        SubscriberPort::new(
            service(),
            SubscriberOptions {
                requested_history: 2,
                ..SubscriberOptions::default()
            },
        )
        .unwrap(),
    );
    registry
        .register_subscriber(Arc::clone(&subscriber), "late-consumer")
        .unwrap();
    subscriber.subscribe().unwrap();
    registry.process_matches();

    assert_eq!(subscriber.take().unwrap().payload().unwrap(), b"sample-C");
    assert_eq!(subscriber.take().unwrap().payload().unwrap(), b"sample-D");
    assert!(subscriber.take().is_err());
}

#[test]
fn test_semaphore_wake_on_publish() {
    let memory = memory("semwake");
    let registry = PortRegistry::new();
    let publisher = Arc::new(
        PublisherPort::new(service(), Arc::clone(&memory), PublisherOptions::default()).unwrap(),
    );
    let subscriber =
        Arc::new(SubscriberPort::new(service(), SubscriberOptions::default()).unwrap());
    wire(&registry, &publisher, &subscriber);

    let semaphore = WakeSemaphore::new(0).unwrap();
    let waiter = semaphore.try_clone().unwrap();
    subscriber
        .receiver()
        .popper()
        .attach_semaphore(semaphore)
        .unwrap();

    assert!(!waiter.try_wait());
    publisher.publish(publisher.loan(8, 8).unwrap()).unwrap();
    assert!(waiter.try_wait());
    assert!(!waiter.try_wait());

    subscriber.release_queued_data();
}

#[test]
fn test_waitset_wakes_on_publish_from_thread() {
    let memory = memory("waitset");
    let registry = PortRegistry::new();
    let publisher = Arc::new(
        PublisherPort::new(service(), Arc::clone(&memory), PublisherOptions::default()).unwrap(),
    );
    let subscriber =
        Arc::new(SubscriberPort::new(service(), SubscriberOptions::default()).unwrap());
    wire(&registry, &publisher, &subscriber);

    let waitset = WaitSet::new().unwrap();
    waitset
        .attach_state(&subscriber, SubscriberState::HasData, 77)
        .unwrap();

    let producer = Arc::clone(&publisher);
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        producer.publish(producer.loan(8, 8).unwrap()).unwrap();
    });

    let fired = waitset.wait();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].trigger_id, 77);

    assert!(subscriber.take().is_ok());
    handle.join().unwrap();
    assert_eq!(memory.total_in_use(), 0);
}

#[test]
fn test_unsubscribed_take_fails_and_resubscribe_works() {
    let memory = memory("resub");
    let registry = PortRegistry::new();
    let publisher = Arc::new(
        PublisherPort::new(service(), Arc::clone(&memory), PublisherOptions::default()).unwrap(),
    );
    let subscriber =
        Arc::new(SubscriberPort::new(service(), SubscriberOptions::default()).unwrap());
    wire(&registry, &publisher, &subscriber);

    subscriber.unsubscribe().unwrap();
    registry.process_matches();
    assert!(subscriber.take().is_err());
    assert_eq!(publisher.subscriber_count(), 0);

    // Samples published while unsubscribed are not seen after resubscribe.
    publisher.publish(publisher.loan(8, 8).unwrap()).unwrap();

    subscriber.subscribe().unwrap();
    registry.process_matches();
    assert_eq!(subscriber.state(), SubscribeState::Subscribed);
    assert!(subscriber.take().is_err());
    assert_eq!(memory.total_in_use(), 0);
}

#[test]
fn test_runtime_daemon_handshake_over_socket() {
    use std::os::unix::net::UnixStream;

    let memory = memory("handshake");
    let (runtime_socket, daemon_socket) = UnixStream::pair().unwrap();

    // Runtime side: register, request a publisher, pass the segment fd.
    let requests = [
        RuntimeRequest::RegRuntime {
            name: "perception".into(),
        },
        RuntimeRequest::ReqPublisher {
            service: service(),
            history_capacity: 3,
        },
        RuntimeRequest::Ping { seq: 9 },
    ];
    let mut stream = Vec::new();
    for request in &requests {
        stream.extend_from_slice(&frame_request(request).unwrap());
    }
    use std::io::Write;
    (&runtime_socket).write_all(&stream).unwrap();
    send_segment(&runtime_socket, memory.segment()).unwrap();

    // Daemon side: parse the frames back out of the byte stream.
    use std::io::Read;
    let mut buf = vec![0u8; stream.len()];
    (&daemon_socket).read_exact(&mut buf).unwrap();

    let mut cursor = 0;
    let mut decoded = Vec::new();
    while let Some((msg, consumed)) = unframe_request(&buf[cursor..]).unwrap() {
        decoded.push(msg);
        cursor += consumed;
    }
    assert_eq!(decoded.len(), 3);
    assert!(matches!(
        decoded[0],
        RuntimeRequest::RegRuntime { ref name } if name == "perception"
    ));
    assert!(matches!(decoded[2], RuntimeRequest::Ping { seq: 9 }));

    let (_fd, segment_id, segment_len) = recv_segment(&daemon_socket).unwrap();
    assert_eq!(segment_id, memory.segment().id());
    assert_eq!(segment_len, memory.segment().len());

    // And a reply frame survives the trip back.
    let reply = DaemonReply::PortCreated {
        port: 1,
        segment: segment_id.0,
        offset: 0,
    };
    let framed = axon::daemon::frame_reply(&reply).unwrap();
    let (decoded, _) = axon::daemon::unframe_reply(&framed).unwrap().unwrap();
    assert!(matches!(decoded, DaemonReply::PortCreated { port: 1, .. }));
}
