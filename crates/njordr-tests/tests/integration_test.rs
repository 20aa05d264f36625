//! End-to-end tests: a real broker, real workers and a producer over TCP

use njordr_core::frame::DEFAULT_MAX_FRAME_SIZE;
use njordr_core::{
    read_frame, write_frame, Assignment, BrokerConfig, BrokerMessage, ClientMessage, Error, ItemId,
    ItemStatus, Outcome, ReportDisposition, Serializer, ServiceConfig, WorkerHealth, WorkerId,
};
use njordr_service::{start_identities, BrokerClient, HandlerRegistry, ServiceRuntime};
use njordr_tests::common::{
    broker_config, init, unique_worker, wait_for_status, TestBroker, TestWorker, WAIT,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

#[tokio::test]
async fn test_submitted_item_completes() {
    let broker = TestBroker::start().await;
    let worker_id = unique_worker("echo");
    let worker = broker.spawn_worker(&worker_id).await;
    let mut producer = broker.client().await;

    let item_id = producer.submit("echo", json!({"text": "hello"})).await.unwrap();
    let item = wait_for_status(&mut producer, &item_id, ItemStatus::Completed).await;

    assert_eq!(item.attempts, 0);
    assert_eq!(item.redeliveries, 0);
    assert!(item.finished_at.is_some());

    let info = broker
        .state
        .worker(&WorkerId::from(worker_id.as_str()))
        .await
        .unwrap();
    assert_eq!(info.completed, 1);
    assert!(info.current.is_none());

    worker.stop().await;
}

#[tokio::test]
async fn test_always_failing_item_exhausts_retries() {
    let broker = TestBroker::start().await;
    let worker = broker.spawn_worker(&unique_worker("failing")).await;
    let mut producer = broker.client().await;

    let item_id = producer
        .submit("fail", json!({"message": "boom"}))
        .await
        .unwrap();
    let item = wait_for_status(&mut producer, &item_id, ItemStatus::Failed).await;

    assert_eq!(item.attempts, 2);
    assert_eq!(item.last_error.as_deref(), Some("boom"));

    worker.stop().await;
}

#[tokio::test]
async fn test_silent_worker_loses_its_item() {
    let broker = TestBroker::start().await;
    let silent_id = WorkerId::from(unique_worker("silent").as_str());

    // Registers and takes an item, then never heartbeats or reports
    let mut silent = broker.client().await;
    silent.register(&silent_id).await.unwrap();

    let mut producer = broker.client().await;
    let item_id = producer.submit("echo", json!(null)).await.unwrap();

    let message = tokio::time::timeout(WAIT, silent.recv()).await.unwrap().unwrap();
    match message {
        BrokerMessage::Dispatch { assignment } => assert_eq!(assignment.item_id, item_id),
        other => panic!("Expected dispatch, got {:?}", other),
    }

    let item = wait_for_status(&mut producer, &item_id, ItemStatus::Pending).await;
    assert_eq!(item.redeliveries, 1);
    assert_eq!(item.attempts, 0);
    assert!(item.assigned_worker.is_none());
    assert!(broker.state.worker(&silent_id).await.is_none());

    // A healthy worker picks the item back up
    let worker = broker.spawn_worker(&unique_worker("rescuer")).await;
    let item = wait_for_status(&mut producer, &item_id, ItemStatus::Completed).await;
    assert_eq!(item.redeliveries, 1);

    worker.stop().await;
}

#[tokio::test]
async fn test_silent_worker_is_suspected_before_dead() {
    let broker = TestBroker::start().await;
    let silent_id = WorkerId::from(unique_worker("quiet").as_str());

    let mut silent = broker.client().await;
    silent.register(&silent_id).await.unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let info = broker.state.worker(&silent_id).await.expect("still registered");
        if info.health == WorkerHealth::Suspected {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "never suspected");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    // A late heartbeat clears the suspicion
    silent
        .send(&njordr_core::ClientMessage::Heartbeat {
            worker_id: silent_id.clone(),
        })
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    let info = broker.state.worker(&silent_id).await.unwrap();
    assert_eq!(info.health, WorkerHealth::Healthy);
}

#[tokio::test]
async fn test_duplicate_worker_id_is_refused() {
    let broker = TestBroker::start().await;
    let worker_id = unique_worker("twin");
    let worker = broker.spawn_worker(&worker_id).await;

    let handlers = Arc::new(HandlerRegistry::with_builtins().await);
    match ServiceRuntime::start(broker.service_config(&worker_id), handlers).await {
        Err(Error::RegistrationError(message)) => assert!(message.contains(&worker_id)),
        Err(other) => panic!("Expected RegistrationError, got {:?}", other),
        Ok(_) => panic!("Second registration of {} succeeded", worker_id),
    }

    worker.stop().await;
}

#[tokio::test]
async fn test_single_worker_runs_items_one_at_a_time() {
    let broker = TestBroker::start().await;
    let worker = broker.spawn_worker(&unique_worker("serial")).await;
    let mut producer = broker.client().await;

    let first = producer.submit("sleep", json!({"ms": 50})).await.unwrap();
    let second = producer.submit("sleep", json!({"ms": 50})).await.unwrap();

    let first = wait_for_status(&mut producer, &first, ItemStatus::Completed).await;
    let second = wait_for_status(&mut producer, &second, ItemStatus::Completed).await;

    let first_finished = first.finished_at.unwrap();
    let second_dispatched = second.dispatched_at.unwrap();
    assert!(second_dispatched >= first_finished);

    worker.stop().await;
}

#[tokio::test]
async fn test_abandoned_item_report_is_discarded() {
    let broker = TestBroker::start().await;
    let worker_id = WorkerId::from(unique_worker("abandon").as_str());
    let worker = broker.spawn_worker(&worker_id.0).await;
    let mut producer = broker.client().await;

    let item_id = producer.submit("sleep", json!({"ms": 200})).await.unwrap();
    wait_for_status(&mut producer, &item_id, ItemStatus::Dispatched).await;
    producer.abandon(&item_id).await.unwrap();

    // Abandoning twice is an invalid transition
    assert!(matches!(
        producer.abandon(&item_id).await,
        Err(Error::InvalidTransition { .. })
    ));

    // The worker is released once its report arrives, and the item stays abandoned
    let next = producer.submit("echo", json!(null)).await.unwrap();
    wait_for_status(&mut producer, &next, ItemStatus::Completed).await;
    let item = producer.status(&item_id).await.unwrap();
    assert_eq!(item.status, ItemStatus::Abandoned);

    worker.stop().await;
}

#[tokio::test]
async fn test_shutdown_finishes_in_flight_item() {
    let broker = TestBroker::start().await;
    let worker = broker.spawn_worker(&unique_worker("draining")).await;
    let mut producer = broker.client().await;

    let item_id = producer.submit("sleep", json!({"ms": 150})).await.unwrap();
    wait_for_status(&mut producer, &item_id, ItemStatus::Dispatched).await;

    worker.stop().await;

    let item = producer.status(&item_id).await.unwrap();
    assert_eq!(item.status, ItemStatus::Completed);
}

#[tokio::test]
async fn test_unknown_item_status() {
    let broker = TestBroker::start().await;
    let mut producer: BrokerClient = broker.client().await;

    let missing = njordr_core::ItemId::from("does-not-exist");
    assert!(matches!(
        producer.status(&missing).await,
        Err(Error::UnknownItem(_))
    ));
}

#[tokio::test]
async fn test_full_queue_is_capacity_exceeded() {
    let broker = TestBroker::with_config(BrokerConfig {
        queue_capacity: 1,
        ..broker_config()
    })
    .await;
    let mut producer = broker.client().await;

    // No worker, so the first item stays pending
    producer.submit("echo", json!(1)).await.unwrap();
    match producer.submit("echo", json!(2)).await {
        Err(err @ Error::CapacityExceeded { capacity: 1 }) => assert!(err.is_retryable()),
        other => panic!("Expected CapacityExceeded, got {:?}", other),
    }

    let err = producer
        .status(&ItemId::from("does-not-exist"))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "unknown item: does-not-exist");
}

#[tokio::test]
async fn test_forgotten_worker_registers_again_on_open_connection() {
    let broker = TestBroker::start().await;
    let worker_id = WorkerId::from(unique_worker("forgotten").as_str());
    let worker = broker.spawn_worker(&worker_id.0).await;

    // Broker drops the worker while its connection stays up
    broker.state.registry().await.unregister(&worker_id);

    let mut producer = broker.client().await;
    let item_id = producer.submit("echo", json!("later")).await.unwrap();
    wait_for_status(&mut producer, &item_id, ItemStatus::Completed).await;

    let info = broker.state.worker(&worker_id).await.expect("registered again");
    assert_eq!(info.completed, 1);
    assert_eq!(info.health, WorkerHealth::Healthy);

    worker.stop().await;
}

#[tokio::test]
async fn test_refused_reregistration_stops_worker() {
    let broker = TestBroker::with_config(BrokerConfig {
        heartbeat_timeout_ms: 2_000,
        dead_grace_ms: 2_000,
        ..broker_config()
    })
    .await;
    let worker_id = WorkerId::from(unique_worker("contested").as_str());
    let worker = broker.spawn_worker(&worker_id.0).await;

    // Another connection takes the id once the broker forgets the worker.
    // The worker may win the race and re-register first; then try again.
    let mut other = broker.client().await;
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        broker.state.registry().await.unregister(&worker_id);
        match other.register(&worker_id).await {
            Ok(_) => break,
            Err(Error::RegistrationError(_)) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Err(e) => panic!("Could not take over {}: {}", worker_id, e),
        }
    }

    let result = tokio::time::timeout(WAIT, worker.task)
        .await
        .expect("worker kept running after losing its id")
        .expect("worker task panicked");
    assert!(
        matches!(result, Err(Error::RegistrationError(_))),
        "unexpected exit: {:?}",
        result
    );

    // The other connection still owns the id
    assert!(broker.state.worker(&worker_id).await.is_some());
    other
        .send(&ClientMessage::Heartbeat {
            worker_id: worker_id.clone(),
        })
        .await
        .unwrap();
}

async fn send_to_worker(stream: &mut TcpStream, message: BrokerMessage) {
    write_frame(stream, &message, Serializer::Json).await.unwrap();
}

async fn accept_registration(listener: &TcpListener, worker_id: &WorkerId) -> TcpStream {
    let (mut stream, _) = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("worker never connected")
        .unwrap();
    match read_frame::<_, ClientMessage>(&mut stream, DEFAULT_MAX_FRAME_SIZE).await {
        Ok(Some(ClientMessage::Register { worker_id: id })) => assert_eq!(&id, worker_id),
        other => panic!("Expected register, got {:?}", other),
    }
    send_to_worker(
        &mut stream,
        BrokerMessage::Registered {
            worker_id: worker_id.clone(),
            heartbeat_interval_ms: 1_000,
        },
    )
    .await;
    stream
}

/// Next report on the stream, skipping heartbeats
async fn next_report(stream: &mut TcpStream) -> (ItemId, Outcome) {
    loop {
        let message = tokio::time::timeout(
            WAIT,
            read_frame::<_, ClientMessage>(stream, DEFAULT_MAX_FRAME_SIZE),
        )
        .await
        .expect("no report arrived");
        match message {
            Ok(Some(ClientMessage::Report {
                item_id, outcome, ..
            })) => return (item_id, outcome),
            Ok(Some(ClientMessage::Heartbeat { .. })) => continue,
            other => panic!("Expected report, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_unacked_report_is_resent_after_reconnect() {
    init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let worker_id = WorkerId::from(unique_worker("resend").as_str());
    let config = ServiceConfig {
        id: Some(worker_id.0.clone()),
        broker_addr: listener.local_addr().unwrap().to_string(),
        heartbeat_interval_ms: 30,
        connect_attempts: 3,
        connect_backoff_ms: 10,
        max_backoff_ms: 50,
        shutdown_timeout_secs: 5,
        ..Default::default()
    };

    let broker = {
        let worker_id = worker_id.clone();
        tokio::spawn(async move {
            // Dispatch, take the report, then drop the connection without acking
            let mut stream = accept_registration(&listener, &worker_id).await;
            send_to_worker(
                &mut stream,
                BrokerMessage::Dispatch {
                    assignment: Assignment {
                        item_id: ItemId::from("item-resend"),
                        job: "echo".into(),
                        payload: json!("once"),
                        attempts: 0,
                    },
                },
            )
            .await;
            let first = next_report(&mut stream).await;
            drop(stream);

            // The same report arrives again on the next connection
            let mut stream = accept_registration(&listener, &worker_id).await;
            let second = next_report(&mut stream).await;
            send_to_worker(
                &mut stream,
                BrokerMessage::ReportAck {
                    item_id: second.0.clone(),
                    disposition: ReportDisposition::Completed,
                },
            )
            .await;
            (first, second, stream)
        })
    };

    let handlers = Arc::new(HandlerRegistry::with_builtins().await);
    let runtime = ServiceRuntime::start(config, handlers).await.unwrap();
    let stats = runtime.stats();
    let worker = TestWorker::run(runtime);

    let (first, second, _stream) = tokio::time::timeout(WAIT, broker)
        .await
        .expect("report was not re-sent")
        .unwrap();
    assert_eq!(first.0, ItemId::from("item-resend"));
    assert_eq!(first, second);
    assert_eq!(second.1, Outcome::Success);

    // Re-sent, not re-executed
    assert_eq!(stats.completed(), 1);

    worker.stop().await;
}

#[tokio::test]
async fn test_concurrent_identities_share_the_queue() {
    let broker = TestBroker::start().await;
    let base = unique_worker("multi");
    let config = ServiceConfig {
        concurrency: 3,
        ..broker.service_config(&base)
    };

    let handlers = Arc::new(HandlerRegistry::with_builtins().await);
    let runtimes = start_identities(&config, handlers).await.unwrap();
    let ids: Vec<WorkerId> = runtimes.iter().map(|r| r.worker_id().clone()).collect();
    let expected: Vec<WorkerId> = (0..3)
        .map(|n| WorkerId::from(format!("{}-{}", base, n)))
        .collect();
    assert_eq!(ids, expected);

    let workers: Vec<TestWorker> = runtimes.into_iter().map(TestWorker::run).collect();
    for id in &ids {
        assert!(broker.state.worker(id).await.is_some(), "{} not registered", id);
    }

    // Three slow items run side by side, one per identity
    let mut producer = broker.client().await;
    let mut items = Vec::new();
    for _ in 0..3 {
        items.push(producer.submit("sleep", json!({"ms": 100})).await.unwrap());
    }
    for item_id in &items {
        wait_for_status(&mut producer, item_id, ItemStatus::Completed).await;
    }

    for id in &ids {
        let info = broker.state.worker(id).await.unwrap();
        assert_eq!(info.completed, 1, "{} ran {} items", id, info.completed);
    }

    for worker in workers {
        worker.stop().await;
    }
}
