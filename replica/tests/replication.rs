mod common;

use std::sync::Arc;

use replica::apply::{BufferedApply, DirectApply};
use replica::concurrency::shutdown::create_shutdown_channel;
use replica::destination::memory::MemoryDestination;
use replica::destination::{Destination, DestinationSession, ForeignKey, ReplicationRole};
use replica::error::ReplicaResult;
use replica::handlers::HandlerRegistry;
use replica::replication::copy::{CopyDelegate, CopyRequest};
use replica::replication::sync::detach_table;
use replica::state::snapshot::CopySnapshot;
use replica::state::table::{TableState, TableSyncPhase, TableSyncPhaseType};
use replica::store::state::StateStore;
use replica::test_utils::config::{TEST_CONSUMER, TEST_QUEUE, test_worker_config};
use replica::test_utils::copy::MemoryCopyDelegate;
use replica::test_utils::event::{control, execute, insert, update};
use replica::test_utils::notify::NotifyingStateStore;
use replica::test_utils::sink::{FailingSink, MemorySink};
use replica::transport::QueueTransport;
use replica::types::ControlKind;
use replica::workers::base::{Worker, WorkerHandle};
use replica::workers::replication::ReplicationWorker;
use replica_telemetry::tracing::init_test_tracing;

use crate::common::{TestNode, row, wait_until};

const COPY_CONSUMER: &str = "leaf_copy_public.orders";

/// Detaches the copied table while its copy runs, as an operator racing the copy would.
#[derive(Debug, Clone)]
struct DetachingCopyDelegate {
    inner: MemoryCopyDelegate,
    store: NotifyingStateStore,
}

impl CopyDelegate for DetachingCopyDelegate {
    async fn copy_table(&self, request: &CopyRequest) -> ReplicaResult<CopySnapshot> {
        detach_table(&self.store, TEST_QUEUE, &request.table).await?;
        self.inner.copy_table(request).await
    }
}

fn orders_customer_fkey() -> ForeignKey {
    ForeignKey {
        name: "orders_customer_fkey".to_owned(),
        table: "public.orders".to_owned(),
        referenced_table: "public.customers".to_owned(),
        restore_sql: "alter table only public.orders add constraint orders_customer_fkey foreign key (customer_id) references public.customers(id)".to_owned(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn attached_table_is_copied_and_handed_over_to_the_main_worker() {
    init_test_tracing();
    let node = TestNode::new();
    node.destination.add_foreign_key(orders_customer_fkey()).await;

    // The row of tick 2 is already on the source when the copy runs.
    node.queue.register_consumer(TEST_CONSUMER, None).await.unwrap();
    node.queue
        .push_tick(vec![insert("public.orders", "id=1&amount=10")])
        .await;
    node.delegate
        .set_source_rows(
            "orders",
            &["id"],
            vec![row(&[("id", "1"), ("amount", "10")])],
        )
        .await;
    node.attach("orders").await;

    let handle = node.start(1).await;

    node.wait_for_phase("orders", TableSyncPhaseType::CatchingUp)
        .await;
    node.queue
        .push_tick(vec![
            insert("public.orders", "id=2&amount=20"),
            update("public.orders", "id=1&amount=15"),
        ])
        .await;

    node.wait_for_phase("orders", TableSyncPhaseType::Ok).await;
    node.queue
        .push_tick(vec![insert("public.orders", "id=3&amount=30")])
        .await;

    let destination = node.destination.clone();
    wait_until("all orders to be replicated", || {
        let destination = destination.clone();
        async move { destination.table_rows("public.orders").await.len() == 3 }
    })
    .await;

    assert_eq!(
        node.destination.table_rows("public.orders").await,
        vec![
            row(&[("id", "1"), ("amount", "15")]),
            row(&[("id", "2"), ("amount", "20")]),
            row(&[("id", "3"), ("amount", "30")]),
        ]
    );
    assert_eq!(
        node.phase_history("orders").await,
        vec![
            TableSyncPhaseType::Missing,
            TableSyncPhaseType::InCopy,
            TableSyncPhaseType::CatchingUp,
            TableSyncPhaseType::WannaSync,
            TableSyncPhaseType::DoSync,
            TableSyncPhaseType::Ok,
        ]
    );

    // The foreign key came back once the table caught up.
    assert_eq!(node.destination.foreign_keys().await, vec![orders_customer_fkey()]);
    assert!(
        node.destination
            .analyzed()
            .await
            .contains(&"public.orders".to_owned())
    );
    let state = node
        .store
        .inner()
        .table_state(TEST_QUEUE, "public.orders")
        .await
        .unwrap();
    assert!(state.dropped_ddl.is_none());

    let acked = node.queue.acked_ticks(TEST_CONSUMER).await;
    assert!(acked.windows(2).all(|pair| pair[0] < pair[1]));
    assert!(!node.queue.is_registered(COPY_CONSUMER).await);

    node.shutdown_tx.shutdown().unwrap();
    handle.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_copy_keeps_the_table_in_copy_and_holds_the_capacity() {
    init_test_tracing();
    let node = TestNode::new();
    node.delegate.fail_table("orders").await;
    node.register("orders", TableSyncPhase::Missing).await;
    node.register("items", TableSyncPhase::Missing).await;

    let handle = node.start(1).await;

    let delegate = node.delegate.clone();
    wait_until("the copy of orders to be attempted", || {
        let delegate = delegate.clone();
        async move { !delegate.requests().await.is_empty() }
    })
    .await;

    // Give the main worker a number of passes to launch another copy.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let requests = node.delegate.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].table, "public.orders");
    assert_eq!(node.phase("orders").await, Some(TableSyncPhase::InCopy));
    assert_eq!(node.phase("items").await, Some(TableSyncPhase::Missing));

    node.shutdown_tx.shutdown().unwrap();
    // The copy failure is reported through the logs, the main worker stopped cleanly.
    handle.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn table_detached_during_its_copy_stops_the_copy_worker_cleanly() {
    init_test_tracing();
    let node = TestNode::new();
    node.attach("orders").await;

    let delegate = DetachingCopyDelegate {
        inner: node.delegate.clone(),
        store: node.store.clone(),
    };
    let handle = ReplicationWorker::new(
        Arc::new(test_worker_config(1)),
        node.queue.clone(),
        node.store.clone(),
        node.destination.clone(),
        DirectApply,
        delegate,
        Arc::new(HandlerRegistry::default()),
        node.shutdown_tx.clone(),
    )
    .start()
    .await
    .unwrap();

    let copies = node.delegate.clone();
    wait_until("the copy of orders to start", || {
        let copies = copies.clone();
        async move { !copies.requests().await.is_empty() }
    })
    .await;

    // Only a copy worker that stopped cleanly drops its consumer.
    let queue = node.queue.clone();
    wait_until("the copy consumer to be unregistered", || {
        let queue = queue.clone();
        async move { !queue.is_registered(COPY_CONSUMER).await }
    })
    .await;
    assert!(node.phase("orders").await.is_none());

    node.shutdown_tx.shutdown().unwrap();
    handle.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn tables_are_copied_one_at_a_time_in_registration_order() {
    init_test_tracing();
    let node = TestNode::new();
    node.register("orders", TableSyncPhase::Missing).await;
    node.register("items", TableSyncPhase::Missing).await;

    let handle = node.start(1).await;

    node.wait_for_phase("orders", TableSyncPhaseType::Ok).await;
    node.wait_for_phase("items", TableSyncPhaseType::Ok).await;

    let copied: Vec<_> = node
        .delegate
        .requests()
        .await
        .into_iter()
        .map(|request| request.table)
        .collect();
    assert_eq!(copied, vec!["public.orders", "public.items"]);

    node.shutdown_tx.shutdown().unwrap();
    handle.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn copy_workers_resume_after_a_restart() {
    init_test_tracing();
    let node = TestNode::new();

    let mut state = TableState::new("orders", None).with_phase(TableSyncPhase::CatchingUp);
    state.snapshot = Some(CopySnapshot::new(1));
    node.store.register_table(TEST_QUEUE, state).await.unwrap();
    node.queue.register_consumer(TEST_CONSUMER, None).await.unwrap();
    node.queue.register_consumer(COPY_CONSUMER, None).await.unwrap();
    node.queue
        .push_tick(vec![insert("public.orders", "id=7")])
        .await;

    let handle = node.start(1).await;

    node.wait_for_phase("orders", TableSyncPhaseType::Ok).await;

    assert!(node.delegate.requests().await.is_empty());
    assert_eq!(
        node.destination.table_rows("public.orders").await,
        vec![row(&[("id", "7")])]
    );

    node.shutdown_tx.shutdown().unwrap();
    handle.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_committed_before_a_crash_is_acked_without_replay() {
    init_test_tracing();
    let node = TestNode::new();
    node.register("orders", TableSyncPhase::Ok).await;
    node.queue.register_consumer(TEST_CONSUMER, None).await.unwrap();
    let committed_tick = node
        .queue
        .push_tick(vec![insert("public.orders", "id=1")])
        .await;

    // The destination already holds the batch, the ack was lost.
    let mut session = node.destination.open_session().await.unwrap();
    session
        .set_completed_tick(TEST_CONSUMER, committed_tick)
        .await
        .unwrap();

    let handle = node.start(1).await;

    let queue = node.queue.clone();
    wait_until("the committed batch to be acked", || {
        let queue = queue.clone();
        async move { queue.acked_ticks(TEST_CONSUMER).await.contains(&committed_tick) }
    })
    .await;
    assert!(node.destination.table_rows("public.orders").await.is_empty());

    node.queue
        .push_tick(vec![insert("public.orders", "id=2")])
        .await;
    let destination = node.destination.clone();
    wait_until("the next batch to be applied", || {
        let destination = destination.clone();
        async move { destination.table_rows("public.orders").await.len() == 1 }
    })
    .await;
    assert_eq!(
        node.destination.table_rows("public.orders").await,
        vec![row(&[("id", "2")])]
    );

    node.shutdown_tx.shutdown().unwrap();
    handle.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_batch_is_retried_as_a_whole() {
    init_test_tracing();
    let node = TestNode::new();
    node.register("orders", TableSyncPhase::Ok).await;
    node.queue.register_consumer(TEST_CONSUMER, None).await.unwrap();
    node.queue
        .push_tick(vec![
            insert("public.orders", "id=1"),
            insert("public.orders", "id=2"),
        ])
        .await;
    node.destination.fail_next_applies(1).await;

    let handle = node.start(1).await;

    let destination = node.destination.clone();
    wait_until("the batch to be applied", || {
        let destination = destination.clone();
        async move { destination.table_rows("public.orders").await.len() == 2 }
    })
    .await;
    assert_eq!(
        node.destination.table_rows("public.orders").await,
        vec![row(&[("id", "1")]), row(&[("id", "2")])]
    );

    node.shutdown_tx.shutdown().unwrap();
    handle.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn execute_runs_at_most_once_per_node() {
    init_test_tracing();
    let node = TestNode::new();
    node.register("orders", TableSyncPhase::Ok).await;
    node.queue.register_consumer(TEST_CONSUMER, None).await.unwrap();
    let execute_tick = node
        .queue
        .push_tick(vec![execute(
            "v1.sql",
            "alter table @orders@ add column note text; create index orders_note_idx on @orders@ (note);",
            Some("local_table=orders"),
        )])
        .await;

    let handle = node.start(1).await;

    let store = node.store.clone();
    wait_until("the execute to be finished", || {
        let store = store.clone();
        async move {
            store
                .inner()
                .execute_record(TEST_QUEUE, "v1.sql")
                .await
                .is_some_and(|record| record.finished)
        }
    })
    .await;

    assert_eq!(
        node.destination.statements().await,
        vec![
            "alter table public.orders add column note text",
            "create index orders_note_idx on public.orders (note)",
        ]
    );
    assert!(node.destination.roles().await.contains(&ReplicationRole::Local));

    node.shutdown_tx.shutdown().unwrap();
    handle.wait().await.unwrap();

    // Replay the execute against a fresh destination, as after a restart that lost the
    // completed tick.
    node.queue.unregister_consumer(TEST_CONSUMER).await.unwrap();
    node.queue
        .register_consumer(TEST_CONSUMER, Some(execute_tick - 1))
        .await
        .unwrap();
    let restarted = TestNode {
        destination: MemoryDestination::new(),
        shutdown_tx: create_shutdown_channel().0,
        ..node.clone()
    };
    let handle = restarted.start(1).await;

    let queue = restarted.queue.clone();
    wait_until("the execute batch to be acked again", || {
        let queue = queue.clone();
        async move { queue.acked_ticks(TEST_CONSUMER).await.contains(&execute_tick) }
    })
    .await;

    assert!(restarted.destination.statements().await.is_empty());
    let record = node
        .store
        .inner()
        .execute_record(TEST_QUEUE, "v1.sql")
        .await
        .unwrap();
    assert_eq!(record.finish_count, 1);

    restarted.shutdown_tx.shutdown().unwrap();
    handle.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn execute_of_a_failed_commit_runs_again_on_retry() {
    init_test_tracing();
    let node = TestNode::new();
    node.register("orders", TableSyncPhase::Ok).await;
    node.queue.register_consumer(TEST_CONSUMER, None).await.unwrap();
    let execute_tick = node
        .queue
        .push_tick(vec![execute(
            "v2.sql",
            "alter table orders add column note text",
            None,
        )])
        .await;
    node.destination.fail_next_commits(1).await;

    let handle = node.start(1).await;

    let queue = node.queue.clone();
    wait_until("the execute batch to be acked", || {
        let queue = queue.clone();
        async move { queue.acked_ticks(TEST_CONSUMER).await.contains(&execute_tick) }
    })
    .await;

    assert_eq!(
        node.destination.statements().await,
        vec!["alter table orders add column note text"]
    );
    let record = node
        .store
        .inner()
        .execute_record(TEST_QUEUE, "v2.sql")
        .await
        .unwrap();
    assert!(record.finished);
    assert_eq!(record.finish_count, 1);

    node.shutdown_tx.shutdown().unwrap();
    handle.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn execute_for_tables_of_other_nodes_is_skipped_but_finished() {
    init_test_tracing();
    let node = TestNode::new();
    node.register("items", TableSyncPhase::Ok).await;
    node.queue.register_consumer(TEST_CONSUMER, None).await.unwrap();
    node.queue
        .push_tick(vec![execute(
            "orders_note.sql",
            "alter table orders add column note text",
            Some("local_table=orders"),
        )])
        .await;

    let handle = node.start(1).await;

    let store = node.store.clone();
    wait_until("the execute to be finished", || {
        let store = store.clone();
        async move {
            store
                .inner()
                .execute_record(TEST_QUEUE, "orders_note.sql")
                .await
                .is_some_and(|record| record.finished)
        }
    })
    .await;
    assert!(node.destination.statements().await.is_empty());

    node.shutdown_tx.shutdown().unwrap();
    handle.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_sink_flush_resends_the_same_batch() {
    init_test_tracing();
    let node = TestNode::new();
    node.register("orders", TableSyncPhase::Ok).await;
    node.queue.register_consumer(TEST_CONSUMER, None).await.unwrap();
    let tick_id = node
        .queue
        .push_tick(vec![
            insert("public.orders", "id=1&amount=10"),
            insert("public.orders", "id=2&amount=20"),
        ])
        .await;

    let sink = FailingSink::new(MemorySink::new(), 1);
    let apply = BufferedApply::new(TEST_QUEUE, sink.clone());
    let handle = node.start_with(test_worker_config(1), apply).await;

    let flushed_sink = sink.clone();
    wait_until("the batch to reach the sink", || {
        let sink = flushed_sink.clone();
        async move { !sink.inner().flushed().await.is_empty() }
    })
    .await;

    let flushed = sink.inner().flushed().await;
    assert_eq!(flushed.len(), 1);
    let (key, payload) = &flushed[0];
    assert_eq!(key, &format!("{TEST_QUEUE}:{TEST_CONSUMER}:{tick_id}"));
    assert_eq!(payload["batch"]["tick_id"], tick_id);
    assert_eq!(payload["blocks"].as_array().unwrap().len(), 2);
    assert_eq!(sink.attempts(), 2);

    // Nothing reached the destination tables, the sink got the changes.
    assert!(node.destination.table_rows("public.orders").await.is_empty());

    node.shutdown_tx.shutdown().unwrap();
    handle.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn control_events_update_the_replication_set() {
    init_test_tracing();
    let node = TestNode::new();
    node.register("items", TableSyncPhase::Ok).await;
    node.store
        .inner()
        .add_local_sequence(TEST_QUEUE, "public.orders_id_seq")
        .await;
    node.queue.register_consumer(TEST_CONSUMER, None).await.unwrap();
    let tick_id = node
        .queue
        .push_tick(vec![
            control(ControlKind::AddTable, "audit", ""),
            control(ControlKind::UpdateSeq, "orders_id_seq", "42"),
            control(ControlKind::RemoveTable, "items", ""),
        ])
        .await;

    let handle = node.start(1).await;

    let queue = node.queue.clone();
    wait_until("the control batch to be acked", || {
        let queue = queue.clone();
        async move { queue.acked_ticks(TEST_CONSUMER).await.contains(&tick_id) }
    })
    .await;

    assert_eq!(
        node.store.inner().global_tables(TEST_QUEUE).await,
        vec!["public.audit"]
    );
    assert!(node.phase("items").await.is_none());
    assert_eq!(node.destination.sequence("public.orders_id_seq").await, Some(42));

    node.shutdown_tx.shutdown().unwrap();
    handle.wait().await.unwrap();
}
