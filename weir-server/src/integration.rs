//! End-to-end exercises of the coordinator against recorded gateways and a
//! scripted slot provider. Task behavior (spilling, pausing at the barrier,
//! snapshotting) is simulated by feeding the coordinator the replies a task
//! would send.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use petgraph::graph::NodeIndex;

use weir::{
    ExecutionAttemptId, ModificationAction, ModificationId, ModificationReply, PartitionLocation,
    ReplyKind, SubtaskState, TaskRequest, WorkerId, WorkerLocation,
};

use crate::controller::graph::{
    DistributionPattern, ExecutionGraph, ExecutionState, JobStatus, SubtaskRef,
};
use crate::controller::modification::{ModificationCoordinator, TerminalState};
use crate::coordination::{
    CheckpointIdCounter, GatewayError, ScheduledUnit, Slot, SlotAllocationError, SlotProvider,
    TaskManagerGateway,
};
use crate::Config;
use weir::JobId;

fn log() -> slog::Logger {
    slog::Logger::root(slog::Discard, o!())
}

// ----------------------------------------------------------------------
//  fakes
// ----------------------------------------------------------------------

#[derive(Default)]
struct RecordingGateway {
    requests: Mutex<Vec<(WorkerLocation, TaskRequest)>>,
}

impl RecordingGateway {
    fn requests(&self) -> Vec<(WorkerLocation, TaskRequest)> {
        self.requests.lock().unwrap().clone()
    }

    fn take(&self) -> Vec<(WorkerLocation, TaskRequest)> {
        std::mem::replace(&mut *self.requests.lock().unwrap(), Vec::new())
    }
}

impl TaskManagerGateway for RecordingGateway {
    fn send_to_task(
        &self,
        worker: &WorkerLocation,
        request: TaskRequest,
        _timeout: Duration,
    ) -> Result<(), GatewayError> {
        self.requests.lock().unwrap().push((*worker, request));
        Ok(())
    }
}

struct FailingGateway;

impl TaskManagerGateway for FailingGateway {
    fn send_to_task(
        &self,
        worker: &WorkerLocation,
        _request: TaskRequest,
        _timeout: Duration,
    ) -> Result<(), GatewayError> {
        Err(GatewayError::Unreachable {
            worker: worker.worker,
            reason: "gateway wired to fail".to_owned(),
        })
    }
}

struct TestSlotProvider {
    workers: Vec<WorkerLocation>,
    next_index: AtomicUsize,
    released: Mutex<Vec<Slot>>,
}

impl TestSlotProvider {
    fn new(workers: Vec<WorkerLocation>) -> Self {
        TestSlotProvider {
            workers,
            next_index: AtomicUsize::new(0),
            released: Mutex::new(Vec::new()),
        }
    }

    fn released(&self) -> Vec<Slot> {
        self.released.lock().unwrap().clone()
    }

    fn slot_on(&self, location: WorkerLocation) -> Slot {
        Slot {
            location,
            slot_index: self.next_index.fetch_add(1, Ordering::SeqCst),
        }
    }
}

impl SlotProvider for TestSlotProvider {
    fn allocate_slot(
        &self,
        unit: &ScheduledUnit,
        _queued: bool,
    ) -> Result<Slot, SlotAllocationError> {
        match self.workers.first() {
            Some(&location) => Ok(self.slot_on(location)),
            None => Err(SlotAllocationError::NoCapacity {
                task: unit.task_name.clone(),
            }),
        }
    }

    fn allocate_slot_except(
        &self,
        unit: &ScheduledUnit,
        _queued: bool,
        exclude: WorkerId,
    ) -> Result<Slot, SlotAllocationError> {
        match self.workers.iter().find(|w| w.worker != exclude) {
            Some(&location) => Ok(self.slot_on(location)),
            None => Err(SlotAllocationError::OnlyExcludedWorker {
                excluded: exclude,
                task: unit.task_name.clone(),
            }),
        }
    }

    fn release_slot(&self, slot: &Slot) {
        self.released.lock().unwrap().push(slot.clone());
    }
}

struct FixedCheckpoints(u64);

impl CheckpointIdCounter for FixedCheckpoints {
    fn current(&self) -> u64 {
        self.0
    }
}

// ----------------------------------------------------------------------
//  fixture: source(2) -> map(2) -> sink(2), map on worker A
// ----------------------------------------------------------------------

struct Fixture {
    coordinator: ModificationCoordinator,
    gateway: Arc<RecordingGateway>,
    slots: Arc<TestSlotProvider>,
    graph: Arc<Mutex<ExecutionGraph>>,
    job: JobId,
    source: NodeIndex,
    map: NodeIndex,
    sink: NodeIndex,
    tm_a: WorkerLocation,
    tm_b: WorkerLocation,
}

fn worker(port: u16) -> WorkerLocation {
    WorkerLocation {
        worker: WorkerId::fresh(),
        addr: format!("127.0.0.1:{}", port).parse().unwrap(),
    }
}

fn fixture(current_checkpoint: u64) -> Fixture {
    let tm_a = worker(5001);
    let tm_b = worker(5002);
    let tm_c = worker(5003);

    let job = JobId::fresh();
    let mut g = ExecutionGraph::new(job, true, log());
    let source = g.add_vertex("kafka-source", 2);
    let map = g.add_vertex("map", 2);
    let sink = g.add_vertex("sink", 2);
    g.connect(source, map, DistributionPattern::AllToAll);
    g.connect(map, sink, DistributionPattern::AllToAll);

    // map runs on worker A, everything else on worker C
    let mut slot_index = 0;
    for r in g.all_subtasks() {
        let location = if r.node == map { tm_a } else { tm_c };
        g.assign_slot(
            r,
            Slot {
                location,
                slot_index,
            },
        );
        g.set_execution_state(r, ExecutionState::Running);
        slot_index += 1;
    }

    let graph = Arc::new(Mutex::new(g));
    let gateway = Arc::new(RecordingGateway::default());
    let slots = Arc::new(TestSlotProvider::new(vec![tm_b]));
    let config = Config {
        modification_timeout: Duration::from_millis(80),
        rpc_timeout: Duration::from_secs(1),
        queued_scheduling: true,
    };

    let coordinator = ModificationCoordinator::new(
        graph.clone(),
        gateway.clone(),
        slots.clone(),
        Arc::new(FixedCheckpoints(current_checkpoint)),
        config,
        log(),
    );

    Fixture {
        coordinator,
        gateway,
        slots,
        graph,
        job,
        source,
        map,
        sink,
        tm_a,
        tm_b,
    }
}

impl Fixture {
    fn attempt(&self, node: NodeIndex, subtask: usize) -> ExecutionAttemptId {
        self.graph
            .lock()
            .unwrap()
            .subtask(SubtaskRef { node, subtask })
            .current_attempt()
    }

    fn ack(&self, attempt: ExecutionAttemptId, modification: ModificationId) -> bool {
        self.coordinator
            .receive_acknowledge(self.job, attempt, modification)
    }

    fn terminal_state(&self, modification: ModificationId) -> Option<TerminalState> {
        let registry = self.coordinator.registry.lock().unwrap();
        registry.failed.get(&modification).map(|pm| pm.state())
    }

    fn is_pending(&self, modification: ModificationId) -> bool {
        self.coordinator
            .registry
            .lock()
            .unwrap()
            .pending
            .contains_key(&modification)
    }

    fn is_completed(&self, modification: ModificationId) -> bool {
        self.coordinator
            .registry
            .lock()
            .unwrap()
            .completed
            .contains_key(&modification)
    }
}

// ----------------------------------------------------------------------
//  scenarios
// ----------------------------------------------------------------------

#[test]
fn pause_single_completes_on_one_ack() {
    let f = fixture(0);
    let map0 = f.attempt(f.map, 0);

    let id = f.coordinator.pause_single(map0).unwrap();

    // the trigger went to both source subtasks, and only there
    let triggers = f.gateway.take();
    assert_eq!(triggers.len(), 2);
    for (_, request) in &triggers {
        match *request {
            TaskRequest::TriggerModification {
                ref subtasks_to_pause,
                action,
                ref acks,
                ..
            } => {
                assert_eq!(subtasks_to_pause.iter().cloned().collect::<Vec<_>>(), vec![0]);
                assert_eq!(action, ModificationAction::Stopping);
                // the spilling upstream of map is the source
                assert!(acks.contains(&f.attempt(f.source, 0)));
                assert!(acks.contains(&f.attempt(f.source, 1)));
            }
            ref r => panic!("expected trigger-modification, got {:?}", r),
        }
    }

    // only map-0 has to acknowledge
    assert!(f.ack(map0, id));
    assert!(f.is_completed(id));
    assert!(!f.is_pending(id));

    // map-1 passed the marker through without participating
    let map1 = f.attempt(f.map, 1);
    f.coordinator.receive_ignore(f.job, map1, id);
    assert!(f.is_completed(id));
}

#[test]
fn acknowledgements_commute_and_duplicates_are_benign() {
    let f = fixture(0);
    let id = f.coordinator.pause_all("map").unwrap();

    let map0 = f.attempt(f.map, 0);
    let map1 = f.attempt(f.map, 1);

    // out of order, with a duplicate in between
    assert!(f.ack(map1, id));
    assert!(!f.is_completed(id));
    assert!(f.ack(map1, id));
    assert!(!f.is_completed(id));
    assert!(f.ack(map0, id));
    assert!(f.is_completed(id));

    // a duplicate after completion is a late ack and changes nothing
    assert!(f.ack(map0, id));
    assert!(f.is_completed(id));
    assert_eq!(f.coordinator.completed_modifications().len(), 1);
}

#[test]
fn ack_for_unknown_modification_returns_false() {
    let f = fixture(0);
    let map0 = f.attempt(f.map, 0);
    assert!(!f.ack(map0, ModificationId::from(999)));
}

#[test]
fn decline_discards_and_later_acks_are_ignored() {
    let f = fixture(0);
    let id = f.coordinator.pause_all("map").unwrap();

    let map0 = f.attempt(f.map, 0);
    let map1 = f.attempt(f.map, 1);

    f.coordinator
        .receive_decline(f.job, map1, id, Some("task is mid-rebalance".to_owned()));
    assert_eq!(f.terminal_state(id), Some(TerminalState::Declined));
    assert!(!f.is_pending(id));

    // the remaining ack arrives late and is ignored, but still truthy since
    // the modification was once known
    assert!(f.ack(map0, id));
    assert_eq!(f.terminal_state(id), Some(TerminalState::Declined));
    assert!(!f.is_completed(id));
}

#[test]
fn unacknowledged_modification_expires_into_failed() {
    let f = fixture(0);
    let id = f.coordinator.pause_all("map").unwrap();

    let map0 = f.attempt(f.map, 0);
    assert!(f.ack(map0, id));

    // map-1 never acknowledges; the 80ms deadline fires
    thread::sleep(Duration::from_millis(300));
    assert!(!f.is_pending(id));
    assert_eq!(f.terminal_state(id), Some(TerminalState::Expired));

    // a very late ack is logged and still returns true: the id is in failed
    let map1 = f.attempt(f.map, 1);
    assert!(f.ack(map1, id));
    assert_eq!(f.terminal_state(id), Some(TerminalState::Expired));
}

#[test]
fn completing_in_time_wins_against_the_deadline() {
    let f = fixture(0);
    let id = f.coordinator.pause_all("map").unwrap();

    assert!(f.ack(f.attempt(f.map, 0), id));
    assert!(f.ack(f.attempt(f.map, 1), id));
    assert!(f.is_completed(id));

    // the deadline fires later and must not resurrect the record
    thread::sleep(Duration::from_millis(300));
    assert!(f.is_completed(id));
    assert_eq!(f.terminal_state(id), None);
}

#[test]
fn migrate_all_from_spills_upstreams_and_stops_targets() {
    let f = fixture(5);
    let map0 = f.attempt(f.map, 0);
    let map1 = f.attempt(f.map, 1);

    let _id = f
        .coordinator
        .migrate_all_from(f.tm_a.worker)
        .unwrap();

    let triggers = f.gateway.take();
    assert_eq!(triggers.len(), 2, "one trigger per source subtask");
    for (_, request) in &triggers {
        match *request {
            TaskRequest::TriggerMigration {
                ref spilling,
                ref stopping,
                upcoming_checkpoint,
                ..
            } => {
                // both source subtasks spill the two migrating partitions
                assert_eq!(spilling.len(), 2);
                for subtask in 0..2 {
                    let spill = &spilling[&f.attempt(f.source, subtask)];
                    assert_eq!(spill.len(), 2);
                    assert!(spill.contains(&0) && spill.contains(&1));
                }

                // the migrating subtasks themselves are stoppers, never
                // spillers
                assert_eq!(stopping.len(), 2);
                assert!(!spilling.contains_key(&map0));
                assert!(!spilling.contains_key(&map1));

                // each stopper carries one replacement descriptor per sink
                // subtask, addressed at worker B
                for attempt in &[map0, map1] {
                    let replacements = &stopping[attempt];
                    assert_eq!(replacements.len(), 2);
                    for icdd in replacements {
                        match icdd.location {
                            PartitionLocation::Remote(c) => {
                                assert_eq!(c.location.worker, f.tm_b.worker)
                            }
                            ref l => panic!("expected remote location, got {:?}", l),
                        }
                        // the descriptor names the upcoming incarnation, not
                        // the one being stopped
                        assert_ne!(icdd.consumed_partition.producer, *attempt);
                    }
                }

                // anchored two checkpoints past the current one
                assert_eq!(upcoming_checkpoint, Some(7));
            }
            ref r => panic!("expected trigger-migration, got {:?}", r),
        }
    }

    // replacement slots were reserved on worker B
    let graph = f.graph.lock().unwrap();
    for subtask in 0..2 {
        let v = graph.subtask(SubtaskRef {
            node: f.map,
            subtask,
        });
        assert_eq!(
            v.future_slot.as_ref().map(|s| s.worker()),
            Some(f.tm_b.worker)
        );
        assert!(v.upcoming_attempt.is_some());
    }
}

#[test]
fn migration_restarts_after_ack_state_and_pause() {
    let f = fixture(5);
    let id = f.coordinator.migrate_all_from(f.tm_a.worker).unwrap();
    f.gateway.take();

    // every task in the job acknowledges the migration
    for &(node, parallelism) in &[(f.source, 2), (f.map, 2), (f.sink, 2)] {
        for subtask in 0..parallelism {
            assert!(f.ack(f.attempt(node, subtask), id));
        }
    }
    assert!(f.is_completed(id));

    // the two migrating subtasks ship their snapshots first
    let migrating: Vec<_> = (0..2).map(|subtask| f.attempt(f.map, subtask)).collect();
    for (subtask, &attempt) in migrating.iter().enumerate() {
        f.coordinator.receive_state_migration(
            f.job,
            attempt,
            id,
            SubtaskState {
                checkpoint: 7,
                snapshot: vec![subtask as u8; 8],
            },
        );
    }
    // no restart yet: neither task has reported Paused
    assert!(f.gateway.requests().is_empty());

    for &attempt in &migrating {
        f.coordinator
            .vertex_updated_state(attempt, ExecutionState::Paused);
    }

    let deploys = f.gateway.take();
    assert_eq!(deploys.len(), 2);
    for (worker, request) in deploys {
        assert_eq!(worker.worker, f.tm_b.worker);
        match request {
            TaskRequest::Deploy(descriptor) => {
                let state = descriptor.initial_state.expect("restored state");
                assert_eq!(state.subtask_state().checkpoint, 7);
                assert_eq!(descriptor.input_gates.len(), 1);
            }
            r => panic!("expected deploy, got {:?}", r),
        }
    }

    // the consumed snapshots and restart tracking are gone, and the subtasks
    // are deploying on worker B
    let registry = f.coordinator.registry.lock().unwrap();
    assert!(registry.stored_state.is_empty());
    assert!(registry.vertex_to_restart.is_empty());
    drop(registry);

    let graph = f.graph.lock().unwrap();
    for subtask in 0..2 {
        let v = graph.subtask(SubtaskRef {
            node: f.map,
            subtask,
        });
        assert_eq!(v.state(), ExecutionState::Deploying);
        assert_eq!(
            v.current.assigned_slot.as_ref().map(|s| s.worker()),
            Some(f.tm_b.worker)
        );
    }
}

#[test]
fn duplicate_state_migration_overwrites() {
    let f = fixture(5);
    let id = f.coordinator.migrate_all_from(f.tm_a.worker).unwrap();
    f.gateway.take();

    let attempt = f.attempt(f.map, 0);
    for fill in &[1u8, 2] {
        f.coordinator.receive_state_migration(
            f.job,
            attempt,
            id,
            SubtaskState {
                checkpoint: 7,
                snapshot: vec![*fill; 4],
            },
        );
    }

    // only the last snapshot is used by the restart
    f.coordinator
        .vertex_updated_state(attempt, ExecutionState::Paused);
    let deploys = f.gateway.take();
    assert_eq!(deploys.len(), 1);
    match deploys.into_iter().next().unwrap().1 {
        TaskRequest::Deploy(descriptor) => {
            let state = descriptor.initial_state.expect("restored state");
            assert_eq!(state.subtask_state().snapshot, vec![2u8; 4]);
        }
        r => panic!("expected deploy, got {:?}", r),
    }
}

#[test]
fn decline_mid_migration_releases_reserved_slots() {
    let f = fixture(5);
    let id = f.coordinator.migrate_all_from(f.tm_a.worker).unwrap();

    f.coordinator
        .receive_decline(f.job, f.attempt(f.sink, 0), id, None);
    assert_eq!(f.terminal_state(id), Some(TerminalState::Declined));

    // both pre-allocated slots went back to the provider, and the vertices
    // forgot their reservations
    assert_eq!(f.slots.released().len(), 2);
    {
        let graph = f.graph.lock().unwrap();
        for subtask in 0..2 {
            let v = graph.subtask(SubtaskRef {
                node: f.map,
                subtask,
            });
            assert!(v.future_slot.is_none());
            assert!(v.upcoming_attempt.is_none());
        }
    }

    // nothing is left waiting for a restart that will never come
    let registry = f.coordinator.registry.lock().unwrap();
    assert!(registry.vertex_to_restart.is_empty());
    assert!(registry.stored_state.is_empty());
}

#[test]
fn decline_after_state_shipped_leaves_topology_unchanged() {
    let f = fixture(5);
    let id = f.coordinator.migrate_all_from(f.tm_a.worker).unwrap();
    f.gateway.take();

    // map-0 already paused at its barrier and shipped its snapshot ...
    let map0 = f.attempt(f.map, 0);
    f.coordinator.receive_state_migration(
        f.job,
        map0,
        id,
        SubtaskState {
            checkpoint: 7,
            snapshot: vec![1; 4],
        },
    );

    // ... when another participant declines the whole migration
    f.coordinator
        .receive_decline(f.job, f.attempt(f.sink, 0), id, None);
    assert_eq!(f.terminal_state(id), Some(TerminalState::Declined));

    // the late Paused report finds nothing to restart: no deploy is issued
    // and the job keeps running
    f.coordinator
        .vertex_updated_state(map0, ExecutionState::Paused);
    assert!(f.gateway.take().is_empty());
    assert_eq!(f.graph.lock().unwrap().status(), JobStatus::Running);

    // the snapshot for the aborted migration is gone too
    let registry = f.coordinator.registry.lock().unwrap();
    assert!(registry.stored_state.is_empty());
    assert!(registry.vertex_to_restart.is_empty());
}

#[test]
fn expiry_after_state_shipped_leaves_topology_unchanged() {
    let f = fixture(5);
    let id = f.coordinator.migrate_all_from(f.tm_a.worker).unwrap();
    f.gateway.take();

    let map0 = f.attempt(f.map, 0);
    f.coordinator.receive_state_migration(
        f.job,
        map0,
        id,
        SubtaskState {
            checkpoint: 7,
            snapshot: vec![2; 4],
        },
    );

    // no acknowledgements arrive; the deadline fires and the reserved slots
    // go back
    thread::sleep(Duration::from_millis(300));
    assert_eq!(f.terminal_state(id), Some(TerminalState::Expired));
    assert_eq!(f.slots.released().len(), 2);

    f.coordinator
        .vertex_updated_state(map0, ExecutionState::Paused);
    assert!(f.gateway.take().is_empty());
    assert_eq!(f.graph.lock().unwrap().status(), JobStatus::Running);

    let registry = f.coordinator.registry.lock().unwrap();
    assert!(registry.stored_state.is_empty());
    assert!(registry.vertex_to_restart.is_empty());
}

#[test]
fn illegal_state_update_fails_the_job() {
    let f = fixture(5);
    let _id = f.coordinator.migrate_all_from(f.tm_a.worker).unwrap();

    f.coordinator
        .vertex_updated_state(f.attempt(f.map, 0), ExecutionState::Created);
    assert_eq!(f.graph.lock().unwrap().status(), JobStatus::Failed);
}

#[test]
fn no_checkpoint_history_means_no_anchor() {
    let f = fixture(1);
    let _id = f.coordinator.pause_all("map").unwrap();

    for (_, request) in f.gateway.take() {
        match request {
            TaskRequest::TriggerModification {
                upcoming_checkpoint,
                ..
            } => assert_eq!(upcoming_checkpoint, None),
            r => panic!("expected trigger-modification, got {:?}", r),
        }
    }
}

#[test]
fn failed_trigger_moves_modification_to_failed() {
    let f = fixture(0);

    // a coordinator whose gateway cannot reach any worker
    let coordinator = ModificationCoordinator::new(
        f.graph.clone(),
        Arc::new(FailingGateway),
        f.slots.clone(),
        Arc::new(FixedCheckpoints(0)),
        Config::default(),
        log(),
    );

    assert!(coordinator.pause_all("map").is_err());
    let registry = coordinator.registry.lock().unwrap();
    assert!(registry.pending.is_empty());
    assert_eq!(registry.failed.len(), 1);
    assert!(registry
        .failed
        .values()
        .all(|pm| pm.state() == TerminalState::Error));
}

#[test]
fn cancel_modification_discards_and_notifies_sources() {
    let f = fixture(0);
    let id = f.coordinator.pause_all("map").unwrap();
    f.gateway.take();

    f.coordinator.cancel_modification(id).unwrap();
    assert_eq!(f.terminal_state(id), Some(TerminalState::Discarded));

    let cancels = f.gateway.take();
    assert_eq!(cancels.len(), 2);
    for (_, request) in cancels {
        match request {
            TaskRequest::TriggerCancelModification { vertices, .. } => {
                assert!(vertices.contains(&f.attempt(f.map, 0)));
                assert!(vertices.contains(&f.attempt(f.map, 1)));
            }
            r => panic!("expected cancel trigger, got {:?}", r),
        }
    }

    // a late ack after the cancel is truthy but changes nothing
    assert!(f.ack(f.attempt(f.map, 0), id));
    assert_eq!(f.terminal_state(id), Some(TerminalState::Discarded));
}

#[test]
fn increase_parallelism_deploys_and_rewires_one_channel() {
    let f = fixture(0);

    let new = f.coordinator.increase_parallelism_of(f.map).unwrap();
    assert_eq!(new.subtask, 2);
    assert_eq!(f.graph.lock().unwrap().vertex(f.map).parallelism(), 3);

    let deploys = f.gateway.take();
    assert_eq!(deploys.len(), 1);
    match &deploys[0].1 {
        TaskRequest::Deploy(descriptor) => {
            assert!(descriptor.initial_state.is_none());
            assert_eq!(descriptor.input_gates.len(), 1);
            // the new subtask reads all of source's partitions
            assert_eq!(descriptor.input_gates[0].channels.len(), 2);
        }
        r => panic!("expected deploy, got {:?}", r),
    }

    // wire sink-0's third input channel to the new subtask's partition
    f.coordinator
        .consume_new_producer(
            SubtaskRef {
                node: f.sink,
                subtask: 0,
            },
            new,
            2,
        )
        .unwrap();

    let rewires = f.gateway.take();
    assert_eq!(rewires.len(), 1);
    match &rewires[0].1 {
        TaskRequest::ConsumeNewProducer {
            channel_index,
            new_producer,
            partition,
            ..
        } => {
            assert_eq!(*channel_index, 2);
            assert_eq!(*new_producer, f.attempt(f.map, 2));
            assert_eq!(partition.producer, f.attempt(f.map, 2));
        }
        r => panic!("expected consume-new-producer, got {:?}", r),
    }

    // the sink keeps its all-to-all input from map
    assert_eq!(f.graph.lock().unwrap().downstream_of(f.map), Some(f.sink));
}

#[test]
fn insert_operator_schedules_and_rewires_the_consumer() {
    let f = fixture(0);

    let filter = f.coordinator.insert_operator("filter", 2).unwrap();

    {
        let graph = f.graph.lock().unwrap();
        assert_eq!(graph.downstream_of(f.source), Some(filter));
        assert_eq!(graph.upstream_of(f.map), Some(filter));
        assert_eq!(graph.downstream_of(filter), Some(f.map));
    }

    let requests = f.gateway.take();
    let deploys: Vec<_> = requests
        .iter()
        .filter(|(_, r)| match r {
            TaskRequest::Deploy(..) => true,
            _ => false,
        })
        .collect();
    let rewires: Vec<_> = requests
        .iter()
        .filter(|(_, r)| match r {
            TaskRequest::ResumeWithNewInput { .. } => true,
            _ => false,
        })
        .collect();
    assert_eq!(deploys.len(), 2, "one deploy per new filter subtask");
    assert_eq!(rewires.len(), 2, "one rewire per map subtask");

    for (_, rewire) in rewires {
        match rewire {
            TaskRequest::ResumeWithNewInput { input_gates, .. } => {
                // the map now reads the filter's two partitions
                assert_eq!(input_gates[0].channels.len(), 2);
            }
            _ => unreachable!(),
        }
    }
}

#[test]
fn reply_dispatch_routes_every_kind() {
    let f = fixture(0);
    let id = f.coordinator.pause_all("map").unwrap();
    let map0 = f.attempt(f.map, 0);
    let map1 = f.attempt(f.map, 1);

    let reply = |attempt, kind| ModificationReply {
        job: f.job,
        attempt,
        modification: id,
        kind,
    };

    assert!(f.coordinator.receive(reply(map0, ReplyKind::Acknowledge)));
    assert!(f.coordinator.receive(reply(map1, ReplyKind::Ignore)));
    assert!(f.coordinator.receive(reply(
        map1,
        ReplyKind::StateMigration {
            state: SubtaskState {
                checkpoint: 2,
                snapshot: vec![1],
            },
        },
    )));
    assert!(f
        .coordinator
        .receive(reply(map1, ReplyKind::Decline { reason: None })));
    assert_eq!(f.terminal_state(id), Some(TerminalState::Declined));
}

#[test]
fn resume_all_issues_resume_rpcs() {
    let f = fixture(0);
    f.coordinator.resume_all("map").unwrap();

    let requests = f.gateway.take();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|(_, r)| match r {
        TaskRequest::Resume { .. } => true,
        _ => false,
    }));

    assert!(f.coordinator.resume_all("reduce").is_err());
}

#[test]
fn resume_with_different_inputs_ships_fresh_gates() {
    let f = fixture(0);
    f.coordinator
        .resume_with_different_inputs(f.sink, 0)
        .unwrap();

    let requests = f.gateway.take();
    assert_eq!(requests.len(), 2);
    for (_, request) in requests {
        match request {
            TaskRequest::ResumeWithDifferentInputs {
                stopped_subtask,
                input_gates,
                ..
            } => {
                assert_eq!(stopped_subtask, 0);
                // one channel per map subtask
                assert_eq!(input_gates[0].channels.len(), 2);
            }
            r => panic!("expected resume-with-different-inputs, got {:?}", r),
        }
    }
}

#[test]
fn worker_details_list_every_subtask() {
    let f = fixture(0);
    let details = f.coordinator.worker_details();
    assert!(details.contains("kafka-source[0]"));
    assert!(details.contains("map[1]"));
    assert!(details.contains("sink[1]"));
}

#[test]
fn trigger_fans_out_as_in_band_markers() {
    use dataflow::ops::Identity;
    use dataflow::prelude::*;
    use weir::channel::{SendError as ChannelSendError, Sender};

    // a channel endpoint standing in for one downstream subtask's input
    #[derive(Clone, Default)]
    struct TaskInput(Arc<Mutex<Vec<StreamMessage>>>);

    impl Sender for TaskInput {
        type Item = StreamMessage;

        fn send(&mut self, msg: StreamMessage) -> Result<(), ChannelSendError> {
            self.0.lock().unwrap().push(msg);
            Ok(())
        }
    }

    let f = fixture(5);
    let map0 = f.attempt(f.map, 0);
    let id = f.coordinator.pause_single(map0).unwrap();

    // the source task that received the trigger broadcasts the marker on its
    // chain, in-band with the records it was already emitting
    let inputs: Vec<TaskInput> = (0..2).map(|_| TaskInput::default()).collect();
    let output = RecordWriterOutput::new(
        "source -> map".to_owned(),
        Partitioner::Broadcast,
        inputs
            .iter()
            .map(|c| Box::new(c.clone()) as Box<dyn Sender<Item = StreamMessage> + Send>)
            .collect(),
    );
    let mut chain = OperatorChainBuilder::new("kafka-source[0]", log())
        .operator("source", Box::new(Identity))
        .output(0, output)
        .build()
        .unwrap();

    chain
        .process_record(StreamRecord::new(vec![1.into()]))
        .unwrap();
    let source0 = f.attempt(f.source, 0);
    for (_, request) in f.gateway.take() {
        match request {
            TaskRequest::TriggerModification {
                attempt,
                metadata,
                acks,
                subtasks_to_pause,
                action,
                ..
            } => {
                // this chain is source subtask 0; its sibling's trigger goes
                // to a different task
                if attempt == source0 {
                    chain
                        .broadcast_start_modification_event(
                            metadata,
                            acks,
                            subtasks_to_pause,
                            action,
                        )
                        .unwrap();
                }
            }
            r => panic!("expected trigger-modification, got {:?}", r),
        }
    }
    chain
        .process_record(StreamRecord::new(vec![2.into()]))
        .unwrap();

    // both downstream subtasks see record, marker, record, in that order
    for input in &inputs {
        let msgs = input.0.lock().unwrap();
        assert_eq!(msgs.len(), 3);
        assert!(msgs[0].is_record());
        match *msgs[1].as_marker().unwrap() {
            Marker::StartModification {
                ref metadata,
                ref subtasks_to_pause,
                ..
            } => {
                assert_eq!(metadata.modification, id);
                assert!(subtasks_to_pause.contains(&0));
            }
            ref m => panic!("expected start-modification marker, got {:?}", m),
        }
        assert!(msgs[2].is_record());
    }

    // map-0 reacts to the marker and acknowledges; the modification completes
    assert!(f.ack(map0, id));
    assert!(f.is_completed(id));
}

#[test]
fn restart_stopped_instance_redeploys_with_state() {
    let f = fixture(0);
    let map0 = f.attempt(f.map, 0);
    let id = f.coordinator.pause_single(map0).unwrap();
    f.gateway.take();

    assert!(f.ack(map0, id));
    f.coordinator.receive_state_migration(
        f.job,
        map0,
        id,
        SubtaskState {
            checkpoint: 3,
            snapshot: vec![9; 4],
        },
    );
    f.graph.lock().unwrap().set_execution_state(
        SubtaskRef {
            node: f.map,
            subtask: 0,
        },
        ExecutionState::Paused,
    );

    f.coordinator.restart_stopped_instance(id).unwrap();

    let deploys = f.gateway.take();
    assert_eq!(deploys.len(), 1);
    match &deploys[0].1 {
        TaskRequest::Deploy(descriptor) => {
            let state = descriptor.initial_state.as_ref().expect("restored state");
            assert_eq!(state.subtask_state().checkpoint, 3);
        }
        r => panic!("expected deploy, got {:?}", r),
    }

    // the stop record and its state were consumed
    let registry = f.coordinator.registry.lock().unwrap();
    assert!(registry.stops.is_empty());
    assert!(registry.stored_state.is_empty());
}
