use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use distbuild::config::RpcConfig;
use distbuild::master::{MasterRpc, MasterRunner, StartOutcome};
use distbuild::proto::{StatusResponse, SystemInfoResponse};
use distbuild::rpc::{RpcChannel, ServiceRegistry};
use distbuild::scheduler::{Admission, EdgeSpec, Graph, Manifest, Plan, SlaveTable};
use distbuild::system;
use distbuild::DistbuildError;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn graph(edges: Vec<EdgeSpec>) -> Graph {
    Graph::from_manifest(Manifest {
        defaults: vec![],
        edges,
    })
    .unwrap()
}

/// cc a.c -> a.o, cc b.c -> b.o, link a.o b.o -> app, phony all -> app
fn program_graph() -> Graph {
    graph(vec![
        EdgeSpec::new("cc", "cc -c a.c -o a.o", &["a.c"], &["a.o"]),
        EdgeSpec::new("cc", "cc -c b.c -o b.o", &["b.c"], &["b.o"]),
        EdgeSpec::new("link", "cc a.o b.o -o app", &["a.o", "b.o"], &["app"]),
        EdgeSpec::phony(&["app"], "all"),
    ])
}

fn edge_for(graph: &Graph, output: &str) -> usize {
    let node = graph.node(output).unwrap();
    graph.node_at(node).in_edge.unwrap()
}

fn slave_info(os: &str, processors: u32) -> SystemInfoResponse {
    SystemInfoResponse {
        number_of_processors: processors,
        operating_system_name: os.to_string(),
        operating_system_architecture: system::os_arch().to_string(),
        ..Default::default()
    }
}

// =============================================================================
// Graph
// =============================================================================

#[test]
fn test_manifest_parses_json() {
    let manifest = Manifest::from_json(
        r#"{
            "defaults": ["app"],
            "edges": [
                {"rule": "cc", "command": "cc -c a.c -o a.o", "inputs": ["a.c"], "outputs": ["a.o"]},
                {"rule": "link", "command": "cc @app.rsp -o app", "inputs": ["a.o"], "outputs": ["app"],
                 "rspfile": "app.rsp", "rspfile_content": "a.o"}
            ]
        }"#,
    )
    .unwrap();

    assert_eq!(manifest.defaults, vec!["app"]);
    assert_eq!(manifest.edges.len(), 2);
    assert_eq!(manifest.edges[1].rspfile(), Some(("app.rsp", "a.o")));
    assert_eq!(manifest.edges[0].rspfile(), None);
}

#[test]
fn test_default_targets_are_unconsumed_outputs() {
    let graph = program_graph();
    assert_eq!(graph.default_targets(), vec!["all"]);
}

#[test]
fn test_edge_hash_ignores_case_and_command() {
    let lower = EdgeSpec::new("cc", "cc -c a.c", &["a.c"], &["a.o"]);
    let upper = EdgeSpec::new("CC", "something else", &[], &["A.O"]);
    let other = EdgeSpec::new("cc", "cc -c a.c", &["a.c"], &["b.o"]);

    assert_eq!(lower.hash(), upper.hash());
    assert_ne!(lower.hash(), other.hash());
}

#[test]
fn test_lookup_by_hash() {
    let graph = program_graph();
    let link = edge_for(&graph, "app");
    assert_eq!(graph.edge_by_hash(graph.edge(link).hash), Some(link));
}

#[test]
fn test_duplicate_producer_is_rejected() {
    let result = Graph::from_manifest(Manifest {
        defaults: vec![],
        edges: vec![
            EdgeSpec::new("cc", "cc -c a.c -o a.o", &["a.c"], &["a.o"]),
            EdgeSpec::new("cc2", "gcc -c a.c -o a.o", &["a.c"], &["a.o"]),
        ],
    });
    assert!(matches!(result, Err(DistbuildError::InvalidManifest(_))));
}

#[test]
fn test_unknown_default_is_rejected() {
    let result = Graph::from_manifest(Manifest {
        defaults: vec!["missing".to_string()],
        edges: vec![EdgeSpec::new("cc", "cc", &[], &["a.o"])],
    });
    assert!(matches!(result, Err(DistbuildError::UnknownTarget(_))));
}

#[test]
fn test_must_run_locally_when_inputs_are_built() {
    let graph = program_graph();

    assert!(!graph.must_run_locally(edge_for(&graph, "a.o")));
    assert!(graph.must_run_locally(edge_for(&graph, "app")));
}

#[test]
fn test_must_run_locally_looks_through_phony() {
    let graph = graph(vec![
        EdgeSpec::new("gen", "gen > gen.h", &[], &["gen.h"]),
        EdgeSpec::phony(&["gen.h"], "headers"),
        EdgeSpec::new("cc", "cc -c a.c -o a.o", &["a.c", "headers"], &["a.o"]),
        EdgeSpec::phony(&["src.h"], "sources"),
        EdgeSpec::new("cc", "cc -c b.c -o b.o", &["b.c", "sources"], &["b.o"]),
    ]);

    assert!(graph.must_run_locally(edge_for(&graph, "a.o")));
    assert!(!graph.must_run_locally(edge_for(&graph, "b.o")));
}

#[test]
fn test_allow_list_holds_command_edges_only() {
    let graph = program_graph();
    let allow = graph.allow_list();

    assert_eq!(allow.len(), 3);
    let link = graph.edge(edge_for(&graph, "app"));
    assert_eq!(allow.get(&link.hash), Some(&link.spec));
    let all = graph.edge(edge_for(&graph, "all"));
    assert!(!allow.contains_key(&all.hash));
}

// =============================================================================
// Plan
// =============================================================================

#[test]
fn test_plan_releases_dependents_in_order() {
    let graph = program_graph();
    let mut plan = Plan::new();
    plan.add_target(&graph, "all").unwrap();
    assert_eq!(plan.command_edge_count(), 3);

    let first = plan.find_work().unwrap();
    let second = plan.find_work().unwrap();
    assert_eq!(first, edge_for(&graph, "a.o"));
    assert_eq!(second, edge_for(&graph, "b.o"));
    assert_eq!(plan.find_work(), None);

    plan.edge_finished(&graph, first, true);
    assert_eq!(plan.find_work(), None);
    plan.edge_finished(&graph, second, true);

    let link = plan.find_work().unwrap();
    assert_eq!(link, edge_for(&graph, "app"));
    plan.edge_finished(&graph, link, true);

    let all = plan.find_work().unwrap();
    assert!(graph.edge(all).is_phony());
    assert!(plan.more_to_do());
    plan.edge_finished(&graph, all, true);
    assert!(!plan.more_to_do());
}

#[test]
fn test_failure_does_not_release_dependents() {
    let graph = program_graph();
    let mut plan = Plan::new();
    plan.add_target(&graph, "app").unwrap();

    let a = plan.find_work().unwrap();
    let b = plan.find_work().unwrap();
    plan.edge_finished(&graph, a, false);
    plan.edge_finished(&graph, b, true);

    assert_eq!(plan.find_work(), None);
    assert!(plan.is_finished(a));
    assert!(plan.more_to_do());
}

#[test]
fn test_source_target_adds_nothing() {
    let graph = program_graph();
    let mut plan = Plan::new();
    plan.add_target(&graph, "a.c").unwrap();

    assert!(!plan.more_to_do());
    assert!(matches!(
        plan.add_target(&graph, "nope"),
        Err(DistbuildError::UnknownTarget(_))
    ));
}

#[test]
fn test_cycle_is_rejected() {
    let graph = graph(vec![
        EdgeSpec::new("x", "x", &["b"], &["a"]),
        EdgeSpec::new("y", "y", &["a"], &["b"]),
    ]);
    let mut plan = Plan::new();
    assert!(matches!(
        plan.add_target(&graph, "a"),
        Err(DistbuildError::InvalidManifest(_))
    ));
}

// =============================================================================
// Slave table
// =============================================================================

#[test]
fn test_admission_requires_matching_system() {
    let mut table = SlaveTable::new("linux", system::os_arch());

    let rejected = table.admit(1, LOCALHOST, &slave_info("plan9", 4));
    match rejected {
        Admission::Rejected { reason } => {
            assert!(reason.starts_with("Different system name or architecture"));
            assert!(reason.contains(&format!("\"linux, {}\"", system::os_arch())));
        }
        Admission::Admitted => panic!("plan9 slave admitted"),
    }
    assert!(table.is_empty());

    assert_eq!(table.admit(2, LOCALHOST, &slave_info("linux", 4)), Admission::Admitted);
    assert_eq!(table.total_processors(), 4);
}

#[test]
fn test_select_slave_with_most_spare_capacity() {
    let mut table = SlaveTable::new("linux", system::os_arch());
    table.admit(1, LOCALHOST, &slave_info("linux", 2));
    table.admit(2, LOCALHOST, &slave_info("linux", 4));

    assert_eq!(table.select_slave(), Some(2));
    table.record_dispatch(2);
    table.record_dispatch(2);
    // Tie at two spare processors: first found wins.
    assert_eq!(table.select_slave(), Some(1));

    table.record_dispatch(1);
    table.record_dispatch(1);
    table.record_dispatch(2);
    table.record_dispatch(2);
    assert_eq!(table.select_slave(), None);

    table.record_completion(1);
    assert_eq!(table.select_slave(), Some(1));
}

#[test]
fn test_status_updates_and_summaries() {
    let mut table = SlaveTable::new("linux", system::os_arch());
    table.admit(3, LOCALHOST, &slave_info("linux", 8));
    table.update_status(
        3,
        &StatusResponse {
            load_average: 1.5,
            amount_of_running_commands: 2,
            amount_of_available_physical_memory: 4096,
        },
    );

    let slave = table.get(3).unwrap();
    assert_eq!(slave.amount_of_running_commands, 2);
    assert!(slave.last_status.is_some());

    let summaries = table.summaries();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].ip, "127.0.0.1");
    assert_eq!(summaries[0].processors, 8);

    assert!(table.remove(3).is_some());
    assert_eq!(table.total_processors(), 0);
}

// =============================================================================
// Master runner
// =============================================================================

struct RunnerFixture {
    runner: MasterRunner,
    graph: Graph,
    _channel: RpcChannel,
    dir: tempfile::TempDir,
}

fn runner_fixture(parallelism: usize) -> RunnerFixture {
    let dir = tempfile::tempdir().unwrap();
    let channel = RpcChannel::new(
        RpcConfig::default(),
        ServiceRegistry::new(),
        CancellationToken::new(),
    );
    let (events_tx, _events) = mpsc::unbounded_channel();
    let rpc = MasterRpc::new(channel.handle(), events_tx);
    let runner = MasterRunner::new(dir.path(), parallelism, SlaveTable::for_local_host(), rpc);
    let graph = graph(vec![
        EdgeSpec::new("gen", "true", &[], &["out/a"]),
        EdgeSpec::new("gen", "true", &[], &["out/b"]),
        EdgeSpec::new("gen", "true", &[], &["out/c"]),
    ]);
    RunnerFixture {
        runner,
        graph,
        _channel: channel,
        dir,
    }
}

#[tokio::test]
async fn test_local_capacity() {
    let mut fx = runner_fixture(1);
    assert!(fx.runner.local_can_run_more());

    let a = edge_for(&fx.graph, "out/a");
    let outcome = fx.runner.start_command(&fx.graph, a, true).unwrap();
    assert_eq!(outcome, StartOutcome::Local);
    assert!(!fx.runner.local_can_run_more());

    let finished = fx.runner.wait_for_local().await.unwrap();
    assert_eq!(finished.tag, a);
    assert!(fx.runner.local_can_run_more());
}

#[tokio::test]
async fn test_remote_capacity_follows_slave_processors() {
    let mut fx = runner_fixture(1);
    assert!(!fx.runner.remote_can_run_more());

    let info = system::local_system_info(Some(2));
    let admitted = fx.runner.slaves_mut().admit(1, LOCALHOST, &info);
    assert_eq!(admitted, Admission::Admitted);
    assert!(fx.runner.remote_can_run_more());

    let a = edge_for(&fx.graph, "out/a");
    let b = edge_for(&fx.graph, "out/b");
    let c = edge_for(&fx.graph, "out/c");
    assert_eq!(
        fx.runner.start_command(&fx.graph, a, false).unwrap(),
        StartOutcome::Remote { connection: 1 }
    );
    assert_eq!(
        fx.runner.start_command(&fx.graph, b, false).unwrap(),
        StartOutcome::Remote { connection: 1 }
    );
    assert!(!fx.runner.remote_can_run_more());
    assert_eq!(
        fx.runner.start_command(&fx.graph, c, false).unwrap(),
        StartOutcome::NoSlaveAvailable
    );
    assert_eq!(fx.runner.outstanding_count(), 2);

    // Remote placement still creates output directories here.
    assert!(fx.dir.path().join("out").is_dir());

    let hash_a = fx.graph.edge(a).hash;
    assert!(fx.runner.is_outstanding(hash_a));
    let entry = fx.runner.remote_done(hash_a).unwrap();
    assert_eq!(entry.edge, a);
    assert!(fx.runner.remote_done(hash_a).is_none());
    assert!(fx.runner.remote_can_run_more());
}

#[tokio::test]
async fn test_same_edge_cannot_be_outstanding_twice() {
    let mut fx = runner_fixture(1);
    fx.runner
        .slaves_mut()
        .admit(1, LOCALHOST, &system::local_system_info(Some(4)));

    let a = edge_for(&fx.graph, "out/a");
    fx.runner.start_command(&fx.graph, a, false).unwrap();
    assert!(matches!(
        fx.runner.start_command(&fx.graph, a, false),
        Err(DistbuildError::Internal(_))
    ));
}

#[tokio::test]
async fn test_disconnect_and_timeout_give_work_back() {
    let mut fx = runner_fixture(1);
    fx.runner
        .slaves_mut()
        .admit(1, LOCALHOST, &system::local_system_info(Some(2)));
    fx.runner
        .slaves_mut()
        .admit(2, LOCALHOST, &system::local_system_info(Some(2)));

    let a = edge_for(&fx.graph, "out/a");
    let b = edge_for(&fx.graph, "out/b");
    fx.runner.start_command(&fx.graph, a, false).unwrap();
    fx.runner.start_command(&fx.graph, b, false).unwrap();
    assert_eq!(fx.runner.outstanding_count(), 2);

    assert!(fx.runner.take_expired(Duration::from_secs(3600)).is_empty());

    let taken = fx.runner.take_outstanding_for(1);
    assert_eq!(taken.len(), 1);
    assert_eq!(fx.runner.outstanding_count(), 1);

    let expired = fx.runner.take_expired(Duration::ZERO);
    assert_eq!(expired.len(), 1);
    assert_eq!(fx.runner.outstanding_count(), 0);
}

#[tokio::test]
async fn test_borrow_oldest_outstanding() {
    let mut fx = runner_fixture(1);
    fx.runner
        .slaves_mut()
        .admit(1, LOCALHOST, &system::local_system_info(Some(4)));
    assert_eq!(fx.runner.borrow_oldest(), None);

    let a = edge_for(&fx.graph, "out/a");
    let b = edge_for(&fx.graph, "out/b");
    fx.runner.start_command(&fx.graph, a, false).unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    fx.runner.start_command(&fx.graph, b, false).unwrap();

    assert_eq!(fx.runner.borrow_oldest(), Some(a));
    assert_eq!(fx.runner.borrow_oldest(), Some(b));
    assert_eq!(fx.runner.borrow_oldest(), None);

    let entry = fx.runner.remote_done(fx.graph.edge(a).hash).unwrap();
    assert!(entry.borrowed);
}

#[tokio::test]
async fn test_superseded_remote_work_keeps_its_slot() {
    let mut fx = runner_fixture(1);
    fx.runner
        .slaves_mut()
        .admit(1, LOCALHOST, &system::local_system_info(Some(1)));

    let a = edge_for(&fx.graph, "out/a");
    let b = edge_for(&fx.graph, "out/b");
    let hash_a = fx.graph.edge(a).hash;
    fx.runner.start_command(&fx.graph, a, false).unwrap();
    assert_eq!(fx.runner.borrow_oldest(), Some(a));

    // The local run wins, but the slave is still busy with `a`.
    assert!(fx.runner.local_done(hash_a));
    assert_eq!(fx.runner.outstanding_count(), 0);
    assert!(!fx.runner.remote_can_run_more());
    assert_eq!(fx.runner.slaves().get(1).unwrap().dispatched, 1);
    assert_eq!(
        fx.runner.start_command(&fx.graph, b, false).unwrap(),
        StartOutcome::NoSlaveAvailable
    );

    // The late reply frees the slot without reporting the edge again.
    assert!(fx.runner.remote_done(hash_a).is_none());
    assert_eq!(fx.runner.slaves().get(1).unwrap().dispatched, 0);
    assert!(fx.runner.remote_can_run_more());

    // A disconnect also frees it.
    fx.runner.start_command(&fx.graph, b, false).unwrap();
    fx.runner.borrow_oldest();
    assert!(fx.runner.local_done(fx.graph.edge(b).hash));
    assert!(fx.runner.take_outstanding_for(1).is_empty());
    assert_eq!(fx.runner.slaves().get(1).unwrap().dispatched, 0);
    assert!(!fx.runner.local_done(fx.graph.edge(b).hash));
}
