use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use prost::Message;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use distbuild::config::{RpcConfig, SlaveConfig};
use distbuild::digest::content_digest;
use distbuild::master::fetch;
use distbuild::proto::{
    ExitStatus, QuitRequest, QuitResponse, RunCommandRequest, RunCommandResponse, StatusRequest,
    StatusResponse, SystemInfoRequest, SystemInfoResponse, METHOD_GET_STATUS, METHOD_QUIT,
    METHOD_RUN_COMMAND, METHOD_SYSTEM_INFO, SLAVE_SERVICE,
};
use distbuild::rpc::{Connection, ConnectionId, ConnectionObserver, RpcChannel, RpcHandle, ServiceRegistry};
use distbuild::scheduler::EdgeSpec;
use distbuild::slave::{file_server, Slave, NOT_ALLOWED_OUTPUT, OUTPUT_TRUNCATED};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const TIMEOUT: Duration = Duration::from_secs(10);

struct Accepted(mpsc::UnboundedSender<ConnectionId>);

impl ConnectionObserver for Accepted {
    fn on_connect(&mut self, connection: &Connection, _rpc: &RpcHandle) {
        let _ = self.0.send(connection.id());
    }

    fn on_close(&mut self, _connection: ConnectionId) {}
}

/// Stands in for the master: accepts one slave and calls into it.
struct FakeMaster {
    rpc: RpcHandle,
    connection: ConnectionId,
    shutdown: CancellationToken,
}

impl FakeMaster {
    async fn call<Req, Resp>(&self, method: &str, request: &Req) -> Resp
    where
        Req: Message,
        Resp: Message + Default + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.rpc
            .call(self.connection, SLAVE_SERVICE, method, request, move |_, resp: Resp| {
                let _ = tx.send(resp);
            })
            .unwrap();
        tokio::time::timeout(TIMEOUT, rx.recv())
            .await
            .expect("no response")
            .expect("call abandoned")
    }
}

fn compile_edge() -> EdgeSpec {
    EdgeSpec::new("gen", "mkdir -p out && echo built > out/a.txt", &[], &["out/a.txt"])
}

/// Prints about 2 MB, more than fits in one frame.
fn noisy_edge() -> EdgeSpec {
    EdgeSpec::new(
        "noisy",
        "head -c 2000000 /dev/zero | tr '\\000' a; exit 1",
        &[],
        &["noisy.txt"],
    )
}

fn write_manifest(dir: &Path) {
    let manifest = json!({ "edges": [compile_edge(), noisy_edge()] });
    std::fs::write(dir.join("build.json"), manifest.to_string()).unwrap();
}

async fn start(dir: &Path) -> (FakeMaster, Slave) {
    write_manifest(dir);

    let (accepted_tx, mut accepted) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let mut channel = RpcChannel::new(RpcConfig::default(), ServiceRegistry::new(), shutdown.clone());
    channel.add_observer(Box::new(Accepted(accepted_tx)));
    let master_addr: SocketAddr = channel.listen(SocketAddr::new(LOCALHOST, 0), 8).unwrap();
    let rpc = channel.handle();
    tokio::spawn(channel.run());

    let mut config = SlaveConfig::new(master_addr, dir);
    config.advertised_processors = Some(6);
    config.parallelism = 2;
    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let slave = Slave::start_with_listener(config, listener, CancellationToken::new())
        .await
        .unwrap();

    let connection = tokio::time::timeout(TIMEOUT, accepted.recv())
        .await
        .unwrap()
        .unwrap();
    (
        FakeMaster {
            rpc,
            connection,
            shutdown,
        },
        slave,
    )
}

#[tokio::test]
async fn test_system_info_advertises_processors() {
    let dir = tempfile::tempdir().unwrap();
    let (master, slave) = start(dir.path()).await;
    let run = tokio::spawn(slave.run());

    let info: SystemInfoResponse = master.call(METHOD_SYSTEM_INFO, &SystemInfoRequest {}).await;
    assert_eq!(info.number_of_processors, 6);
    assert_eq!(info.operating_system_name, std::env::consts::OS);
    assert_eq!(info.operating_system_architecture, std::env::consts::ARCH);

    let _: QuitResponse = master
        .call(METHOD_QUIT, &QuitRequest { reason: "done".to_string() })
        .await;
    tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap();
    master.shutdown.cancel();
}

#[tokio::test]
async fn test_unknown_command_is_not_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let (master, slave) = start(dir.path()).await;
    let run = tokio::spawn(slave.run());

    let request = RunCommandRequest {
        command: "touch pwned".to_string(),
        edge_id: 0xdead_beef,
        ..Default::default()
    };
    let response: RunCommandResponse = master.call(METHOD_RUN_COMMAND, &request).await;

    assert_eq!(response.edge_id, 0xdead_beef);
    assert_eq!(response.status(), ExitStatus::Failure);
    assert_eq!(response.output, NOT_ALLOWED_OUTPUT);
    assert!(!dir.path().join("pwned").exists());

    // Known hash, different command text.
    let request = RunCommandRequest {
        command: "touch pwned".to_string(),
        edge_id: compile_edge().hash(),
        ..Default::default()
    };
    let response: RunCommandResponse = master.call(METHOD_RUN_COMMAND, &request).await;
    assert_eq!(response.output, NOT_ALLOWED_OUTPUT);
    assert!(!dir.path().join("pwned").exists());

    let _: QuitResponse = master
        .call(METHOD_QUIT, &QuitRequest { reason: "done".to_string() })
        .await;
    tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap();
    master.shutdown.cancel();
}

#[tokio::test]
async fn test_allowed_command_runs_and_reports_digests() {
    let dir = tempfile::tempdir().unwrap();
    let (master, slave) = start(dir.path()).await;
    let file_server = slave.file_server_addr();
    let run = tokio::spawn(slave.run());

    let edge = compile_edge();
    let request = RunCommandRequest {
        command: edge.command.clone(),
        edge_id: edge.hash(),
        output_paths: edge.outputs.clone(),
        ..Default::default()
    };
    let response: RunCommandResponse = master.call(METHOD_RUN_COMMAND, &request).await;

    assert_eq!(response.status(), ExitStatus::Success);
    assert_eq!(response.output_digests, vec![content_digest(b"built\n")]);

    // The output is served over HTTP for the master to fetch.
    let body = reqwest::get(format!("http://{}/out/a.txt", file_server))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(&body[..], b"built\n");

    let status: StatusResponse = master.call(METHOD_GET_STATUS, &StatusRequest {}).await;
    assert_eq!(status.amount_of_running_commands, 0);

    let _: QuitResponse = master
        .call(METHOD_QUIT, &QuitRequest { reason: "done".to_string() })
        .await;
    tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap();
    master.shutdown.cancel();
}

#[tokio::test]
async fn test_large_output_is_truncated_and_link_survives() {
    let dir = tempfile::tempdir().unwrap();
    let (master, slave) = start(dir.path()).await;
    let run = tokio::spawn(slave.run());

    let edge = noisy_edge();
    let request = RunCommandRequest {
        command: edge.command.clone(),
        edge_id: edge.hash(),
        output_paths: edge.outputs.clone(),
        ..Default::default()
    };
    let response: RunCommandResponse = master.call(METHOD_RUN_COMMAND, &request).await;

    assert_eq!(response.status(), ExitStatus::Failure);
    assert!(response.output.ends_with(OUTPUT_TRUNCATED));
    assert!(response.output.starts_with("aaaa"));
    assert!(response.output.len() < RpcConfig::default().max_buffer_size);

    // Still connected and serving.
    let status: StatusResponse = master.call(METHOD_GET_STATUS, &StatusRequest {}).await;
    assert_eq!(status.amount_of_running_commands, 0);
    assert!(!run.is_finished());

    let _: QuitResponse = master
        .call(METHOD_QUIT, &QuitRequest { reason: "done".to_string() })
        .await;
    tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap();
    master.shutdown.cancel();
}

#[tokio::test]
async fn test_fetch_escapes_reserved_characters() {
    let served = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(served.path().join("gen dir")).unwrap();
    std::fs::write(served.path().join("a#1.txt"), b"hash\n").unwrap();
    std::fs::write(served.path().join("gen dir/b?%.txt"), b"query\n").unwrap();

    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(file_server::serve(
        listener,
        file_server::router(served.path()),
        shutdown.clone(),
    ));

    let client = fetch::client().unwrap();
    fetch::fetch_artifact(&client, addr, dest.path(), "a#1.txt", &content_digest(b"hash\n"))
        .await
        .unwrap();
    fetch::fetch_artifact(
        &client,
        addr,
        dest.path(),
        "gen dir/b?%.txt",
        &content_digest(b"query\n"),
    )
    .await
    .unwrap();

    assert_eq!(std::fs::read(dest.path().join("a#1.txt")).unwrap(), b"hash\n");
    assert_eq!(
        std::fs::read(dest.path().join("gen dir/b?%.txt")).unwrap(),
        b"query\n"
    );
    shutdown.cancel();
}

#[tokio::test]
async fn test_slave_stops_when_master_goes_away() {
    let dir = tempfile::tempdir().unwrap();
    let (master, slave) = start(dir.path()).await;
    let run = tokio::spawn(slave.run());

    master.rpc.close(master.connection).unwrap();

    tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap();
    master.shutdown.cancel();
}
