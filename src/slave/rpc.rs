use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::proto::{
    ExitStatus, QuitRequest, QuitResponse, RunCommandRequest, RunCommandResponse, StatusRequest,
    StatusResponse, SystemInfoRequest, SystemInfoResponse, METHOD_GET_STATUS, METHOD_QUIT,
    METHOD_RUN_COMMAND, METHOD_SYSTEM_INFO, SLAVE_SERVICE,
};
use crate::rpc::{CallContext, Connection, ConnectionId, ConnectionObserver, Reply, RpcHandle, ServiceRegistry};
use crate::scheduler::EdgeSpec;
use crate::system;

pub const NOT_ALLOWED_OUTPUT: &str = "This command is NOT ALLOWED to run.";

/// Posted to the slave's main loop from the RPC loop.
pub enum SlaveEvent {
    RunCommand {
        edge_id: u32,
        edge: EdgeSpec,
        reply: Reply<RunCommandResponse>,
    },
    Quit {
        reason: String,
    },
    MasterClosed,
}

/// Immutable state shared with the service handlers.
pub struct SlaveServiceContext {
    /// Known command edges by hash. Nothing else is ever executed.
    pub allow_list: HashMap<u32, EdgeSpec>,
    pub advertised_processors: Option<u32>,
    /// Remote commands accepted and not yet answered.
    pub running: Arc<AtomicUsize>,
    pub events: mpsc::UnboundedSender<SlaveEvent>,
}

/// Checks a RunCommand request against the allow-list. Returns the known
/// edge to run, which must match the request's command text.
pub fn validate_request<'a>(
    allow_list: &'a HashMap<u32, EdgeSpec>,
    request: &RunCommandRequest,
) -> Option<&'a EdgeSpec> {
    allow_list
        .get(&request.edge_id)
        .filter(|edge| edge.command == request.command)
}

pub fn not_allowed(edge_id: u32) -> RunCommandResponse {
    RunCommandResponse {
        edge_id,
        status: ExitStatus::Failure as i32,
        output: NOT_ALLOWED_OUTPUT.to_string(),
        output_digests: Vec::new(),
    }
}

/// Registers the slave service handlers.
pub fn register_slave_service(registry: &mut ServiceRegistry, ctx: Arc<SlaveServiceContext>) {
    let handler_ctx = ctx.clone();
    registry.register(
        SLAVE_SERVICE,
        METHOD_SYSTEM_INFO,
        move |_: CallContext, _: SystemInfoRequest, reply: Reply<SystemInfoResponse>| {
            reply.send(system::local_system_info(handler_ctx.advertised_processors));
        },
    );

    let handler_ctx = ctx.clone();
    registry.register(
        SLAVE_SERVICE,
        METHOD_RUN_COMMAND,
        move |call: CallContext, request: RunCommandRequest, reply: Reply<RunCommandResponse>| {
            let Some(edge) = validate_request(&handler_ctx.allow_list, &request) else {
                tracing::warn!(
                    connection = call.connection,
                    edge_id = request.edge_id,
                    command = %request.command,
                    "Rejected command not in the build graph"
                );
                reply.send(not_allowed(request.edge_id));
                return;
            };

            handler_ctx.running.fetch_add(1, Ordering::SeqCst);
            let event = SlaveEvent::RunCommand {
                edge_id: request.edge_id,
                edge: edge.clone(),
                reply,
            };
            if handler_ctx.events.send(event).is_err() {
                handler_ctx.running.fetch_sub(1, Ordering::SeqCst);
                tracing::warn!(edge_id = request.edge_id, "Slave is shutting down, dropping command");
            }
        },
    );

    let handler_ctx = ctx.clone();
    registry.register(
        SLAVE_SERVICE,
        METHOD_GET_STATUS,
        move |_: CallContext, _: StatusRequest, reply: Reply<StatusResponse>| {
            reply.send(system::local_status(
                handler_ctx.running.load(Ordering::SeqCst),
            ));
        },
    );

    let handler_ctx = ctx;
    registry.register(
        SLAVE_SERVICE,
        METHOD_QUIT,
        move |_: CallContext, request: QuitRequest, reply: Reply<QuitResponse>| {
            tracing::info!(reason = %request.reason, "Master asked us to quit");
            reply.send(QuitResponse {});
            let _ = handler_ctx.events.send(SlaveEvent::Quit {
                reason: request.reason,
            });
        },
    );
}

/// Tells the main loop when the master link drops.
pub struct MasterLinkObserver {
    events: mpsc::UnboundedSender<SlaveEvent>,
}

impl MasterLinkObserver {
    pub fn new(events: mpsc::UnboundedSender<SlaveEvent>) -> Self {
        Self { events }
    }
}

impl ConnectionObserver for MasterLinkObserver {
    fn on_connect(&mut self, connection: &Connection, _rpc: &RpcHandle) {
        tracing::info!(
            connection = connection.id(),
            master = %connection.peer_addr(),
            "Connected to master"
        );
    }

    fn on_close(&mut self, _connection: ConnectionId) {
        let _ = self.events.send(SlaveEvent::MasterClosed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow_list() -> HashMap<u32, EdgeSpec> {
        let edge = EdgeSpec::new("cc", "cc -c a.c -o a.o", &["a.c"], &["a.o"]);
        HashMap::from([(edge.hash(), edge)])
    }

    #[test]
    fn known_command_is_allowed() {
        let list = allow_list();
        let edge = EdgeSpec::new("cc", "cc -c a.c -o a.o", &["a.c"], &["a.o"]);
        let request = RunCommandRequest {
            command: edge.command.clone(),
            edge_id: edge.hash(),
            ..Default::default()
        };
        assert_eq!(validate_request(&list, &request), Some(&edge));
    }

    #[test]
    fn unknown_hash_is_rejected() {
        let request = RunCommandRequest {
            command: "cc -c a.c -o a.o".to_string(),
            edge_id: 42,
            ..Default::default()
        };
        assert!(validate_request(&allow_list(), &request).is_none());
    }

    #[test]
    fn altered_command_is_rejected() {
        let edge = EdgeSpec::new("cc", "cc -c a.c -o a.o", &["a.c"], &["a.o"]);
        let request = RunCommandRequest {
            command: "rm -rf /".to_string(),
            edge_id: edge.hash(),
            ..Default::default()
        };
        assert!(validate_request(&allow_list(), &request).is_none());
        assert_eq!(not_allowed(7).status(), ExitStatus::Failure);
    }
}
