use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::proto::{
    QuitRequest, QuitResponse, RunCommandRequest, RunCommandResponse, StatusRequest,
    StatusResponse, SystemInfoRequest, SystemInfoResponse, METHOD_GET_STATUS, METHOD_QUIT,
    METHOD_RUN_COMMAND, METHOD_SYSTEM_INFO, SLAVE_SERVICE,
};
use crate::rpc::{Connection, ConnectionId, ConnectionObserver, RpcHandle};
use crate::scheduler::EdgeId;

/// Posted to the build driver from the RPC loop and from fetch tasks.
#[derive(Debug)]
pub enum MasterEvent {
    SlaveConnected {
        connection: ConnectionId,
        peer: SocketAddr,
    },
    SlaveSystemInfo {
        connection: ConnectionId,
        info: SystemInfoResponse,
    },
    SlaveStatus {
        connection: ConnectionId,
        status: StatusResponse,
    },
    SlaveClosed {
        connection: ConnectionId,
    },
    RemoteCommandDone {
        connection: ConnectionId,
        response: RunCommandResponse,
    },
    QuitAcknowledged {
        connection: ConnectionId,
    },
    FetchDone {
        edge: EdgeId,
        hash: u32,
        result: Result<()>,
    },
}

/// Typed calls into the slave service. Every response is posted back to
/// the build driver as a [`MasterEvent`].
#[derive(Clone)]
pub struct MasterRpc {
    rpc: RpcHandle,
    events: mpsc::UnboundedSender<MasterEvent>,
}

impl MasterRpc {
    pub fn new(rpc: RpcHandle, events: mpsc::UnboundedSender<MasterEvent>) -> Self {
        Self { rpc, events }
    }

    pub fn request_system_info(&self, connection: ConnectionId) -> Result<()> {
        request_system_info(&self.rpc, &self.events, connection)
    }

    pub fn run_command(&self, connection: ConnectionId, request: &RunCommandRequest) -> Result<()> {
        let events = self.events.clone();
        self.rpc.call(
            connection,
            SLAVE_SERVICE,
            METHOD_RUN_COMMAND,
            request,
            move |connection, response: RunCommandResponse| {
                let _ = events.send(MasterEvent::RemoteCommandDone {
                    connection,
                    response,
                });
            },
        )
    }

    pub fn get_status(&self, connection: ConnectionId) -> Result<()> {
        let events = self.events.clone();
        self.rpc.call(
            connection,
            SLAVE_SERVICE,
            METHOD_GET_STATUS,
            &StatusRequest {},
            move |connection, status: StatusResponse| {
                let _ = events.send(MasterEvent::SlaveStatus { connection, status });
            },
        )
    }

    pub fn quit(&self, connection: ConnectionId, reason: &str) -> Result<()> {
        let events = self.events.clone();
        self.rpc.call(
            connection,
            SLAVE_SERVICE,
            METHOD_QUIT,
            &QuitRequest {
                reason: reason.to_string(),
            },
            move |connection, _: QuitResponse| {
                let _ = events.send(MasterEvent::QuitAcknowledged { connection });
            },
        )
    }

    pub fn close(&self, connection: ConnectionId) -> Result<()> {
        self.rpc.close(connection)
    }
}

fn request_system_info(
    rpc: &RpcHandle,
    events: &mpsc::UnboundedSender<MasterEvent>,
    connection: ConnectionId,
) -> Result<()> {
    let events = events.clone();
    rpc.call(
        connection,
        SLAVE_SERVICE,
        METHOD_SYSTEM_INFO,
        &SystemInfoRequest {},
        move |connection, info: SystemInfoResponse| {
            let _ = events.send(MasterEvent::SlaveSystemInfo { connection, info });
        },
    )
}

/// Reports slave connections to the build driver and asks each new slave
/// for its system info.
pub struct SlaveObserver {
    events: mpsc::UnboundedSender<MasterEvent>,
}

impl SlaveObserver {
    pub fn new(events: mpsc::UnboundedSender<MasterEvent>) -> Self {
        Self { events }
    }
}

impl ConnectionObserver for SlaveObserver {
    fn on_connect(&mut self, connection: &Connection, rpc: &RpcHandle) {
        let _ = self.events.send(MasterEvent::SlaveConnected {
            connection: connection.id(),
            peer: connection.peer_addr(),
        });
        if let Err(e) = request_system_info(rpc, &self.events, connection.id()) {
            tracing::warn!(connection = connection.id(), error = %e, "Failed to request system info");
        }
    }

    fn on_close(&mut self, connection: ConnectionId) {
        let _ = self.events.send(MasterEvent::SlaveClosed { connection });
    }
}
