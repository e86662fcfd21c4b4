use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Instant;

use serde::Serialize;

use crate::proto::{StatusResponse, SystemInfoResponse};
use crate::rpc::ConnectionId;
use crate::system;

/// What the master knows about one admitted slave.
#[derive(Debug, Clone)]
pub struct SlaveInfo {
    pub connection: ConnectionId,
    pub ip: IpAddr,
    pub number_of_processors: u32,
    pub amount_of_physical_memory: u64,
    pub amount_of_virtual_memory: u64,
    pub operating_system_name: String,
    pub operating_system_version: String,
    pub operating_system_architecture: String,
    pub load_average: f64,
    /// Running commands as last reported by the slave.
    pub amount_of_running_commands: i32,
    pub amount_of_available_physical_memory: i64,
    /// Commands this master has dispatched to the slave and not yet seen
    /// complete.
    pub dispatched: usize,
    pub admitted_at: Instant,
    pub last_status: Option<Instant>,
}

impl SlaveInfo {
    pub fn spare_capacity(&self) -> i64 {
        self.number_of_processors as i64 - self.dispatched as i64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SlaveSummary {
    pub connection: ConnectionId,
    pub ip: String,
    pub processors: u32,
    pub dispatched: usize,
    pub load_average: f64,
    pub running_commands: i32,
    pub available_physical_memory: i64,
    pub operating_system: String,
}

/// Admitted slaves and their capacity.
#[derive(Debug)]
pub struct SlaveTable {
    slaves: BTreeMap<ConnectionId, SlaveInfo>,
    os_name: String,
    os_arch: String,
}

impl SlaveTable {
    pub fn new(os_name: impl Into<String>, os_arch: impl Into<String>) -> Self {
        Self {
            slaves: BTreeMap::new(),
            os_name: os_name.into(),
            os_arch: os_arch.into(),
        }
    }

    /// Table that admits slaves matching this host.
    pub fn for_local_host() -> Self {
        Self::new(system::os_name(), system::os_arch())
    }

    /// Admits a slave whose OS and architecture match the master's.
    /// Artifacts built elsewhere would not be usable here.
    pub fn admit(
        &mut self,
        connection: ConnectionId,
        ip: IpAddr,
        info: &SystemInfoResponse,
    ) -> Admission {
        if info.operating_system_name != self.os_name
            || info.operating_system_architecture != self.os_arch
        {
            let reason = format!(
                "Different system name or architecture, system info of master: \"{}, {}\".",
                self.os_name, self.os_arch
            );
            tracing::warn!(
                connection,
                slave_os = %info.operating_system_name,
                slave_arch = %info.operating_system_architecture,
                "Slave rejected"
            );
            return Admission::Rejected { reason };
        }

        tracing::info!(
            connection,
            ip = %ip,
            processors = info.number_of_processors,
            os = %info.operating_system_name,
            version = %info.operating_system_version,
            "Slave admitted"
        );
        self.slaves.insert(
            connection,
            SlaveInfo {
                connection,
                ip,
                number_of_processors: info.number_of_processors,
                amount_of_physical_memory: info.amount_of_physical_memory,
                amount_of_virtual_memory: info.amount_of_virtual_memory,
                operating_system_name: info.operating_system_name.clone(),
                operating_system_version: info.operating_system_version.clone(),
                operating_system_architecture: info.operating_system_architecture.clone(),
                load_average: 0.0,
                amount_of_running_commands: 0,
                amount_of_available_physical_memory: 0,
                dispatched: 0,
                admitted_at: Instant::now(),
                last_status: None,
            },
        );
        Admission::Admitted
    }

    pub fn remove(&mut self, connection: ConnectionId) -> Option<SlaveInfo> {
        self.slaves.remove(&connection)
    }

    pub fn update_status(&mut self, connection: ConnectionId, status: &StatusResponse) {
        if let Some(slave) = self.slaves.get_mut(&connection) {
            slave.load_average = status.load_average;
            slave.amount_of_running_commands = status.amount_of_running_commands;
            slave.amount_of_available_physical_memory =
                status.amount_of_available_physical_memory;
            slave.last_status = Some(Instant::now());
        }
    }

    /// Sum of processor counts over admitted slaves.
    pub fn total_processors(&self) -> usize {
        self.slaves
            .values()
            .map(|s| s.number_of_processors as usize)
            .sum()
    }

    /// The slave with the most spare capacity, first found on ties.
    /// `None` when no slave has a free processor.
    pub fn select_slave(&self) -> Option<ConnectionId> {
        let mut best: Option<&SlaveInfo> = None;
        for slave in self.slaves.values() {
            if best.map_or(true, |b| slave.spare_capacity() > b.spare_capacity()) {
                best = Some(slave);
            }
        }
        best.filter(|s| s.spare_capacity() > 0)
            .map(|s| s.connection)
    }

    pub fn record_dispatch(&mut self, connection: ConnectionId) {
        if let Some(slave) = self.slaves.get_mut(&connection) {
            slave.dispatched += 1;
        }
    }

    pub fn record_completion(&mut self, connection: ConnectionId) {
        if let Some(slave) = self.slaves.get_mut(&connection) {
            slave.dispatched = slave.dispatched.saturating_sub(1);
        }
    }

    pub fn get(&self, connection: ConnectionId) -> Option<&SlaveInfo> {
        self.slaves.get(&connection)
    }

    pub fn contains(&self, connection: ConnectionId) -> bool {
        self.slaves.contains_key(&connection)
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        self.slaves.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.slaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slaves.is_empty()
    }

    pub fn summaries(&self) -> Vec<SlaveSummary> {
        self.slaves
            .values()
            .map(|s| SlaveSummary {
                connection: s.connection,
                ip: s.ip.to_string(),
                processors: s.number_of_processors,
                dispatched: s.dispatched,
                load_average: s.load_average,
                running_commands: s.amount_of_running_commands,
                available_physical_memory: s.amount_of_available_physical_memory,
                operating_system: format!(
                    "{} {} {}",
                    s.operating_system_name,
                    s.operating_system_version,
                    s.operating_system_architecture
                ),
            })
            .collect()
    }
}
