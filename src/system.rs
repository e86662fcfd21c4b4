//! Host introspection for slave admission and status polling.

use sysinfo::System;

use crate::proto::{StatusResponse, SystemInfoResponse};

/// Default command parallelism for a host with `processors` logical CPUs.
pub fn parallelism_for(processors: usize) -> usize {
    match processors {
        0 | 1 => 2,
        2 => 3,
        n => n + 2,
    }
}

/// Parallelism derived from the local CPU count plus headroom.
pub fn guess_parallelism() -> usize {
    parallelism_for(processor_count())
}

pub fn processor_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// OS family name used for binary compatibility checks.
pub fn os_name() -> &'static str {
    std::env::consts::OS
}

pub fn os_arch() -> &'static str {
    std::env::consts::ARCH
}

/// Static description of this host, as reported to the master.
pub fn local_system_info(advertised_processors: Option<u32>) -> SystemInfoResponse {
    let mut system = System::new();
    system.refresh_memory();

    SystemInfoResponse {
        number_of_processors: advertised_processors.unwrap_or(processor_count() as u32),
        amount_of_physical_memory: system.total_memory(),
        amount_of_virtual_memory: system.total_memory() + system.total_swap(),
        operating_system_name: os_name().to_string(),
        operating_system_version: System::os_version().unwrap_or_default(),
        operating_system_architecture: os_arch().to_string(),
    }
}

/// Live load figures for a GetStatus reply.
pub fn local_status(running_commands: usize) -> StatusResponse {
    let mut system = System::new();
    system.refresh_memory();

    StatusResponse {
        load_average: System::load_average().one,
        amount_of_running_commands: running_commands as i32,
        amount_of_available_physical_memory: system.available_memory() as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallelism_headroom() {
        assert_eq!(parallelism_for(0), 2);
        assert_eq!(parallelism_for(1), 2);
        assert_eq!(parallelism_for(2), 3);
        assert_eq!(parallelism_for(8), 10);
    }

    #[test]
    fn system_info_reports_host() {
        let info = local_system_info(Some(4));
        assert_eq!(info.number_of_processors, 4);
        assert_eq!(info.operating_system_name, std::env::consts::OS);
        assert_eq!(info.operating_system_architecture, std::env::consts::ARCH);
    }
}
