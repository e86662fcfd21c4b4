pub mod config;
pub mod dashboard;
pub mod digest;
pub mod error;
pub mod master;
pub mod proto;
pub mod rpc;
pub mod scheduler;
pub mod shutdown;
pub mod slave;
pub mod system;
pub mod worker;

pub use error::{DistbuildError, Result};
