//! Messages of the slave service.

/// Fully-qualified name of the service every slave registers.
pub const SLAVE_SERVICE: &str = "distbuild.SlaveService";

pub const METHOD_SYSTEM_INFO: &str = "SystemInfo";
pub const METHOD_RUN_COMMAND: &str = "RunCommand";
pub const METHOD_GET_STATUS: &str = "GetStatus";
pub const METHOD_QUIT: &str = "Quit";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ExitStatus {
    Success = 0,
    Failure = 1,
    Interrupted = 2,
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Success => write!(f, "success"),
            ExitStatus::Failure => write!(f, "failure"),
            ExitStatus::Interrupted => write!(f, "interrupted"),
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SystemInfoRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SystemInfoResponse {
    #[prost(uint32, tag = "1")]
    pub number_of_processors: u32,
    #[prost(uint64, tag = "2")]
    pub amount_of_physical_memory: u64,
    #[prost(uint64, tag = "3")]
    pub amount_of_virtual_memory: u64,
    #[prost(string, tag = "4")]
    pub operating_system_name: String,
    #[prost(string, tag = "5")]
    pub operating_system_version: String,
    #[prost(string, tag = "6")]
    pub operating_system_architecture: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RunCommandRequest {
    #[prost(string, tag = "1")]
    pub command: String,
    #[prost(uint32, tag = "2")]
    pub edge_id: u32,
    #[prost(string, optional, tag = "3")]
    pub rspfile_name: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub rspfile_content: Option<String>,
    #[prost(string, repeated, tag = "5")]
    pub output_paths: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RunCommandResponse {
    #[prost(uint32, tag = "1")]
    pub edge_id: u32,
    #[prost(enumeration = "ExitStatus", tag = "2")]
    pub status: i32,
    #[prost(string, tag = "3")]
    pub output: String,
    /// One content digest per requested output path, in order. Only set on
    /// success; an empty entry means the output was not produced.
    #[prost(string, repeated, tag = "4")]
    pub output_digests: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusResponse {
    #[prost(double, tag = "1")]
    pub load_average: f64,
    #[prost(int32, tag = "2")]
    pub amount_of_running_commands: i32,
    #[prost(int64, tag = "3")]
    pub amount_of_available_physical_memory: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QuitRequest {
    #[prost(string, tag = "1")]
    pub reason: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QuitResponse {}
