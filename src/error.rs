use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Output;
use thiserror;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid YAML")]
    InvalidYaml(#[from] serde_yaml::Error),
    #[error("invalid JSON")]
    InvalidJson(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("run timeout must be strictly positive")]
    ZeroTimeout,
    #[error("number of racing winners must be strictly positive")]
    ZeroWinnerCount,
    #[error("penalization factor must lie within [1, 1e6], got {}", .0)]
    InvalidPenalizationFactor(f64),
    #[error("number of workers per node must be strictly positive")]
    ZeroWorkersPerNode,
    #[error("heartbeat timeout ({:?}) must be longer than heartbeat interval ({:?})", .timeout, .interval)]
    HeartbeatTimeoutTooShort {
        interval: std::time::Duration,
        timeout: std::time::Duration,
    },
    #[error("unable to launch target algorithm process: {}", .0)]
    UnableToLaunchTargetProcess(io::Error),
    #[error("unsuccessful termination of target algorithm process.{}",
            .0.output.status.code().map(|code| format!(" Status code: {}", code))
            .unwrap_or_else(|| "".to_string()))]
    TargetProcessFailed(ProcOutputWithArgs),
    #[error("invalid output from target algorithm process")]
    TargetProcessInvalidOutput(ProcOutputWithArgs),
    #[error("target algorithm fault: {}", .0)]
    TargetFault(String),
    #[error("task {} failed after {} attempts: {}", .task, .attempts, .cause)]
    TaskFailed {
        task: String,
        attempts: u32,
        cause: String,
    },
    #[error("worker {} faulted: {}", .worker, .cause)]
    WorkerFault { worker: String, cause: String },
    #[error("received non-finite score for genome {}", .genome)]
    NonFiniteScore { genome: String },
    #[error("generation has no genomes or no instances")]
    EmptyGeneration,
    #[error("agent task failed: {}", .0)]
    AgentFailed(String),
    #[error("coordinator stopped")]
    CoordinatorStopped,
    #[error("result storage is unavailable")]
    StorageUnavailable,
    #[error("Unable to create detailed reporting file at path: {}, cause: {}", .path.display(), .source)]
    UnableToCreateDetailedReportingFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to set signal handler")]
    FailedToSetSignalHandler(#[from] ctrlc::Error),
}

#[derive(Debug)]
pub struct ProcOutputWithArgs {
    pub genome_arg: OsString,
    pub instance_arg: OsString,
    pub output: Output,
}

impl ProcOutputWithArgs {
    pub fn new(genome_arg: OsString, instance_arg: OsString, output: Output) -> Self {
        Self {
            genome_arg,
            instance_arg,
            output,
        }
    }
}
