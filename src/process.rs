use crate::error::{Error, ProcOutputWithArgs};
use crate::target::TargetAlgorithm;
use crate::task::Key;
use async_process::{Child, Command};
use async_trait::async_trait;
use log::trace;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::process::Stdio;
use std::time::Duration;

/// Runs the target algorithm as a child process:
/// `program [args...] <genome> <instance>`.
pub struct ProcessTarget {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl ProcessTarget {
    pub fn new(program: OsString, args: Vec<OsString>) -> Self {
        Self { program, args }
    }
}

#[allow(non_snake_case)]
#[derive(Debug, Deserialize)]
struct TargetChildResult {
    runtimeSeconds: Option<f64>,
}

fn to_arg<T: Serialize>(value: &T) -> Result<OsString, Error> {
    Ok(match serde_json::to_value(value)? {
        serde_json::Value::String(string) => string.into(),
        other => other.to_string().into(),
    })
}

fn parse_reported_runtime(stdout: &[u8]) -> Option<Option<Duration>> {
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Some(None);
    }

    let result: TargetChildResult = serde_json::from_slice(stdout).ok()?;
    match result.runtimeSeconds {
        None => Some(None),
        Some(secs) => Duration::try_from_secs_f64(secs).ok().map(Some),
    }
}

async fn get_child_result(
    child: Child,
    genome_arg: OsString,
    instance_arg: OsString,
) -> Result<Option<Duration>, Error> {
    let output = child.output().await?;
    if !output.status.success() {
        trace!(
            "Child terminated unsuccessfully, status: {:?}",
            output.status
        );
        return Err(Error::TargetProcessFailed(ProcOutputWithArgs::new(
            genome_arg,
            instance_arg,
            output,
        )));
    }

    match parse_reported_runtime(&output.stdout) {
        Some(runtime) => Ok(runtime),
        None => Err(Error::TargetProcessInvalidOutput(ProcOutputWithArgs::new(
            genome_arg,
            instance_arg,
            output,
        ))),
    }
}

#[async_trait]
impl<G, I> TargetAlgorithm<G, I> for ProcessTarget
where
    G: Key + Serialize,
    I: Key + Serialize,
{
    async fn run(&self, genome: &G, instance: &I) -> Result<Option<Duration>, Error> {
        let genome_arg = to_arg(genome)?;
        let instance_arg = to_arg(instance)?;

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(&genome_arg)
            .arg(&instance_arg)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(Error::UnableToLaunchTargetProcess)?;

        trace!("Spawned target algorithm process, pid: {:?}", child.id());

        get_child_result(child, genome_arg, instance_arg).await
    }
}
