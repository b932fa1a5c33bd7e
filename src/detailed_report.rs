use crate::error::Error;
use crate::message::Report;
use crate::task::RunStatus;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DetailedReportItem {
    pub generation: usize,
    pub worker: String,
    pub genome: serde_json::Value,
    pub instance: serde_json::Value,
    pub status: RunStatus,
    pub runtime: Duration,
}

impl DetailedReportItem {
    pub fn from_report<G: Serialize, I: Serialize>(
        report: &Report<G, I>,
    ) -> Result<Option<Self>, Error> {
        match report {
            Report::TaskFinished {
                generation,
                worker,
                genome,
                instance,
                result,
            } => Ok(Some(Self {
                generation: *generation,
                worker: worker.to_string(),
                genome: serde_json::to_value(genome)?,
                instance: serde_json::to_value(instance)?,
                status: result.status,
                runtime: result.runtime,
            })),
            _ => Ok(None),
        }
    }

    pub fn get_csv_header_row() -> &'static str {
        "generation;worker;genome;instance;status;runtimeSeconds\n"
    }

    pub fn to_csv_row(&self) -> String {
        format!(
            "{};{};{};{};{};{}\n",
            self.generation,
            self.worker,
            self.genome,
            self.instance,
            self.status,
            self.runtime.as_secs_f64(),
        )
    }
}
