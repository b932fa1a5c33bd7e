#[macro_use]
extern crate enum_display_derive;

pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod detailed_report;
pub mod error;
pub mod event;
pub mod genome_stats;
pub mod launch;
pub mod message;
pub mod process;
pub mod racing;
pub mod storage;
pub mod strategy;
pub mod target;
pub mod task;
pub mod value;
pub mod worker;
