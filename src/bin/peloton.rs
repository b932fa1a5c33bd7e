use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::Verbosity;
use futures::channel::mpsc;
use log::info;
use parse_duration::parse::parse;
use peloton::config::{TunerConfig, TunerConfigBuilder};
use peloton::detailed_report::DetailedReportItem;
use peloton::error::Error;
use peloton::launch;
use peloton::message::Report;
use peloton::process::ProcessTarget;
use peloton::storage::ResultStorage;
use peloton::value::ParameterGenome;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about = "Evaluate a generation on a local cluster", long_about = None)]
struct Args {
    #[clap(flatten)]
    verbose: Option<Verbosity>,

    /// JSON array of parameter objects
    #[arg(short = 'g', long)]
    genomes_file: PathBuf,

    /// One problem instance per line
    #[arg(short = 'i', long)]
    instances_file: PathBuf,

    /// YAML tuner configuration
    #[arg(short = 'c', long)]
    config_file: Option<PathBuf>,

    #[arg(short = 'n', long, default_value_t = 1)]
    num_nodes: usize,

    #[arg(short = 'k', long)]
    kill_target_after: Option<String>,

    #[arg(short, long)]
    out_file: Option<PathBuf>,

    #[arg(short = 'd', long)]
    detailed_report_file: Option<PathBuf>,

    target_program: OsString,
    target_program_args: Vec<OsString>,
}

fn init_logger(args: &Args) {
    env_logger::Builder::new()
        .filter_level(
            args.verbose
                .as_ref()
                .map(|v| v.log_level_filter())
                .unwrap_or_else(|| log::LevelFilter::Error),
        )
        .format_module_path(false)
        .format_target(false)
        .init();
}

fn load_config(args: &Args) -> Result<TunerConfig> {
    let mut config = match &args.config_file {
        Some(config_file) => {
            let config_ctx =
                |op| format!("Unable to {} config_file: {}", op, config_file.display());

            info!("Reading config file: {}", config_file.display());
            let config_str = fs::read_to_string(config_file).with_context(|| config_ctx("read"))?;
            TunerConfig::from_yaml_str(&config_str).with_context(|| config_ctx("parse"))?
        }
        None => TunerConfigBuilder::new().build()?,
    };

    if let Some(kill_after) = &args.kill_target_after {
        config.cpu_timeout = parse(kill_after)
            .with_context(|| format!("Unable to parse duration from value \"{}\"", kill_after))?;
        config.validate()?;
    }

    Ok(config)
}

fn load_genomes(args: &Args) -> Result<Vec<ParameterGenome>> {
    let genomes_file_display = args.genomes_file.display();
    let genomes_ctx = |op| format!("Unable to {} genomes_file: {}", op, &genomes_file_display);

    info!("Reading genomes file: {}", genomes_file_display);
    let genomes_str =
        fs::read_to_string(&args.genomes_file).with_context(|| genomes_ctx("read"))?;
    let genomes =
        ParameterGenome::from_json_str(&genomes_str).with_context(|| genomes_ctx("parse"))?;
    Ok(genomes)
}

fn load_instances(args: &Args) -> Result<Vec<String>> {
    info!("Reading instances file: {}", args.instances_file.display());
    let instances_str = fs::read_to_string(&args.instances_file).with_context(|| {
        format!(
            "Unable to read instances_file: {}",
            args.instances_file.display()
        )
    })?;

    Ok(instances_str
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

fn create_detailed_report_file(path: &Path) -> Result<File, Error> {
    let mut file =
        File::create(path).map_err(|source| Error::UnableToCreateDetailedReportingFile {
            path: path.to_path_buf(),
            source,
        })?;
    file.write_all(DetailedReportItem::get_csv_header_row().as_bytes())?;
    Ok(file)
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logger(&args);
    let config = load_config(&args)?;
    let genomes = load_genomes(&args)?;
    let instances = load_instances(&args)?;

    let detailed_report = args
        .detailed_report_file
        .as_ref()
        .map(|path| create_detailed_report_file(path).map(|file| (file, mpsc::unbounded())))
        .transpose()?;
    let report_sender = detailed_report
        .as_ref()
        .map(|(_, (sender, _))| sender.clone());

    let target = ProcessTarget::new(args.target_program, args.target_program_args);

    let (outcome, storage) = launch::run_local_generation(
        config,
        target,
        args.num_nodes,
        genomes,
        instances,
        ResultStorage::new(),
        report_sender,
        true,
    )
    .context("Generation evaluation failed")?;

    info!("Evaluated {} distinct runs", storage.len());

    if let Some((mut file, (sender, mut receiver))) = detailed_report {
        drop(sender);
        while let Ok(Some(report)) = receiver.try_next() {
            let report: Report<ParameterGenome, String> = report;
            if let Some(item) = DetailedReportItem::from_report(&report)? {
                file.write_all(item.to_csv_row().as_bytes())?;
            }
        }
    }

    let ranking = serde_json::to_string_pretty(&outcome)?;

    if let Some(out_file) = args.out_file {
        info!("Writing ranking to output file: {}", out_file.display());
        fs::write(&out_file, ranking)
            .with_context(|| format!("Unable to write output file: {}", &out_file.display()))?;
    } else {
        println!("{}", ranking);
    }

    info!("Done");

    Ok(())
}
