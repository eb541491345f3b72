//! SCAMP CLI - matrix profile computation
//!
//! Local computation, coordinator, worker and job submission front ends.

use clap::Parser;
use humansize::{format_size, BINARY};
use scamp::config::{
    ClientConfig, Commands, CoordinatorConfig, CliArgs, EngineConfig, JobArgs, LogFormat, OutputArgs,
    OutputFormat, WorkerConfig, default_worker_id,
};
use scamp::core::{primary_output, JobSpec, ScampEngine};
use scamp::distributed::{CoordinatorServer, JobClient, JobService, RemoteJobService, Worker};
use scamp::error::{Result, ScampError};
use scamp::profile::ProfileOutput;
use scamp::progress::ProgressReporter;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    // Parse CLI arguments
    let args = CliArgs::parse();

    init_logging(args.verbose, args.log_format);

    // Handle result
    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// `RUST_LOG` wins; otherwise the level follows `-v`
fn init_logging(verbose: u8, format: LogFormat) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init(),
    }
}

fn run(args: CliArgs) -> Result<()> {
    match args.command {
        Commands::Compute { job, output } => cmd_compute(&job, &output),
        Commands::Server {
            bind,
            port,
            range_size,
            liveness_timeout,
            max_attempts,
            retention,
        } => cmd_server(CoordinatorConfig {
            bind,
            port,
            range_size,
            liveness_timeout,
            max_range_attempts: max_attempts,
            retention,
        }),
        Commands::Worker {
            coordinator,
            worker_id,
            threads,
            idle_backoff,
        } => cmd_worker(
            &coordinator,
            WorkerConfig {
                worker_id: worker_id.unwrap_or_else(default_worker_id),
                idle_backoff,
                engine: EngineConfig {
                    threads,
                    ..Default::default()
                },
            },
        ),
        Commands::Submit {
            coordinator,
            poll_interval,
            job,
            output,
        } => cmd_submit(&coordinator, poll_interval, &job, &output),
        Commands::Jobs { coordinator } => cmd_jobs(&coordinator),
    }
}

/// Parse a series file: numbers separated by whitespace or commas
fn read_series(path: &Path) -> Result<Vec<f64>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ScampError::from(e).with_context(format!("reading {}", path.display())))?;

    let mut values = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        for token in line.split(|c: char| c.is_whitespace() || c == ',').filter(|t| !t.is_empty()) {
            let value = token.parse::<f64>().map_err(|_| {
                ScampError::validation(format!(
                    "{}:{}: '{}' is not a number",
                    path.display(),
                    line_no + 1,
                    token
                ))
            })?;
            values.push(value);
        }
    }
    Ok(values)
}

fn build_spec(job: &JobArgs) -> Result<JobSpec> {
    let a = read_series(&job.series_a)?;
    let spec = match &job.series_b {
        Some(path) => JobSpec::ab_join(a, read_series(path)?, job.window),
        None => JobSpec::self_join(a, job.window),
    };
    let spec = job.options().apply_to(spec, job.kind);

    let input_bytes = (spec.series_a.len() + spec.series_b.as_ref().map_or(0, Vec::len)) * std::mem::size_of::<f64>();
    info!(
        "Job: {} ({} of input)",
        spec.describe(),
        format_size(input_bytes as u64, BINARY)
    );
    Ok(spec)
}

fn write_output(output: &ProfileOutput, args: &OutputArgs) -> Result<()> {
    let sink: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(
            File::create(path)
                .map_err(|e| ScampError::from(e).with_context(format!("creating {}", path.display())))?,
        ),
        None => Box::new(io::stdout().lock()),
    };
    let mut out = BufWriter::new(sink);

    match args.output_format {
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut out, output)?;
            writeln!(out)?;
        }
        OutputFormat::Text => match output {
            ProfileOutput::NearestNeighbor { values, indices } => {
                for (value, index) in values.iter().zip(indices) {
                    writeln!(out, "{} {}", value, index)?;
                }
            }
            ProfileOutput::KNearest { matches } => {
                for m in matches {
                    writeln!(out, "{} {} {}", m.source_index, m.match_index, m.value)?;
                }
            }
            ProfileOutput::ThresholdedSum { values } => {
                for value in values {
                    writeln!(out, "{}", value)?;
                }
            }
            ProfileOutput::PooledSummary(matrix) => {
                for row in matrix.rows() {
                    let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
                    writeln!(out, "{}", line.join(" "))?;
                }
            }
        },
    }

    out.flush()?;
    Ok(())
}

fn cmd_compute(job: &JobArgs, output: &OutputArgs) -> Result<()> {
    let spec = build_spec(job)?;
    let options = job.options();

    let progress = if job.progress {
        ProgressReporter::new()
    } else {
        ProgressReporter::disabled()
    };
    let engine = ScampEngine::new(EngineConfig::from_options(&options)).with_progress(progress);

    let start = Instant::now();
    let result = engine.compute(&spec)?;
    info!("Computed in {}", humantime::format_duration(start.elapsed()));
    if let Some(progress) = engine.progress().filter(|p| p.is_enabled()) {
        progress.summary().print();
    }

    write_output(&primary_output(&result, options.pearson)?, output)
}

fn cmd_server(config: CoordinatorConfig) -> Result<()> {
    info!(
        "Coordinator: range size {}, liveness timeout {}, {} attempts per range",
        config.range_size,
        humantime::format_duration(config.liveness_timeout),
        config.max_range_attempts
    );
    CoordinatorServer::new(config).run()
}

fn cmd_worker(coordinator: &str, config: WorkerConfig) -> Result<()> {
    let source = RemoteJobService::new(coordinator, &ClientConfig::default()).as_worker();
    let worker = Worker::new(source, config);
    info!("Worker {} serving coordinator {}", worker.id(), coordinator);

    let stop = AtomicBool::new(false);
    let stats = worker.run_until(&stop)?;
    println!(
        "Worker finished: {} ranges, {} failures, {} ignored",
        stats.ranges, stats.failures, stats.ignored
    );
    Ok(())
}

fn cmd_submit(coordinator: &str, poll_interval: std::time::Duration, job: &JobArgs, output: &OutputArgs) -> Result<()> {
    let spec = build_spec(job)?;
    let config = ClientConfig {
        poll_interval,
        ..Default::default()
    };
    let client = JobClient::new(RemoteJobService::new(coordinator, &config), config);

    let start = Instant::now();
    let result = client.run(&spec)?;
    info!("Job complete in {}", humantime::format_duration(start.elapsed()));

    write_output(&primary_output(&result, job.pearson)?, output)
}

fn cmd_jobs(coordinator: &str) -> Result<()> {
    let service = RemoteJobService::new(coordinator, &ClientConfig::default());
    let jobs = service.list_jobs()?;

    if jobs.is_empty() {
        println!("No jobs");
        return Ok(());
    }

    println!("{:>6}  {:<28}  {:<20}  DESCRIPTION", "ID", "STATUS", "SUBMITTED");
    for job in jobs {
        println!(
            "{:>6}  {:<28}  {:<20}  {}",
            job.id,
            job.status.to_string(),
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
            job.description
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn series_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_read_series_mixed_separators() {
        let file = series_file("1.5 2\n3,4.25\n\n-1e2\t0\n");
        let series = read_series(file.path()).unwrap();
        assert_eq!(series, vec![1.5, 2.0, 3.0, 4.25, -100.0, 0.0]);
    }

    #[test]
    fn test_read_series_reports_line() {
        let file = series_file("1 2 3\n4 five 6\n");
        let err = read_series(file.path()).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains(":2:"));
        assert!(err.to_string().contains("five"));
    }

    #[test]
    fn test_read_series_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_series(&dir.path().join("absent.txt")).unwrap_err();
        assert!(err.to_string().contains("absent.txt"));
    }
}
