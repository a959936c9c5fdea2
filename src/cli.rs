// src/cli.rs
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::backend::{GdalBackend, PixelType, Window};
use crate::config::PoolConfig;
use crate::context::WarpContext;
use crate::key::DatasetSelector;
use crate::ops::ReadRequest;
use crate::retry::Attempts;

#[derive(Parser)]
#[command(name = "warp-pool")]
#[command(about = "Concurrent, retrying access to GDAL rasters through a shared handle pool")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Pool configuration file (JSON)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print a JSON summary of each raster
    Info {
        /// Rasters to open
        #[arg(required = true)]
        uris: Vec<String>,

        /// Warp option for the processed view, repeatable (e.g. --opt=-ts --opt=256 --opt=256)
        #[arg(long = "opt", allow_hyphen_values = true)]
        opts: Vec<String>,

        /// Describe the processed view instead of the source
        #[arg(long)]
        processed: bool,

        /// Pool capacity
        #[arg(long)]
        capacity: Option<usize>,
    },

    /// Hammer one raster with window reads from many threads
    Bench {
        uri: String,

        /// Warp option for the processed view, repeatable
        #[arg(long = "opt", allow_hyphen_values = true)]
        opts: Vec<String>,

        /// Read from the processed view
        #[arg(long)]
        processed: bool,

        /// Worker threads (default: number of CPUs)
        #[arg(long)]
        threads: Option<usize>,

        /// Total window reads
        #[arg(long, default_value = "1000")]
        reads: usize,

        /// Pool capacity
        #[arg(long, default_value = "1")]
        capacity: usize,

        /// Window edge in pixels
        #[arg(long, default_value = "256")]
        window: usize,

        /// Attempts per read, 0 for unbounded (default: from the configuration)
        #[arg(long)]
        attempts: Option<i32>,

        /// Pool entries kept for the raster so reads can run in parallel
        #[arg(long)]
        copies: Option<usize>,
    },
}

fn selector(processed: bool) -> DatasetSelector {
    if processed {
        DatasetSelector::Processed
    } else {
        DatasetSelector::Source
    }
}

fn load_config(path: Option<&PathBuf>, capacity: Option<usize>) -> Result<PoolConfig> {
    let config = match path {
        Some(path) => PoolConfig::from_json_file(path)?,
        None => PoolConfig::default(),
    };
    let mut config = config.with_env_overrides()?;
    if let Some(capacity) = capacity {
        config.capacity = capacity;
    }
    Ok(config)
}

fn gdal_context(config: PoolConfig) -> Result<Arc<WarpContext>> {
    let backend = GdalBackend::new().context("failed to set up GDAL")?;
    Ok(Arc::new(WarpContext::new(config, Arc::new(backend))?))
}

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Info {
            uris,
            opts,
            processed,
            capacity,
        } => {
            let ctx = gdal_context(load_config(cli.config.as_ref(), capacity)?)?;
            let summaries = info(&ctx, &uris, &opts, selector(processed));
            ctx.shutdown();
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
        Commands::Bench {
            uri,
            opts,
            processed,
            threads,
            reads,
            capacity,
            window,
            attempts,
            copies,
        } => {
            let mut config = load_config(cli.config.as_ref(), Some(capacity))?;
            if let Some(copies) = copies {
                config.copies = copies;
            }
            let ctx = gdal_context(config)?;
            let threads = threads.unwrap_or_else(num_cpus::get).max(1);
            let attempts = attempts.map_or_else(|| ctx.default_attempts(), Attempts::from_raw);
            let report = bench(
                &ctx,
                &uri,
                &opts,
                BenchParams {
                    sel: selector(processed),
                    threads,
                    reads,
                    window,
                    attempts,
                },
            )?;
            ctx.shutdown();
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

#[derive(Serialize, Debug)]
pub struct RasterSummary {
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<(usize, usize)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bands: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_transform: Option<[f64; 6]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proj4: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub metadata_domains: Vec<String>,
}

/// Summaries for `uris`, gathered in parallel through one shared context.
pub fn info(
    ctx: &WarpContext,
    uris: &[String],
    opts: &[String],
    sel: DatasetSelector,
) -> Vec<RasterSummary> {
    uris.par_iter()
        .map(|uri| match summarize(ctx, uri, opts, sel) {
            Ok(summary) => summary,
            Err(e) => {
                warn!(%uri, error = %e, "could not describe raster");
                RasterSummary {
                    uri: uri.clone(),
                    error: Some(e.to_string()),
                    size: None,
                    bands: None,
                    geo_transform: None,
                    proj4: None,
                    metadata_domains: Vec::new(),
                }
            }
        })
        .collect()
}

fn summarize(
    ctx: &WarpContext,
    uri: &str,
    opts: &[String],
    sel: DatasetSelector,
) -> Result<RasterSummary> {
    let token = ctx.get_token(uri, opts.iter().cloned())?;
    let attempts = ctx.default_attempts();
    let summary = (|| -> Result<RasterSummary> {
        Ok(RasterSummary {
            uri: uri.to_string(),
            error: None,
            size: Some(ctx.raster_size(token, sel, attempts)?.value),
            bands: Some(ctx.band_count(token, sel, attempts)?.value),
            geo_transform: ctx.geo_transform(token, sel, attempts).ok().map(|a| a.value),
            proj4: ctx
                .crs_proj4(token, sel, attempts)
                .ok()
                .map(|a| a.value)
                .filter(|s| !s.is_empty()),
            metadata_domains: ctx.metadata_domains(token, sel, 0, attempts)?.value,
        })
    })();
    ctx.surrender_token(token)?;
    summary
}

pub struct BenchParams {
    pub sel: DatasetSelector,
    pub threads: usize,
    pub reads: usize,
    pub window: usize,
    pub attempts: Attempts,
}

#[derive(Serialize, Debug, Default)]
pub struct BenchReport {
    pub threads: usize,
    pub reads: usize,
    pub failures: usize,
    pub total_attempts: u64,
    pub max_attempts: u32,
    pub elapsed_secs: f64,
    pub reads_per_sec: f64,
}

#[derive(Default)]
struct WorkerStats {
    reads: usize,
    failures: usize,
    total_attempts: u64,
    max_attempts: u32,
}

/// Spread `reads` window reads across worker threads sharing one token.
pub fn bench(ctx: &Arc<WarpContext>, uri: &str, opts: &[String], params: BenchParams) -> Result<BenchReport> {
    let token = ctx.get_token(uri, opts.iter().cloned())?;
    let (width, height) = match ctx.raster_size(token, params.sel, params.attempts) {
        Ok(done) => done.value,
        Err(e) => {
            ctx.surrender_token(token)?;
            return Err(e).with_context(|| format!("cannot size {uri}"));
        }
    };
    let edge_x = params.window.min(width);
    let edge_y = params.window.min(height);
    if edge_x == 0 || edge_y == 0 {
        ctx.surrender_token(token)?;
        bail!("{uri} has no pixels");
    }
    let (cols, rows) = (width / edge_x, height / edge_y);

    let (req_tx, req_rx) = flume::bounded::<ReadRequest>(params.threads * 4);
    let started = Instant::now();

    let mut workers = Vec::with_capacity(params.threads);
    for _ in 0..params.threads {
        let req_rx = req_rx.clone();
        let ctx = Arc::clone(ctx);
        let (sel, attempts) = (params.sel, params.attempts);
        workers.push(thread::spawn(move || {
            let mut stats = WorkerStats::default();
            let mut out = vec![0u8; edge_x * edge_y * PixelType::Float64.size()];
            for request in req_rx {
                stats.reads += 1;
                match ctx.read_window_into(token, sel, &request, attempts, &mut out) {
                    Ok(done) => {
                        stats.total_attempts += u64::from(done.attempts);
                        stats.max_attempts = stats.max_attempts.max(done.attempts);
                    }
                    Err(e) => {
                        warn!(error = %e, "read failed");
                        stats.failures += 1;
                    }
                }
            }
            stats
        }));
    }
    drop(req_rx);

    for i in 0..params.reads {
        // stride through the tile grid so neighbouring reads hit different tiles
        let tile = (i * 7919) % (cols * rows);
        let window = Window::new(
            ((tile % cols) * edge_x) as isize,
            ((tile / cols) * edge_y) as isize,
            edge_x,
            edge_y,
        );
        let request = ReadRequest::new(1, window, PixelType::Float64);
        if req_tx.send(request).is_err() {
            break;
        }
    }
    drop(req_tx);

    let mut report = BenchReport {
        threads: params.threads,
        ..BenchReport::default()
    };
    for worker in workers {
        let stats = worker
            .join()
            .map_err(|_| anyhow::anyhow!("bench worker panicked"))?;
        report.reads += stats.reads;
        report.failures += stats.failures;
        report.total_attempts += stats.total_attempts;
        report.max_attempts = report.max_attempts.max(stats.max_attempts);
    }
    report.elapsed_secs = started.elapsed().as_secs_f64();
    if report.elapsed_secs > 0.0 {
        report.reads_per_sec = report.reads as f64 / report.elapsed_secs;
    }
    ctx.surrender_token(token)?;
    info!(reads = report.reads, failures = report.failures, "bench finished");
    Ok(report)
}
