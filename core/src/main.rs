use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use log::{error, info, warn};

use omegascan_core::config::ScanConfig;
use omegascan_core::datasource::{ChannelFileSource, DataSource, MemorySource, SegmentFileSource, StateFlagSource};
use omegascan_core::orchestrator::{ScanError, ScanOrchestrator};
use omegascan_core::products::ProductPool;
use omegascan_core::qtransform::QTransform;
use omegascan_core::report::JsonReport;
use omegascan_core::types::{round_dp, FrequencyScale, ScanOptions, DEFAULT_FAR_THRESHOLD};

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Scan auxiliary channels for transient noise around a GPS time",
    long_about = None,
    arg_required_else_help = true,
    after_help = "Examples:\n  omega-scan 1187008882.43 -f L1-channels.ini --data-dir frames/ -o scans/\n  omega-scan 1187008882.43 -i L1 -f common.ini -f L1.ini --data-dir frames/ --segment-dir segments/ -j 4\n"
)]
struct Args {
    /// GPS time to scan (rounded to 0.01 s)
    #[arg(allow_hyphen_values = true)]
    gps: f64,

    /// Interferometer prefix substituted for %(IFO)s / %(ifo)s in the configuration
    #[arg(short, long)]
    ifo: Option<String>,

    /// Output directory (default: ./<gps>)
    #[arg(short = 'o', long = "output-directory")]
    output_directory: Option<PathBuf>,

    /// Channel configuration file; may be given several times
    #[arg(short = 'f', long = "config-file", required = true)]
    config_file: Vec<PathBuf>,

    /// Do not cross-correlate against the primary channel
    #[arg(short = 'd', long = "disable-correlation")]
    disable_correlation: bool,

    /// Neither read nor resume from an existing checkpoint
    #[arg(short = 'D', long = "disable-checkpoint")]
    disable_checkpoint: bool,

    /// Scan blocks whatever the state of their state flag
    #[arg(short = 's', long = "ignore-state-flags")]
    ignore_state_flags: bool,

    /// White-noise false-alarm-rate threshold (Hz)
    #[arg(short = 't', long = "far-threshold", default_value_t = DEFAULT_FAR_THRESHOLD)]
    far_threshold: f64,

    /// Frequency axis of the maps: log or linear
    #[arg(short = 'y', long = "frequency-scaling", default_value = "log")]
    frequency_scaling: FrequencyScale,

    /// Map writer threads
    #[arg(short = 'j', long, default_value_t = 1)]
    nproc: usize,

    /// Directory of channel files for blocks without their own source
    #[arg(long = "data-dir")]
    data_dir: Option<PathBuf>,

    /// Directory of state-flag segment files
    #[arg(long = "segment-dir")]
    segment_dir: Option<PathBuf>,
}

fn create_dir(path: &Path) -> Result<(), ScanError> {
    fs::create_dir_all(path).map_err(|source| ScanError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn run(args: Args) -> Result<(), ScanError> {
    let gps = round_dp(args.gps, 2);
    let config = ScanConfig::read(args.config_file.as_slice(), args.ifo.as_deref())?;
    info!(
        "Loaded {} block(s) with {} channel(s)",
        config.blocks.len(),
        config.channel_count()
    );


    let outdir = args
        .output_directory
        .unwrap_or_else(|| PathBuf::from(gps.to_string()));
    let plots = outdir.join("plots");
    let data_dir = outdir.join("data");
    create_dir(&plots)?;
    create_dir(&data_dir)?;
    info!("Writing output to {}", outdir.display());

    let data: Box<dyn DataSource> = match &args.data_dir {
        Some(dir) => Box::new(ChannelFileSource::from_dir(dir)?),
        None => {
            warn!("No --data-dir given; only blocks with their own source will be read");
            Box::new(MemorySource::new())
        }
    };
    let flags: Box<dyn StateFlagSource> = match &args.segment_dir {
        Some(dir) => Box::new(SegmentFileSource::new(dir)),
        None => Box::new(MemorySource::new()),
    };

    let options = ScanOptions {
        gps,
        fthresh: args.far_threshold,
        correlate: !args.disable_correlation,
        use_checkpoint: !args.disable_checkpoint,
        ignore_state_flags: args.ignore_state_flags,
        frequency_scale: args.frequency_scaling,
        nproc: args.nproc.max(1),
        ..ScanOptions::default()
    };
    let pool = ProductPool::new(&plots, options.nproc);

    let summary = ScanOrchestrator::new(
        config,
        options,
        QTransform::new(),
        data,
        flags,
        Box::new(JsonReport::new(data_dir.join("summary.json"))),
    )
    .with_checkpoint(data_dir.join("summary.csv"))
    .with_products(pool)
    .run()?;

    if summary.products.failed > 0 {
        warn!("{} map(s) could not be written", summary.products.failed);
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
