use anyhow::Context;
use clap::error::ErrorKind;
use clap::{ArgAction, CommandFactory, Parser};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use memsweep::kernel::{Catalog, Kernel};
use memsweep::memory::{AllocOptions, BackingRegion};
use memsweep::report::{OutputFormat, ResultWriter, DEFAULT_OUTPUT};
use memsweep::sweep::{parse_size, Sweep, SweepSettings};
use memsweep::system::cpu_info::{cache_levels, detect_features, FeatureProbe};
use memsweep::system::numa::NumaTopology;
use memsweep::system::platform::{cpu_ids, hostname, physical_cpus, physical_memory_bytes};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Parallel memory bandwidth and latency benchmark",
    disable_help_flag = true
)]
struct Args {
    /// Run only kernels whose name contains SUBSTR (repeatable); `list` prints the kernels
    #[arg(short = 'f', value_name = "SUBSTR")]
    filter: Vec<String>,

    /// Smallest array size to test, 0 for no bound (suffixes k, m, g, t)
    #[arg(short = 's', value_name = "BYTES", value_parser = size_arg, default_value = "0")]
    size_min: u64,

    /// Largest array size to test, 0 for no bound
    #[arg(short = 'S', value_name = "BYTES", value_parser = size_arg, default_value = "4g")]
    size_max: u64,

    /// Cap on the backing allocation, 0 for the largest power of two that fits
    #[arg(short = 'M', value_name = "BYTES", value_parser = size_arg, default_value = "0")]
    memory_limit: u64,

    /// Smallest thread count
    #[arg(short = 'p', value_name = "N", default_value_t = 0)]
    min_threads: usize,

    /// Largest thread count (default: CPUs + 2)
    #[arg(short = 'P', value_name = "N", default_value_t = 0)]
    max_threads: usize,

    /// Double the thread count instead of incrementing it
    #[arg(short = 'Q')]
    geometric: bool,

    /// Repeat every run for each NUMA node offset
    #[arg(short = 'H')]
    numa_hops: bool,

    /// Results file
    #[arg(short = 'o', value_name = "FILE", default_value = DEFAULT_OUTPUT)]
    output: PathBuf,

    /// Shortest measurement accepted, in seconds
    #[arg(long, default_value_t = 1.0)]
    min_time: f64,

    /// Duration repeat counts are scaled towards, in seconds
    #[arg(long, default_value_t = 1.5)]
    target_time: f64,

    /// Check that every permutation is a single cycle before walking it
    #[arg(long)]
    verify_permutation: bool,

    /// Use one region even when NUMA nodes are present
    #[arg(long)]
    no_numa: bool,

    /// Format of the stdout copy of each result
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Print usage
    #[arg(short = 'h', long = "help", action = ArgAction::SetTrue)]
    help: bool,
}

impl Args {
    fn settings(&self) -> SweepSettings {
        SweepSettings {
            size_min: self.size_min,
            size_max: self.size_max,
            min_threads: self.min_threads,
            max_threads: self.max_threads,
            geometric: self.geometric,
            numa_hops: self.numa_hops,
            min_time: self.min_time,
            target_time: self.target_time,
            verify_permutation: self.verify_permutation,
        }
    }
}

fn size_arg(text: &str) -> Result<u64, String> {
    parse_size(text).map_err(|e| e.to_string())
}

#[derive(Serialize)]
struct KernelListing<'a> {
    #[serde(flatten)]
    kernel: &'a Kernel,
    supported: bool,
}

fn list_kernels(
    catalog: &Catalog,
    filters: &[String],
    probe: &dyn FeatureProbe,
    format: OutputFormat,
) -> anyhow::Result<()> {
    for kernel in catalog.filter_by_name(filters) {
        if format == OutputFormat::Json {
            let listing = KernelListing {
                kernel,
                supported: catalog.supported(kernel, probe),
            };
            println!("{}", serde_json::to_string(&listing)?);
            continue;
        }
        match kernel.required_feature {
            None => println!("{}", kernel.name),
            Some(feature) if catalog.supported(kernel, probe) => {
                println!("{}\t{feature}", kernel.name)
            }
            Some(feature) => println!("{}\t{feature}\tunsupported", kernel.name),
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.help {
        eprintln!("{}", Args::command().render_help());
        std::process::exit(2);
    }

    let settings = args.settings();
    if let Err(e) = settings.validate() {
        Args::command().error(ErrorKind::ValueValidation, e).exit();
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let catalog = Catalog::builtin();
    let probe = detect_features();

    let listing = args.filter.iter().any(|f| f == "list");
    let filters: Vec<String> = args.filter.iter().filter(|f| *f != "list").cloned().collect();
    if listing {
        return list_kernels(&catalog, &filters, probe.as_ref(), args.format);
    }

    let features: Vec<&str> = probe.available().iter().map(|f| f.as_str()).collect();
    info!("CPU features: {}", features.join(" "));
    for cache in cache_levels() {
        info!(
            "L{} {} cache: {} KiB, {}-byte lines, {} sets, {}-way",
            cache.level, cache.kind, cache.size_kib, cache.line_size, cache.sets, cache.associativity
        );
    }

    let cpus = cpu_ids();
    let host = hostname();
    info!("Detected {} CPUs on {host}.", physical_cpus());

    let topology = if args.no_numa { None } else { NumaTopology::detect() };
    if let Some(topology) = &topology {
        info!("Detected {} NUMA nodes.", topology.numa_nodes());
    }
    let physical_memory = physical_memory_bytes()
        .or((args.memory_limit != 0).then_some(args.memory_limit))
        .context("cannot determine physical memory size; pass -M")?;

    let backing = BackingRegion::allocate(&AllocOptions {
        limit_bytes: args.memory_limit,
        physical_memory,
        cpus: physical_cpus(),
        topology,
    })
    .context("allocating the test region")?;

    let mut writer = ResultWriter::create(&args.output, args.format)
        .with_context(|| format!("opening {}", args.output.display()))?;

    let kernels = catalog.filter_by_name(&filters);
    let results = Sweep::new(&settings, &backing, &mut writer, host, cpus)
        .run_all(&kernels, probe.as_ref())
        .context("benchmark aborted")?;

    info!("Wrote {results} results to {}.", writer.path().display());
    Ok(())
}
