use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cadenza_plugin_scanner::{ScanOptions, Scanner};

/// Scan plugin directories and rebuild the Cadenza plugin cache.
#[derive(Parser, Debug)]
#[command(name = "cadenza-plugin-scanner", version)]
struct Args {
    /// Extra directory to scan, in addition to the default roots.
    /// May be given multiple times.
    #[arg(long = "path", value_name = "DIR")]
    paths: Vec<PathBuf>,

    /// Scan only the directories given with --path.
    #[arg(long, requires = "paths")]
    only: bool,

    /// Cache file to read and write instead of the per-user default.
    #[arg(long, value_name = "FILE")]
    cache: Option<PathBuf>,

    /// Ignore the cache entirely; open every plugin file.
    #[arg(long)]
    no_cache: bool,

    /// Delete the existing cache before scanning.
    #[arg(long)]
    invalidate: bool,

    /// Print one line per module instead of per plugin file.
    #[arg(long)]
    verbose: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let scanner = Scanner::new(&ScanOptions {
        extra_paths: args.paths,
        skip_default_paths: args.only,
        cache_path: args.cache,
        no_cache: args.no_cache,
        invalidate: args.invalidate,
    });

    let report = scanner.scan()?;

    if args.verbose {
        for descriptor in &report.modules {
            let meta = &descriptor.metadata;
            println!(
                "{:<24} {:<16} {:>6}  {}",
                meta.short_name, meta.capability, meta.score, meta.long_name
            );
        }
    }
    println!(
        "{} modules in {} plugin files ({} from cache, {} opened, {} junk)",
        report.modules.len(),
        report.stats.files_seen,
        report.stats.cache_hits,
        report.stats.opened,
        report.stats.junk
    );
    Ok(())
}
