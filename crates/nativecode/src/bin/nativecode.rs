use clap::Parser;
use nativecode::{ArtifactLocator, LoadOutcome, Loader, NativeCodeConfig, ResourceRoot};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Resolve and load packaged native libraries for this host.
#[derive(Debug, Parser)]
#[command(name = "nativecode", version)]
struct Args {
    /// Logical library names, e.g. `minisat` or `glucose`
    #[arg(required = true)]
    names: Vec<String>,

    /// Extract into this directory instead of temporary files
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Bundle directory to search; repeat to search several in order
    #[arg(long = "resource-root")]
    resource_roots: Vec<PathBuf>,

    /// TOML configuration file; defaults to `$NATIVECODE_CONFIG`
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("nativecode={default_level},platform={default_level}"))
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_loader(args: &Args) -> nativecode::Result<Loader> {
    let mut config = match &args.config {
        Some(path) => NativeCodeConfig::from_toml_file(path)?.with_env_overrides(),
        None => NativeCodeConfig::from_env()?,
    };

    if !args.resource_roots.is_empty() {
        config.resource_roots = args.resource_roots.clone();
    }
    if args.cache_dir.is_some() {
        config.cache_dir = args.cache_dir.clone();
    }

    let loader = Loader::from_config(&config)?;
    if loader.locator().roots().is_empty() {
        return Err(nativecode::NativeCodeError::Config(
            "no resource root configured".into(),
        ));
    }
    Ok(loader)
}

fn describe_roots(locator: &ArtifactLocator) -> String {
    locator
        .roots()
        .iter()
        .map(|root| match root {
            ResourceRoot::Directory(dir) => dir.display().to_string(),
            ResourceRoot::Embedded(_) => "<embedded>".to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let loader = match build_loader(&args) {
        Ok(loader) => loader,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("Platform: {}", loader.platform());
    println!("Resource roots: {}", describe_roots(loader.locator()));

    let mut failed = false;
    for name in &args.names {
        match loader.try_load(None, name) {
            Ok(outcome @ (LoadOutcome::Loaded { .. } | LoadOutcome::AlreadyLoaded { .. })) => {
                println!("{name}: {outcome}");
            }
            Ok(outcome) => {
                println!("{name}: unavailable ({outcome})");
                failed = true;
            }
            Err(e) => {
                eprintln!("{name}: error: {e}");
                failed = true;
            }
        }
    }

    loader.purge_temporaries();
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
