//! CLI entry point for the on-the-fly KMC driver.
//!
//! Reads a TOML configuration, runs the driver until it reaches
//! `[driver].time_lim`, and writes a final cell snapshot next to the
//! catalogue.

#![forbid(unsafe_code)]

use std::{env, path::Path};

use otfkmc::config::Config;
use otfkmc::driver::KMCDriver;
use otfkmc::xyz;

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "otfkmc=debug,info" } else { "otfkmc=info,warn" })
    });
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    let verbose = args.iter().any(|a| a == "--verbose" || a == "-v");
    init_tracing(verbose);

    let config_path = parse_flag(&args, "--config").unwrap_or_else(|| "otfkmc.toml".to_string());
    let final_xyz = parse_flag(&args, "--final-xyz");

    eprintln!("loading configuration from {config_path}");
    let config = Config::load(Path::new(&config_path))
        .map_err(|e| anyhow::anyhow!("failed to load {config_path}: {e}"))?;

    let time_lim = config.driver.time_lim;
    eprintln!("building initial cell and catalogue...");
    let mut driver = KMCDriver::from_config(config).map_err(|e| anyhow::anyhow!("failed to initialise driver: {e}"))?;

    eprintln!("running until simulated time reaches {time_lim:.3e}s");
    driver.run().map_err(|e| anyhow::anyhow!("kmc run failed at iteration {}: {e}", driver.iteration()))?;

    eprintln!(
        "finished after {} accepted steps, simulated time {:.3e}s",
        driver.iteration(),
        driver.time()
    );

    if let Some(path) = final_xyz {
        let comment = format!("iteration={} time={:.6e}", driver.iteration(), driver.time());
        xyz::write(Path::new(&path), driver.cell(), &comment)?;
        eprintln!("wrote final cell to {path}");
    }

    Ok(())
}
