use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::{info, LevelFilter};
use memhier::sim::config::SystemConfig;
use memhier::sim::units::Latency;
use memhier::sim::System;

#[derive(Parser)]
#[command(version, about)]
struct MemhierArgs {
    #[arg(help = "Path to config.toml")]
    config_path: PathBuf,
    #[arg(long, help = "Override number of cores")]
    num_cores: Option<usize>,
    #[arg(long, help = "Enable log at level (0:warn, 1:info, 2:debug, 3:trace)")]
    log: Option<u64>,
    #[arg(long, help = "Stop after this much simulated time, e.g. \"50us\"")]
    max_time: Option<String>,
    #[arg(long, help = "Write the statistics summary here instead of stdout")]
    stats_json: Option<PathBuf>,
    #[arg(long, help = "Override random loads/stores per core")]
    num_loadstore: Option<u64>,
}

fn level_filter(level: u64) -> LevelFilter {
    match level {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

pub fn main() -> anyhow::Result<()> {
    let argv = MemhierArgs::parse();
    let text = fs::read_to_string(&argv.config_path)
        .with_context(|| format!("failed to read config file {}", argv.config_path.display()))?;
    let mut config = SystemConfig::from_toml_str(&text)?;

    // override toml configs with argv
    config.sim.num_cores = argv.num_cores.unwrap_or(config.sim.num_cores);
    config.sim.log_level = argv.log.unwrap_or(config.sim.log_level);
    config.sim.stats_json = argv.stats_json.or(config.sim.stats_json.take());
    config.cpu.num_loadstore = argv.num_loadstore.unwrap_or(config.cpu.num_loadstore);
    if let Some(max_time) = &argv.max_time {
        config.sim.max_time = Latency(memhier::sim::units::parse_latency(max_time)?);
    }

    let mut logger = env_logger::Builder::from_default_env();
    if argv.log.is_some() || config.sim.log_level > 0 || std::env::var_os("RUST_LOG").is_none() {
        logger.filter_level(level_filter(config.sim.log_level));
    }
    logger.init();

    let stats_path = config.sim.stats_json.clone();
    let mut system = System::build(config)?;
    let end = system.run()?;
    info!("finished at {}ps", end);

    let summary = serde_json::to_string_pretty(&system.summary())?;
    match stats_path {
        Some(path) => fs::write(&path, summary)
            .with_context(|| format!("cannot write statistics to {}", path.display()))?,
        None => println!("{}", summary),
    }
    Ok(())
}
