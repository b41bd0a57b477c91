use std::{error::Error, path::PathBuf};

use ldma_core::config::Config;
use ldma_sim::scenario;

fn main() -> Result<(), Box<dyn Error>> {
    pretty_env_logger::init();

    let mut plot = false;
    let mut path = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--plot" => plot = true,
            _ if path.is_none() => path = Some(PathBuf::from(&arg)),
            _ => return Err(format!("unexpected argument '{arg}'").into()),
        }
    }

    let config = Config::load_or_default(path.as_deref())?;
    log::info!(
        "Running {} channels, {} fixed",
        config.channels.len(),
        config.fixed_channels
    );

    let capture = scenario::run(&config)?;

    if plot {
        print!("{}", capture.plot());
    } else {
        print!("{}", capture.report(&config));
    }

    for stats in capture.observer().stats() {
        log::info!(
            "channel {}: {} elements in {} runs, {} blocks per grant",
            stats.channel,
            stats.elements,
            stats.runs,
            stats.blocks_per_grant(config.row_len)
        );
    }
    log::debug!("{} grants in total", capture.grants.len());

    if let Err(e) = capture.result {
        log::error!("{e}");
        std::process::exit(1);
    }

    Ok(())
}
