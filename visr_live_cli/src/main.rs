use clap::{Arg, Command};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use libvisr_live::config::Config;
use libvisr_live::server::run_server;
use libvisr_live::source::SourceOpener;

#[cfg(feature = "hdf5")]
fn make_opener() -> Arc<dyn SourceOpener> {
    Arc::new(libvisr_live::hdf_source::Hdf5Opener)
}

#[cfg(not(feature = "hdf5"))]
fn make_opener() -> Arc<dyn SourceOpener> {
    log::warn!("Built without the hdf5 feature; datasets cannot be opened");
    Arc::new(libvisr_live::source::UnsupportedOpener)
}

fn init_logging(config: &Config) -> Result<(), String> {
    let level = config.log_level_filter().map_err(|e| e.to_string())?;
    let log_file = File::create(&config.log_path)
        .map_err(|e| format!("Could not create log file {:?}: {e}", config.log_path))?;
    simplelog::CombinedLogger::init(vec![
        simplelog::TermLogger::new(
            level,
            simplelog::Config::default(),
            simplelog::TerminalMode::Mixed,
            simplelog::ColorChoice::Auto,
        ),
        simplelog::WriteLogger::new(level, simplelog::Config::default(), log_file),
    ])
    .map_err(|e| format!("Could not create logging: {e}"))
}

fn main() {
    // Create a cli
    let matches = Command::new("visr_live_cli")
        .about("Live colour statistics for a detector dataset being written over SWMR")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .required(true)
                .global(true)
                .help("Path to the configuration file"),
        )
        .get_matches();

    let config_path = match matches.get_one::<String>("path") {
        Some(path) => PathBuf::from(path),
        None => {
            eprintln!("A configuration path is required (-p <path>)");
            return;
        }
    };

    if let Some(("new", _)) = matches.subcommand() {
        println!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        match Config::default().write_config_file(&config_path) {
            Ok(()) => println!("Done."),
            Err(e) => eprintln!("Could not write template config: {e}"),
        }
        return;
    }

    // Load our config
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };

    // Initialize feedback
    if let Err(e) = init_logging(&config) {
        eprintln!("{e}");
        return;
    }
    log::info!("Config successfully loaded from {}.", config_path.to_string_lossy());
    log::info!("Default dataset: {}", config.full_dataset_path().to_string_lossy());
    log::info!("Dataset name: {}", config.dataset_name);
    log::info!("Notifier: {:?}", config.notifier);
    log::info!("Watch directory: {}", config.watch_directory().to_string_lossy());

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("Could not start the async runtime: {e}");
            return;
        }
    };

    match runtime.block_on(run_server(config, make_opener())) {
        Ok(()) => log::info!("Done."),
        Err(e) => log::error!("Server failed with error: {e}"),
    }
}
