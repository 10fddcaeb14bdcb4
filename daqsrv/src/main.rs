use std::process::exit;
use std::sync::Arc;

use clap::{App as ClapApp, Arg};
use tokio::runtime::Runtime;

use daqsrv::engine::{Engine, EngineOptions};
use daqsrv::file_catalog::{FileCatalog, JsonlHistorySink, LogPushChannel};

fn main() {
    env_logger::init();
    let matches = ClapApp::new("daqsrv")
        .version("1.2")
        .about("Modbus data-acquisition engine: polls field devices, detects changes, keeps history")
        .arg(
            Arg::new("devices")
                .long("devices")
                .short('d')
                .takes_value(true)
                .required(true)
                .help("Path to the device catalog JSON file."),
        )
        .arg(
            Arg::new("history")
                .long("history")
                .takes_value(true)
                .default_value("history.jsonl")
                .help("Path of the history sink file (JSON lines)."),
        )
        .arg(
            Arg::new("interval")
                .long("interval")
                .takes_value(true)
                .help("Change monitoring interval in milliseconds."),
        )
        .arg(
            Arg::new("startup-timeout")
                .long("startup-timeout")
                .takes_value(true)
                .default_value("30000")
                .help("Startup budget in milliseconds."),
        )
        .get_matches();

    let devices_path = matches.value_of("devices").unwrap().to_string();
    let history_path = matches.value_of("history").unwrap().to_string();
    let interval = match matches.value_of("interval").map(|x| x.parse::<u64>()) {
        None => None,
        Some(Ok(x)) => Some(x),
        Some(Err(_)) => {
            println!("Cannot parse the monitoring interval.");
            exit(1);
        }
    };
    let startup_timeout = match matches.value_of("startup-timeout").unwrap().parse::<u64>() {
        Ok(x) => x,
        Err(_) => {
            println!("Cannot parse the startup timeout.");
            exit(1);
        }
    };

    let rt = Runtime::new().unwrap();
    rt.block_on(async move {
        let catalog = match FileCatalog::load(&devices_path).await {
            Ok(x) => x,
            Err(err) => {
                log::error!("cannot load device catalog {}: {}", devices_path, err);
                exit(1);
            }
        };
        let history = match JsonlHistorySink::create(&history_path).await {
            Ok(x) => x,
            Err(err) => {
                log::error!("cannot open history sink {}: {}", history_path, err);
                exit(1);
            }
        };

        let engine = Engine::new(Arc::new(catalog), Arc::new(history), Arc::new(LogPushChannel));
        let options = EngineOptions {
            monitoring_interval_ms: interval,
            startup_timeout_ms: startup_timeout,
        };
        if let Err(err) = engine.start(options).await {
            log::error!("engine failed to start: {}", err);
            exit(1);
        }
        log::info!("engine running, ctrl-c to stop");

        let _ = tokio::signal::ctrl_c().await;
        engine.stop().await;
    });
}
