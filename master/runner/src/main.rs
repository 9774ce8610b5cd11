use ballast::logging::{self, Logger};
use ballast::time::MonotonicClock;
use clap::{Arg, Command};
use genisys::config::MasterConfig;
use genisys::observe::LogObserver;
use genisys::runtime::Controller;
use genisys::sched::ThreadScheduler;
use genisys::transport::udp::UdpEndpoint;
use std::process;
use std::sync::Arc;

fn main() {
    let matches = Command::new("masterd")
        .about("GENISYS wayside master controller")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .default_value("masterd.toml")
                .help("Path to the TOML configuration file"),
        )
        .get_matches();

    let path = matches
        .get_one::<String>("config")
        .expect("Config path has a default");

    let log = logging::terminal();

    let config = load_config(path, &log);

    let clock = Arc::new(MonotonicClock::new());
    let scheduler = Arc::new(ThreadScheduler::new(clock.clone()));

    let endpoint = match UdpEndpoint::new(config.bind_address, Some(&log)) {
        Ok(endpoint) => Arc::new(endpoint),
        Err(err) => {
            logging::crit!(log, "failed to bind endpoint";
                           "context" => "startup",
                           "bind_address" => %config.bind_address,
                           "error" => %err);
            process::exit(1);
        }
    };

    let observer = Arc::new(LogObserver::new(log.new(logging::o!())));

    let mut controller = Controller::new(
        &config,
        endpoint,
        clock,
        scheduler.clone(),
        observer,
        Some(&log),
    );

    if let Err(err) = controller.start() {
        logging::crit!(log, "failed to start controller";
                       "context" => "startup",
                       "error" => %err);
        process::exit(1);
    }

    logging::info!(log, "master running";
                   "context" => "startup",
                   "bind_address" => %config.bind_address,
                   "stations" => config.stations.len());

    controller.run();

    scheduler.shutdown();
}

fn load_config(path: &str, log: &Logger) -> genisys::config::ValidatedConfig {
    let config = match MasterConfig::load(path) {
        Ok(config) => config,
        Err(err) => {
            logging::crit!(log, "failed to load configuration";
                           "context" => "startup",
                           "path" => path,
                           "error" => %err);
            process::exit(1);
        }
    };

    match config.validate() {
        Ok(validated) => validated,
        Err(err) => {
            logging::crit!(log, "invalid configuration";
                           "context" => "startup",
                           "path" => path,
                           "error" => %err);
            process::exit(1);
        }
    }
}
