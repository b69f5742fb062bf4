use clap::{App, Arg};
use palaver::config::ServerConfig;
use palaver::logging;
use palaver::server::Server;
use std::process;

fn main() {
    let matches = App::new("Palaver Server")
        .version("0.1.0")
        .about("Runs the palaver chat server.")
        .arg(
            Arg::with_name("config")
                .short("f")
                .value_name("CONFIG_FILE")
                .help("Path to the config file")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("log_level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warning, error)")
                .takes_value(true)
                .default_value("info"),
        )
        .get_matches();

    let config_path = matches.value_of("config").unwrap();
    let config = match ServerConfig::load(config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}: {}", config_path, err);
            process::exit(1);
        }
    };

    let log = logging::init(matches.value_of("log_level").unwrap());

    logging::info!(log, "configuration loaded";
                   "path" => config_path,
                   "unix_path" => %config.unix_path.display(),
                   "dir_name" => %config.dir_name.display(),
                   "stat_file_name" => %config.stat_file_name.display(),
                   "max_connections" => config.max_connections,
                   "threads_in_pool" => config.threads_in_pool,
                   "max_msg_size" => config.max_msg_size,
                   "max_file_size" => config.max_file_size,
                   "max_hist_msgs" => config.max_hist_msgs);

    let server = Server::bind(config, &log).expect("Error starting server");

    if let Err(err) = server.run() {
        logging::crit!(log, "server failed"; "error" => %err);
        process::exit(1);
    }
}
