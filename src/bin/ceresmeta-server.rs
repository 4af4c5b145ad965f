// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! The main entry point of the meta server.

use ceresmeta::{config::Config, setup};
use clap::{Arg, Command};

fn main() {
    let matches = Command::new("ceresmeta-server")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .takes_value(true)
                .help("Set configuration file, eg: \"/path/server.toml\""),
        )
        .get_matches();

    let config = match Config::load(matches.value_of("config")) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config, err:{e}");
            std::process::exit(1);
        }
    };

    let log_runtime = setup::setup_logger(&config);
    setup::run_server(config, log_runtime);
}
