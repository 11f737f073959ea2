use crate::logging::LoggingStyle;
use clap::{value_parser, Arg, Command};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

pub fn build_command() -> Command {
    let command = Command::new("Stitchery")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Markus Mayer")
        .about("A service for reassembling files uploaded in chunks")
        .arg(
            Arg::new("logging_style")
                .long("log")
                .env("APP_LOG_STYLE")
                .value_name("STYLE")
                .default_value("simple")
                .help("The logging style to use (simple, json)")
                .num_args(1)
                .value_parser(logging_style)
                .help_heading("Logging"),
        )
        .arg(
            Arg::new("bind_http")
                .long("http")
                .env("APP_SERVER_BIND_HTTP")
                .value_name("SOCKET")
                .default_value("127.0.0.1:8080")
                .help("The socket to bind insecure HTTP on")
                .num_args(1..)
                .allow_negative_numbers(false)
                .action(clap::ArgAction::Append)
                .value_parser(socket_addr)
                .help_heading("Server"),
        )
        .arg(
            Arg::new("config_file")
                .long("config")
                .env("APP_CONFIG_FILE")
                .value_name("FILE")
                .help("A YAML configuration file to load")
                .num_args(1)
                .value_parser(value_parser!(PathBuf))
                .help_heading("Configuration"),
        )
        .arg(
            Arg::new("temp_dir")
                .long("temp-dir")
                .env("APP_TEMP_DIR")
                .value_name("DIR")
                .help("The directory holding chunks of unfinished uploads")
                .num_args(1)
                .value_parser(value_parser!(PathBuf))
                .help_heading("Storage"),
        )
        .arg(
            Arg::new("complete_dir")
                .long("complete-dir")
                .env("APP_COMPLETE_DIR")
                .value_name("DIR")
                .help("The directory receiving merged files")
                .num_args(1)
                .value_parser(value_parser!(PathBuf))
                .help_heading("Storage"),
        );
    command
}

fn logging_style(s: &str) -> Result<LoggingStyle, String> {
    match s {
        "simple" => Ok(LoggingStyle::Compact),
        "compact" => Ok(LoggingStyle::Compact),
        "json" => Ok(LoggingStyle::Json),
        _ => Err(String::from("Either simple or json must be specified")),
    }
}

fn socket_addr(s: &str) -> Result<SocketAddr, String> {
    SocketAddr::from_str(s).map_err(|e| format!("{e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_is_well_formed() {
        build_command().debug_assert();
    }

    #[test]
    fn multiple_sockets_can_be_bound() {
        let matches = build_command()
            .try_get_matches_from(["stitchery", "--http", "127.0.0.1:80", "--http", "[::1]:81"])
            .unwrap();
        let sockets: Vec<&SocketAddr> = matches.get_many("bind_http").unwrap().collect();
        assert_eq!(sockets.len(), 2);
    }

    #[test]
    fn unknown_logging_style_is_rejected() {
        assert!(build_command()
            .try_get_matches_from(["stitchery", "--log", "fancy"])
            .is_err());
    }
}
