mod fs_daemon;

use log::error;
use std::env;
use std::path::PathBuf;

use crate::fs_daemon::{run_fs_daemon, FsDaemonRunOptions, DEFAULT_FS_DAEMON_CONFIG_PATH};

fn usage() -> String {
    format!(
        "usage: fs_daemon [--config <path>] [--listen <addr:port>] [--readonly]\n\
         defaults:\n\
         --config {}",
        DEFAULT_FS_DAEMON_CONFIG_PATH
    )
}

fn parse_args() -> Result<FsDaemonRunOptions, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    if args.first().map(String::as_str) == Some("-h")
        || args.first().map(String::as_str) == Some("--help")
    {
        return Err(usage());
    }

    let mut config_path = PathBuf::from(DEFAULT_FS_DAEMON_CONFIG_PATH);
    let mut listen_override = None;
    let mut readonly_override = false;

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                config_path = PathBuf::from(value);
            }
            "--listen" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --listen".to_string())?;
                listen_override = Some(value.clone());
            }
            "--readonly" => {
                readonly_override = true;
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    Ok(FsDaemonRunOptions {
        config_path,
        listen_override,
        readonly_override,
    })
}

fn main() {
    env_logger::init();
    let options = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    if let Err(err) = run_fs_daemon(options) {
        error!("run fs_daemon failed: {}", err);
        std::process::exit(1);
    }
}
