mod cli;
mod compress_cmd;
mod decompress_cmd;
mod string_utils;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::*;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

fn init_log(opts: &cli::LogOpts) -> Result<()> {
    let local_level = opts.filter;
    fern::Dispatch::new()
        .format(move |out, message, record| {
            if local_level > log::LevelFilter::Info {
                // Add some extra info to each message in debug
                out.finish(format_args!(
                    "[{}]({})({}) {}",
                    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                    record.target(),
                    record.level(),
                    message
                ))
            } else {
                out.finish(format_args!("{}", message))
            }
        })
        .level(opts.filter)
        .chain(std::io::stderr())
        .apply()
        .context("unable to initialize log")?;
    Ok(())
}

/// Key material source: a file named by PCOMPRESS_PASSWORD_FILE, with a
/// trailing newline stripped.
pub fn password_from_env() -> Result<Option<Vec<u8>>> {
    let path = match std::env::var_os("PCOMPRESS_PASSWORD_FILE") {
        Some(path) => path,
        None => return Ok(None),
    };
    let mut password = std::fs::read(&path)
        .with_context(|| format!("failed to read password file {}", path.to_string_lossy()))?;
    while password.last() == Some(&b'\n') || password.last() == Some(&b'\r') {
        password.pop();
    }
    Ok(Some(password))
}

async fn run() -> i32 {
    let (command, log_opts) = match cli::parse_opts(std::env::args_os()) {
        Ok(parsed) => parsed,
        Err(e) => {
            let code = match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 2,
                _ => 1,
            };
            let _ = e.print();
            return code;
        }
    };
    if init_log(&log_opts).is_err() {
        eprintln!("unable to initialize log");
        return 3;
    }

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, canceling");
                cancel.store(true, Ordering::Release);
            }
        });
    }

    let result = match command {
        cli::CommandOpts::Compress(opts) => compress_cmd::run(opts, cancel).await,
        cli::CommandOpts::Decompress(opts) => decompress_cmd::run(opts, cancel).await,
    };
    match result {
        Ok(()) => 0,
        Err(e) => {
            error!("error: {:#}", e);
            match e.downcast_ref::<pcmpr::Error>() {
                Some(pcmpr::Error::Usage(_)) => 1,
                _ => 3,
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}
