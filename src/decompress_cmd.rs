use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::*;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::compress_cmd::COMP_EXTENSION;
use crate::password_from_env;
use crate::string_utils::size_to_str;
use pcmpr::decompress_stream;

#[derive(Debug)]
pub struct Options {
    /// Input file; "-" reads from stdin.
    pub input: PathBuf,
    pub output: Option<PathBuf>,
    pub num_workers: usize,
}

pub async fn run(opts: Options, cancel: Arc<AtomicBool>) -> Result<()> {
    let from_stdin = opts.input == PathBuf::from("-");
    let output_path = match (&opts.output, from_stdin) {
        (Some(path), _) => Some(path.clone()),
        (None, true) => None,
        (None, false) => {
            if opts.input.extension().map(|e| e == COMP_EXTENSION) != Some(true) {
                return Err(anyhow!(
                    "cannot derive output name from {}; pass an output path",
                    opts.input.display()
                ));
            }
            Some(opts.input.with_extension(""))
        }
    };

    let input: Box<dyn AsyncRead + Unpin + Send> = if from_stdin {
        Box::new(tokio::io::stdin())
    } else {
        Box::new(
            tokio::fs::File::open(&opts.input)
                .await
                .context(format!("failed to open input file {}", opts.input.display()))?,
        )
    };
    let output: Box<dyn AsyncWrite + Unpin> = match &output_path {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .context(format!("failed to create output file {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let stats = decompress_stream(
        cancel,
        password_from_env()?,
        opts.num_workers,
        input,
        output,
    )
    .await?;

    info!(
        "restored {} in {} chunks",
        size_to_str(stats.output_bytes),
        stats.chunks
    );
    if let Some(path) = output_path {
        info!("wrote {}", path.display());
    }
    Ok(())
}
