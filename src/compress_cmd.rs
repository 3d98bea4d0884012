use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::*;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::password_from_env;
use crate::string_utils::size_to_str;
use pcmpr::{bridge, compress_stream, CompressStats, PipelineConfig};

pub const COMP_EXTENSION: &str = "pz";

#[derive(Debug)]
pub struct Options {
    /// One input file, or several in archive mode. A single "-" reads from
    /// stdin.
    pub inputs: Vec<PathBuf>,
    pub output: Option<PathBuf>,
    pub config: PipelineConfig,
}

fn is_stdin(inputs: &[PathBuf]) -> bool {
    inputs.len() == 1 && inputs[0] == PathBuf::from("-")
}

pub async fn run(opts: Options, cancel: Arc<AtomicBool>) -> Result<()> {
    let mut config = opts.config;
    if let Some(encrypt) = config.encrypt.as_mut() {
        encrypt.password = password_from_env()?
            .ok_or_else(|| anyhow!("encryption requires PCOMPRESS_PASSWORD_FILE to be set"))?;
    }

    let from_stdin = is_stdin(&opts.inputs);
    let output_path = match (&opts.output, from_stdin) {
        (Some(path), _) => Some(path.clone()),
        (None, true) => None,
        (None, false) => {
            let mut name = opts.inputs[0].clone().into_os_string();
            name.push(".");
            name.push(COMP_EXTENSION);
            Some(PathBuf::from(name))
        }
    };

    let output: Box<dyn AsyncWrite + Unpin> = match &output_path {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .context(format!("failed to create output file {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let stats = if config.archive {
        compress_archive(&mut config, &opts.inputs, output, cancel).await?
    } else if from_stdin {
        compress_stream(config.clone(), cancel, None, tokio::io::stdin(), output).await?
    } else {
        let path = &opts.inputs[0];
        let input = tokio::fs::File::open(path)
            .await
            .context(format!("failed to open input file {}", path.display()))?;
        let file_size = input.metadata().await.ok().map(|m| m.len());
        compress_stream(config.clone(), cancel, file_size, input, output).await?
    };

    if !config.hide_stats {
        print_stats(&stats);
    }
    if let Some(path) = output_path {
        info!("wrote {}", path.display());
    }
    Ok(())
}

/// Stream the member files through the archive bridge and compress the
/// resulting byte stream. Member framing is the producer's concern; the
/// pipeline sees opaque bytes.
async fn compress_archive(
    config: &mut PipelineConfig,
    inputs: &[PathBuf],
    output: Box<dyn AsyncWrite + Unpin>,
    cancel: Arc<AtomicBool>,
) -> Result<CompressStats> {
    let mut total_size: u64 = 0;
    for path in inputs {
        let meta = tokio::fs::metadata(path)
            .await
            .context(format!("failed to stat archive member {}", path.display()))?;
        total_size += meta.len();
    }

    let (mut writer, reader) = bridge(8, cancel.clone());
    let members: Vec<PathBuf> = inputs.to_vec();
    let producer = tokio::spawn(async move {
        for path in members {
            let mut file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(e) => {
                    error!("archive member {}: {}", path.display(), e);
                    writer.signal_cancel();
                    return;
                }
            };
            if let Err(e) = tokio::io::copy(&mut file, &mut writer).await {
                error!("archive member {}: {}", path.display(), e);
                writer.signal_cancel();
                return;
            }
        }
        writer.close();
    });

    let boxed_reader: Box<dyn AsyncRead + Unpin + Send> = Box::new(reader);
    let result = compress_stream(
        config.clone(),
        cancel,
        Some(total_size),
        boxed_reader,
        output,
    )
    .await;
    producer.await.context("archive producer task failed")?;
    Ok(result?)
}

fn print_stats(stats: &CompressStats) {
    info!("chunks:           {}", stats.chunks);
    if stats.chunks > 0 {
        info!("smallest chunk:   {}", size_to_str(stats.smallest_chunk));
        info!("largest chunk:    {}", size_to_str(stats.largest_chunk));
        info!(
            "average chunk:    {}",
            size_to_str(stats.source_bytes / stats.chunks)
        );
    }
    info!("source size:      {}", size_to_str(stats.source_bytes));
    info!("output size:      {}", size_to_str(stats.output_bytes));
    info!("ratio:            {:.2}", stats.ratio());
    if let Some(mode) = stats.dedup_mode {
        info!("dedup index:      {:?}", mode);
        info!("dedup saved:      {}", size_to_str(stats.dedup_saved));
    }
}
