use std::ffi::OsString;
use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::{Arg, ArgAction, Command};
use log::LevelFilter;

use crate::compress_cmd;
use crate::decompress_cmd;
use crate::string_utils::parse_size;
use crate::{PKG_NAME, PKG_VERSION};
use pcmpr::chunking;
use pcmpr::dedupe::{DedupConfig, IndexRequest};
use pcmpr::{
    CipherKind, CksumKind, Compression, CompressionAlgorithm, EncryptConfig, PipelineConfig,
    PreprocessConfig,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOpts {
    pub filter: LevelFilter,
}

#[derive(Debug)]
pub enum CommandOpts {
    Compress(compress_cmd::Options),
    Decompress(decompress_cmd::Options),
}

fn command() -> Command {
    Command::new(PKG_NAME)
        .version(PKG_VERSION)
        .about("Chunked parallel multi-algorithm compression.")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count)
                .help("Set verbosity level"),
        )
        .arg(
            Arg::new("compress")
                .short('c')
                .long("compress")
                .value_name("ALGO")
                .help("Compress with the given algorithm (none, lz4, zlib, brotli, adapt)"),
        )
        .arg(
            Arg::new("decompress")
                .short('d')
                .long("decompress")
                .action(ArgAction::SetTrue)
                .conflicts_with("compress")
                .help("Decompress the input"),
        )
        .arg(
            Arg::new("level")
                .short('l')
                .long("level")
                .value_name("LEVEL")
                .help("Compression level [default: 6]"),
        )
        .arg(
            Arg::new("chunk-size")
                .short('s')
                .long("chunk-size")
                .value_name("SIZE")
                .help("Chunk size, the unit of parallel processing [default: 4MiB]"),
        )
        .arg(
            Arg::new("preprocess")
                .short('p')
                .long("preprocess")
                .action(ArgAction::SetTrue)
                .help("Enable the preprocessing pipeline"),
        )
        .arg(
            Arg::new("lzp")
                .short('L')
                .long("lzp")
                .action(ArgAction::SetTrue)
                .help("Enable the LZP preprocessor"),
        )
        .arg(
            Arg::new("rabin-dedup")
                .short('D')
                .long("dedupe")
                .action(ArgAction::SetTrue)
                .help("Enable content-defined (Rabin) deduplication"),
        )
        .arg(
            Arg::new("segmented-dedup")
                .short('E')
                .long("segmented-dedupe")
                .action(ArgAction::SetTrue)
                .help("Use the segmented similarity dedup index"),
        )
        .arg(
            Arg::new("fixed-dedup")
                .short('F')
                .long("fixed-dedupe")
                .action(ArgAction::SetTrue)
                .help("Enable fixed-block deduplication"),
        )
        .arg(
            Arg::new("global-index")
                .short('G')
                .long("global-index")
                .action(ArgAction::SetTrue)
                .help("Force the simple stream-wide dedup index"),
        )
        .arg(
            Arg::new("dedup-block")
                .long("dedup-block")
                .value_name("SIZE")
                .help("Average dedup block size [default: 32KiB]"),
        )
        .arg(
            Arg::new("dedup-mem")
                .long("dedup-mem")
                .value_name("SIZE")
                .help("Memory limit for the dedup index [default: 512MiB]"),
        )
        .arg(
            Arg::new("encrypt")
                .short('e')
                .long("encrypt")
                .value_name("CIPHER")
                .help("Encrypt with the given cipher (AES, SALSA20)"),
        )
        .arg(
            Arg::new("keylen")
                .short('k')
                .long("keylen")
                .value_name("BYTES")
                .help("Cipher key length, 16 or 32 [default: 32]"),
        )
        .arg(
            Arg::new("archive")
                .short('a')
                .long("archive")
                .action(ArgAction::SetTrue)
                .help("Archive mode: stream the given inputs through the archive bridge"),
        )
        .arg(
            Arg::new("threads")
                .short('T')
                .long("threads")
                .value_name("COUNT")
                .help("Worker thread count [default: cores available]"),
        )
        .arg(
            Arg::new("cksum")
                .short('S')
                .long("cksum")
                .value_name("KIND")
                .help("Chunk checksum kind (xxh32, crc32, crc64, sha256, sha512, sha512t256, keccak256, keccak512, blake2b)"),
        )
        .arg(
            Arg::new("no-stats")
                .short('M')
                .long("no-stats")
                .action(ArgAction::SetTrue)
                .help("Do not print chunk and memory statistics"),
        )
        .arg(
            Arg::new("INPUT")
                .value_name("INPUT [OUTPUT]")
                .num_args(1..)
                .required(true)
                .help(
                    "Input file, or input and output files; '-' reads from stdin. \
                     Archive mode treats every path as a member",
                ),
        )
        .arg(
            Arg::new("OUTPUT")
                .long("output")
                .short('o')
                .value_name("OUTPUT")
                .help("Output file; defaults to INPUT.pz (or stripping .pz on decompression)"),
        )
}

pub fn parse_opts<I, T>(args: I) -> Result<(CommandOpts, LogOpts), clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let mut cmd = command();
    let matches = cmd.try_get_matches_from_mut(args)?;

    let log_opts = LogOpts {
        filter: match matches.get_count("verbose") {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        },
    };

    let mut inputs: Vec<PathBuf> = matches
        .get_many::<String>("INPUT")
        .expect("INPUT is required")
        .map(PathBuf::from)
        .collect();
    let mut output = matches.get_one::<String>("OUTPUT").map(PathBuf::from);
    // Outside archive mode the second positional is the output file.
    if output.is_none() && !matches.get_flag("archive") && inputs.len() == 2 {
        output = inputs.pop();
    }
    let num_workers = match matches.get_one::<String>("threads") {
        Some(v) => v
            .parse::<usize>()
            .map_err(|e| cmd.error(ErrorKind::ValueValidation, e))?,
        None => std::cmp::max(1, num_cpus::get()),
    };

    if matches.get_flag("decompress") {
        if inputs.len() != 1 {
            return Err(cmd.error(
                ErrorKind::TooManyValues,
                "decompression takes exactly one input",
            ));
        }
        return Ok((
            CommandOpts::Decompress(decompress_cmd::Options {
                input: inputs.into_iter().next().expect("one input"),
                output,
                num_workers,
            }),
            log_opts,
        ));
    }

    let algo_name = matches
        .get_one::<String>("compress")
        .map(String::as_str)
        .unwrap_or("zlib");
    let algorithm = CompressionAlgorithm::from_name(algo_name)
        .ok_or_else(|| cmd.error(ErrorKind::ValueValidation, "unknown compression algorithm"))?;
    let level = match matches.get_one::<String>("level") {
        Some(v) => v
            .parse::<u8>()
            .map_err(|e| cmd.error(ErrorKind::ValueValidation, e))?,
        None => 6,
    };

    let mut config = PipelineConfig::new(Compression::new(algorithm, level));
    config.num_workers = num_workers;
    config.hide_stats = matches.get_flag("no-stats");
    config.archive = matches.get_flag("archive");

    if let Some(size) = matches.get_one::<String>("chunk-size") {
        config.chunk_size =
            parse_size(size).map_err(|e| cmd.error(ErrorKind::ValueValidation, e))?;
    }
    if let Some(kind) = matches.get_one::<String>("cksum") {
        config.cksum = CksumKind::from_name(kind)
            .ok_or_else(|| cmd.error(ErrorKind::ValueValidation, "unknown checksum kind"))?;
    }

    if matches.get_flag("preprocess") || matches.get_flag("lzp") {
        config.preprocess = PreprocessConfig {
            lzp: matches.get_flag("lzp") || matches.get_flag("preprocess"),
            delta2: matches.get_flag("preprocess"),
        };
    }

    let rabin = matches.get_flag("rabin-dedup") || matches.get_flag("segmented-dedup");
    let fixed = matches.get_flag("fixed-dedup");
    if rabin && fixed {
        return Err(cmd.error(
            ErrorKind::ArgumentConflict,
            "fixed and rabin dedup are mutually exclusive",
        ));
    }
    if rabin || fixed || matches.get_flag("global-index") {
        let avg_block = match matches.get_one::<String>("dedup-block") {
            Some(v) => parse_size(v).map_err(|e| cmd.error(ErrorKind::ValueValidation, e))?
                as usize,
            None => 32 * 1024,
        };
        let split = if fixed {
            chunking::Config::FixedSize(avg_block)
        } else {
            chunking::Config::Rabin(chunking::SplitConfig::from_avg(avg_block))
        };
        let mut dedup = DedupConfig::new(split);
        if matches.get_flag("segmented-dedup") {
            dedup.index = IndexRequest::Segmented;
        } else if matches.get_flag("global-index") {
            dedup.index = IndexRequest::Simple;
        }
        if let Some(limit) = matches.get_one::<String>("dedup-mem") {
            dedup.mem_limit =
                parse_size(limit).map_err(|e| cmd.error(ErrorKind::ValueValidation, e))?;
        }
        if let Ok(dir) = std::env::var("PCOMPRESS_TMPDIR") {
            dedup.tmp_dir = PathBuf::from(dir);
        }
        config.dedup = Some(dedup);
    }

    if let Some(cipher) = matches.get_one::<String>("encrypt") {
        let cipher = CipherKind::from_name(cipher)
            .ok_or_else(|| cmd.error(ErrorKind::ValueValidation, "unknown cipher"))?;
        // The password itself is resolved later, from the password file
        // source; an empty password fails validation at that point.
        let mut encrypt = EncryptConfig::new(cipher, Vec::new());
        if let Some(keylen) = matches.get_one::<String>("keylen") {
            let keylen = keylen
                .parse::<usize>()
                .map_err(|e| cmd.error(ErrorKind::ValueValidation, e))?;
            encrypt.key_len = cipher.normalize_key_len(keylen);
        }
        config.encrypt = Some(encrypt);
    }

    if !config.archive && inputs.len() != 1 {
        return Err(cmd.error(
            ErrorKind::TooManyValues,
            "multiple inputs require archive mode (-a)",
        ));
    }

    Ok((
        CommandOpts::Compress(compress_cmd::Options {
            inputs,
            output,
            config,
        }),
        log_opts,
    ))
}
