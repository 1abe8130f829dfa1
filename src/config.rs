//! Config Source (A1, `SPEC_FULL.md` §4.8 / §6).
//!
//! Either a TOML file (`-c <path>`) or CLI flags feed the same [`Config`]; the rest of the
//! pipeline only ever sees the resolved struct and is agnostic to which source populated it.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Command-line flags, parsed directly or used to point at a config file.
#[derive(Parser, Debug)]
#[command(name = "mongosync", about = "One-way MongoDB replication engine")]
struct Cli {
    /// Load configuration from a TOML file instead of the flags below.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    #[arg(long)]
    src_ip_port: Option<String>,
    #[arg(long)]
    src_auth_db: Option<String>,
    #[arg(long)]
    src_user: Option<String>,
    #[arg(long)]
    src_passwd: Option<String>,
    #[arg(long)]
    src_use_mcr: bool,

    #[arg(long)]
    dst_ip_port: Option<String>,
    #[arg(long)]
    dst_auth_db: Option<String>,
    #[arg(long)]
    dst_user: Option<String>,
    #[arg(long)]
    dst_passwd: Option<String>,

    /// Comma-separated allow-list of databases.
    #[arg(long)]
    dbs: Option<String>,
    /// Comma-separated allow-list of `db.coll` namespaces.
    #[arg(long)]
    colls: Option<String>,

    #[arg(long)]
    oplog_start: Option<u32>,
    #[arg(long)]
    oplog_end: Option<u32>,

    #[arg(long)]
    is_mongos: bool,

    #[arg(long)]
    bg_thread_num: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    log_level: Option<String>,
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

/// On-disk shape of a `-c <path>` TOML config file; every field mirrors a CLI flag.
#[derive(Deserialize, Debug, Default)]
struct FileConfig {
    src_ip_port: Option<String>,
    src_auth_db: Option<String>,
    src_user: Option<String>,
    src_passwd: Option<String>,
    #[serde(default)]
    src_use_mcr: bool,

    dst_ip_port: Option<String>,
    dst_auth_db: Option<String>,
    dst_user: Option<String>,
    dst_passwd: Option<String>,

    dbs: Option<String>,
    colls: Option<String>,

    oplog_start: Option<u32>,
    oplog_end: Option<u32>,

    #[serde(default)]
    is_mongos: bool,

    bg_thread_num: Option<usize>,
    batch_size: Option<usize>,

    log_level: Option<String>,
    log_dir: Option<PathBuf>,
}

/// The fully resolved configuration driving one run of the replicator.
#[derive(Clone, Debug)]
pub struct Config {
    /// Source endpoint (`host:port`).
    pub src_ip_port: String,
    /// Source authentication database.
    pub src_auth_db: Option<String>,
    /// Source username.
    pub src_user: Option<String>,
    /// Source password.
    pub src_passwd: Option<String>,
    /// Request majority-read concern on source cursors.
    pub src_use_mcr: bool,

    /// Destination endpoint (`host:port`).
    pub dst_ip_port: String,
    /// Destination authentication database.
    pub dst_auth_db: Option<String>,
    /// Destination username.
    pub dst_user: Option<String>,
    /// Destination password.
    pub dst_passwd: Option<String>,

    /// Database allow-list entries.
    pub dbs: Vec<String>,
    /// Namespace allow-list entries.
    pub colls: Vec<String>,

    /// Pinned tail start timestamp, overriding the live oplog head.
    pub oplog_start: Option<u32>,
    /// Pinned tail stop timestamp.
    pub oplog_end: Option<u32>,

    /// Treat the source as a `mongos` router.
    pub is_mongos: bool,

    /// Workers per destination pool.
    pub bg_thread_num: usize,
    /// Max documents per write batch.
    pub batch_size: usize,

    /// Minimum log level.
    pub log_level: String,
    /// Directory for log files.
    pub log_dir: PathBuf,
}

const DEFAULT_BG_THREAD_NUM: usize = 4;
const DEFAULT_BATCH_SIZE: usize = 1000;
const DEFAULT_LOG_LEVEL: &str = "INFO";
const DEFAULT_LOG_DIR: &str = "./log";

impl Config {
    /// Load configuration from `argv`, choosing between a `-c <path>` TOML file and direct flags.
    pub fn load() -> Result<Config> {
        Self::load_from(std::env::args_os())
    }

    /// Load configuration from an explicit argument iterator (used by tests).
    pub fn load_from<I, T>(args: I) -> Result<Config>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli = Cli::parse_from(args);

        let file = match &cli.config {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|e| {
                    Error::Configuration(format!("failed to read {}: {}", path.display(), e))
                })?;
                toml::from_str(&contents).map_err(|e| {
                    Error::Configuration(format!("invalid config file {}: {}", path.display(), e))
                })?
            }
            None => FileConfig::default(),
        };

        let src_ip_port = cli
            .src_ip_port
            .or(file.src_ip_port)
            .ok_or_else(|| Error::Configuration("src_ip_port is required".into()))?;
        let dst_ip_port = cli
            .dst_ip_port
            .or(file.dst_ip_port)
            .ok_or_else(|| Error::Configuration("dst_ip_port is required".into()))?;

        let oplog_start = cli.oplog_start.or(file.oplog_start);
        let oplog_end = cli.oplog_end.or(file.oplog_end);
        if let (Some(start), Some(end)) = (oplog_start, oplog_end) {
            if start > end {
                return Err(Error::Configuration(
                    "oplog_start must be <= oplog_end".into(),
                ));
            }
        }

        let config = Config {
            src_ip_port,
            src_auth_db: cli.src_auth_db.or(file.src_auth_db),
            src_user: cli.src_user.or(file.src_user),
            src_passwd: cli.src_passwd.or(file.src_passwd),
            src_use_mcr: cli.src_use_mcr || file.src_use_mcr,

            dst_ip_port,
            dst_auth_db: cli.dst_auth_db.or(file.dst_auth_db),
            dst_user: cli.dst_user.or(file.dst_user),
            dst_passwd: cli.dst_passwd.or(file.dst_passwd),

            dbs: split_list(cli.dbs.or(file.dbs)),
            colls: split_list(cli.colls.or(file.colls)),

            oplog_start,
            oplog_end,

            is_mongos: cli.is_mongos || file.is_mongos,

            bg_thread_num: cli
                .bg_thread_num
                .or(file.bg_thread_num)
                .unwrap_or(DEFAULT_BG_THREAD_NUM),
            batch_size: cli
                .batch_size
                .or(file.batch_size)
                .unwrap_or(DEFAULT_BATCH_SIZE),

            log_level: cli
                .log_level
                .or(file.log_level)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.into()),
            log_dir: cli
                .log_dir
                .or(file.log_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
        };

        Ok(config)
    }
}

fn split_list(raw: Option<String>) -> Vec<String> {
    match raw {
        None => Vec::new(),
        Some(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_src_and_dst() {
        let err = Config::load_from(["mongosync"]).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn parses_minimal_flags() {
        let config = Config::load_from([
            "mongosync",
            "--src-ip-port",
            "source:27017",
            "--dst-ip-port",
            "dest:27017",
        ])
        .unwrap();

        assert_eq!(config.src_ip_port, "source:27017");
        assert_eq!(config.dst_ip_port, "dest:27017");
        assert_eq!(config.bg_thread_num, DEFAULT_BG_THREAD_NUM);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert!(config.dbs.is_empty());
    }

    #[test]
    fn splits_comma_separated_allow_lists() {
        let config = Config::load_from([
            "mongosync",
            "--src-ip-port",
            "source:27017",
            "--dst-ip-port",
            "dest:27017",
            "--dbs",
            "a, b,c",
        ])
        .unwrap();

        assert_eq!(config.dbs, vec!["a", "b", "c"]);
    }

    #[test]
    fn rejects_oplog_start_after_oplog_end() {
        let err = Config::load_from([
            "mongosync",
            "--src-ip-port",
            "source:27017",
            "--dst-ip-port",
            "dest:27017",
            "--oplog-start",
            "100",
            "--oplog-end",
            "50",
        ])
        .unwrap_err();

        assert!(matches!(err, Error::Configuration(_)));
    }
}
