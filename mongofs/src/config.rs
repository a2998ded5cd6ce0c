use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;

use crate::cache::{CacheConfig, DEFAULT_CACHE_CAPACITY, WritebackPolicy};
use crate::vfs::fs::DEFAULT_PAGE_SIZE;

#[derive(Parser, Debug)]
#[command(version, about = "Mount a MongoDB collection as a directory of documents", long_about = None)]
pub struct Args {
    /// Empty directory to mount the collection on
    #[arg(value_name = "MOUNTPOINT")]
    pub mountpoint: PathBuf,

    /// Collection to expose, as <database>.<collection>
    #[arg(short, long, env = "MONGOFS_NAMESPACE", default_value = "test.coll")]
    pub namespace: String,

    /// MongoDB connection string
    #[arg(long, env = "MONGOFS_URI", default_value = "mongodb://localhost:27017")]
    pub uri: String,

    /// Append log output to this file
    #[arg(short, long, env = "MONGOFS_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Also print log output to the console when logging to a file
    #[arg(short, long)]
    pub console: bool,

    /// Number of documents held in the write-back cache
    #[arg(long, default_value_t = DEFAULT_CACHE_CAPACITY)]
    pub cache_capacity: usize,

    /// Number of documents per directory page
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: u64,

    /// Keep documents cached after a successful write-back instead of dropping them
    #[arg(long)]
    pub retain_after_writeback: bool,

    /// Mount with privileged FUSE instead of fusermount3
    #[arg(long)]
    pub privileged: bool,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("namespace `{0}` must look like <database>.<collection>")]
    Namespace(String),

    #[error("{0} must be at least 1")]
    Zero(&'static str),
}

/// Validated runtime configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub mountpoint: PathBuf,
    pub uri: String,
    pub database: String,
    pub collection: String,
    pub log_file: Option<PathBuf>,
    pub console: bool,
    pub cache: CacheConfig,
    pub page_size: u64,
    pub privileged: bool,
}

/// Split `db.collection` at the first dot. Collection names may contain dots.
pub fn parse_namespace(ns: &str) -> Result<(String, String), ConfigError> {
    match ns.split_once('.') {
        Some((db, coll)) if !db.is_empty() && !coll.is_empty() => {
            Ok((db.to_owned(), coll.to_owned()))
        }
        _ => Err(ConfigError::Namespace(ns.to_owned())),
    }
}

impl TryFrom<Args> for Config {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let (database, collection) = parse_namespace(&args.namespace)?;
        if args.cache_capacity == 0 {
            return Err(ConfigError::Zero("cache capacity"));
        }
        if args.page_size == 0 {
            return Err(ConfigError::Zero("page size"));
        }
        let writeback = if args.retain_after_writeback {
            WritebackPolicy::Retain
        } else {
            WritebackPolicy::Evict
        };
        Ok(Config {
            mountpoint: args.mountpoint,
            uri: args.uri,
            database,
            collection,
            log_file: args.log_file,
            console: args.console,
            cache: CacheConfig {
                capacity: args.cache_capacity,
                writeback,
            },
            page_size: args.page_size,
            privileged: args.privileged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Result<Config, ConfigError> {
        let args = Args::try_parse_from(std::iter::once("mongofs").chain(argv.iter().copied()))
            .expect("args");
        Config::try_from(args)
    }

    #[test]
    fn test_defaults() {
        let cfg = parse(&["/mnt/docs"]).unwrap();
        assert_eq!(cfg.mountpoint, PathBuf::from("/mnt/docs"));
        assert_eq!(cfg.database, "test");
        assert_eq!(cfg.collection, "coll");
        assert_eq!(cfg.uri, "mongodb://localhost:27017");
        assert_eq!(cfg.cache.capacity, 100);
        assert_eq!(cfg.cache.writeback, WritebackPolicy::Evict);
        assert_eq!(cfg.page_size, 1000);
        assert!(cfg.log_file.is_none());
        assert!(!cfg.console && !cfg.privileged);
    }

    #[test]
    fn test_overrides() {
        let cfg = parse(&[
            "/mnt/docs",
            "--namespace",
            "shop.orders.2024",
            "--log-file",
            "/tmp/mongofs.log",
            "--console",
            "--cache-capacity",
            "8",
            "--page-size",
            "50",
            "--retain-after-writeback",
        ])
        .unwrap();
        assert_eq!(cfg.database, "shop");
        assert_eq!(cfg.collection, "orders.2024");
        assert_eq!(cfg.log_file, Some(PathBuf::from("/tmp/mongofs.log")));
        assert!(cfg.console);
        assert_eq!(cfg.cache.capacity, 8);
        assert_eq!(cfg.page_size, 50);
        assert_eq!(cfg.cache.writeback, WritebackPolicy::Retain);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(parse(&["/m", "-n", "nodot"]), Err(ConfigError::Namespace(_))));
        assert!(matches!(parse(&["/m", "-n", ".coll"]), Err(ConfigError::Namespace(_))));
        assert!(matches!(parse(&["/m", "-n", "db."]), Err(ConfigError::Namespace(_))));
        assert_eq!(
            parse(&["/m", "--cache-capacity", "0"]).unwrap_err(),
            ConfigError::Zero("cache capacity")
        );
        assert_eq!(
            parse(&["/m", "--page-size", "0"]).unwrap_err(),
            ConfigError::Zero("page size")
        );
    }
}
