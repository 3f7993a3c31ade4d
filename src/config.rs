//! Repository configuration.
//!
//! `.dcfh/config` is an INI style file; a string keyed option map passed
//! with each operation overrides single values. Unknown sections, keys or
//! values fail with `ConfigInvalid` naming the recognised keys.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Error};
use serde::Serialize;

use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::char,
    combinator::map,
    sequence::delimited,
};

use dcfh_datastore::digest::{self, DigestKind};
use dcfh_tools::nom::{multispace0, parse_complete, IResult};
use dcfh_tools::units::parse_byte_size;

use crate::error::WorkflowError;

pub const DEFAULT_HASH_WORKERS: usize = 4;
pub const MAX_HASH_WORKERS: usize = 64;
pub const DEFAULT_HASH_BUFFER: usize = 2 * 1024 * 1024;

const RECOGNISED_CONFIG_KEYS: &str = "filehash.default, output.format, verbose.level, \
     verbose.debug, symlink.mode, performance.hash_workers, performance.hash_buffer, \
     snapshot.keep_last, snapshot.keep_hourly, snapshot.keep_daily, snapshot.keep_weekly, \
     snapshot.keep_monthly, snapshot.keep_yearly";

const RECOGNISED_OPTION_KEYS: &str =
    "v, filehash, default, format, symlinks, hash_workers, debug";

fn config_invalid(msg: String) -> Error {
    WorkflowError::ConfigInvalid { msg }.into()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Human,
    Json,
    Fdupes,
}

impl OutputFormat {
    fn parse(value: &str) -> Result<Self, Error> {
        match value {
            "human" => Ok(OutputFormat::Human),
            "json" => Ok(OutputFormat::Json),
            "fdupes" => Ok(OutputFormat::Fdupes),
            _ => Err(config_invalid(format!(
                "bad output format {:?} (expected human|json|fdupes)",
                value
            ))),
        }
    }
}

/// How the scanner treats symlinks to directories; symlinks to files are
/// always recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymlinkMode {
    /// Traverse all directory symlinks.
    All,
    /// Traverse only when the resolved target stays under the
    /// repository root.
    Contained,
    /// Never traverse directory symlinks.
    None,
}

impl SymlinkMode {
    fn parse(value: &str) -> Result<Self, Error> {
        match value {
            "all" => Ok(SymlinkMode::All),
            "contained" => Ok(SymlinkMode::Contained),
            "none" => Ok(SymlinkMode::None),
            _ => Err(config_invalid(format!(
                "bad symlink mode {:?} (expected all|contained|none)",
                value
            ))),
        }
    }
}

/// Snapshot retention keys; parsed and validated, retention itself is
/// applied by external tooling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotKeep {
    pub keep_last: Option<u64>,
    pub keep_hourly: Option<u64>,
    pub keep_daily: Option<u64>,
    pub keep_weekly: Option<u64>,
    pub keep_monthly: Option<u64>,
    pub keep_yearly: Option<u64>,
}

#[derive(Clone)]
pub struct Config {
    pub default_hash: &'static DigestKind,
    pub format: OutputFormat,
    pub verbose: u8,
    pub debug: Vec<(String, Option<String>)>,
    pub symlink_mode: SymlinkMode,
    pub hash_workers: usize,
    pub hash_buffer: usize,
    pub snapshot: SnapshotKeep,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_hash: digest::digest_by_name("sha256").unwrap(),
            format: OutputFormat::Human,
            verbose: 0,
            debug: Vec::new(),
            symlink_mode: SymlinkMode::Contained,
            hash_workers: DEFAULT_HASH_WORKERS,
            hash_buffer: DEFAULT_HASH_BUFFER,
            snapshot: SnapshotKeep::default(),
        }
    }
}

fn parse_section_name(i: &str) -> IResult<&str, &str> {
    delimited(
        char('['),
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.'),
        char(']'),
    )(i)
}

fn parse_key(i: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(i)
}

fn parse_key_value(i: &str) -> IResult<&str, (&str, &str)> {
    let (i, key) = parse_key(i)?;
    let (i, _) = delimited(multispace0, tag("="), multispace0)(i)?;
    Ok(("", (key, i.trim_end())))
}

impl Config {
    /// Load `<meta_dir>/config`; an absent file yields the defaults.
    pub fn load(meta_dir: &Path) -> Result<Self, Error> {
        let path = meta_dir.join("config");
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default())
            }
            Err(err) => bail!("unable to read config {:?} - {}", path, err),
        };
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, Error> {
        let mut config = Self::default();
        let mut section = String::new();

        for (lineno, raw_line) in content.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') {
                section = parse_complete("section header", line, map(parse_section_name, str::to_string))
                    .map_err(|err| config_invalid(format!("line {} - {}", lineno + 1, err)))?;
                continue;
            }

            let (key, value) =
                parse_complete("config line", line, parse_key_value).map_err(|err| {
                    config_invalid(format!("line {} - {}", lineno + 1, err))
                })?;

            config.apply_file_key(&section, key, value).map_err(|err| {
                match err.downcast_ref::<WorkflowError>() {
                    Some(_) => err,
                    None => config_invalid(format!("line {} - {}", lineno + 1, err)),
                }
            })?;
        }

        Ok(config)
    }

    fn apply_file_key(&mut self, section: &str, key: &str, value: &str) -> Result<(), Error> {
        match (section, key) {
            ("filehash", "default") => self.set_default_hash(value)?,
            ("output", "format") => self.format = OutputFormat::parse(value)?,
            ("verbose", "level") => self.set_verbose(value)?,
            ("verbose", "debug") => self.debug = parse_debug_flags(value),
            ("symlink", "mode") => self.symlink_mode = SymlinkMode::parse(value)?,
            ("performance", "hash_workers") => self.set_hash_workers(value)?,
            ("performance", "hash_buffer") => self.set_hash_buffer(value)?,
            ("snapshot", _) => self.set_snapshot_keep(key, value)?,
            _ => {
                return Err(config_invalid(format!(
                    "unknown key '{}.{}' (recognised keys: {})",
                    section, key, RECOGNISED_CONFIG_KEYS
                )))
            }
        }
        Ok(())
    }

    /// Apply a per-operation option map on top of a copy of this config.
    pub fn with_overrides(&self, options: &HashMap<String, String>) -> Result<Self, Error> {
        let mut config = self.clone();
        for (key, value) in options {
            match key.as_str() {
                "v" => config.set_verbose(value)?,
                "filehash" | "default" => config.set_default_hash(value)?,
                "format" => config.format = OutputFormat::parse(value)?,
                "symlinks" => config.symlink_mode = SymlinkMode::parse(value)?,
                "hash_workers" => config.set_hash_workers(value)?,
                "debug" => config.debug = parse_debug_flags(value),
                _ => {
                    return Err(config_invalid(format!(
                        "unknown option '{}' (recognised options: {})",
                        key, RECOGNISED_OPTION_KEYS
                    )))
                }
            }
        }
        Ok(config)
    }

    fn set_default_hash(&mut self, value: &str) -> Result<(), Error> {
        self.default_hash = digest::digest_by_name(value).ok_or_else(|| {
            config_invalid(format!(
                "unknown digest {:?} (expected sha1|sha256|sha512)",
                value
            ))
        })?;
        Ok(())
    }

    fn set_verbose(&mut self, value: &str) -> Result<(), Error> {
        let level: u8 = value
            .parse()
            .map_err(|_| config_invalid(format!("bad verbose level {:?}", value)))?;
        if level > 3 {
            return Err(config_invalid(format!(
                "verbose level {} out of range (0-3)",
                level
            )));
        }
        self.verbose = level;
        Ok(())
    }

    fn set_hash_workers(&mut self, value: &str) -> Result<(), Error> {
        let workers: usize = value
            .parse()
            .map_err(|_| config_invalid(format!("bad hash_workers value {:?}", value)))?;
        if workers < 1 || workers > MAX_HASH_WORKERS {
            return Err(config_invalid(format!(
                "hash_workers {} out of range (1-{})",
                workers, MAX_HASH_WORKERS
            )));
        }
        self.hash_workers = workers;
        Ok(())
    }

    fn set_hash_buffer(&mut self, value: &str) -> Result<(), Error> {
        let size = parse_byte_size(value)
            .map_err(|err| config_invalid(format!("bad hash_buffer value - {}", err)))?;
        if size == 0 {
            return Err(config_invalid("hash_buffer must not be zero".to_string()));
        }
        self.hash_buffer = size as usize;
        Ok(())
    }

    fn set_snapshot_keep(&mut self, key: &str, value: &str) -> Result<(), Error> {
        let count: u64 = value
            .parse()
            .map_err(|_| config_invalid(format!("bad snapshot.{} value {:?}", key, value)))?;
        let slot = match key {
            "keep_last" => &mut self.snapshot.keep_last,
            "keep_hourly" => &mut self.snapshot.keep_hourly,
            "keep_daily" => &mut self.snapshot.keep_daily,
            "keep_weekly" => &mut self.snapshot.keep_weekly,
            "keep_monthly" => &mut self.snapshot.keep_monthly,
            "keep_yearly" => &mut self.snapshot.keep_yearly,
            _ => {
                return Err(config_invalid(format!(
                    "unknown key 'snapshot.{}' (recognised keys: {})",
                    key, RECOGNISED_CONFIG_KEYS
                )))
            }
        };
        *slot = Some(count);
        Ok(())
    }

    /// env_logger filter string for the configured verbose level.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }

    pub fn debug_flag(&self, name: &str) -> Option<Option<&str>> {
        self.debug
            .iter()
            .find(|(flag, _)| flag == name)
            .map(|(_, value)| value.as_deref())
    }
}

/// Comma separated debug flags, each optionally `flag:value`.
fn parse_debug_flags(value: &str) -> Vec<(String, Option<String>)> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|flag| match flag.split_once(':') {
            Some((name, value)) => (name.to_string(), Some(value.to_string())),
            None => (flag.to_string(), None),
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config = Config::parse(
            "# comment\n\
             [filehash]\n\
             default = sha512\n\
             \n\
             [output]\n\
             format = json\n\
             [verbose]\n\
             level = 2\n\
             debug = scan,hash:1\n\
             [symlink]\n\
             mode = none\n\
             [performance]\n\
             hash_workers = 8\n\
             hash_buffer = 4M\n\
             [snapshot]\n\
             keep_last = 3\n",
        )
        .unwrap();

        assert_eq!(config.default_hash.name, "sha512");
        assert_eq!(config.format, OutputFormat::Json);
        assert_eq!(config.verbose, 2);
        assert_eq!(config.debug_flag("hash"), Some(Some("1")));
        assert_eq!(config.debug_flag("scan"), Some(None));
        assert_eq!(config.debug_flag("other"), None);
        assert_eq!(config.symlink_mode, SymlinkMode::None);
        assert_eq!(config.hash_workers, 8);
        assert_eq!(config.hash_buffer, 4 * 1024 * 1024);
        assert_eq!(config.snapshot.keep_last, Some(3));
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = Config::parse("[filehash]\nalgorithm = sha1\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("filehash.algorithm") || msg.contains("recognised"));

        assert!(Config::parse("[grandfather]\nx = 1\n").is_err());
        assert!(Config::parse("[verbose]\nlevel = 9\n").is_err());
        assert!(Config::parse("[performance]\nhash_workers = 0\n").is_err());
        assert!(Config::parse("[performance]\nhash_workers = 100\n").is_err());
    }

    #[test]
    fn option_map_overrides() {
        let base = Config::default();
        let mut options = HashMap::new();
        options.insert("filehash".to_string(), "sha1".to_string());
        options.insert("v".to_string(), "3".to_string());
        let config = base.with_overrides(&options).unwrap();
        assert_eq!(config.default_hash.name, "sha1");
        assert_eq!(config.verbose, 3);

        let mut bad = HashMap::new();
        bad.insert("bogus".to_string(), "1".to_string());
        let err = base.with_overrides(&bad).unwrap_err();
        assert!(err.to_string().contains("recognised options"));
    }
}
