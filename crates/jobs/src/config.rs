//! Layered configuration: built-in defaults, then `ffmpegof.yaml` from the
//! config directory, then `FFMPEGOF_<SECTION>_<KEY>` environment variables.

use remote::{Binaries, SshOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENV_PREFIX: &str = "FFMPEGOF_";
pub const CONFIG_DIR_ENV: &str = "FFMPEGOF_CONFIG_DIR";
pub const DEFAULT_CONFIG_DIR: &str = "/etc/ffmpegof";

const CONFIG_FILE_NAMES: [&str; 2] = ["ffmpegof.yaml", "ffmpegof.yml"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: String, value: String },
    #[error("{0} must not be empty")]
    Missing(&'static str),
    #[error("selector.max_parallel must be at least 1")]
    ZeroParallelism,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub program: ProgramConfig,
    pub directories: DirectoriesConfig,
    pub remote: RemoteConfig,
    pub commands: CommandsConfig,
    pub database: DatabaseConfig,
    pub selector: SelectorConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramConfig {
    /// Directory for the daily log files.
    pub log: PathBuf,
    pub debug: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoriesConfig {
    /// Where ssh keeps its multiplexing control sockets.
    pub persist: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub user: String,
    /// Seconds an idle ssh master connection is kept; 0 disables reuse.
    pub persist: u64,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    pub ssh: String,
    /// Run on the worker before the ffmpeg binary, e.g. `nice -n 10`.
    pub pre: Vec<String>,
    pub ffmpeg: String,
    pub ffprobe: String,
    pub fallback_ffmpeg: String,
    pub fallback_ffprobe: String,
    /// Arguments that make ffmpeg print to stdout instead of stderr.
    pub special_flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Upper bound on concurrent per-host lookups during selection.
    pub max_parallel: usize,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            log: PathBuf::from("/var/log/ffmpegof"),
            debug: false,
        }
    }
}

impl Default for DirectoriesConfig {
    fn default() -> Self {
        Self {
            persist: PathBuf::from("/run/shm"),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            user: "jellyfin".to_string(),
            persist: 300,
            args: vec![
                "-i".to_string(),
                "/var/lib/ffmpegof/.ssh/id_ed25519".to_string(),
            ],
        }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            ssh: "/usr/bin/ssh".to_string(),
            pre: Vec::new(),
            ffmpeg: "/usr/lib/jellyfin-ffmpeg/ffmpeg".to_string(),
            ffprobe: "/usr/lib/jellyfin-ffmpeg/ffprobe".to_string(),
            fallback_ffmpeg: "/usr/lib/jellyfin-ffmpeg/ffmpeg".to_string(),
            fallback_ffprobe: "/usr/lib/jellyfin-ffmpeg/ffprobe".to_string(),
            special_flags: [
                "-version",
                "-encoders",
                "-decoders",
                "-hwaccels",
                "-filters",
                "-h",
                "-muxers",
                "-fp_format",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/ffmpegof/db.sqlite"),
        }
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self { max_parallel: 16 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            program: ProgramConfig::default(),
            directories: DirectoriesConfig::default(),
            remote: RemoteConfig::default(),
            commands: CommandsConfig::default(),
            database: DatabaseConfig::default(),
            selector: SelectorConfig::default(),
        }
    }
}

impl Config {
    /// Load from `dir` and the process environment.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_dir(dir)?;
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with the first YAML file found in `dir`, if any.
    pub fn from_dir(dir: &Path) -> Result<Self, ConfigError> {
        for name in CONFIG_FILE_NAMES {
            let path = dir.join(name);
            if !path.is_file() {
                tracing::trace!(path = %path.display(), "no config file");
                continue;
            }
            let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            return Self::from_yaml(&raw).map_err(|source| ConfigError::Parse { path, source });
        }
        Ok(Self::default())
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    /// The effective configuration, in the file format.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Apply `FFMPEGOF_<SECTION>_<KEY>` overrides. List values are
    /// whitespace separated. Unknown keys are ignored.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let key = key.to_ascii_lowercase();
            match key.as_str() {
                "program_log" => self.program.log = PathBuf::from(value),
                "program_debug" => self.program.debug = parse_bool(&name, &value)?,
                "directories_persist" => self.directories.persist = PathBuf::from(value),
                "remote_user" => self.remote.user = value,
                "remote_persist" => self.remote.persist = parse_number(&name, &value)?,
                "remote_args" => self.remote.args = split_list(&value),
                "commands_ssh" => self.commands.ssh = value,
                "commands_pre" => self.commands.pre = split_list(&value),
                "commands_ffmpeg" => self.commands.ffmpeg = value,
                "commands_ffprobe" => self.commands.ffprobe = value,
                "commands_fallback_ffmpeg" => self.commands.fallback_ffmpeg = value,
                "commands_fallback_ffprobe" => self.commands.fallback_ffprobe = value,
                "commands_special_flags" => self.commands.special_flags = split_list(&value),
                "database_path" => self.database.path = PathBuf::from(value),
                "selector_max_parallel" => {
                    self.selector.max_parallel = parse_number(&name, &value)?
                }
                "config_dir" => {}
                _ => tracing::debug!(variable = %name, "ignoring unknown config variable"),
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("remote.user", self.remote.user.is_empty()),
            ("commands.ssh", self.commands.ssh.is_empty()),
            ("commands.ffmpeg", self.commands.ffmpeg.is_empty()),
            ("commands.ffprobe", self.commands.ffprobe.is_empty()),
            ("commands.fallback_ffmpeg", self.commands.fallback_ffmpeg.is_empty()),
            ("commands.fallback_ffprobe", self.commands.fallback_ffprobe.is_empty()),
            ("database.path", self.database.path.as_os_str().is_empty()),
        ];
        if let Some((key, _)) = required.iter().find(|(_, empty)| *empty) {
            return Err(ConfigError::Missing(*key));
        }
        if self.selector.max_parallel == 0 {
            return Err(ConfigError::ZeroParallelism);
        }
        Ok(())
    }

    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            ssh: self.commands.ssh.clone(),
            user: self.remote.user.clone(),
            persist_secs: self.remote.persist,
            persist_dir: self.directories.persist.clone(),
            extra_args: self.remote.args.clone(),
            debug: self.program.debug,
        }
    }

    /// Binaries on the workers.
    pub fn remote_binaries(&self) -> Binaries {
        Binaries {
            ffmpeg: self.commands.ffmpeg.clone(),
            ffprobe: self.commands.ffprobe.clone(),
        }
    }

    /// Binaries used when the job runs on this machine.
    pub fn local_binaries(&self) -> Binaries {
        Binaries {
            ffmpeg: self.commands.fallback_ffmpeg.clone(),
            ffprobe: self.commands.fallback_ffprobe.clone(),
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.remote.persist, 300);
        assert!(config
            .commands
            .special_flags
            .contains(&"-version".to_string()));
    }

    #[test]
    fn test_yaml_overrides_only_given_keys() {
        let config = Config::from_yaml(
            "remote:\n  user: transcoder\n  args: []\ncommands:\n  pre: [nice, -n, '10']\n",
        )
        .unwrap();
        assert_eq!(config.remote.user, "transcoder");
        assert!(config.remote.args.is_empty());
        assert_eq!(config.remote.persist, 300);
        assert_eq!(config.commands.pre, vec!["nice", "-n", "10"]);
        assert_eq!(config.commands.ssh, "/usr/bin/ssh");
    }

    #[test]
    fn test_from_dir_reads_yml_fallback() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Config::from_dir(dir.path()).unwrap(), Config::default());

        fs::write(dir.path().join("ffmpegof.yml"), "program:\n  debug: true\n").unwrap();
        assert!(Config::from_dir(dir.path()).unwrap().program.debug);

        fs::write(dir.path().join("ffmpegof.yaml"), "program: [not, a, map]\n").unwrap();
        assert!(matches!(
            Config::from_dir(dir.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_effective_config_reloads_unchanged() {
        let mut config = Config::default();
        config.commands.pre = vec!["nice".to_string(), "-n".to_string(), "10".to_string()];
        config.remote.persist = 0;
        let dumped = config.to_yaml().unwrap();
        assert!(dumped.contains("max_parallel: 16"));
        assert_eq!(Config::from_yaml(&dumped).unwrap(), config);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("FFMPEGOF_REMOTE_PERSIST", "0"),
                ("FFMPEGOF_PROGRAM_DEBUG", "true"),
                ("FFMPEGOF_REMOTE_ARGS", "-i /keys/id -p 2222"),
                ("FFMPEGOF_DATABASE_PATH", "/tmp/ffmpegof.db"),
                ("FFMPEGOF_SOMETHING_ELSE", "x"),
                ("HOME", "/root"),
            ]))
            .unwrap();
        assert_eq!(config.remote.persist, 0);
        assert!(config.program.debug);
        assert_eq!(config.remote.args, vec!["-i", "/keys/id", "-p", "2222"]);
        assert_eq!(config.database.path, PathBuf::from("/tmp/ffmpegof.db"));
    }

    #[test]
    fn test_bad_env_value_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_env(env(&[("FFMPEGOF_REMOTE_PERSIST", "forever")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_validate_rejects_empty_user_and_zero_parallelism() {
        let mut config = Config::default();
        config.remote.user.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("remote.user"))
        ));

        let mut config = Config::default();
        config.selector.max_parallel = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroParallelism)
        ));
    }

    #[test]
    fn test_ssh_options_follow_config() {
        let mut config = Config::default();
        config.program.debug = true;
        let opts = config.ssh_options();
        assert!(opts.debug);
        assert_eq!(opts.user, "jellyfin");
        assert_eq!(opts.persist_dir, PathBuf::from("/run/shm"));
        assert_eq!(config.local_binaries().ffmpeg, config.commands.fallback_ffmpeg);
    }
}
