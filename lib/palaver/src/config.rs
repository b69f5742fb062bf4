use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Operational parameters, read from a `key = value` file. Lines starting
/// with `#` and blank lines are ignored; unknown keys are skipped.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Filesystem path of the listening socket.
    pub unix_path: PathBuf,
    /// Root directory of the file store.
    pub dir_name: PathBuf,
    /// Statistics dump target (appended to on SIGUSR1).
    pub stat_file_name: PathBuf,
    /// Maximum simultaneous online users.
    pub max_connections: usize,
    /// Worker threads in the pool.
    pub threads_in_pool: usize,
    /// Maximum text message length, in chars.
    pub max_msg_size: usize,
    /// Maximum file size, in KiB.
    pub max_file_size: usize,
    /// Per-user history capacity, in messages.
    pub max_hist_msgs: usize,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    /// A value failed to parse; carries the 1-based line number.
    Invalid(usize, String),
    Missing(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "config file unreadable: {}", err),
            ConfigError::Invalid(line, value) => {
                write!(f, "invalid value {:?} at line {}", value, line)
            }
            ConfigError::Missing(key) => write!(f, "missing configuration key {}", key),
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ServerConfig, ConfigError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn parse(text: &str) -> Result<ServerConfig, ConfigError> {
        let mut unix_path = None;
        let mut dir_name = None;
        let mut stat_file_name = None;
        let mut max_connections = None;
        let mut threads_in_pool = None;
        let mut max_msg_size = None;
        let mut max_file_size = None;
        let mut max_hist_msgs = None;

        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.splitn(2, '=');
            let key = parts.next().unwrap_or("").trim();
            let value = match parts.next() {
                Some(value) => value.trim(),
                None => continue,
            };
            if key.is_empty() || value.is_empty() {
                continue;
            }

            let number = |value: &str| {
                value
                    .parse::<usize>()
                    .map_err(|_| ConfigError::Invalid(index + 1, value.to_string()))
            };

            match key {
                "UnixPath" => unix_path = Some(PathBuf::from(value)),
                "DirName" => dir_name = Some(PathBuf::from(value)),
                "StatFileName" => stat_file_name = Some(PathBuf::from(value)),
                "MaxConnections" => max_connections = Some(number(value)?),
                "ThreadsInPool" => threads_in_pool = Some(number(value)?),
                "MaxMsgSize" => max_msg_size = Some(number(value)?),
                "MaxFileSize" => max_file_size = Some(number(value)?),
                "MaxHistMsgs" => max_hist_msgs = Some(number(value)?),
                _ => (),
            }
        }

        let config = ServerConfig {
            unix_path: unix_path.ok_or(ConfigError::Missing("UnixPath"))?,
            dir_name: dir_name.ok_or(ConfigError::Missing("DirName"))?,
            stat_file_name: stat_file_name.ok_or(ConfigError::Missing("StatFileName"))?,
            max_connections: max_connections.ok_or(ConfigError::Missing("MaxConnections"))?,
            threads_in_pool: threads_in_pool.ok_or(ConfigError::Missing("ThreadsInPool"))?,
            max_msg_size: max_msg_size.ok_or(ConfigError::Missing("MaxMsgSize"))?,
            max_file_size: max_file_size.ok_or(ConfigError::Missing("MaxFileSize"))?,
            max_hist_msgs: max_hist_msgs.ok_or(ConfigError::Missing("MaxHistMsgs"))?,
        };

        if config.max_connections == 0 {
            return Err(ConfigError::Missing("MaxConnections"));
        }
        if config.threads_in_pool == 0 {
            return Err(ConfigError::Missing("ThreadsInPool"));
        }

        Ok(config)
    }
}
