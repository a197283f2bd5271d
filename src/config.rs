//! Configuration for the log server and the fan-out client.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::fanout::ServerDescriptor;
use crate::matcher::MatcherKind;
use crate::protocol::DirectoryHeader;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server list read when nothing else is configured and the file exists.
const DEFAULT_SERVERS_FILE: &str = "servers.conf";

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "fleet-grep")]
#[command(author = "fleet-grep authors")]
#[command(version = "0.1.0")]
#[command(about = "Search log files across many log servers", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a log server
    Serve(ServeArgs),
    /// Send a query to every configured server
    Query(QueryArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Address to bind to (e.g., 127.0.0.1:8000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Log file, or directory of log files, to search
    #[arg(short = 'f', long)]
    pub log_source: Option<PathBuf>,

    /// Connection multiplexer
    #[arg(long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Search engine
    #[arg(long, value_enum)]
    pub matcher: Option<MatcherKind>,

    /// Header format for directory sources
    #[arg(long, value_enum)]
    pub directory_header: Option<DirectoryHeader>,
}

#[derive(Args, Debug, Default)]
pub struct QueryArgs {
    /// Server to query as host:port (repeatable)
    #[arg(short = 's', long = "server")]
    pub servers: Vec<ServerDescriptor>,

    /// File listing servers, one `hostname, port` per line
    #[arg(long)]
    pub servers_file: Option<PathBuf>,

    /// Query to send, e.g. "search ['ERROR']". Starts the menu when absent
    #[arg(short, long)]
    pub query: Option<String>,

    /// Per-server timeout in seconds (default: wait indefinitely)
    #[arg(short, long)]
    pub timeout_secs: Option<u64>,

    /// Only print counts, not the matched lines
    #[arg(long)]
    pub no_logs: bool,
}

/// Connection multiplexer implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Readiness event loop (epoll/kqueue)
    #[default]
    Mio,
    /// Cooperative tasks on a current-thread Tokio runtime
    Tokio,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Log file or directory to search
    #[serde(default = "default_log_source")]
    pub log_source: PathBuf,
    #[serde(default)]
    pub runtime: RuntimeType,
    #[serde(default)]
    pub matcher: MatcherKind,
    #[serde(default)]
    pub directory_header: DirectoryHeader,
    /// Upper bound on one readiness wait, in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            log_source: default_log_source(),
            runtime: RuntimeType::default(),
            matcher: MatcherKind::default(),
            directory_header: DirectoryHeader::default(),
            poll_timeout_ms: default_poll_timeout_ms(),
            max_connections: default_max_connections(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
    pub servers_file: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_print_logs")]
    pub print_logs: bool,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            servers_file: None,
            timeout_secs: None,
            print_logs: default_print_logs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_log_source() -> PathBuf {
    PathBuf::from("logs/machine.log")
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_max_connections() -> usize {
    1024
}

fn default_print_logs() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved log server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub log_source: PathBuf,
    pub runtime: RuntimeType,
    pub matcher: MatcherKind,
    pub directory_header: DirectoryHeader,
    pub poll_timeout: Duration,
    pub max_connections: usize,
}

/// Resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Servers in the order results are reported.
    pub servers: Vec<ServerDescriptor>,
    pub timeout: Option<Duration>,
    pub print_logs: bool,
    /// One-shot query; `None` runs the interactive menu.
    pub query: Option<String>,
}

/// What the process was asked to do.
#[derive(Debug, Clone)]
pub enum Mode {
    Serve(ServerConfig),
    Query(ClientConfig),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub mode: Mode,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point to, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let log_level = cli.log_level.unwrap_or(toml_config.logging.level);

        let mode = match cli.command {
            Command::Serve(args) => Mode::Serve(server_config(args, toml_config.server)),
            Command::Query(args) => Mode::Query(client_config(args, toml_config.client)?),
        };

        Ok(Config { log_level, mode })
    }
}

fn server_config(args: ServeArgs, toml: ServerSection) -> ServerConfig {
    ServerConfig {
        listen: args.listen.unwrap_or(toml.listen),
        log_source: args.log_source.unwrap_or(toml.log_source),
        runtime: args.runtime.unwrap_or(toml.runtime),
        matcher: args.matcher.unwrap_or(toml.matcher),
        directory_header: args.directory_header.unwrap_or(toml.directory_header),
        poll_timeout: Duration::from_millis(toml.poll_timeout_ms),
        max_connections: toml.max_connections,
    }
}

fn client_config(args: QueryArgs, toml: ClientSection) -> Result<ClientConfig, ConfigError> {
    let servers = if !args.servers.is_empty() {
        args.servers
    } else {
        let mut servers = toml.servers;
        match args.servers_file.or(toml.servers_file) {
            Some(path) => servers.extend(read_servers_file(&path)?),
            None if servers.is_empty() && Path::new(DEFAULT_SERVERS_FILE).is_file() => {
                servers = read_servers_file(Path::new(DEFAULT_SERVERS_FILE))?;
            }
            None => {}
        }
        servers
    };

    Ok(ClientConfig {
        servers,
        timeout: args.timeout_secs.or(toml.timeout_secs).map(Duration::from_secs),
        print_logs: !args.no_logs && toml.print_logs,
        query: args.query,
    })
}

/// Read a server list: one `hostname, port` per line. Blank lines and
/// lines starting with `#` are skipped.
pub fn read_servers_file(path: &Path) -> Result<Vec<ServerDescriptor>, ConfigError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
    parse_servers(&contents).map_err(|(line, reason)| ConfigError::ServersFile {
        path: path.to_path_buf(),
        line,
        reason,
    })
}

fn parse_servers(contents: &str) -> Result<Vec<ServerDescriptor>, (usize, String)> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(i, line)| line.parse().map_err(|reason| (i + 1, reason)))
        .collect()
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    ServersFile {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ServersFile { path, line, reason } => {
                write!(f, "Invalid server list '{}' line {}: {}", path.display(), line, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Config {
        Config::from_args(CliArgs::try_parse_from(args).unwrap()).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:8000");
        assert_eq!(config.server.log_source, PathBuf::from("logs/machine.log"));
        assert_eq!(config.server.runtime, RuntimeType::Mio);
        assert_eq!(config.server.directory_header, DirectoryHeader::Names);
        assert_eq!(config.server.poll_timeout_ms, 1000);
        assert!(config.client.print_logs);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            log_source = "/var/log/app"
            runtime = "tokio"
            matcher = "grep"
            directory_header = "counted"
            poll_timeout_ms = 250

            [client]
            servers = [
                { host = "vm1", port = 8000 },
                { host = "vm2", port = 8001 },
            ]
            timeout_secs = 5
            print_logs = false

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.runtime, RuntimeType::Tokio);
        assert_eq!(config.server.matcher, MatcherKind::Grep);
        assert_eq!(config.server.directory_header, DirectoryHeader::Counted);
        assert_eq!(config.server.poll_timeout_ms, 250);
        assert_eq!(config.client.servers[1], ServerDescriptor::new("vm2", 8001));
        assert_eq!(config.client.timeout_secs, Some(5));
        assert!(!config.client.print_logs);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_serve_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nlisten = \"0.0.0.0:9000\"\nmatcher = \"grep\"").unwrap();
        let path = file.path().to_str().unwrap();

        let config = parse(&["fleet-grep", "serve", "-c", path, "--listen", "127.0.0.1:7000"]);
        match config.mode {
            Mode::Serve(server) => {
                assert_eq!(server.listen, "127.0.0.1:7000");
                assert_eq!(server.matcher, MatcherKind::Grep);
                assert_eq!(server.poll_timeout, Duration::from_secs(1));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_query_cli_servers() {
        let config = parse(&[
            "fleet-grep",
            "--log-level",
            "warn",
            "query",
            "-s",
            "127.0.0.1:8000",
            "--server",
            "localhost:8001",
            "--query",
            "search ['ERROR']",
            "--timeout-secs",
            "3",
            "--no-logs",
        ]);
        assert_eq!(config.log_level, "warn");
        match config.mode {
            Mode::Query(client) => {
                assert_eq!(
                    client.servers,
                    [
                        ServerDescriptor::new("127.0.0.1", 8000),
                        ServerDescriptor::new("localhost", 8001)
                    ]
                );
                assert_eq!(client.query.as_deref(), Some("search ['ERROR']"));
                assert_eq!(client.timeout, Some(Duration::from_secs(3)));
                assert!(!client.print_logs);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_servers_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# fleet\n127.0.0.1, 8000\n\nvm2.example.com,8001").unwrap();

        let servers = read_servers_file(file.path()).unwrap();
        assert_eq!(
            servers,
            [
                ServerDescriptor::new("127.0.0.1", 8000),
                ServerDescriptor::new("vm2.example.com", 8001)
            ]
        );
    }

    #[test]
    fn test_servers_file_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "127.0.0.1, 8000\nbroken line").unwrap();

        match read_servers_file(file.path()) {
            Err(ConfigError::ServersFile { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(
            read_servers_file(Path::new("/nonexistent/servers.conf")),
            Err(ConfigError::FileRead(..))
        ));
    }
}
