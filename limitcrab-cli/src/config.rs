//! CLI configuration
//!
//! Every option can be given on the command line or through an environment
//! variable with the LIMITCRAB_ prefix. Precedence:
//! 1. CLI arguments (highest priority)
//! 2. Environment variables
//! 3. Default values (lowest priority)
//!
//! ```bash
//! # Ten takes against a local server, 5 per second
//! limitcrab --tokens 5 --interval-ms 1000 --count 10 api_key_12345
//!
//! # Same, configured from the environment
//! export LIMITCRAB_HOST=redis.internal
//! export LIMITCRAB_FAILURE_MODE=fail-open
//! limitcrab --count 10 api_key_12345
//! ```

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use limitcrab::{Credentials, FailureMode, TcpConnector};
use std::path::PathBuf;
use std::time::Duration;

/// Where the store lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    Unix(PathBuf),
}

/// Settings for one CLI run
#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint: Endpoint,
    pub connect_timeout: Duration,
    pub credentials: Option<Credentials>,
    pub tokens: u64,
    pub interval: Duration,
    /// Key expiry in seconds; 0 picks the library default
    pub ttl: u64,
    pub initial_pool_size: usize,
    pub max_pool_size: usize,
    pub failure_mode: FailureMode,
    /// Key to take tokens from
    pub key: String,
    /// Number of takes to run
    pub count: u32,
    /// Pause between consecutive takes
    pub pause: Duration,
    /// Logging level (error, warn, info, debug, trace)
    pub log_level: String,
}

/// Command-line arguments
///
/// All arguments can also be set via environment variables with the
/// LIMITCRAB_ prefix. CLI arguments take precedence over environment variables.
#[derive(Parser, Debug)]
#[command(
    name = "limitcrab",
    about = "Take tokens from a distributed rate limiter",
    long_about = "Take tokens from a token bucket rate limiter whose state lives in a Redis-compatible server.\n\nEnvironment variables with LIMITCRAB_ prefix are supported. CLI arguments take precedence over environment variables."
)]
pub struct Args {
    /// Key to take tokens from
    #[arg(value_name = "KEY", env = "LIMITCRAB_KEY")]
    pub key: Option<String>,

    // Server
    #[arg(
        long,
        value_name = "HOST",
        help = "Server host",
        default_value = "127.0.0.1",
        env = "LIMITCRAB_HOST"
    )]
    pub host: String,
    #[arg(
        long,
        value_name = "PORT",
        help = "Server port",
        default_value_t = 6379,
        env = "LIMITCRAB_PORT"
    )]
    pub port: u16,
    #[arg(
        long,
        value_name = "PATH",
        help = "Unix socket path (overrides host and port)",
        env = "LIMITCRAB_SOCKET"
    )]
    pub socket: Option<PathBuf>,
    #[arg(
        long,
        value_name = "MS",
        help = "Connect timeout in milliseconds",
        default_value_t = 1000,
        env = "LIMITCRAB_CONNECT_TIMEOUT_MS"
    )]
    pub connect_timeout_ms: u64,
    #[arg(
        long,
        value_name = "NAME",
        help = "Username for AUTH",
        env = "LIMITCRAB_USERNAME"
    )]
    pub username: Option<String>,
    #[arg(
        long,
        value_name = "PASSWORD",
        help = "Password for AUTH",
        env = "LIMITCRAB_PASSWORD",
        hide_env_values = true
    )]
    pub password: Option<String>,

    // Bucket
    #[arg(
        long,
        value_name = "N",
        help = "Bucket size",
        default_value_t = 1,
        env = "LIMITCRAB_TOKENS"
    )]
    pub tokens: u64,
    #[arg(
        long,
        value_name = "MS",
        help = "Time to refill a full bucket, in milliseconds",
        default_value_t = 1000,
        env = "LIMITCRAB_INTERVAL_MS"
    )]
    pub interval_ms: u64,
    #[arg(
        long,
        value_name = "SECS",
        help = "Key expiry in seconds (0 = ten intervals)",
        default_value_t = 0,
        env = "LIMITCRAB_TTL"
    )]
    pub ttl: u64,

    // Pool
    #[arg(
        long,
        value_name = "N",
        help = "Connections opened up front",
        default_value_t = 5,
        env = "LIMITCRAB_INITIAL_POOL_SIZE"
    )]
    pub initial_pool_size: usize,
    #[arg(
        long,
        value_name = "N",
        help = "Maximum live connections",
        default_value_t = 100,
        env = "LIMITCRAB_MAX_POOL_SIZE"
    )]
    pub max_pool_size: usize,
    #[arg(
        long,
        value_name = "MODE",
        help = "Answer when the store is unavailable: fail-open, fail-closed",
        default_value = "fail-closed",
        env = "LIMITCRAB_FAILURE_MODE"
    )]
    pub failure_mode: FailureMode,

    // Run
    #[arg(
        long,
        value_name = "N",
        help = "Number of takes to run",
        default_value_t = 1,
        env = "LIMITCRAB_COUNT"
    )]
    pub count: u32,
    #[arg(
        long,
        value_name = "MS",
        help = "Pause between takes in milliseconds",
        default_value_t = 0,
        env = "LIMITCRAB_PAUSE_MS"
    )]
    pub pause_ms: u64,
    #[arg(
        long,
        value_name = "LEVEL",
        help = "Log level: error, warn, info, debug, trace",
        default_value = "warn",
        env = "LIMITCRAB_LOG_LEVEL"
    )]
    pub log_level: String,

    // Utility options
    #[arg(
        long,
        help = "List all environment variables and exit",
        action = clap::ArgAction::SetTrue
    )]
    pub list_env_vars: bool,
}

impl Config {
    /// Build configuration from environment variables and CLI arguments
    pub fn from_env_and_args() -> Result<Self> {
        let args = Args::parse();

        if args.list_env_vars {
            Self::print_env_vars();
            std::process::exit(0);
        }

        Self::from_args(args)
    }

    /// Build and validate configuration from already parsed arguments
    pub fn from_args(args: Args) -> Result<Self> {
        let endpoint = match args.socket {
            #[cfg(unix)]
            Some(path) => Endpoint::Unix(path),
            #[cfg(not(unix))]
            Some(_) => return Err(anyhow!("--socket is only supported on unix")),
            None => Endpoint::Tcp {
                host: args.host,
                port: args.port,
            },
        };

        let credentials = match (args.username, args.password) {
            (username, Some(password)) => Some(Credentials::new(username, password)),
            (Some(_), None) => return Err(anyhow!("--username requires --password")),
            (None, None) => None,
        };

        let config = Config {
            endpoint,
            connect_timeout: Duration::from_millis(args.connect_timeout_ms),
            credentials,
            tokens: args.tokens,
            interval: Duration::from_millis(args.interval_ms),
            ttl: args.ttl,
            initial_pool_size: args.initial_pool_size,
            max_pool_size: args.max_pool_size,
            failure_mode: args.failure_mode,
            key: args.key.unwrap_or_default(),
            count: args.count,
            pause: Duration::from_millis(args.pause_ms),
            log_level: args.log_level,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(anyhow!(
                "A key is required.\n\n\
                Example:\n  \
                limitcrab --tokens 5 api_key_12345\n  \
                LIMITCRAB_KEY=api_key_12345 limitcrab\n\n\
                For more information, try '--help'"
            ));
        }

        if self.count == 0 {
            return Err(anyhow!("--count must be at least 1"));
        }

        if self.max_pool_size != 0 && self.initial_pool_size > self.max_pool_size {
            return Err(anyhow!(
                "--initial-pool-size ({}) cannot exceed --max-pool-size ({})",
                self.initial_pool_size,
                self.max_pool_size
            ));
        }

        Ok(())
    }

    /// Translate into the library configuration, resolving the server address
    pub async fn store_config(&self) -> Result<limitcrab::Config> {
        let mut config = limitcrab::Config::new()
            .tokens(self.tokens)
            .interval(self.interval)
            .ttl(self.ttl)
            .initial_pool_size(self.initial_pool_size)
            .max_pool_size(self.max_pool_size)
            .failure_mode(self.failure_mode);

        if let Some(credentials) = &self.credentials {
            config = config.credentials(credentials.clone());
        }

        let config = match &self.endpoint {
            Endpoint::Tcp { host, port } => {
                let addr = tokio::net::lookup_host((host.as_str(), *port))
                    .await
                    .with_context(|| format!("failed to resolve {host}:{port}"))?
                    .next()
                    .ok_or_else(|| anyhow!("{host}:{port} did not resolve to any address"))?;
                config.connector(TcpConnector::new(addr).connect_timeout(self.connect_timeout))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                config.connector(limitcrab::connector::UnixConnector::new(path.clone()))
            }
        };

        Ok(config)
    }

    fn print_env_vars() {
        println!("limitcrab Environment Variables");
        println!("===============================");
        println!();
        println!("All environment variables use the LIMITCRAB_ prefix.");
        println!("CLI arguments take precedence over environment variables.");
        println!();

        println!("Server Connection:");
        println!("  LIMITCRAB_HOST=<host>                 Server host [default: 127.0.0.1]");
        println!("  LIMITCRAB_PORT=<port>                 Server port [default: 6379]");
        println!("  LIMITCRAB_SOCKET=<path>               Unix socket path (overrides host and port)");
        println!("  LIMITCRAB_CONNECT_TIMEOUT_MS=<ms>     Connect timeout [default: 1000]");
        println!("  LIMITCRAB_USERNAME=<name>             Username for AUTH");
        println!("  LIMITCRAB_PASSWORD=<password>         Password for AUTH");
        println!();

        println!("Bucket Configuration:");
        println!("  LIMITCRAB_TOKENS=<n>                  Bucket size [default: 1]");
        println!("  LIMITCRAB_INTERVAL_MS=<ms>            Time to refill a full bucket [default: 1000]");
        println!("  LIMITCRAB_TTL=<secs>                  Key expiry, 0 = ten intervals [default: 0]");
        println!();

        println!("Pool Configuration:");
        println!("  LIMITCRAB_INITIAL_POOL_SIZE=<n>       Connections opened up front [default: 5]");
        println!("  LIMITCRAB_MAX_POOL_SIZE=<n>           Maximum live connections [default: 100]");
        println!(
            "  LIMITCRAB_FAILURE_MODE=<mode>         fail-open or fail-closed [default: fail-closed]"
        );
        println!();

        println!("Run Configuration:");
        println!("  LIMITCRAB_KEY=<key>                   Key to take tokens from");
        println!("  LIMITCRAB_COUNT=<n>                   Number of takes [default: 1]");
        println!("  LIMITCRAB_PAUSE_MS=<ms>               Pause between takes [default: 0]");
        println!(
            "  LIMITCRAB_LOG_LEVEL=<level>           Log level: error, warn, info, debug, trace [default: warn]"
        );
        println!();

        println!("Examples:");
        println!("  # Allow 100 takes per minute, keep serving if the server is down");
        println!("  export LIMITCRAB_TOKENS=100");
        println!("  export LIMITCRAB_INTERVAL_MS=60000");
        println!("  export LIMITCRAB_FAILURE_MODE=fail-open");
        println!();
        println!("  # Run (CLI args override env vars)");
        println!("  limitcrab --tokens 10 user:123  # Uses 10 tokens, not 100");
    }
}
