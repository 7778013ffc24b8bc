use std::{borrow::Cow, fmt, io::IsTerminal, net::IpAddr, path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand, ValueEnum};
use config::{Config, Window};
use logforth::filter::EnvFilter;
use rate_limit::RateLimitRequest;

#[derive(Debug, Parser)]
#[command(name = "ratelimit", version, long_about = concat!("ratelimit v", env!("CARGO_PKG_VERSION")))]
pub struct Args {
    /// Path to the TOML configuration file
    #[arg(long, short, env = "RATELIMIT_CONFIG_PATH", default_value = "./ratelimit.toml")]
    pub config: PathBuf,
    /// Set the logging level
    #[arg(long = "log", env = "RATELIMIT_LOG", default_value_t = LogLevel::default())]
    pub log_level: LogLevel,
    /// Set the style of log output
    #[arg(long, env = "RATELIMIT_LOG_STYLE", default_value_t = LogStyle::default())]
    pub log_style: LogStyle,
    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    pub fn config(&self) -> anyhow::Result<Config> {
        let config = if self.config.exists() {
            Config::load(&self.config)?
        } else {
            Config::default()
        };

        Ok(config)
    }
}

#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Take tokens for an identifier and print the decision
    Limit {
        identifier: String,
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Retry until the identifier is allowed or the timeout passes
    Wait {
        identifier: String,
        /// How long to keep trying, e.g. `5s`
        #[arg(long, default_value = "5s")]
        timeout: Window,
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Print the tokens left for an identifier
    Remaining { identifier: String },
    /// Forget everything counted for an identifier
    Reset { identifier: String },
    /// Manage the deny list
    #[command(subcommand)]
    DenyList(DenyListCommand),
    /// Print usage per identifier
    Usage {
        /// How far back to look, e.g. `24h`
        #[arg(long, default_value = "24h")]
        since: Window,
    },
}

#[derive(Debug, Subcommand)]
pub(crate) enum DenyListCommand {
    /// Fetch the IP deny list now
    Refresh,
    /// Drop the IP deny list, keeping manually denied values
    Disable,
    /// Deny identifiers, IPs, user agents or countries
    Add {
        #[arg(required = true)]
        values: Vec<String>,
    },
    /// Stop denying values
    Remove {
        #[arg(required = true)]
        values: Vec<String>,
    },
}

#[derive(Debug, clap::Args)]
pub(crate) struct RequestArgs {
    /// Client IP address
    #[arg(long)]
    pub ip: Option<IpAddr>,
    /// Client user agent
    #[arg(long)]
    pub user_agent: Option<String>,
    /// Client country code
    #[arg(long)]
    pub country: Option<String>,
    /// Tokens to take
    #[arg(long, default_value_t = 1)]
    pub rate: u64,
}

impl RequestArgs {
    pub fn request(&self) -> RateLimitRequest {
        let mut builder = RateLimitRequest::builder().rate(self.rate);

        if let Some(ip) = self.ip {
            builder = builder.ip(ip);
        }

        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent);
        }

        if let Some(country) = &self.country {
            builder = builder.country(country);
        }

        builder.build()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub(crate) enum LogStyle {
    /// Colorized text, used as the default with TTY output
    Color,
    /// Standard text, used as the default with non-TTY output
    Text,
    /// JSON objects
    Json,
}

impl Default for LogStyle {
    fn default() -> Self {
        if std::io::stderr().is_terminal() {
            LogStyle::Color
        } else {
            LogStyle::Text
        }
    }
}

impl AsRef<str> for LogStyle {
    fn as_ref(&self) -> &str {
        match self {
            LogStyle::Color => "color",
            LogStyle::Text => "text",
            LogStyle::Json => "json",
        }
    }
}

impl fmt::Display for LogStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub(crate) enum LogLevel {
    /// Disable logging
    Off,
    /// Only log errors
    Error,
    /// Log errors, and warnings
    #[default]
    Warn,
    /// Log errors, warnings, and info messages
    Info,
    /// Log errors, warnings, info, and debug messages
    Debug,
    /// Log errors, warnings, info, debug, and trace messages
    Trace,
}

impl LogLevel {
    pub fn env_filter(self) -> EnvFilter {
        let filter_str = match self {
            LogLevel::Off => Cow::Borrowed("off"),
            // Dependencies stay at 'warn', workspace crates use the selected level.
            level => Cow::Owned(format!(
                "warn,ratelimit={level},rate_limit={level},config={level},telemetry={level}"
            )),
        };

        EnvFilter::from_str(&filter_str).expect("These all are valid env filters.")
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl AsRef<str> for LogLevel {
    fn as_ref(&self) -> &str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}
