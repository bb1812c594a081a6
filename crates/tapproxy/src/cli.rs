use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "tapproxy",
    version,
    about = "Intercepting TCP proxy with content rewriting and rule-based filtering"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "tapproxy.yaml")]
    pub config: PathBuf,

    /// Local address to listen on (overrides config file setting)
    #[arg(short, long)]
    pub local: Option<String>,

    /// Remote address to forward to (overrides config file setting)
    #[arg(short, long)]
    pub remote: Option<String>,

    /// Path to the rule file to watch (overrides config file setting)
    #[arg(long)]
    pub rules: Option<PathBuf>,

    /// Report-only regex matched against outbound chunks
    #[arg(long = "match", value_name = "REGEX")]
    pub match_pattern: Option<String>,

    /// Append a regex replacer, in the form 'pattern~replacement'
    #[arg(long, value_name = "REGEX~TEMPLATE")]
    pub replace: Option<String>,

    /// Dial the remote over TLS and relay it unencrypted locally
    #[arg(long)]
    pub unwrap_tls: bool,

    /// Disable Nagle's algorithm on both legs
    #[arg(short = 'n', long)]
    pub disable_nagle: bool,

    /// Trace relayed payloads as hex instead of text
    #[arg(short = 'x', long)]
    pub hex: bool,

    /// Increase verbosity (-v: debug, -vv: trace)
    #[arg(short, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
