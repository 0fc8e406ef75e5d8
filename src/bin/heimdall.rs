//! heimdall: Steam Web API access from the command line
//!
//! Runs requests through the same cache and admission controls a bot
//! would use, which makes it handy for checking config and credentials.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use heimdall::{Config, EndpointClass, HeimdallBuilder, Parameters, Secrets};

/// Heimdall CLI
#[derive(Parser)]
#[command(name = "heimdall")]
#[command(version)]
#[command(about = "Cached, rate-limited Steam Web API client")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "HEIMDALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch one endpoint and print the JSON payload
    Fetch {
        /// Endpoint class (e.g. "profile", "player_count")
        endpoint: EndpointClass,
        /// Parameters as key=value pairs
        #[arg(value_parser = parse_param)]
        params: Vec<(String, String)>,
        /// Caller identity charged for the request
        #[arg(long, default_value = "cli")]
        caller: String,
        /// Issue the request this many times (later ones should hit the cache)
        #[arg(long, default_value_t = 1)]
        repeat: u32,
        /// Print executor statistics afterwards
        #[arg(long)]
        stats: bool,
    },

    /// List endpoint classes with their parameters and effective TTL
    Endpoints,

    /// Print the effective configuration as TOML
    Config,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing (default: warn for CLI; override with RUST_LOG).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    match args.command {
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }

        Command::Endpoints => {
            for endpoint in EndpointClass::ALL {
                let policy = config.endpoint_policy(endpoint);
                let params: Vec<String> = endpoint
                    .params()
                    .iter()
                    .map(|p| {
                        if p.required {
                            p.name.to_string()
                        } else {
                            format!("[{}]", p.name)
                        }
                    })
                    .collect();
                println!(
                    "{:<14} ttl={:>5}s  scope={:<10}  key={:<5}  {}",
                    endpoint.as_str(),
                    policy.ttl.as_secs(),
                    format!("{:?}", policy.scope),
                    endpoint.requires_key(),
                    params.join(" "),
                );
            }
        }

        Command::Fetch {
            endpoint,
            params,
            caller,
            repeat,
            stats,
        } => {
            let secrets = Secrets::load()?;
            let steam = HeimdallBuilder::from_config(&config, &secrets).build()?;
            let params: Parameters = params.into_iter().collect();

            for _ in 0..repeat.max(1) {
                let payload = steam.request(endpoint, params.clone(), &caller).await?;
                println!("{}", serde_json::to_string_pretty(&payload.value()?)?);
            }

            if stats {
                let s = steam.stats();
                let cache = steam.admin().cache_stats();
                eprintln!("requests:        {}", s.requests);
                eprintln!("cache hits:      {}", s.cache_hits);
                eprintln!("cache misses:    {}", s.cache_misses);
                eprintln!("upstream:        {}", s.upstream_fetches);
                eprintln!("errors:          {}", s.errors);
                eprintln!("avg latency:     {:?}", s.average_latency);
                eprintln!("cache entries:   {}/{}", cache.len, cache.capacity);
            }
        }
    }

    Ok(())
}
