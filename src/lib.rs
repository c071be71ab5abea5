pub mod config;
pub mod transport;
pub mod vector;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use config::ClientConfig;
use transport::TcpTransport;
use vector::{
    DistanceConfig, DistanceQuery, QueryVector, ScanOptions, SearchOptions, Vector, VectorClient,
    codec,
};

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "tvs",
    version,
    about = "Query a remote vector index: scans, KNN search and batched top-K distances"
)]
pub struct Cli {
    /// Server host (overrides TVS_HOST)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Server port (overrides TVS_PORT)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Increase log verbosity (-v debug, -vv trace); otherwise RUST_LOG applies
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List index names
    ScanIndex {
        /// Glob-style pattern for index names
        #[arg(long)]
        pattern: Option<String>,

        /// Page size hint
        #[arg(long, default_value_t = vector::DEFAULT_SCAN_COUNT)]
        count: usize,
    },
    /// List entry keys of an index
    Scan {
        index: String,

        /// Glob-style pattern for keys
        #[arg(long)]
        pattern: Option<String>,

        /// Page size hint
        #[arg(long, default_value_t = vector::DEFAULT_SCAN_COUNT)]
        count: usize,

        /// Attribute filter expression, e.g. 'age>30'
        #[arg(long)]
        filter: Option<String>,

        /// Only keys within --max-dist of this vector, e.g. '[0.1,0.2]'
        #[arg(long, requires = "max_dist")]
        vector: Option<String>,

        #[arg(long, requires = "vector")]
        max_dist: Option<f64>,
    },
    /// Approximate nearest neighbour search
    Knn {
        index: String,

        k: usize,

        /// Query vector in wire form, e.g. '[0.1,0.2]'
        vector: String,

        #[arg(long)]
        filter: Option<String>,

        /// Treat the query vector as binary
        #[arg(long, default_value_t = false)]
        binary: bool,

        /// Extra search parameter as name=value (repeatable), e.g. ef_search=100
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
    },
    /// Top-K distances between a vector and explicit keys
    Distance {
        index: String,

        /// Query vector in wire form, e.g. '[0.1,0.2]'
        vector: String,

        /// Candidate keys
        #[arg(required = true, num_args = 1..)]
        keys: Vec<String>,

        #[arg(long)]
        top_n: Option<usize>,

        /// Keys per server call (overrides TVS_GETDISTANCE_BATCH_SIZE)
        #[arg(long)]
        batch_size: Option<usize>,

        /// Concurrent server calls (overrides TVS_GETDISTANCE_PARALLELISM)
        #[arg(long)]
        parallelism: Option<usize>,

        #[arg(long)]
        max_dist: Option<f64>,

        #[arg(long)]
        filter: Option<String>,

        /// Treat the query vector as binary
        #[arg(long, default_value_t = false)]
        binary: bool,
    },
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate man page to stdout
    Man,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = ClientConfig::from_env();
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    match cli.command {
        Commands::ScanIndex { pattern, count } => {
            let options = ScanOptions {
                pattern,
                count,
                ..Default::default()
            };
            let client = VectorClient::new(TcpTransport::new(config));
            let names = client.scan_index(&options)?.collect_strings().await?;
            print_json(&names)
        }
        Commands::Scan {
            index,
            pattern,
            count,
            filter,
            vector,
            max_dist,
        } => {
            let options = ScanOptions {
                pattern,
                count,
                filter,
                vector: vector.as_deref().map(|v| parse_cli_vector(v, false)).transpose()?,
                max_dist,
            };
            let client = VectorClient::new(TcpTransport::new(config));
            let keys = client.scan(&index, &options)?.collect_strings().await?;
            print_json(&keys)
        }
        Commands::Knn {
            index,
            k,
            vector,
            filter,
            binary,
            params,
        } => {
            let query = parse_cli_vector(&vector, binary)?;
            let options = SearchOptions { filter, params };
            let client = VectorClient::new(TcpTransport::new(config));
            let results = client.knn_search(&index, k, &query, &options).await?;
            print_json(&results)
        }
        Commands::Distance {
            index,
            vector,
            keys,
            top_n,
            batch_size,
            parallelism,
            max_dist,
            filter,
            binary,
        } => {
            let mut distance_config = DistanceConfig::from_env();
            if let Some(n) = batch_size {
                distance_config.batch_size = n;
            }
            if let Some(n) = parallelism {
                distance_config.parallelism = n;
            }

            let query = DistanceQuery {
                top_n,
                max_dist,
                filter,
                ..DistanceQuery::new(index, parse_cli_vector(&vector, binary)?, keys)
            };
            let client = VectorClient::new(TcpTransport::new(config))
                .with_distance_config(distance_config);
            let results = client.top_k(&query).await?;
            print_json(&results)
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "tvs", &mut std::io::stdout());
            Ok(())
        }
        Commands::Man => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            let mut out = std::io::stdout();
            man.render(&mut out)?;
            Ok(())
        }
    }
}

/// Install the stderr log subscriber for the binary.
fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Decode a vector given on the command line in wire form.
fn parse_cli_vector(text: &str, binary: bool) -> Result<QueryVector> {
    let decoded = codec::decode(text.trim().as_bytes())
        .with_context(|| format!("invalid vector {:?}", text))?;
    Ok(Vector::new(decoded.to_f64(), binary).into())
}

fn parse_key_val(s: &str) -> Result<(String, String)> {
    let Some((name, value)) = s.split_once('=') else {
        bail!("expected name=value, got {:?}", s);
    };
    if name.is_empty() {
        bail!("empty parameter name in {:?}", s);
    }
    Ok((name.to_string(), value.to_string()))
}
