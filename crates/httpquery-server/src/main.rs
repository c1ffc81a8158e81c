//! HttpQuery server — entry point.

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use httpquery::{compile, Dataset, Query, ResponseEnvelope, DEFAULT_PARAMETER};
use httpquery_server::config::{ConfigOverrides, ServerConfig};
use httpquery_server::surfaces::build_routes;
use httpquery_server::{HttpTransport, QueryService};

#[derive(Parser)]
#[command(
    name = "httpquery",
    about = "Answer LINQ-style query expressions sent with the HTTP QUERY verb",
    version
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Default)]
struct ServeArgs {
    /// Listen address (host:port). Also reads HTTPQUERY_ADDR.
    #[arg(long)]
    addr: Option<String>,

    /// Records generated per request. Also reads HTTPQUERY_DATASET_SIZE.
    #[arg(long)]
    dataset_size: Option<usize>,

    /// Largest size accepted by /api/people/{count}.
    #[arg(long)]
    max_dataset_size: Option<usize>,

    /// Largest accepted request body. Also reads HTTPQUERY_MAX_BODY_BYTES.
    #[arg(long)]
    max_body_bytes: Option<usize>,

    /// Compiled-query cache entries, 0 to disable. Also reads HTTPQUERY_CACHE_CAPACITY.
    #[arg(long)]
    cache_capacity: Option<usize>,

    /// Include full error detail in failure responses.
    #[arg(long)]
    diagnostics: bool,

    /// Public base URL used for absolute links. Also reads HTTPQUERY_PUBLIC_URL.
    #[arg(long)]
    public_url: Option<String>,
}

impl ServeArgs {
    fn into_overrides(self) -> ConfigOverrides {
        ConfigOverrides {
            addr: self.addr,
            dataset_size: self.dataset_size,
            max_dataset_size: self.max_dataset_size,
            max_body_bytes: self.max_body_bytes,
            cache_capacity: self.cache_capacity,
            diagnostics: self.diagnostics.then_some(true),
            public_url: self.public_url,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server (default).
    Serve(ServeArgs),

    /// Evaluate an expression locally and print the response body.
    Eval {
        /// Query expression, e.g. "people.Take(3)".
        expr: String,

        /// Records to generate.
        #[arg(long, default_value_t = Dataset::DEFAULT_SIZE)]
        size: usize,

        /// Include full error detail.
        #[arg(long)]
        diagnostics: bool,
    },

    /// Compile an expression without running it.
    Check {
        /// Query expression.
        expr: String,
    },

    /// Print the query route table.
    Routes,

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   httpquery completions bash > ~/.local/share/bash-completion/completions/httpquery
    ///   httpquery completions zsh > ~/.zfunc/_httpquery
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command.unwrap_or(Commands::Serve(ServeArgs::default())) {
        Commands::Serve(args) => {
            let config = ServerConfig::resolve(args.into_overrides())?;
            tracing::info!("HttpQuery server");
            tracing::info!(
                dataset_size = config.dataset_size,
                cache_capacity = config.cache_capacity,
                diagnostics = config.diagnostics,
                "configuration resolved"
            );
            let transport = HttpTransport::new(config)?;
            transport.run().await?;
        }

        Commands::Eval {
            expr,
            size,
            diagnostics,
        } => {
            let service = QueryService::new(&ServerConfig {
                diagnostics,
                ..ServerConfig::default()
            });
            let envelope: ResponseEnvelope = service.run(Query::from_text(expr), None, size);
            println!("{}", serde_json::to_string_pretty(&envelope)?);
            if !envelope.is_success() {
                std::process::exit(1);
            }
        }

        Commands::Check { expr } => match compile(DEFAULT_PARAMETER, &expr) {
            Ok(query) => println!("ok: {}", query.output_type()),
            Err(e) => {
                match (e.position(), e.token()) {
                    (Some(pos), Some(token)) => eprintln!("{e} (at {pos}, near '{token}')"),
                    _ => eprintln!("{e}"),
                }
                std::process::exit(1);
            }
        },

        Commands::Routes => {
            let service = std::sync::Arc::new(QueryService::new(&ServerConfig::default()));
            let routes = build_routes(service)?;
            for route in routes.registrations() {
                println!(
                    "{:<7} {:<24} {}",
                    route.method,
                    route.template,
                    route.name.as_deref().unwrap_or("-")
                );
            }
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "httpquery", &mut std::io::stdout());
        }
    }

    Ok(())
}
