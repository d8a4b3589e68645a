use clap::{Parser, Subcommand};

mod demo;

use demo::{run_classify, run_coordinate, run_route};

#[derive(Parser, Debug)]
#[command(name = "conclave", version = "0.1.0")]
#[command(about = "Conclave CLI - run coordinator and router demos on the configured bus")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one query through worker and evaluator
    Coordinate {
        /// Query text
        #[arg(long)]
        query: String,
        /// Skip the evaluation hop
        #[arg(long)]
        no_evaluator: bool,
        /// Seconds to wait for the workflow to finish
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
    /// Route queries to specialized workers
    Route {
        /// Query text, repeatable
        #[arg(long = "query", required = true)]
        queries: Vec<String>,
        /// Load-balancing strategy (defaults to CONCLAVE_ROUTER_STRATEGY)
        #[arg(long)]
        strategy: Option<String>,
        /// Seconds to wait for expert answers
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
    /// Print the category a query is classified into
    Classify {
        /// Query text
        query: String,
    },
}

#[tokio::main]
async fn main() {
    // Initialize JSON logging once.
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let env_filter = match "info".parse() {
        Ok(directive) => env_filter.add_directive(directive),
        Err(_) => env_filter,
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .try_init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Coordinate {
            query,
            no_evaluator,
            timeout,
        } => run_coordinate(&query, !no_evaluator, timeout).await,
        Commands::Route {
            queries,
            strategy,
            timeout,
        } => run_route(&queries, strategy.as_deref(), timeout).await,
        Commands::Classify { query } => {
            run_classify(&query);
            Ok(())
        }
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "Command failed");
        std::process::exit(1);
    }
}
