//! carve: run extraction configs from the command line.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use carve_cli::config::{load_config, resolve_config_path};
use carve_cli::runner::{build_carver, render, run_items, select_items, validate};

#[derive(Parser)]
#[command(
    name = "carve",
    about = "Fetch documents and carve typed JSON trees out of them",
    version
)]
struct Cli {
    /// Path to a .json, .yaml or .yml config file.
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured items once and print their trees as JSON.
    Run {
        /// Only run these items (repeatable). Runs everything when omitted.
        #[arg(short, long = "item")]
        items: Vec<String>,

        /// Emit compact JSON instead of pretty-printed.
        #[arg(long)]
        compact: bool,
    },

    /// Check a config file without fetching anything.
    Validate,

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   carve completions bash > ~/.local/share/bash-completion/completions/carve
    ///   carve completions zsh > ~/.zfunc/_carve
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

    match cli.command {
        Commands::Run { items, compact } => {
            let path = resolve_config_path(cli.config.as_deref());
            let config = load_config(&path)?;
            tracing::info!("Config: {}", path.display());

            let carver = build_carver(&config)?;
            let selected = select_items(&config, &items)?;
            let outcomes = run_items(&carver, &selected).await;

            let trees = render(&outcomes);
            let out = if compact {
                serde_json::to_string(&trees)?
            } else {
                serde_json::to_string_pretty(&trees)?
            };
            println!("{out}");

            let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
            if failed > 0 {
                anyhow::bail!("{failed} of {} item(s) failed", outcomes.len());
            }
        }

        Commands::Validate => {
            let path = resolve_config_path(cli.config.as_deref());
            let config = load_config(&path)?;
            let report = validate(&config);
            if report.is_valid() {
                println!("Valid config: {}", path.display());
                println!("  Items: {}", report.items);
                println!("  References: {}", report.references);
                println!("  Expressions: {} ({} templated)", report.expressions, report.templated);
            } else {
                eprintln!("Invalid config: {}", path.display());
                for problem in &report.problems {
                    eprintln!("  {problem}");
                }
                std::process::exit(1);
            }
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "carve", &mut std::io::stdout());
        }
    }

    Ok(())
}
