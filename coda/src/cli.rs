use clap::Parser;

/// coda - terminal AI coding assistant
#[derive(Parser, Debug)]
#[command(name = "coda")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Provider name from providers.json (default: the configured active one)
    #[arg(long)]
    pub provider: Option<String>,

    /// Override the provider's API base URL
    #[arg(long, env = "CODA_BASE_URL")]
    pub api_base: Option<String>,

    /// API key (falls back to the stored key for the provider)
    #[arg(long, env = "CODA_API_KEY")]
    pub api_key: Option<String>,

    /// Override the provider's model
    #[arg(long, env = "CODA_MODEL")]
    pub model: Option<String>,

    /// Workspace directory tools operate in (default: current directory)
    #[arg(long)]
    pub workspace: Option<String>,

    /// Database file (default: ~/.coda/data.db)
    #[arg(long)]
    pub db: Option<String>,

    /// Verbose output (tool arguments, reasoning stream)
    #[arg(short, long)]
    pub verbose: bool,

    /// Run a single message and exit instead of starting the REPL
    pub message: Option<String>,
}
