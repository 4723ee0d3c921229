use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[command(name = "use-stage")]
#[command(about = "Run newline-delimited records from stdin through transform stages")]
pub struct CliConfig {
    #[arg(long, help = "Pipeline TOML file; defaults to a single pass-through stage")]
    pub config: Option<String>,

    #[arg(long, help = "Stop at the first stage error")]
    pub fail_fast: bool,

    #[arg(long, help = "Print the execution summary as JSON on stderr")]
    pub summary: bool,

    #[arg(long, help = "Emit logs as JSON")]
    pub json_logs: bool,

    #[arg(long, help = "Enable verbose output (also logs panics contained inside stages)")]
    pub verbose: bool,
}
