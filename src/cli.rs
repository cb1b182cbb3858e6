use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

use crate::config::{DEFAULT_CONFIG_PATH, DEFAULT_TEAM_PATH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Auto,
    Openai,
    Deepseek,
    Groq,
    Ollama,
}

#[derive(Debug, Subcommand)]
pub enum TeamCommands {
    #[command(about = "Show the resolved team: agents, capacities, tools and routing table")]
    Show,
}

#[derive(Debug, Subcommand)]
pub enum TelemetryCommands {
    #[command(about = "Summarize telemetry events from a JSONL stream")]
    Report {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

const CLI_EXAMPLES: &str = "Examples:\n\
  teamcheck run \"Please check if the 'name' attribute of the Protein node Q4G0T1 is correct.\"\n\
  teamcheck --provider openai --model gpt-4o-mini run --transcript \"...\"\n\
  teamcheck batch --dataset data/kgcheck.json --output .teamcheck/results/kgcheck.json --concurrency 8\n\
  teamcheck evaluate --results .teamcheck/results/kgcheck.json --golden data/kgcheck.json\n\
  teamcheck --team-path .teamcheck/team.toml team show\n\
  teamcheck telemetry report --limit 2000\n\
\n\
Configuration precedence: command-line flags, then the selected [profiles.<name>] section\n\
of --config-path, then built-in defaults.";

#[derive(Debug, Parser)]
#[command(name = "teamcheck")]
#[command(about = "Multi-agent conversation scheduler for LLM verification teams")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "TEAMCHECK_PROVIDER", value_enum, default_value_t = Provider::Auto)]
    pub provider: Provider,

    #[arg(long, env = "TEAMCHECK_MODEL")]
    pub model: Option<String>,

    /// Model used only for JSON format-correction calls.
    #[arg(long, env = "TEAMCHECK_FORMATTER_MODEL")]
    pub formatter_model: Option<String>,

    #[arg(long, env = "TEAMCHECK_BASE_URL")]
    pub base_url: Option<String>,

    #[arg(long, env = "TEAMCHECK_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<u64>,

    #[arg(long, env = "TEAMCHECK_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "TEAMCHECK_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config_path: String,

    #[arg(long, env = "TEAMCHECK_TEAM", default_value = DEFAULT_TEAM_PATH)]
    pub team_path: String,

    #[arg(long, env = "TEAMCHECK_MAX_STEPS")]
    pub max_steps: Option<usize>,

    #[arg(long, env = "TEAMCHECK_TOOL_TIMEOUT_SECS")]
    pub tool_timeout_secs: Option<u64>,

    #[arg(long, env = "TEAMCHECK_TOOL_RETRY_ATTEMPTS")]
    pub tool_retry_attempts: Option<u32>,

    #[arg(long, env = "TEAMCHECK_TOOL_RETRY_DELAY_MS")]
    pub tool_retry_delay_ms: Option<u64>,

    #[arg(long, env = "TEAMCHECK_TELEMETRY_ENABLED", action = clap::ArgAction::Set)]
    pub telemetry_enabled: Option<bool>,

    #[arg(long, env = "TEAMCHECK_TELEMETRY_PATH")]
    pub telemetry_path: Option<String>,

    #[arg(long, env = "RUST_LOG", default_value = "warn")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Run one instruction through the team and print the answer")]
    Run {
        #[arg(required = true)]
        instruction: Vec<String>,
        /// Also print every message of the conversation.
        #[arg(long, default_value_t = false)]
        transcript: bool,
    },
    #[command(about = "Run every instruction of a JSON dataset on isolated team instances")]
    Batch {
        #[arg(long)]
        dataset: String,
        #[arg(long, default_value = ".teamcheck/results/results.json")]
        output: String,
        /// Defaults to `<output stem>.failures.json` next to the results.
        #[arg(long)]
        failures: Option<String>,
        #[arg(long, env = "TEAMCHECK_CONCURRENCY")]
        concurrency: Option<usize>,
    },
    #[command(about = "Score a results file against golden labels (EM and executability)")]
    Evaluate {
        #[arg(long)]
        results: String,
        #[arg(long)]
        golden: String,
        #[arg(long)]
        output: Option<String>,
        #[arg(long, default_value_t = 0.0)]
        fail_under: f64,
    },
    #[command(about = "Inspect the configured team")]
    Team {
        #[command(subcommand)]
        command: TeamCommands,
    },
    #[command(about = "Telemetry utilities and reporting")]
    Telemetry {
        #[command(subcommand)]
        command: TelemetryCommands,
    },
}

pub fn command_label(command: &Commands) -> String {
    match command {
        Commands::Run { .. } => "run".to_string(),
        Commands::Batch { .. } => "batch".to_string(),
        Commands::Evaluate { .. } => "evaluate".to_string(),
        Commands::Team { command } => match command {
            TeamCommands::Show => "team.show".to_string(),
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { .. } => "telemetry.report".to_string(),
        },
    }
}
