use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "strata",
    about = "Strata: object graph change tracking and commit planning",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Validate a mapping file and summarize its entities
    Check(CheckArgs),
    /// Show the table order commits write in
    Order(OrderArgs),
    /// Show the effective domain configuration
    Config(ConfigArgs),
    /// Run a sample insert, update, and cascade delete in memory
    Demo(DemoArgs),
}

#[derive(Args)]
pub struct CheckArgs {
    pub mapping: String,
}

#[derive(Args)]
pub struct OrderArgs {
    pub mapping: String,
}

#[derive(Args)]
pub struct ConfigArgs {
    pub path: Option<String>,
}

#[derive(Args)]
pub struct DemoArgs {
    /// Domain configuration file
    #[arg(short, long)]
    pub config: Option<String>,
}
