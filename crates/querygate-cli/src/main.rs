use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::Outcome;

#[derive(Parser, Debug)]
#[command(name = "querygate", version, about = "Authorize, rewrite and mask ad-hoc SQL")]
struct Cli {
    /// Log filter used when RUST_LOG is not set. Logs go to stderr.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full authorization pipeline and print the rewritten query.
    Check(commands::check::CheckArgs),

    /// Run only the statement safety check and print the cleaned SQL.
    Safety {
        #[arg(long)]
        sql: String,

        /// Allow non-read statements (operator-configured SQL only)
        #[arg(long, default_value_t = false)]
        allow_all_ops: bool,
    },

    /// Print the tables, columns and scopes extracted from a query.
    Extract {
        #[arg(long)]
        sql: String,
    },

    /// Mask a query result (JSON) for a principal.
    Mask(commands::mask::MaskArgs),
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let outcome = match &cli.cmd {
        Command::Check(args) => commands::check::run(args)?,
        Command::Safety { sql, allow_all_ops } => commands::safety::run(sql, *allow_all_ops)?,
        Command::Extract { sql } => commands::extract::run(sql)?,
        Command::Mask(args) => commands::mask::run(args)?,
    };

    print(&outcome)
}

fn print(outcome: &Outcome) -> anyhow::Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(&outcome.output)?);
    Ok(if outcome.allowed {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}
