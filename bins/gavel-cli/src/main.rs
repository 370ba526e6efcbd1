mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gavel-cli")]
#[command(about = "Gavel CLI - Submit runs, inspect results and upload problem data", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a run of local source files against a problem version
    Submit {
        /// Problem version id
        #[arg(short, long)]
        problem: i64,

        /// Language id from languages.json (e.g., cpp, python3)
        #[arg(short, long)]
        language: String,

        /// Reuse an existing submission id
        #[arg(short, long)]
        submission: Option<i64>,

        /// Source files; stored under their file names
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Judge a run again under a new run id
    Rejudge {
        /// Run id to judge again
        run_id: i64,
    },

    /// Show a run with its case and group results
    Show {
        /// Run id
        run_id: i64,

        /// Print raw JSON instead of a table
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Store a problem version from a JSON file
    PutProblem {
        /// Path to the problem version JSON
        path: PathBuf,
    },

    /// Upload a test data file and print its content hash
    PutFile {
        /// Path to the file
        path: PathBuf,
    },

    /// Compare an output with a reference answer using the default validator
    Diff {
        /// Reference answer
        reference: PathBuf,

        /// Produced output
        output: PathBuf,

        /// Validator flags (e.g., case_sensitive, float_tolerance=1e-6)
        #[arg(short, long)]
        flag: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Submit {
            problem,
            language,
            submission,
            files,
        } => {
            commands::submit(problem, &language, submission, &files).await?;
        }
        Commands::Rejudge { run_id } => {
            commands::rejudge(run_id).await?;
        }
        Commands::Show { run_id, json } => {
            commands::show(run_id, json).await?;
        }
        Commands::PutProblem { path } => {
            commands::put_problem(&path).await?;
        }
        Commands::PutFile { path } => {
            commands::put_file(&path).await?;
        }
        Commands::Diff { reference, output, flag } => {
            if !commands::diff_files(&reference, &output, &flag)? {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
