//! CLI for the GDM group download manager.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use gdm_core::config;
use std::path::PathBuf;

use commands::{run_clean, run_completions, run_group, run_probe, RunArgs};

/// Top-level CLI for the GDM download manager.
#[derive(Debug, Parser)]
#[command(name = "gdm")]
#[command(about = "GDM: bounded, resumable group downloads", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Download a batch of URLs as one group. Ctrl-C stops it; partial
    /// files are kept and the next run resumes them.
    Run {
        /// Direct HTTP/HTTPS URLs to download.
        urls: Vec<String>,

        /// File with one `URL [PATH] [WEIGHT]` entry per line (`#` starts a comment).
        #[arg(long, short, value_name = "FILE")]
        input: Option<PathBuf>,

        /// Directory for downloads without an explicit path (default: current directory).
        #[arg(long, short, value_name = "DIR")]
        dir: Option<PathBuf>,

        /// Maximum concurrent downloads (default from config).
        #[arg(long, short, value_name = "N", value_parser = clap::value_parser!(u16).range(1..))]
        jobs: Option<u16>,

        /// Treat an existing non-empty destination as done without asking the server.
        #[arg(long)]
        local_only: bool,
    },

    /// Print the remote size of a URL.
    Probe {
        /// Direct HTTP/HTTPS URL.
        url: String,
    },

    /// Delete the partial download belonging to a destination path.
    Clean {
        /// Destination path of the download (not the `.part` file).
        path: PathBuf,
    },

    /// Print shell completions to stdout.
    Completions {
        shell: Shell,
    },
}

impl CliCommand {
    /// Parse arguments and run the command. Returns the process exit code.
    pub async fn run_from_args() -> Result<i32> {
        let cli = Cli::parse();

        if let CliCommand::Completions { shell } = cli.command {
            run_completions(shell);
            return Ok(0);
        }

        let cfg = config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);

        match cli.command {
            CliCommand::Run {
                urls,
                input,
                dir,
                jobs,
                local_only,
            } => {
                let dir = match dir {
                    Some(d) => d,
                    None => std::env::current_dir()?,
                };
                let args = RunArgs {
                    urls,
                    input,
                    dir,
                    jobs: jobs.map(usize::from),
                    local_only,
                };
                run_group(&cfg, args).await
            }
            CliCommand::Probe { url } => {
                run_probe(&cfg, &url).await?;
                Ok(0)
            }
            CliCommand::Clean { path } => {
                run_clean(&path)?;
                Ok(0)
            }
            CliCommand::Completions { .. } => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests;
