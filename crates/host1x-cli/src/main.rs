//! `host1x-ctl` — a harness for exercising the host1x job lifecycle
//! against an in-process simulated channel backend. There is no real
//! Tegra SoC behind this: `submit`/`bench`/`hang` all stand up their own
//! [`host1x_core::backend::SimChannelBackend`] and tear it down when the
//! process exits.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "host1x-ctl")]
#[command(about = "Exercise the host1x job lifecycle against a simulated channel backend")]
#[command(version = host1x_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a single trivial job to completion and print its fence result.
    Submit {
        /// Push-buffer ring size for the one channel this creates, in words.
        #[arg(long, default_value = "4096")]
        ring_words: usize,
    },

    /// Print a point-in-time debug dump of a freshly-built device.
    Dump {
        /// Submit this many trivial jobs before dumping.
        #[arg(long, default_value = "0")]
        jobs: usize,

        /// Print JSON instead of the plain-text rendering.
        #[arg(long)]
        json: bool,
    },

    /// Push-buffer wraparound stress: submit many tiny jobs through a
    /// small ring to exercise wraparound and report how many completed.
    Bench {
        /// Push-buffer ring size, in words. Small on purpose to force wraps.
        #[arg(long, default_value = "64")]
        ring_words: usize,

        /// Number of jobs to submit.
        #[arg(long, default_value = "200")]
        jobs: usize,
    },

    /// Force the timeout/recovery path: stall the backend mid-job, then
    /// invoke the ten-step recovery sequence and print the resulting
    /// fence error.
    Hang,

    /// Run the HTTP introspection server over a freshly-built, idle device.
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value = "8080")]
        port: u16,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Submit { ring_words } => commands::submit::run(ring_words),
        Commands::Dump { jobs, json } => commands::dump::run(jobs, json),
        Commands::Bench { ring_words, jobs } => commands::bench::run(ring_words, jobs),
        Commands::Hang => commands::hang::run(),
        Commands::Serve { host, port } => commands::serve::run(&host, port),
    }
}
