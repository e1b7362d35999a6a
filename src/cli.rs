use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "castbridge")]
#[command(author, version, about = "On-demand HLS transcoding bridge for cast receivers")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HLS server, optionally streaming a source right away
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Port to listen on (0 = ephemeral)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Source URL to start streaming immediately
        #[arg(long)]
        url: Option<String>,

        /// Title hint for transcode classification
        #[arg(long)]
        title: Option<String>,

        /// Wait for the full download before transcoding
        #[arg(long)]
        wait_complete: bool,
    },

    /// Classify a source without starting it
    Classify {
        /// Source URL
        url: String,

        /// Title hint
        #[arg(long)]
        title: Option<String>,
    },

    /// Display version information
    Version,
}
