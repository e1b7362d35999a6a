mod cli;

use castbridge::config::Config;
use castbridge::server::{self, AppContext};
use castbridge::session::{SessionManager, StartOptions};
use castbridge::source::SourceDescriptor;
use castbridge_codec::CodecBackend;
use clap::Parser;
use cli::{Cli, Commands};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing. Respect RUST_LOG env var; otherwise use defaults
    // based on the verbose flag.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "castbridge=trace,castbridge_codec=debug,castbridge_media=debug,tower_http=debug"
                .to_string()
        } else {
            "castbridge=info,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&env_filter))
        .init();

    match cli.command {
        Commands::Serve {
            host,
            port,
            url,
            title,
            wait_complete,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(serve(
                host,
                port,
                url,
                title,
                wait_complete,
                cli.config.as_deref(),
            ))
        }
        Commands::Classify { url, title } => {
            let classification = castbridge::prescan::classify(Some(&url), title.as_deref());
            println!(
                "remux: {}\nvideo transcode: {}\naudio transcode: {}\nreason: {}",
                classification.needs_remux,
                classification.needs_video_transcode,
                classification.needs_audio_transcode,
                classification.reason
            );
            Ok(())
        }
        Commands::Version => {
            println!("castbridge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// The codec backend compiled into this binary.
fn codec_backend() -> Result<Arc<dyn CodecBackend>, Box<dyn std::error::Error>> {
    #[cfg(feature = "mock-codec")]
    {
        Ok(Arc::new(castbridge_codec::mock::MockBackend::new()))
    }
    #[cfg(not(feature = "mock-codec"))]
    {
        Err("castbridge was built without a codec backend; \
             rebuild with --features mock-codec or link a backend"
            .into())
    }
}

async fn serve(
    host: String,
    port: u16,
    url: Option<String>,
    title: Option<String>,
    wait_complete: bool,
    config_path: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::load_or_default(config_path);
    config.server.host = host;
    config.server.port = port;

    let codec = codec_backend()?;
    tracing::info!(backend = codec.name(), "Codec backend ready");

    let manager = SessionManager::new(codec, Arc::new(config.clone()));
    let (listener, addr) = server::bind(&config.server.host, config.server.port).await?;
    manager.set_port(addr.port());

    if let Some(url) = url {
        let descriptor = SourceDescriptor::ProgressiveHttp {
            url,
            wait_for_complete: wait_complete,
        };
        match manager.start(descriptor, StartOptions { title }).await {
            Ok(result) => {
                println!("session:  {}", result.session_id);
                println!("local:    {}", result.playlist_url_local);
                println!("lan:      {}", result.playlist_url_lan);
            }
            Err(e) => {
                tracing::error!("Failed to start session: {e}");
                return Err(e.to_string().into());
            }
        }
    }

    let ctx = AppContext {
        sessions: Arc::clone(&manager),
    };
    server::serve(listener, ctx).await?;

    manager.stop_all().await;
    Ok(())
}
