mod cli;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};

use reelcast::av::{tools, Prober};
use reelcast::{config, server};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, otherwise derive the filter from the verbose
    // flag.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "reelcast=trace,tower_http=debug".to_string()
        } else {
            "reelcast=info,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt().with_env_filter(&env_filter).init();

    match cli.command {
        Commands::Serve {
            root_path,
            host,
            port,
        } => {
            let mut config = config::load_config_or_default(cli.config.as_deref())?;
            if let Some(root_path) = root_path {
                config.root_path = root_path;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if cli.verbose {
                config.debug = true;
            }
            config::validate_config(&config)?;

            tracing::info!(
                root = %config.root_path.display(),
                "Starting reelcast server"
            );

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(server::start_server(config))
        }
        Commands::Probe { file, json } => {
            let config = config::load_config_or_default(cli.config.as_deref()).unwrap_or_default();
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(probe_file(&config, &file, json))
        }
        Commands::CheckTools => {
            let config = config::load_config_or_default(cli.config.as_deref()).unwrap_or_default();
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(check_tools(&config))
        }
        Commands::Version => {
            println!("reelcast {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn probe_file(config: &config::Config, file: &std::path::Path, json: bool) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("File does not exist: {:?}", file);
    }

    let prober = Prober::new(config.ffprobe_path());
    let info = prober.probe_init(file).await?;

    if json {
        let body = serde_json::json!({
            "type": info.kind.as_str(),
            "container": info.format_name,
            "videoCodec": info.video_codec,
            "audioCodec": info.audio_codec,
            "maybeNativelySupported": info.maybe_natively_supported(),
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        println!("File: {}", file.display());
        println!("Type: {}", info.kind);
        println!("Container: {}", info.format_name);
        if let Some(ref codec) = info.video_codec {
            println!("Video codec: {codec}");
        }
        if let Some(ref codec) = info.audio_codec {
            println!("Audio codec: {codec}");
        }
        println!(
            "Maybe natively supported: {}",
            info.maybe_natively_supported()
        );
    }

    Ok(())
}

async fn check_tools(config: &config::Config) -> Result<()> {
    println!("Checking external tools...\n");

    let infos = tools::check_tools(config).await;
    let mut all_ok = true;

    for tool in &infos {
        let status = if tool.available {
            "ok"
        } else {
            all_ok = false;
            "missing"
        };

        print!("[{status}] {}", tool.name);
        if let Some(ref version) = tool.version {
            print!(" ({version})");
        }
        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }
        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available.");
    } else {
        println!("Some tools are missing; install ffmpeg to enable streaming.");
    }

    Ok(())
}
