use anyhow::Context as _;
use clap::Parser;
use std::path::PathBuf;
use swarm_stream::config::Config;

/// Stream files out of a swarm download over HTTP while it is still downloading.
#[derive(Parser, Debug)]
#[command(name = "swarm-stream", version, about)]
struct Cli {
    /// Config file; created with defaults when missing.
    #[arg(long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    /// Download URI (overrides download.uri).
    #[arg(long)]
    uri: Option<String>,

    /// HTTP bind address (overrides http.bind).
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// Keep downloaded data when the session ends.
    #[arg(long)]
    keep_files: bool,
}

impl Cli {
    fn apply(&self, cfg: &mut Config) {
        if let Some(uri) = &self.uri {
            cfg.download.uri = uri.clone();
        }
        if let Some(bind) = &self.bind {
            cfg.http.bind = bind.clone();
        }
        if self.keep_files {
            cfg.download.keep_files = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = swarm_stream::config_io::load_or_create_config(&cli.config)
        .await
        .with_context(|| format!("unable to read or create {}", cli.config.display()))?;
    cli.apply(&mut cfg);

    swarm_stream::config::init_tracing(&cfg);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "swarm-stream booted");

    swarm_stream::app::run(cfg).await
}
