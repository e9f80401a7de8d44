use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use unicontact_rs::config::{ConfigOverrides, ServerOverrides, StorageOverrides, UniContactConfig};
use unicontact_rs::{http, Unicontact};

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_help() {
    eprintln!(
        r#"unicontact_server - Contact identity reconciliation over HTTP

USAGE:
    unicontact_server [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to config file (TOML)
    -l, --listen <ADDR>     Override listen address [default: 127.0.0.1:3000]
    -d, --data-dir <DIR>    Persist contacts in DIR (in-memory when unset)
        --repair            Repair the data directory before opening
    -h, --help              Print help

ENVIRONMENT:
    UNICONTACT_CONFIG               Path to config file
    UNICONTACT_SERVER__LISTEN       Listen address
    UNICONTACT_STORAGE__DATA_DIR    Data directory
    RUST_LOG                        Log filter, overrides [log] filter

CONFIG FILE (unicontact.toml):
    [server]
    listen = "0.0.0.0:3000"

    [storage]
    data_dir = "/var/lib/unicontact"
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    // Build CLI overrides
    let mut overrides = ConfigOverrides::default();

    if let Some(listen) = parse_arg("--listen").or_else(|| parse_arg("-l")) {
        overrides.server = Some(ServerOverrides {
            listen: Some(listen.parse()?),
        });
    }

    let mut storage_overrides = StorageOverrides::default();
    if let Some(data_dir) = parse_arg("--data-dir").or_else(|| parse_arg("-d")) {
        storage_overrides.data_dir = Some(data_dir.into());
    }
    if has_flag("--repair") {
        storage_overrides.repair = Some(true);
    }
    if storage_overrides.data_dir.is_some() || storage_overrides.repair.is_some() {
        overrides.storage = Some(storage_overrides);
    }

    // Load config: CLI > Env > File > Defaults
    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("UNICONTACT_CONFIG").ok());
    let config = UniContactConfig::load(config_path.as_deref(), overrides)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let service = Arc::new(Unicontact::from_config(&config)?);
    let listener = TcpListener::bind(config.server.listen).await?;
    http::serve(listener, service).await?;

    Ok(())
}
