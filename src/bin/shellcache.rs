use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use shellcache::config::StorageBackend;
use shellcache::server::{self, ServerOptions};
use shellcache::{
    AppConfig, CacheStore, DiskCacheStore, HttpNetwork, MemoryCacheStore, Network, Registration,
};

fn print_usage() {
    eprintln!("Usage: shellcache [OPTIONS]");
    eprintln!();
    eprintln!("Serves an app origin through an offline-first asset cache.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <PATH>     Config file (default: {})", AppConfig::default_path().display());
    eprintln!("  --host <HOST>       Bind address (overrides config)");
    eprintln!("  --port <PORT>       Bind port (overrides config and SHELLCACHE_PORT)");
    eprintln!("  -h, --help          Show this help");
    eprintln!();
    eprintln!("Set RUST_LOG=debug for per-request logging.");
}

fn take_value(args: &[String], i: &mut usize, flag: &str) -> String {
    *i += 1;
    if let Some(value) = args.get(*i) {
        value.clone()
    } else {
        eprintln!("Error: {flag} requires a value");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn main() -> shellcache::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config_path: Option<PathBuf> = None;
    let mut host: Option<String> = None;
    let mut port: Option<u16> = None;

    let args: Vec<String> = env::args().skip(1).collect();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => config_path = Some(PathBuf::from(take_value(&args, &mut i, "--config"))),
            "--host" => host = Some(take_value(&args, &mut i, "--host")),
            "--port" => {
                let raw = take_value(&args, &mut i, "--port");
                match raw.parse() {
                    Ok(p) => port = Some(p),
                    Err(_) => {
                        eprintln!("Error: invalid port {raw}");
                        std::process::exit(1);
                    }
                }
            }
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Error: unknown argument {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let config_path = config_path.unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load_or_create(&config_path)?;
    log::info!(
        "Loaded {} (version {}, {} eager / {} lazy assets)",
        config_path.display(),
        config.worker.version,
        config.worker.assets.eager().len(),
        config.worker.assets.lazy().len()
    );

    let store: Arc<dyn CacheStore> = match config.storage.backend {
        StorageBackend::Disk => {
            log::info!("Cache storage at {}", config.storage.dir.display());
            Arc::new(DiskCacheStore::new(&config.storage.dir))
        }
        StorageBackend::Memory => Arc::new(MemoryCacheStore::new()),
    };
    let network: Arc<dyn Network> = Arc::new(HttpNetwork::with_defaults()?);
    let registration = Arc::new(Registration::new(store, network));

    let options = ServerOptions {
        host: host.unwrap_or_else(|| config.server.host.clone()),
        port: port.unwrap_or(config.server.port),
        origin: config.worker.origin_url()?,
        config_path: Some(config_path),
    };

    // Serve even if install fails; requests then pass through to the network.
    if let Err(e) = registration.register(config.worker).await {
        log::error!("Worker not installed: {e}");
    }

    server::serve(registration, options).await
}
