//! Demo facade server over in-memory stores.
//!
//! Production deployments swap the memory connectors for real backend
//! drivers at wiring time; nothing else changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use weave_connector_memory::MemoryConnector;
use weave_hlc::LocalTimeSource;
use weave_server::{router, AppState, Committer, ItemCache, Reader};
use weave_txn::SharedConnector;

#[derive(Parser, Debug)]
#[command(name = "weave-server", about = "Transaction facade server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8000, env = "WEAVE_PORT")]
    port: u16,

    /// Datastore names to host (one in-memory store each)
    #[arg(long = "store", default_values_t = [String::from("Redis"), String::from("MongoDB")])]
    stores: Vec<String>,

    /// Lease window granted to PREPARED records, in milliseconds
    #[arg(long, default_value_t = 100)]
    lease_ms: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut conns: HashMap<String, SharedConnector> = HashMap::new();
    for name in &args.stores {
        conns.insert(name.clone(), Arc::new(MemoryConnector::new()));
    }

    let cache = Arc::new(ItemCache::new());
    let time_source = Arc::new(LocalTimeSource::new());
    let state = AppState {
        reader: Arc::new(Reader::new(conns.clone(), cache.clone())),
        committer: Arc::new(Committer::new(
            conns,
            cache,
            time_source,
            Duration::from_millis(args.lease_ms),
        )),
    };

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("bind server address");
    info!(%addr, stores = ?args.stores, "server running");
    axum::serve(listener, router(state))
        .await
        .expect("server failed");
}
