//! laskd — local request-routing daemon bridging `ask`, email, and web
//! clients to long-running interactive AI terminal sessions.

mod adapter;
mod cmd_init;
mod cmd_status;
mod email_context;
mod ipc;
mod lifecycle;
mod logging;
mod notifier;
pub(crate) mod paths;
mod registry;
mod session_file;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use laskd_protocol::{Config, Provider};
use tracing::{info, warn};

use crate::adapter::ProviderAdapter;
use crate::ipc::CancellationTable;
use crate::lifecycle::{Dispatchers, LifecycleEngine, ProviderDispatcher};
use crate::logging::init_logging;
use crate::notifier::{CompletionNotifier, NullSmtpSender};
use crate::registry::SessionRegistry;

pub(crate) const VERSION: &str = env!("CARGO_PKG_VERSION");

const ALL_PROVIDERS: [Provider; 5] = [
    Provider::Claude,
    Provider::Codex,
    Provider::Gemini,
    Provider::Opencode,
    Provider::Droid,
];

#[derive(Parser, Debug)]
#[command(name = "laskd", about = "laskd — local request-routing daemon", version = VERSION)]
struct Cli {
    /// Data directory (default: ~/.laskd)
    #[arg(long, global = true, env = "LASKD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon (default when no subcommand given)
    Start,

    /// Bootstrap a fresh machine (create data dir structure)
    Init,

    /// Check if the daemon is running
    Status,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let data_dir = paths::init_data_dir(cli.data_dir.as_deref());

    match cli.command {
        Some(Command::Init) => return cmd_init::run(&data_dir),
        Some(Command::Status) => return cmd_status::run(&data_dir),
        _ => {}
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async_main(&data_dir))
}

async fn async_main(data_dir: &std::path::Path) -> anyhow::Result<()> {
    paths::ensure_dirs()?;

    let logging = init_logging()?;
    let run_id = logging.run_id.clone();
    let _log_guard = logging.guard;
    let root_span = tracing::info_span!("laskd", service = "laskd", run_id = %run_id);
    let _root_span_guard = root_span.enter();

    info!(
        component = "server",
        event = "server.starting",
        run_id = %run_id,
        version = VERSION,
        pid = std::process::id(),
        data_dir = %data_dir.display(),
    );

    let config = Config::from_env();
    let registry = SessionRegistry::new();
    let notifier = Arc::new(CompletionNotifier::new(Box::new(NullSmtpSender)));
    let cancellations = CancellationTable::new();

    let mut dispatcher_map = HashMap::new();
    for provider in ALL_PROVIDERS {
        let adapter = Arc::new(ProviderAdapter::new(provider, &config));
        let engine = Arc::new(LifecycleEngine::new(adapter, registry.clone()));
        let dispatcher = ProviderDispatcher::spawn(engine, notifier.clone());
        dispatcher_map.insert(provider, dispatcher);

        let root = registry::provider_log_root(provider);
        if let Some(handle) = registry::spawn_root_watcher(registry.clone(), provider, root.clone()) {
            info!(
                component = "server",
                event = "server.watcher.started",
                provider = provider.as_str(),
                path = %root.display(),
            );
            drop(handle);
        } else {
            warn!(
                component = "server",
                event = "server.watcher.skipped",
                provider = provider.as_str(),
                path = %root.display(),
                "log root missing or watcher init failed; falling back to periodic refresh only",
            );
        }
    }
    let dispatchers = Arc::new(Dispatchers::new(dispatcher_map));

    tokio::spawn(registry::run_monitor_loop(registry.clone()));
    tokio::spawn(async {
        let mut ticker = tokio::time::interval(Config::PENDING_LOG_PRUNE_AFTER);
        loop {
            ticker.tick().await;
            email_context::prune_stale().await;
        }
    });

    write_pid_file();

    let socket_path = paths::socket_path();
    let ipc_result = tokio::select! {
        result = ipc::serve(socket_path, dispatchers, cancellations) => result,
        _ = tokio::signal::ctrl_c() => {
            info!(component = "server", event = "server.shutdown", "shutdown signal received");
            Ok(())
        }
    };

    remove_pid_file();
    ipc_result
}

fn write_pid_file() {
    let pid_path = paths::pid_file_path();
    if let Err(e) = std::fs::write(&pid_path, std::process::id().to_string()) {
        warn!(
            component = "server",
            event = "server.pid_file.write_error",
            path = %pid_path.display(),
            error = %e,
        );
    }
}

fn remove_pid_file() {
    let pid_path = paths::pid_file_path();
    let _ = std::fs::remove_file(&pid_path);
}
