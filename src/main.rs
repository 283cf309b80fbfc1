mod config;
mod logging;
mod policy;
mod project;
mod remote;
mod runner;
mod scanner;
mod server;
mod sync;
mod tabular;
mod terminal;
mod watcher;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use config::Config;
use policy::PathPolicy;
use project::ProjectManager;
use runner::ScriptRunner;
use server::AppState;
use sync::RemoteHandle;
use terminal::TerminalRegistry;
use watcher::EventBus;

const EXIT_BIND_FAILURE: u8 = 1;
const EXIT_INVALID_PROJECT: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "vibefoundry", version, about = "Bridge daemon for the VibeFoundry IDE")]
struct Cli {
    /// Port for the local HTTP endpoint
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Do not open the browser after startup
    #[arg(long = "no-browser", default_value_t = false)]
    no_browser: bool,

    /// Project folder to select at startup (also VIBEFOUNDRY_PROJECT_PATH)
    project: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let cfg = Config::resolve(cli.port, cli.no_browser, cli.project);

    let log_path = match logging::init_default_log_file() {
        Ok(path) => path,
        Err(err) => {
            eprintln!("vibefoundry: failed to open log file: {err:#}");
            return ExitCode::from(EXIT_BIND_FAILURE);
        }
    };
    logging::info(format!(
        "daemon start version={} port={} log={}",
        env!("CARGO_PKG_VERSION"),
        cfg.port,
        log_path.display()
    ));

    let policy = match PathPolicy::new() {
        Ok(policy) => Arc::new(policy),
        Err(err) => {
            logging::error(format!("failed to build path policy: {err:#}"));
            return ExitCode::FAILURE;
        }
    };

    let bus = EventBus::new();
    let manager = Arc::new(ProjectManager::new(policy, bus));
    let runner = ScriptRunner::new();
    let terminals = TerminalRegistry::new();
    let remote = Arc::new(RemoteHandle::default());

    // Startup project selection, if one was given.
    if let Some(path) = &cfg.project_path {
        if let Err(err) = manager.select(path).await {
            logging::error(format!(
                "invalid project path {}: {err:#}",
                path.display()
            ));
            eprintln!("vibefoundry: invalid project path: {}", path.display());
            return ExitCode::from(EXIT_INVALID_PROJECT);
        }
    }

    let _worker = runner.spawn_worker();
    let _keepalive = sync::spawn_keepalive_task(remote.clone());
    let _metadata = project::spawn_metadata_task(manager.clone());

    let state = AppState::new(manager, runner, terminals, remote);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        logging::info("shutdown requested");
    };

    let bound = match server::serve(state, cfg.port, shutdown).await {
        Ok(addr) => addr,
        Err(err) => {
            logging::error(format!("failed to bind http server: {err:#}"));
            eprintln!("vibefoundry: {err:#}");
            return ExitCode::from(EXIT_BIND_FAILURE);
        }
    };

    if cfg.open_browser {
        let url = format!("http://{bound}");
        if let Err(err) = open::that_detached(&url) {
            logging::warn(format!("could not open browser at {url}: {err}"));
        }
    }

    // Serve until ctrl-c.
    match tokio::signal::ctrl_c().await {
        Ok(()) => {}
        Err(err) => logging::error(format!("signal handler failed: {err}")),
    }
    logging::info("daemon stopped");
    ExitCode::SUCCESS
}
