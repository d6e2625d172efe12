use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pagetrigger::config as cfg;
use pagetrigger::engine::{LifecycleState, TriggerInstance};
use pagetrigger::executor::PipelineRuntime;
use pagetrigger::page::{
    CommandOutcome, ElementReader, Page, PageAvailability, PageCommand, VirtualPage,
};
use pagetrigger::ports::{ContextReader, PipelineExecutor, Services};
use pagetrigger::sources;

/// pagetrigger CLI
#[derive(Debug, Parser)]
#[command(
    name = pagetrigger::PKG_NAME,
    version = pagetrigger::PKG_VERSION,
    about = "Run declarative page automations off page triggers"
)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short = 'c', long = "config", default_value = "config/default.json")]
    config: PathBuf,

    /// Enable dry-run mode (log page mutations instead of applying them)
    #[arg(long = "dry-run")]
    dry_run: bool,

    /// Set log level (e.g., trace, debug, info, warn, error). Overrides RUST_LOG.
    #[arg(long = "log-level")]
    log_level: Option<String>,

    /// Print the JSON Schema for the configuration and exit
    #[arg(long = "print-schema")]
    print_schema: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    pagetrigger::init_tracing(args.log_level.as_deref());

    if args.print_schema {
        let schema = cfg::generate_schema();
        let json = serde_json::to_string_pretty(&schema)?;
        println!("{json}");
        return Ok(());
    }

    info!(
        version = pagetrigger::PKG_VERSION,
        config = %args.config.display(),
        dry_run = args.dry_run,
        "Starting pagetrigger"
    );

    let config = cfg::load_from_path_async(&args.config).await?;
    debug!(target: "pagetrigger", triggers = config.triggers.len(), "Configuration loaded successfully");

    let page = Arc::new(VirtualPage::with_elements(
        config.page.url.clone(),
        &config.page.elements,
    ));
    let triggers = build_triggers(&page, &config, args.dry_run);
    for trigger in &triggers {
        arm(trigger.clone()).await;
    }

    let sources = sources::build_sources_from_config(&config);
    if sources.is_empty() {
        warn!("No page command sources configured. Waiting for Ctrl+C.");
    }

    let token = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<PageCommand>(256);
    let _handles = sources::spawn_all_sources(&sources, tx, &token);

    let commands = async {
        while let Some(command) = rx.recv().await {
            debug!(target: "pagetrigger", ?command, "Applying page command");
            if page.apply(command) == CommandOutcome::Navigated {
                info!(target: "pagetrigger", url = %page.url(), "Navigated; re-arming triggers");
                for trigger in &triggers {
                    arm(trigger.clone()).await;
                }
            }
        }
        info!("All sources finished. Waiting for Ctrl+C.");
        std::future::pending::<()>().await;
    };

    tokio::select! {
        () = commands => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
            info!("Received Ctrl+C, shutting down");
        }
    }

    token.cancel();
    for trigger in &triggers {
        trigger.uninstall();
    }
    info!("pagetrigger exited");
    Ok(())
}

/// One trigger instance per configured trigger, sharing the page, the
/// pipeline runtime and the context reader.
fn build_triggers(
    page: &Arc<VirtualPage>,
    config: &cfg::Config,
    dry_run: bool,
) -> Vec<Arc<TriggerInstance>> {
    let dyn_page: Arc<dyn Page> = page.clone();
    let executor: Arc<dyn PipelineExecutor> =
        Arc::new(PipelineRuntime::from_config(page.clone(), config, dry_run));
    let reader: Arc<dyn ContextReader> = Arc::new(ElementReader::new(page.clone()));

    config
        .triggers
        .iter()
        .cloned()
        .map(|definition| {
            let availability =
                PageAvailability::new(dyn_page.clone(), definition.availability.clone());
            let services = Services::new(dyn_page.clone(), executor.clone(), reader.clone())
                .with_availability(Arc::new(availability));
            Arc::new(TriggerInstance::new(definition, services))
        })
        .collect()
}

/// Install `trigger` if it is available on the current page and arm it in
/// the background; tear it down otherwise.
async fn arm(trigger: Arc<TriggerInstance>) {
    match trigger.install().await {
        Ok(true) => {
            tokio::spawn(async move {
                if let Err(e) = trigger.run().await {
                    error!(target: "pagetrigger", trigger = %trigger.id(), error = %e, "Failed to arm trigger");
                }
            });
        }
        Ok(false) => {
            if trigger.state() != LifecycleState::Uninstalled {
                trigger.uninstall();
            }
        }
        Err(e) => {
            error!(target: "pagetrigger", trigger = %trigger.id(), error = %e, "Availability check failed");
        }
    }
}
