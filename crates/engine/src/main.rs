use clap::Parser;
use serde_json::Map;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tripwire_engine::{
    config::Config,
    definition::WorkflowDefinition,
    metrics,
    procedure::{register_builtins, InMemoryRegistry},
    server::Server,
    store::create_store,
    trigger::{TriggerManager, WebhookDispatcher},
    workflow::{BroadcastNotifier, WorkflowEngine},
    Result,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Procedure orchestration engine", long_about = None)]
struct Cli {
    /// Listen address, overrides SERVER_ADDR
    #[arg(long)]
    addr: Option<String>,

    /// Workflow definitions directory, overrides WORKFLOWS_DIR
    #[arg(long)]
    workflows: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;
    if let Some(addr) = cli.addr {
        config.server.addr = addr;
    }
    if let Some(dir) = cli.workflows {
        config.engine.workflows_dir = Some(dir);
    }
    info!("Loaded configuration: {:?}", config);

    metrics::register_metrics()?;
    let store = create_store(&config.database).await?;

    let mut registry = InMemoryRegistry::new();
    register_builtins(&mut registry);
    info!("Registered procedures: {}", registry.names().join(", "));

    let engine = Arc::new(
        WorkflowEngine::new(Arc::new(registry))
            .with_notifier(Arc::new(BroadcastNotifier::default()))
            .with_store(store)
            .with_max_steps(config.engine.max_steps),
    );
    let dispatcher = Arc::new(WebhookDispatcher::new());
    let manager = TriggerManager::builder(engine.clone(), dispatcher.clone())
        .timeout_policy(config.engine.timeout_policy)
        .build();

    let definitions = match &config.engine.workflows_dir {
        Some(dir) => WorkflowDefinition::load_dir(dir)?,
        None => Vec::new(),
    };
    let definitions: Vec<Arc<WorkflowDefinition>> = definitions.into_iter().map(Arc::new).collect();
    for definition in &definitions {
        if let Err(e) = engine.validate(definition) {
            warn!("Workflow {} is invalid and was not loaded: {}", definition.id, e);
            continue;
        }
        manager.register_workflow(definition.clone()).await;
    }

    let restored = manager.restore().await?;
    info!("{} pending executions restored", restored);

    for definition in &definitions {
        let Some(trigger) = &definition.trigger else {
            continue;
        };
        if manager.definition(&definition.id).await.is_none() || manager.is_deployed(&definition.id).await {
            continue;
        }
        let webhook_url = config.webhook_url(&trigger.provider);
        match manager.deploy(definition.clone(), &webhook_url, Map::new()).await {
            Ok(subscription) => info!(
                "Deployed workflow {} (subscription {})",
                definition.id, subscription.subscription_id
            ),
            Err(e) => warn!("Failed to deploy workflow {}: {}", definition.id, e),
        }
    }

    let server = Server::new(manager, dispatcher);
    info!("Starting server on {}", config.server.addr);
    server.start(&config.server.addr).await?;

    Ok(())
}
