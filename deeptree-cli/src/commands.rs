//! CLI subcommand handlers.

use crate::{BuildArgs, Commands, ConfigAction};
use anyhow::Context;
use deeptree_core::config::workspace_config_path;
use deeptree_core::providers::create_provider;
use deeptree_core::{
    DeepTreeConfig, Document, DocumentResult, DuckDuckGoSearch, SearchProvider, SessionHistory,
    TreeOrchestrator, corpus, export, load_config,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path, quiet: bool) -> anyhow::Result<()> {
    match command {
        Commands::Build(args) => handle_build(args, workspace, quiet).await,
        Commands::Config { action } => handle_config(action, workspace).await,
    }
}

fn effective_config(args: &BuildArgs, workspace: &Path) -> anyhow::Result<DeepTreeConfig> {
    let mut config = load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    if let Some(max_layers) = args.max_layers {
        config.tree.max_layers = max_layers;
    }
    if let Some(max_children) = args.max_children {
        config.tree.max_children_per_node = max_children;
    }
    if let Some(workers) = args.workers {
        config.minimality.workers = workers;
    }
    if args.dry_run {
        config.integration.llm_integrated = false;
        config.integration.ambiguous = false;
    }
    config.validate()?;
    Ok(config)
}

fn live_orchestrator(config: &DeepTreeConfig) -> anyhow::Result<TreeOrchestrator> {
    let llm = create_provider(&config.llm).context("Failed to create LLM provider")?;
    let validator = config
        .validator_llm
        .as_ref()
        .map(create_provider)
        .transpose()
        .context("Failed to create validator provider")?;
    let search: Arc<dyn SearchProvider> = Arc::new(DuckDuckGoSearch::new(&config.search)?);
    Ok(TreeOrchestrator::from_providers(
        config.clone(),
        llm,
        validator,
        search,
    ))
}

fn dry_run_orchestrator(config: &DeepTreeConfig, document: &Document) -> TreeOrchestrator {
    TreeOrchestrator::from_providers(
        config.clone(),
        Arc::new(crate::dry_run::llm(document)),
        None,
        Arc::new(crate::dry_run::search()),
    )
}

async fn handle_build(args: BuildArgs, workspace: &Path, quiet: bool) -> anyhow::Result<()> {
    let config = effective_config(&args, workspace)?;
    let documents = corpus::load_documents(&args.input)
        .with_context(|| format!("Failed to load documents from {}", args.input.display()))?;

    let output = args.output.clone().unwrap_or_else(|| config.output.dir.clone());
    let output: PathBuf = if output.is_absolute() {
        output
    } else {
        workspace.join(output)
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing the current node");
                cancel.cancel();
            }
        });
    }

    let mut live = if args.dry_run {
        None
    } else {
        Some(live_orchestrator(&config)?.with_cancellation(cancel.clone()))
    };
    let mut history = SessionHistory::new(config.circular.max_history);
    let mut results: Vec<DocumentResult> = Vec::with_capacity(documents.len());

    info!(
        documents = documents.len(),
        output = %output.display(),
        dry_run = args.dry_run,
        "Starting build"
    );
    for document in &documents {
        if cancel.is_cancelled() {
            warn!(document_id = %document.id, "Build cancelled, remaining documents skipped");
            break;
        }
        let result = match live.as_mut() {
            Some(orchestrator) => orchestrator.process_document(document, &mut history).await,
            None => {
                dry_run_orchestrator(&config, document)
                    .with_cancellation(cancel.clone())
                    .process_document(document, &mut history)
                    .await
            }
        };
        let written = export::write_result(&output, &result)
            .with_context(|| format!("Failed to write results to {}", output.display()))?;
        if !quiet {
            println!("{}", result.summary());
        }
        info!(
            document_id = %result.document_id,
            trajectory = %written.trajectory.display(),
            "Document finished"
        );
        results.push(result);
    }

    let trees = results.iter().filter(|r| r.tree.is_some()).count();
    let nodes: usize = results.iter().map(|r| r.trajectory.stats.final_size).sum();
    if !quiet {
        println!(
            "Built {trees}/{} trees ({nodes} nodes) into {}",
            results.len(),
            output.display()
        );
    }
    Ok(())
}

async fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace_config_path(workspace);
            if let Some(dir) = config_path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = DeepTreeConfig::default().to_toml()?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(Some(workspace), None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            println!("{}", config.to_toml()?);
            Ok(())
        }
    }
}
