use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use file_resolver::infrastructure::environment::{setup_environment, setup_fetch_session};
use file_resolver::{FileReference, LifecycleCoordinator, Resolver, ResolverConfig};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Resolve file references (paths, URLs, data: payloads, workflow:// refs)
/// into local files.
#[derive(Parser, Debug)]
#[command(name = "file-resolver", version)]
struct Args {
    /// References to resolve, in order
    #[arg(required = true)]
    references: Vec<String>,

    /// Only check the references; fetch and write nothing
    #[arg(long)]
    probe: bool,

    /// Store fetched files below the workflow directory
    #[arg(long)]
    persist: bool,

    /// Allowed extensions, e.g. `.csv,.txt`
    #[arg(long = "allowed-ext", value_delimiter = ',')]
    allowed_extensions: Vec<String>,

    /// Read timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Workflow directory for workflow:// references
    #[arg(long)]
    workflow_dir: Option<PathBuf>,

    /// Keep materialized temp files instead of resetting before exit
    #[arg(long)]
    keep: bool,

    /// Report failed references as inactive instead of failing
    #[arg(long)]
    lenient: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // Initialize tracing with EnvFilter
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "file_resolver=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut config = ResolverConfig::from_env();
    if !args.allowed_extensions.is_empty() {
        config.allowed_extensions = args.allowed_extensions.clone();
    }
    if let Some(timeout) = args.timeout_ms {
        config.timeout_millis = timeout;
    }
    config.persist_locally |= args.persist;
    config.disable_output_if_missing |= args.lenient;

    info!(
        "🔎 Resolving {} reference(s): timeout={}ms, persist={}, extensions={:?}",
        args.references.len(),
        config.timeout_millis,
        config.persist_locally,
        config.allowed_extensions
    );

    let mut environment = setup_environment();
    if let Some(dir) = &args.workflow_dir {
        environment = environment.with_workflow_dir(dir.clone());
    }

    let resolver = Resolver::new(environment, &config).with_fetch_session(setup_fetch_session());
    let mut coordinator = LifecycleCoordinator::new(resolver, config.clone());

    let references: Vec<FileReference> = args
        .references
        .iter()
        .enumerate()
        .map(|(i, raw)| FileReference::with_id(format!("ref-{}", i), raw.as_str()))
        .collect();

    let report = if args.probe {
        coordinator.configure(&references).await
    } else {
        coordinator.execute(&references).await
    };

    let summary = serde_json::to_string_pretty(&report.summary()).context("serializing report")?;
    println!("{}", summary);

    let outputs = report.outputs(config.disable_output_if_missing);

    if args.keep {
        let kept = coordinator.detach();
        info!("📌 Keeping {} materialized file(s)", kept.len());
    } else {
        coordinator.dispose().await;
    }

    match outputs {
        Ok(outputs) => {
            info!("✅ {} output(s) ready", outputs.len());
            Ok(())
        }
        Err(e) => {
            error!("❌ {}", e);
            Err(e.into())
        }
    }
}
