use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kapply_apply::{SyncOptions, Synchronizer};
use kapply_core::{classify_envelope, BatchReport, ItemReport};
use kapply_kubehub::KubeCluster;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kapplyctl", version, about = "Apply a directory of Kubernetes manifests")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or update every manifest under DIR
    Sync {
        dir: PathBuf,
        /// Namespace for namespaced manifests that do not declare one
        #[arg(long = "ns", env = "KAPPLY_NAMESPACE")]
        namespace: Option<String>,
        /// Kubeconfig context (default: current context or in-cluster)
        #[arg(long = "context", env = "KAPPLY_CONTEXT")]
        context: Option<String>,
        /// Send writes as server-side dry runs
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        /// Skip the update that normally follows a create
        #[arg(long = "no-confirm", action = ArgAction::SetTrue)]
        no_confirm: bool,
        /// Also update existing custom resources
        #[arg(long = "update-custom-resources", action = ArgAction::SetTrue)]
        update_custom_resources: bool,
        /// Apply in directory order instead of prerequisites first
        #[arg(long = "keep-order", action = ArgAction::SetTrue)]
        keep_order: bool,
    },
    /// Print the kind of every manifest under DIR without touching the cluster
    Classify { dir: PathBuf },
    /// List the registered kinds
    Kinds,
}

fn init_tracing() {
    let env = std::env::var("KAPPLY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KAPPLY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KAPPLY_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Sync { dir, namespace, context, dry_run, no_confirm, update_custom_resources, keep_order } => {
            let mut opts = SyncOptions::from_env();
            if let Some(ns) = namespace.filter(|s| !s.trim().is_empty()) {
                opts.default_namespace = ns;
            }
            if no_confirm {
                opts.confirm_after_create = false;
            }
            opts.update_custom_resources |= update_custom_resources;

            let mut manifests = kapply_source::load_dir(&dir)?;
            if !keep_order {
                kapply_source::sort_for_apply(&mut manifests);
            }
            let ctx = context.clone().or_else(kapply_kubehub::current_context);
            info!(dir = %dir.display(), count = manifests.len(), ns = %opts.default_namespace, context = ?ctx, dry_run, "sync invoked");

            let cluster = KubeCluster::connect(context.as_deref()).await.context("connecting to cluster")?.with_dry_run(dry_run);
            let sync = Synchronizer::new(cluster, opts);

            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if signal::ctrl_c().await.is_ok() {
                        info!("Ctrl-C received; finishing current manifest");
                        cancel.cancel();
                    }
                }
            });

            let report = sync.run_until(&manifests, &cancel).await;
            render_report(cli.output, &report)?;
            if report.cancelled {
                bail!("sync cancelled after {} of {} manifests", report.items.len(), manifests.len());
            }
            let failed = report.summary().failed;
            if failed > 0 {
                bail!("{} of {} manifests failed", failed, report.items.len());
            }
        }
        Commands::Classify { dir } => {
            let manifests = kapply_source::load_dir(&dir)?;
            #[derive(serde::Serialize)]
            struct Row<'a> { origin: &'a str, kind: Option<String>, registered: bool, name: Option<String>, error: Option<String> }
            let rows: Vec<_> = manifests
                .iter()
                .map(|m| match classify_envelope(m.bytes()) {
                    Ok((tag, env)) => Row {
                        origin: m.origin(),
                        registered: kapply_kinds::lookup(&tag).is_some(),
                        kind: Some(tag.as_str().to_string()),
                        name: env.metadata.name,
                        error: None,
                    },
                    Err(e) => Row { origin: m.origin(), kind: None, registered: false, name: None, error: Some(e.to_string()) },
                })
                .collect();
            match cli.output {
                Output::Human => {
                    for r in &rows {
                        let kind = r.kind.as_deref().unwrap_or("-");
                        let reg = if r.registered { "registered" } else { "unknown" };
                        match &r.error {
                            Some(e) => println!("{} • {}", r.origin, e),
                            None => println!("{} • {} • {}", r.origin, kind, reg),
                        }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
        Commands::Kinds => {
            #[derive(serde::Serialize)]
            struct Row { kind: &'static str, namespaced: bool, update: &'static str }
            let rows: Vec<_> = kapply_kinds::KINDS
                .iter()
                .map(|e| Row { kind: e.tag, namespaced: e.namespaced, update: e.update.as_str() })
                .collect();
            match cli.output {
                Output::Human => {
                    for r in &rows {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        println!("{} • {} • {}", r.kind, scope, r.update);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
    }

    Ok(())
}

fn render_report(output: Output, report: &BatchReport) -> Result<()> {
    let summary = report.summary();
    match output {
        Output::Human => {
            for item in &report.items {
                println!("{:<18} {}", item.status(), describe(item));
            }
            println!(
                "created={} updated={} unchanged={} failed={}{}",
                summary.created,
                summary.updated,
                summary.unchanged,
                summary.failed,
                if report.cancelled { " (cancelled)" } else { "" }
            );
            for (item, e) in report.failures() {
                warn!(origin = %item.origin, reason = e.reason(), "failed");
                eprintln!("{}: {}", item.origin, e);
            }
        }
        Output::Json => {
            #[derive(serde::Serialize)]
            struct Row<'a> {
                origin: &'a str,
                kind: Option<&'a str>,
                status: &'static str,
                key: Option<String>,
                #[serde(skip_serializing_if = "Option::is_none")]
                resource_version: Option<&'a str>,
                #[serde(skip_serializing_if = "Option::is_none")]
                error: Option<String>,
            }
            #[derive(serde::Serialize)]
            struct Report<'a> { items: Vec<Row<'a>>, summary: kapply_core::Summary, cancelled: bool }
            let items = report
                .items
                .iter()
                .map(|i| Row {
                    origin: &i.origin,
                    kind: i.kind.as_ref().map(|k| k.as_str()),
                    status: i.status(),
                    key: match &i.result {
                        Ok(a) => Some(a.key.to_string()),
                        Err(e) => e.key().map(ToString::to_string),
                    },
                    resource_version: i.result.as_ref().ok().and_then(|a| a.resource_version.as_deref()),
                    error: i.result.as_ref().err().map(ToString::to_string),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&Report { items, summary, cancelled: report.cancelled })?);
        }
    }
    Ok(())
}

fn describe(item: &ItemReport) -> String {
    match &item.result {
        Ok(applied) => format!("{} ({})", applied.key, item.origin),
        Err(e) => match e.key() {
            Some(key) => format!("{} ({})", key, item.origin),
            None => match &item.kind {
                Some(kind) => format!("{} ({})", kind, item.origin),
                None => item.origin.clone(),
            },
        },
    }
}
