//! kubectl plugin entry point.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use kube::Client;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use csi_triage::cleanup::{CleanupJobConfig, CleanupJobManager};
use csi_triage::detect::MetricsDetector;
use csi_triage::output::{self, OutputFormat};
use csi_triage::{
    Coordinator, DetectionMethod, DetectionOptions, KubeClusterReader, Severity,
};

/// Diagnose stuck and inconsistent CSI volume state.
#[derive(Parser)]
#[command(name = "kubectl-csi_triage")]
#[command(about = "Diagnose stuck and inconsistent CSI volume state in a cluster")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect CSI mount issues using the selected methods
    Detect {
        /// Detection methods to run (volume-attachments,cross-node-pvc,events,metrics)
        #[arg(
            long = "method",
            value_delimiter = ',',
            default_value = "volume-attachments,cross-node-pvc,events"
        )]
        methods: Vec<String>,

        /// Target CSI driver to analyze (e.g. cinder.csi.openstack.org)
        #[arg(long)]
        driver: Option<String>,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,

        /// Generate cleanup recommendations
        #[arg(long)]
        recommend_cleanup: bool,

        /// Minimum severity level to report (low,medium,high,critical)
        #[arg(long)]
        min_severity: Option<String>,

        /// Wall-clock deadline for the whole pass, in seconds
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },

    /// Perform detailed analysis of cluster volume state
    Analyze {
        /// Target CSI driver to analyze
        #[arg(long)]
        driver: Option<String>,
    },

    /// Print Prometheus queries and alerts for CSI monitoring
    Metrics {
        /// Target CSI driver to parameterise queries with
        #[arg(long)]
        driver: Option<String>,

        /// Generate Prometheus alerting rules
        #[arg(long)]
        generate_alerts: bool,

        /// Generate Grafana dashboard JSON
        #[arg(long)]
        generate_dashboard: bool,

        /// Write output to a file instead of stdout
        #[arg(long)]
        output_file: Option<PathBuf>,
    },

    /// Create privileged cleanup jobs on the given nodes
    Cleanup {
        /// Target nodes (repeatable or comma-separated)
        #[arg(long = "node", value_delimiter = ',', required = true)]
        nodes: Vec<String>,

        /// Namespace to create the jobs in
        #[arg(long, default_value = "kube-system")]
        namespace: String,

        /// Image for the cleanup container
        #[arg(long, default_value = "busybox:1.36")]
        image: String,

        /// Actually unmount; without this flag the jobs only report
        #[arg(long)]
        execute: bool,

        /// Wait for the jobs to complete
        #[arg(long)]
        wait: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Detect {
            methods,
            driver,
            output,
            recommend_cleanup,
            min_severity,
            timeout,
        } => {
            run_detect(
                &methods,
                driver,
                output,
                recommend_cleanup,
                min_severity,
                timeout,
            )
            .await
        }
        Commands::Analyze { driver } => run_analyze(driver).await,
        Commands::Metrics {
            driver,
            generate_alerts,
            generate_dashboard,
            output_file,
        } => run_metrics(driver, generate_alerts, generate_dashboard, output_file),
        Commands::Cleanup {
            nodes,
            namespace,
            image,
            execute,
            wait,
        } => run_cleanup(&nodes, namespace, image, execute, wait).await,
    }
}

async fn cluster_reader() -> Result<Arc<KubeClusterReader>> {
    let client = Client::try_default()
        .await
        .context("failed to initialize Kubernetes client - check your kubeconfig and cluster connectivity")?;
    Ok(Arc::new(KubeClusterReader::new(client)))
}

async fn run_detect(
    methods: &[String],
    driver: Option<String>,
    output: OutputFormat,
    recommend_cleanup: bool,
    min_severity: Option<String>,
    timeout: u64,
) -> Result<()> {
    let methods: Vec<DetectionMethod> = methods
        .iter()
        .map(|m| m.parse())
        .collect::<Result<_, _>>()?;
    let min_severity: Option<Severity> = min_severity.as_deref().map(str::parse).transpose()?;

    info!(?methods, driver = driver.as_deref().unwrap_or(""), "starting detection pass");

    let options = DetectionOptions {
        methods: methods.clone(),
        target_driver: driver,
        output_format: output.as_str().to_string(),
        recommend_cleanup,
        min_severity,
    };

    let coordinator = Coordinator::new(cluster_reader().await?, options);

    eprintln!(
        "Analyzing cluster state using {} detection method(s)...",
        methods.len()
    );

    let result = coordinator
        .detect_all_within(Duration::from_secs(timeout))
        .await?;

    if result.issues.is_empty() {
        eprintln!("{}", "No CSI mount issues detected".green());
    } else {
        eprintln!("{}", format!("Found {} issue(s)", result.issues.len()).yellow());
    }

    print!("{}", output::render(&result, output)?);
    Ok(())
}

async fn run_analyze(driver: Option<String>) -> Result<()> {
    let options = DetectionOptions {
        methods: DetectionMethod::ALL.to_vec(),
        target_driver: driver,
        ..DetectionOptions::default()
    };

    let coordinator = Coordinator::new(cluster_reader().await?, options);
    let analysis = coordinator.detailed_analysis().await?;

    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}

fn run_metrics(
    driver: Option<String>,
    generate_alerts: bool,
    generate_dashboard: bool,
    output_file: Option<PathBuf>,
) -> Result<()> {
    let detector = MetricsDetector::new(None, driver);
    let mut out = String::new();

    if generate_alerts {
        out.push_str("# Prometheus Alerting Rules for CSI Mount Issues\n");
        out.push_str("groups:\n- name: csi-triage\n  rules:\n");
        for alert in detector.recommended_alerts() {
            out.push_str(&alert);
            out.push('\n');
        }
    }

    if generate_dashboard {
        if generate_alerts {
            out.push_str("\n---\n\n");
        }
        out.push_str("# Grafana Dashboard JSON\n");
        out.push_str(&detector.grafana_dashboard());
        out.push('\n');
    }

    if !generate_alerts && !generate_dashboard {
        out.push_str("# Prometheus Queries for CSI Mount Detection\n\n");
        for query in detector.metric_queries() {
            out.push_str(&format!(
                "## {}\n# {}\n{}\n\n",
                query.name, query.description, query.query
            ));
        }
    }

    match output_file {
        Some(path) => {
            let mut file = std::fs::File::create(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            file.write_all(out.as_bytes())?;
        }
        None => print!("{out}"),
    }

    Ok(())
}

async fn run_cleanup(
    nodes: &[String],
    namespace: String,
    image: String,
    execute: bool,
    wait: bool,
) -> Result<()> {
    let client = Client::try_default()
        .await
        .context("failed to initialize Kubernetes client")?;
    let manager = CleanupJobManager::new(client, namespace.clone());

    if !execute {
        eprintln!("dry-run mode: jobs will only report what they would unmount");
    }

    let mut job_names = Vec::with_capacity(nodes.len());
    for node in nodes {
        let config = CleanupJobConfig {
            node_name: node.clone(),
            dry_run: !execute,
            image: image.clone(),
            namespace: namespace.clone(),
            ..CleanupJobConfig::default()
        };
        let name = manager.create_cleanup_job(&config).await?;
        println!("created job {name} for node {node}");
        job_names.push(name);
    }

    if wait {
        debug!("waiting for cleanup jobs");
        tokio::time::timeout(
            Duration::from_secs(600),
            manager.wait_for_jobs(&job_names),
        )
        .await
        .context("timed out waiting for cleanup jobs")??;
        println!("all cleanup jobs completed");
    }

    Ok(())
}
