use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edgecore::{
    AcquisitionSettings, DataFormat, DeviceConfig, GraphSettings, GraphSpec, HealthSnapshot,
    NodeSpec, PipelineEvent, Stream, Value,
};
use edgenodes::{backend_from_spec, standard_registry};
use edgeruntime::{DataFlowGraph, Orchestrator, OrchestratorConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "edgeflow")]
#[command(about = "On-device data-flow engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every graph of a device configuration until Ctrl-C
    Run {
        /// Path to device configuration JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(short, long)]
        duration: Option<u64>,

        /// Print a status line every N seconds
        #[arg(long, default_value_t = 30)]
        status_every: u64,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a device configuration file
    Validate {
        /// Path to device configuration JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create an example device configuration
    Init {
        /// Output file path
        #[arg(short, long, default_value = "device.json")]
        output: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            duration,
            status_every,
            verbose,
        } => {
            init_logging(verbose);
            run_device(&file, duration.map(Duration::from_secs), status_every).await?;
        }

        Commands::Validate { file } => {
            validate_device(&file)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_device(&output)?;
        }
    }

    Ok(())
}

fn load_device(file: &Path) -> Result<DeviceConfig> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let config: DeviceConfig =
        serde_json::from_str(&json).with_context(|| format!("parsing {}", file.display()))?;
    Ok(config)
}

/// Heartbeat nodes report the device identity unless configured otherwise.
fn apply_device_identity(config: &mut DeviceConfig) {
    let tags: std::collections::BTreeMap<String, Value> = config
        .tags
        .iter()
        .map(|(k, v)| (k.clone(), Value::from(v.clone())))
        .collect();

    for node in config.graphs.iter_mut().flat_map(|g| g.nodes.iter_mut()) {
        if node.node_type != "system.heartbeat" {
            continue;
        }
        node.config
            .entry("device_id".to_string())
            .or_insert_with(|| Value::from(config.device_id.clone()));
        if !tags.is_empty() {
            node.config
                .entry("tags".to_string())
                .or_insert_with(|| Value::Record(tags.clone()));
        }
    }
}

async fn run_device(file: &Path, duration: Option<Duration>, status_every: u64) -> Result<()> {
    println!("🚀 Loading device configuration from: {}", file.display());
    let mut config = load_device(file)?;
    apply_device_identity(&mut config);

    println!("📋 Device: {} ({})", config.name, config.device_id);
    println!("   Graphs: {}", config.graphs.len());
    println!();

    let backend = backend_from_spec(&config.delivery.backend)?;
    let orchestrator = Orchestrator::new(
        Arc::new(standard_registry()),
        backend,
        OrchestratorConfig::from(&config),
    );

    let mut events = orchestrator.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PipelineEvent::OrchestratorStateChanged { state, .. } => {
                    println!("▶️  Orchestrator {}", state);
                }
                PipelineEvent::TaskRestarted { task, attempt, .. } => {
                    println!("  🔁 Restarted {} (attempt {})", task, attempt);
                }
                PipelineEvent::TaskQuarantined { task, .. } => {
                    println!("  ⛔ Task {} quarantined", task);
                }
                PipelineEvent::NodeQuarantined { graph, node, .. } => {
                    println!("  ⛔ Node {}/{} quarantined", graph, node);
                }
                PipelineEvent::DeliveryFailed { origin, error, .. } => {
                    println!("  ❌ Delivery from {} failed: {}", origin, error);
                }
                _ => {}
            }
        }
    });

    orchestrator.start_device(&config).await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(status_every.max(1)));
    ticker.tick().await;
    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping (Ctrl-C)...");
                break;
            }
            _ = &mut deadline => break,
            _ = ticker.tick() => print_status_line(&orchestrator.status()),
        }
    }

    orchestrator.stop_all().await?;
    event_task.abort();

    print_summary(&orchestrator.status());
    Ok(())
}

fn print_status_line(status: &HealthSnapshot) {
    let quarantined = status.quarantined_nodes().count();
    println!(
        "📊 {} nodes, {} delivered, {} spilled, {} quarantined",
        status.nodes.len(),
        status.delivery.delivered,
        status.delivery.spill_depth,
        quarantined
    );
}

fn print_summary(status: &HealthSnapshot) {
    println!();
    println!("📊 Summary:");
    for node in &status.nodes {
        println!(
            "   {}/{} [{:?}] produced={} delivered={} errors={} dropped={} inputs_dropped={}",
            node.graph,
            node.node,
            node.health,
            node.produced,
            node.delivered,
            node.errors,
            node.overflow_dropped,
            node.inputs_dropped
        );
    }
    let delivery = &status.delivery;
    println!(
        "   delivery: delivered={} retried={} spilled={} redelivered={} failed={} lost_at_stop={}",
        delivery.delivered,
        delivery.retried,
        delivery.spilled,
        delivery.redelivered,
        delivery.terminal_failures,
        delivery.spill_depth
    );
}

fn validate_device(file: &Path) -> Result<()> {
    println!("🔍 Validating device configuration: {}", file.display());
    let config = load_device(file)?;
    let registry = standard_registry();

    let mut invalid = 0;
    for graph in &config.graphs {
        match DataFlowGraph::validate(graph, &registry) {
            Ok(()) => println!(
                "  ✅ {}: {} nodes, {} edges",
                graph.name,
                graph.nodes.len(),
                graph.edges.len()
            ),
            Err(e) => {
                invalid += 1;
                println!("  ❌ {}: {}", graph.name, e);
            }
        }
    }

    if invalid > 0 {
        anyhow::bail!("{} of {} graphs are invalid", invalid, config.graphs.len());
    }
    println!("✅ Device {} is valid", config.name);
    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let registry = standard_registry();
    for node_type in registry.list_node_types() {
        if let Some(metadata) = registry.get_metadata(&node_type) {
            println!("  • {} ({})", node_type, metadata.category);
            println!("    {}", metadata.description);
            for port in &metadata.outputs {
                println!("      #{} {}: {}", port.index, port.name, port.description);
            }
        } else {
            println!("  • {}", node_type);
        }
    }
}

fn example_device() -> DeviceConfig {
    let mut heart = GraphSpec::new("heart");
    heart.add_node(
        NodeSpec::acquisition("heartbeat", "system.heartbeat")
            .with_output(Stream::new("heart", "HEART", 0, DataFormat::Log).with_container("journals"))
            .with_acquisition(AcquisitionSettings {
                read_interval_ms: 60_000,
                ..AcquisitionSettings::default()
            }),
    );
    heart.add_node(
        NodeSpec::transform("log", "transform.log")
            .with_output(Stream::new("heart", "HEART", 0, DataFormat::Log).with_container("journals")),
    );
    heart.connect("heartbeat", 0, "log");

    let mut climate = GraphSpec::new("climate").with_settings(GraphSettings {
        tick_interval_ms: 500,
        ..GraphSettings::default()
    });
    climate.add_node(
        NodeSpec::acquisition("temp", "sim.counter")
            .with_output(Stream::new("temp", "TEMP", 0, DataFormat::Log))
            .with_config("start", 15.0)
            .with_config("step", 0.5)
            .with_acquisition(AcquisitionSettings {
                read_interval_ms: 1_000,
                ..AcquisitionSettings::default()
            }),
    );
    climate.add_node(
        NodeSpec::transform("alarm", "transform.threshold")
            .with_output(Stream::new("hot", "TEMP", 0, DataFormat::Log).with_container("alerts"))
            .with_output(
                Stream::new("normal", "TEMP", 1, DataFormat::Log)
                    .with_container("journals")
                    .with_sample_rate(0.1),
            )
            .with_config("threshold", 25.0),
    );
    climate.connect("temp", 0, "alarm");

    let mut device = DeviceConfig::new("example-device")
        .with_graph(heart)
        .with_graph(climate);
    device.device_id = "dev-0001".to_string();
    device.tags.insert("site".to_string(), "lab".to_string());
    device
}

fn create_example_device(output: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&example_device())?;
    std::fs::write(output, json)?;

    println!("✨ Created example device configuration: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  edgeflow run --file {} --duration 30", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_device_is_valid() {
        let device = example_device();
        let registry = standard_registry();
        for graph in &device.graphs {
            DataFlowGraph::validate(graph, &registry).unwrap();
        }

        let json = serde_json::to_string(&device).unwrap();
        let parsed: DeviceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.graphs.len(), 2);
    }

    #[test]
    fn heartbeat_nodes_inherit_device_identity() {
        let mut device = example_device();
        apply_device_identity(&mut device);

        let heartbeat = device.graphs[0].find_node("heartbeat").unwrap();
        assert_eq!(
            heartbeat.config.get("device_id").and_then(Value::as_str),
            Some("dev-0001")
        );
        assert!(heartbeat.config.contains_key("tags"));
        assert!(device.graphs[1].find_node("temp").unwrap().config.get("device_id").is_none());
    }
}
