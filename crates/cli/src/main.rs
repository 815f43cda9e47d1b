use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kassert_core::{parse_selector, Value};
use kassert_engine::{EngineDeps, ExecutionContext};
use kassert_kubehub::{ClusterHandle, DataClusterFactory, KubeClientBuilder, KubeconfigSource, DEFAULT_CLUSTER};
use serde_json::Value as Json;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "kassertctl", version, about = "kassert CLI")]
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
    /// List the registered functions with their argument signatures
    Functions,
    /// Parse a label selector and print its query form
    Selector {
        /// Selector expression, e.g. "app=web,tier=front|back,!canary"
        expr: String,
    },
    /// Call one function against a cluster from a kubeconfig
    Call {
        /// Function name, e.g. "x_k8s_list"
        name: String,
        /// Arguments: JSON literals or templates such as "($client)"; anything else is a string
        args: Vec<String>,
        /// Kubeconfig path (default: $KUBECONFIG, then ~/.kube/config)
        #[arg(long = "kubeconfig", env = "KUBECONFIG")]
        kubeconfig: Option<PathBuf>,
        /// Kubeconfig context (default: current context)
        #[arg(long = "context", default_value = "")]
        context: String,
        /// Bound as $namespace
        #[arg(long = "ns", default_value = "default")]
        namespace: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KASSERT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KASSERT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KASSERT_METRICS_ADDR; expected host:port");
        }
    }
}

fn default_kubeconfig() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME is not set; pass --kubeconfig")?;
    Ok(PathBuf::from(home).join(".kube").join("config"))
}

/// Valid JSON is taken as-is, anything else as a plain string.
fn parse_arg(raw: &str) -> Json {
    serde_json::from_str(raw).unwrap_or_else(|_| Json::String(raw.to_string()))
}

fn print_value(output: Output, value: Value) -> Result<()> {
    match output {
        Output::Human => match &value {
            Value::Json(Json::String(s)) => println!("{s}"),
            Value::Json(j) => println!("{}", serde_json::to_string_pretty(j)?),
            other => println!("{}", other.to_display_string()),
        },
        Output::Json => println!("{}", serde_json::to_string(&value.into_json())?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let builder = Arc::new(KubeClientBuilder::default());
    let factory = Arc::new(DataClusterFactory::from_env(builder.clone()));
    let deps = Arc::new(EngineDeps::new(builder.clone(), factory.clone()));

    match cli.command {
        Commands::Functions => {
            let library = &deps.library;
            let mut entries = library.functions();
            entries.extend(library.inner_functions());
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            match cli.output {
                Output::Human => {
                    for e in &entries {
                        println!("{}", e.signature());
                    }
                }
                Output::Json => {
                    let rows: Vec<Json> = entries
                        .iter()
                        .map(|e| serde_json::json!({ "name": e.name, "arguments": e.arguments }))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::Selector { expr } => {
            let selector = parse_selector(&expr);
            match cli.output {
                Output::Human => match &selector {
                    Some(s) if s.is_everything() => println!("<everything>"),
                    Some(s) => println!("{}", s.to_query_string()),
                    None => println!("<none>"),
                },
                Output::Json => println!("{}", serde_json::to_string_pretty(&selector)?),
            }
        }
        Commands::Call { name, args, kubeconfig, context, namespace } => {
            let path = match kubeconfig {
                Some(p) => p,
                None => default_kubeconfig()?,
            };
            let source = KubeconfigSource::new(path, &context);
            let ctx = ExecutionContext::new(deps.clone())
                .with_cluster(DEFAULT_CLUSTER, Arc::new(ClusterHandle::kubeconfig(Arc::new(source), builder.clone())));
            let (ctx, selected) = ctx.with_current_cluster(DEFAULT_CLUSTER).await;
            selected?;
            let ctx = ctx.with_namespace(&namespace);

            let mut values = Vec::with_capacity(args.len());
            for raw in &args {
                let value = ctx.resolve(&parse_arg(raw)).await.with_context(|| format!("resolving argument {raw:?}"))?;
                values.push(value);
            }
            info!(function = %name, args = values.len(), "calling");
            let result = deps.caller.call(&name, values).await;
            factory.shutdown();
            match result {
                Ok(v) => print_value(cli.output, v)?,
                Err(e) => {
                    error!(function = %name, error = %e, "call failed");
                    return Err(anyhow!("{name}: {e}"));
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_fall_back_to_strings() {
        assert_eq!(parse_arg("3"), serde_json::json!(3));
        assert_eq!(parse_arg("\"v1\""), serde_json::json!("v1"));
        assert_eq!(parse_arg("v1"), serde_json::json!("v1"));
        assert_eq!(parse_arg("($client)"), serde_json::json!("($client)"));
    }

    #[test]
    fn cli_parses_call() {
        let cli = Cli::try_parse_from(["kassertctl", "-o", "json", "call", "x_k8s_list", "($client)", "v1", "Pod", "--ns", "team"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        match cli.command {
            Commands::Call { name, args, namespace, .. } => {
                assert_eq!(name, "x_k8s_list");
                assert_eq!(args, vec!["($client)", "v1", "Pod"]);
                assert_eq!(namespace, "team");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
