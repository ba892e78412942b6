//! OpsFlow admin CLI
//!
//! Thin HTTP client over the control API for operators: start/stop the
//! scheduler, inspect runs and the dead-letter queue, execute pipelines,
//! decide approvals, and manage exceptions. Prints JSON responses as-is so
//! the output pipes into jq.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, Method, StatusCode};
use serde_json::json;

#[derive(Parser)]
#[command(name = "opsflow-admin")]
#[command(about = "OpsFlow admin CLI - control and inspect the orchestrator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Control API base URL
    #[arg(long, env = "OPSFLOW_URL", default_value = "http://localhost:8080")]
    url: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler loop
    Start,
    /// Stop the scheduler loop
    Stop,
    /// Show orchestrator status
    Status,
    /// Seed default workflows, thresholds, rules, and the demo pipeline
    Initialize,
    /// Health check
    Health,

    /// List workflow definitions
    Workflows,
    /// Flip a workflow's active flag
    Toggle { workflow_id: String },
    /// Dispatch a workflow now
    Trigger { workflow_id: String },

    /// List runs
    Runs {
        #[arg(long)]
        workflow_id: Option<String>,
        /// Filter by status (queued|running|completed|failed|awaiting_approval|cancelled)
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// 7-day run statistics
    Stats,

    /// List the dead-letter queue
    Dlq {
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Re-dispatch a dead-lettered run
    RetryDlq { run_id: String },

    /// List pipelines
    Pipelines,
    /// Execute a pipeline and print the execution report
    ExecutePipeline { pipeline_id: String },

    /// List business exceptions
    Exceptions {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        severity: Option<String>,
    },
    /// Raise a business exception
    Raise {
        exception_type: String,
        description: String,
        #[arg(long)]
        severity: Option<String>,
        #[arg(long)]
        financial_impact: Option<f64>,
    },
    /// Resolve an exception
    Resolve {
        exception_id: String,
        action: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Escalate an exception
    Escalate { exception_id: String },
    /// List exception classification rules
    Rules,

    /// List approval thresholds
    Thresholds,
    /// List pending approvals
    Approvals,
    /// Approve or reject a run awaiting approval
    Decide {
        run_id: String,
        /// Approve (omit to reject)
        #[arg(long)]
        approve: bool,
        #[arg(long)]
        decided_by: String,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Deliver an external signal by name
    Signal { event_name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base = cli.url.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Start => call(&client, Method::POST, &format!("{base}/control/start"), None).await,
        Commands::Stop => call(&client, Method::POST, &format!("{base}/control/stop"), None).await,
        Commands::Status => call(&client, Method::GET, &format!("{base}/control/status"), None).await,
        Commands::Initialize => {
            call(&client, Method::POST, &format!("{base}/control/initialize"), None).await
        }
        Commands::Health => call(&client, Method::GET, &format!("{base}/health"), None).await,

        Commands::Workflows => call(&client, Method::GET, &format!("{base}/workflows"), None).await,
        Commands::Toggle { workflow_id } => {
            call(&client, Method::POST, &format!("{base}/workflows/{workflow_id}/toggle"), None).await
        }
        Commands::Trigger { workflow_id } => {
            call(&client, Method::POST, &format!("{base}/workflows/{workflow_id}/trigger"), None)
                .await
        }

        Commands::Runs {
            workflow_id,
            status,
            limit,
        } => {
            let mut url = format!("{base}/runs?limit={limit}");
            if let Some(workflow_id) = workflow_id {
                url.push_str(&format!("&workflow_id={workflow_id}"));
            }
            if let Some(status) = status {
                url.push_str(&format!("&status={status}"));
            }
            call(&client, Method::GET, &url, None).await
        }
        Commands::Stats => call(&client, Method::GET, &format!("{base}/runs/stats"), None).await,

        Commands::Dlq { limit } => {
            call(&client, Method::GET, &format!("{base}/dlq?limit={limit}"), None).await
        }
        Commands::RetryDlq { run_id } => {
            call(&client, Method::POST, &format!("{base}/dlq/{run_id}/retry"), None).await
        }

        Commands::Pipelines => call(&client, Method::GET, &format!("{base}/pipelines"), None).await,
        Commands::ExecutePipeline { pipeline_id } => {
            call(&client, Method::POST, &format!("{base}/pipelines/{pipeline_id}/execute"), None)
                .await
        }

        Commands::Exceptions { status, severity } => {
            let mut url = format!("{base}/exceptions?");
            if let Some(status) = status {
                url.push_str(&format!("status={status}&"));
            }
            if let Some(severity) = severity {
                url.push_str(&format!("severity={severity}"));
            }
            call(&client, Method::GET, url.trim_end_matches(['?', '&']), None).await
        }
        Commands::Raise {
            exception_type,
            description,
            severity,
            financial_impact,
        } => {
            let body = json!({
                "exception_type": exception_type,
                "description": description,
                "severity": severity,
                "financial_impact": financial_impact,
            });
            call(&client, Method::POST, &format!("{base}/exceptions"), Some(body)).await
        }
        Commands::Resolve {
            exception_id,
            action,
            notes,
        } => {
            let body = json!({ "action": action, "notes": notes });
            call(&client, Method::POST, &format!("{base}/exceptions/{exception_id}/resolve"), Some(body))
                .await
        }
        Commands::Escalate { exception_id } => {
            call(&client, Method::POST, &format!("{base}/exceptions/{exception_id}/escalate"), None)
                .await
        }
        Commands::Rules => call(&client, Method::GET, &format!("{base}/exception-rules"), None).await,

        Commands::Thresholds => call(&client, Method::GET, &format!("{base}/thresholds"), None).await,
        Commands::Approvals => call(&client, Method::GET, &format!("{base}/approvals"), None).await,
        Commands::Decide {
            run_id,
            approve,
            decided_by,
            reason,
        } => {
            let body = json!({ "approve": approve, "decided_by": decided_by, "reason": reason });
            call(&client, Method::POST, &format!("{base}/approvals/{run_id}/decide"), Some(body))
                .await
        }

        Commands::Signal { event_name } => {
            call(&client, Method::POST, &format!("{base}/events/{event_name}/signal"), None).await
        }
    }
}

/// Issue one request and print the response body as pretty JSON.
async fn call(
    client: &Client,
    method: Method,
    url: &str,
    body: Option<serde_json::Value>,
) -> Result<()> {
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request.send().await?;
    let status = response.status();
    let text = response.text().await?;

    if text.is_empty() {
        println!("{{\"status\": {}}}", status.as_u16());
    } else {
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            Err(_) => println!("{text}"),
        }
    }

    if !status.is_success() && status != StatusCode::NO_CONTENT {
        bail!("request failed with status {status}");
    }
    Ok(())
}
