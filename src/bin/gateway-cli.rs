use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Query and inspect a running metrics gateway", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    /// Debug endpoint base URL, when served on a separate listener.
    #[arg(long)]
    debug_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find metric paths matching patterns
    Find {
        #[arg(required = true)]
        patterns: Vec<String>,
        /// Query timeout in milliseconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Fetch series for targets over a time range
    Render {
        #[arg(required = true)]
        targets: Vec<String>,
        #[arg(long)]
        from: i64,
        #[arg(long)]
        until: i64,
        #[arg(long)]
        step: Option<u32>,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// List backend health
    Backends,
    /// Show gateway status
    Status,
    /// Show cache occupancy
    Cache,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let debug_url = cli.debug_url.clone().unwrap_or_else(|| cli.url.clone());

    match cli.command {
        Commands::Find { patterns, timeout } => {
            let mut params: Vec<(&str, String)> =
                patterns.into_iter().map(|p| ("query", p)).collect();
            if let Some(t) = timeout {
                params.push(("timeout", t.to_string()));
            }
            let res = client
                .get(format!("{}/metrics/find", cli.url))
                .query(&params)
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Render {
            targets,
            from,
            until,
            step,
            timeout,
        } => {
            let mut params: Vec<(&str, String)> =
                targets.into_iter().map(|t| ("target", t)).collect();
            params.push(("from", from.to_string()));
            params.push(("until", until.to_string()));
            if let Some(s) = step {
                params.push(("step", s.to_string()));
            }
            if let Some(t) = timeout {
                params.push(("timeout", t.to_string()));
            }
            let res = client
                .get(format!("{}/render", cli.url))
                .query(&params)
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Backends => {
            let res = client.get(format!("{}/debug/backends", debug_url)).send().await?;
            print_response(res).await?;
        }
        Commands::Status => {
            let res = client.get(format!("{}/debug/status", debug_url)).send().await?;
            print_response(res).await?;
        }
        Commands::Cache => {
            let res = client.get(format!("{}/debug/cache", debug_url)).send().await?;
            print_response(res).await?;
        }
    }

    Ok(())
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let completeness = res
        .headers()
        .get("x-gateway-completeness")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if !status.is_success() {
        eprintln!("Error: gateway returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    if let Some(c) = completeness {
        eprintln!("completeness: {}", c);
    }
    Ok(())
}
