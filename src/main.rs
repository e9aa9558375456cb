use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use boardapi::api::{Api, ReqwestTransport};
use boardapi::config::Config;

/// boardapi: rate-limited client for an image-board site's API.
///
/// Every call goes through one serialized queue that waits at least
/// BOARDAPI_MIN_DELAY_MS between requests, so the site is never hammered.
#[derive(Parser)]
#[command(name = "boardapi", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch one or more paths and print the response bodies
    Get {
        /// Origin-relative paths (e.g. /posts.json?tags=cat)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Fetch a path and pretty-print the JSON response
    Json {
        path: String,
    },

    /// Submit form fields to a path (authenticity token is added automatically)
    Post {
        path: String,

        /// Form field as key=value (repeatable)
        #[arg(long = "field", short = 'f', value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },

    /// Capture and print the site's authenticity token
    Token,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if missing)
    let _ = dotenvy::dotenv();

    // Set up structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("boardapi=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Get { paths } => {
            let api = read_only_api(&config)?;
            info!(
                count = paths.len(),
                delay_ms = config.min_delay.as_millis() as u64,
                "Queueing reads"
            );

            // Submitted together; the queue still dispatches them one at a time
            let results =
                futures::future::join_all(paths.iter().map(|path| api.get_url(path))).await;

            for (path, result) in paths.iter().zip(results) {
                let body = result.with_context(|| format!("GET {path} failed"))?;
                if paths.len() > 1 {
                    println!("{}", format!("── {path}").dimmed());
                }
                println!("{body}");
            }
        }

        Commands::Json { path } => {
            let api = read_only_api(&config)?;
            let value: serde_json::Value = api
                .get_json(&path)
                .await
                .with_context(|| format!("GET {path} failed"))?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }

        Commands::Post { path, fields } => {
            config.require_session()?;
            let api = bootstrap_api(&config).await?;
            let data: Vec<(&str, &str)> = fields
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();

            let body = api
                .post_url(&path, &data)
                .await
                .with_context(|| format!("{} {path} failed", api.mutating_method()))?;
            println!("{body}");
        }

        Commands::Token => {
            let api = bootstrap_api(&config).await?;
            match api.token() {
                Some(token) => println!("{}", token.as_str()),
                None => {
                    println!("No authenticity token found on {}", api.origin());
                    println!(
                        "{}",
                        "Log in and set BOARDAPI_SESSION_COOKIE, or pin BOARDAPI_CSRF_TOKEN."
                            .dimmed()
                    );
                }
            }
        }
    }

    Ok(())
}

fn transport(config: &Config) -> Result<Arc<ReqwestTransport>> {
    let transport = ReqwestTransport::new(
        &config.client_name,
        &config.origin,
        config.session_cookie.as_deref(),
    )?;
    Ok(Arc::new(transport))
}

fn read_only_api(config: &Config) -> Result<Api> {
    Ok(Api::new(config, transport(config)?, None))
}

async fn bootstrap_api(config: &Config) -> Result<Api> {
    Api::bootstrap(config, transport(config)?)
        .await
        .with_context(|| format!("Failed to capture authenticity token from {}", config.origin))
}

/// Parse a `key=value` form field argument.
fn parse_field(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))
}
