use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tap_proto::{Direction, LogEntry, ViewerEvent};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "beach-tap")]
#[command(about = "HTTP interceptor with live traffic viewers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the interceptor server (default when no command is given)
    Serve(ServeArgs),

    /// Create a session on a running server
    Create {
        /// Server base URL
        #[arg(short, long, default_value = "http://localhost:8080")]
        server: String,

        /// Target address to forward proxied traffic to
        #[arg(short, long)]
        target: Option<String>,
    },

    /// Stream a session's captured traffic
    Watch {
        /// Server websocket base URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Session ID to watch
        #[arg(short, long)]
        session: String,

        /// Print raw JSON events instead of a summary
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug, Default, Clone)]
pub struct ServeArgs {
    #[arg(long, env = "BEACH_TAP_PORT")]
    pub port: Option<u16>,

    #[arg(long, env = "BEACH_TAP_HOST")]
    pub host: Option<String>,

    /// Redis URL for durable session records
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Keep session records in memory; targets are lost on restart
    #[arg(long)]
    pub ephemeral: bool,

    /// Maximum captured entries kept per session
    #[arg(long, env = "TAP_LOG_CAPACITY")]
    pub log_capacity: Option<usize>,
}

impl ServeArgs {
    pub fn apply(self, mut config: Config) -> Config {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(url) = self.redis_url.filter(|url| !url.trim().is_empty()) {
            config.redis_url = url;
        }
        if self.ephemeral {
            config.ephemeral = true;
        }
        if let Some(capacity) = self.log_capacity {
            config.log_capacity = capacity.max(1);
        }
        config
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedSessionBody {
    session_id: String,
    proxy_url: String,
    viewer_url: String,
    #[serde(default)]
    target_address: Option<String>,
}

pub async fn run_create(server: String, target: Option<String>) -> Result<()> {
    let endpoint = format!("{}/sessions", server.trim_end_matches('/'));
    debug!("creating session via {}", endpoint);

    let response = reqwest::Client::new()
        .post(&endpoint)
        .json(&json!({ "target": target }))
        .send()
        .await
        .with_context(|| format!("failed to reach {}", endpoint))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!("server returned {}: {}", status, body));
    }

    let created: CreatedSessionBody = response.json().await?;
    println!("session:  {}", created.session_id);
    println!("proxy:    {}", created.proxy_url);
    println!("viewer:   {}", created.viewer_url);
    if let Some(target) = created.target_address {
        println!("target:   {}", target);
    }
    Ok(())
}

pub async fn run_watch(url: String, session: String, raw: bool) -> Result<()> {
    let ws_url = format!("{}/ws/{}", url.trim_end_matches('/'), session);
    debug!("Connecting to {}", ws_url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", ws_url, e);
            return Err(anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            return Err(anyhow!("Connection timeout - is the server running?"));
        }
    };
    let (_write, mut read) = ws_stream.split();

    while let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => {
                if raw {
                    println!("{}", text.as_str());
                    continue;
                }
                match serde_json::from_str::<ViewerEvent>(text.as_str()) {
                    Ok(event) => print_event(&event),
                    Err(e) => debug!("skipping unrecognised event: {}", e),
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

fn print_event(event: &ViewerEvent) {
    match event {
        ViewerEvent::InitialLogs { logs } => {
            println!("-- replay: {} entries --", logs.len());
            for entry in logs {
                println!("{}", summarize(entry));
            }
            println!("-- live --");
        }
        ViewerEvent::NewLog { log } => println!("{}", summarize(log)),
        ViewerEvent::LogsCleared => println!("-- cleared --"),
    }
}

pub fn summarize(entry: &LogEntry) -> String {
    let time = entry.timestamp.format("%H:%M:%S%.3f");
    match entry.direction {
        Direction::Request => format!(
            "{} -> {} {} [{}]",
            time,
            entry.method.as_deref().unwrap_or("?"),
            entry.url.as_deref().unwrap_or("?"),
            entry.id
        ),
        Direction::Response => format!(
            "{} <- {} {} [{}]",
            time,
            entry.status.map(|s| s.to_string()).unwrap_or_else(|| "?".into()),
            entry.status_text.as_deref().unwrap_or(""),
            entry.exchange_id()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn serve_flags_override_config() {
        let args = ServeArgs {
            port: Some(9000),
            log_capacity: Some(0),
            ..Default::default()
        };
        let config = args.apply(Config::default());
        assert_eq!(config.port, 9000);
        assert_eq!(config.log_capacity, 1);
        assert_eq!(config.host, "0.0.0.0");
        assert!(!config.ephemeral);
    }

    #[test]
    fn ephemeral_flag_is_explicit() {
        let cli = Cli::try_parse_from(["beach-tap", "serve", "--ephemeral"]).unwrap();
        let Some(Commands::Serve(args)) = cli.command else {
            panic!("expected serve command");
        };
        assert!(args.apply(Config::default()).ephemeral);
    }

    #[test]
    fn summary_pairs_response_with_request_id() {
        let resp = LogEntry::response("abc", 200, "OK", BTreeMap::new(), None);
        let line = summarize(&resp);
        assert!(line.contains("<- 200 OK [abc]"), "{line}");
    }

    #[test]
    fn no_subcommand_defaults_to_server() {
        let cli = Cli::try_parse_from(["beach-tap"]).unwrap();
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["beach-tap", "watch", "--session", "abc"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Watch { .. })));
    }
}
