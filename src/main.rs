use clap::Parser;
use mcp_chat_client::application::orchestrator::{
    Orchestrator, OrchestratorOptions, DEFAULT_MAX_TURNS,
};
use mcp_chat_client::application::registry::SessionRegistry;
use mcp_chat_client::application::shell;
use mcp_chat_client::config::{AppConfig, ServerConfig};
use mcp_chat_client::infrastructure::model::OpenAiClient;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "mcp-chat",
    version,
    about = "Chat with an LLM that can call tools on MCP servers"
)]
struct Cli {
    /// Path to a single MCP server script (.py or .js). When given, the
    /// configured server list is ignored.
    server: Option<String>,
    /// Configuration file (default: config/client.toml)
    #[arg(long)]
    config: Option<String>,
    /// Model name override
    #[arg(long)]
    model: Option<String>,
    /// Model endpoint base URL override
    #[arg(long)]
    base_url: Option<String>,
    /// System prompt for every query
    #[arg(long)]
    system: Option<String>,
    /// Maximum model completions per query
    #[arg(long, default_value_t = DEFAULT_MAX_TURNS)]
    max_turns: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    init_tracing();
    info!("Starting mcp-chat");
    let cli = Cli::parse();
    debug!(server = ?cli.server, config = ?cli.config, max_turns = cli.max_turns, "CLI arguments parsed");

    let config_path = cli.config.as_deref().map(Path::new);
    let file_config = AppConfig::load(config_path)?;

    let servers: Vec<ServerConfig> = match &cli.server {
        Some(script) => vec![ServerConfig::for_script(script)],
        None => file_config.servers.clone(),
    };
    if !servers.iter().any(|server| server.enabled) {
        return Err("no enabled MCP servers configured".into());
    }

    let mut settings = file_config.model.clone();
    if let Some(model) = cli.model {
        settings.model = model;
    }
    if let Some(base_url) = cli.base_url {
        settings.base_url = base_url;
    }
    let api_key = settings
        .api_key
        .clone()
        .ok_or("OPENAI_API_KEY is required (environment, .env, or config file)")?;

    let registry = Arc::new(SessionRegistry::new());
    let connected = registry.connect_all(&servers).await;
    if !registry.has_active_sessions() {
        registry.close_all().await;
        return Err("failed to connect to any MCP server".into());
    }

    let tools = registry.aggregated_tools();
    println!("Connected to {connected} MCP server(s):");
    for provider in registry.provider_names() {
        let names: Vec<&str> = tools
            .iter()
            .filter(|tool| tool.provider == provider)
            .map(|tool| tool.local_name.as_str())
            .collect();
        println!("  {provider}: {}", names.join(", "));
    }

    let provider = OpenAiClient::new(settings.base_url.clone(), api_key);
    let orchestrator = Orchestrator::new(provider, registry.clone(), settings.model.clone())
        .with_options(OrchestratorOptions {
            max_turns: cli.max_turns,
            system_prompt: cli.system,
        });

    // Sessions are released on every exit path, shell errors included.
    let outcome = shell::run(&orchestrator).await;
    registry.close_all().await;
    outcome?;

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .init();
    });
}
