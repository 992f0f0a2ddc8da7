use chat_gateway::gateway::{GatewayConfig, GatewayState};
use chat_gateway::pipeline::Pipeline;
use chat_gateway::server;
use chat_gateway::stages;
use clap::Parser;

/// Pluggable gateway in front of an OpenAI-compatible chat-completion API.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Upstream chat-completion endpoint to forward requests to
    #[arg(long, default_value = "https://api.siliconflow.cn/v1/chat/completions")]
    upstream_url: String,

    /// Upstream request timeout in seconds
    #[arg(long, default_value_t = 600)]
    timeout: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = GatewayConfig {
        host: args.host,
        port: args.port,
        upstream_url: args.upstream_url,
        api_key: std::env::var("UPSTREAM_API_KEY").ok(),
        timeout: args.timeout,
    };

    let pipeline = Pipeline::new(stages::default_stages());
    let state = GatewayState::new(config.clone(), pipeline)?;
    actix_web::rt::System::new().block_on(server::startup(config, state))?;
    Ok(())
}
