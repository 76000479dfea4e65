pub mod classify;
pub mod cli;
pub mod config;
pub mod llm;
pub mod models;
pub mod server;
pub mod session;
pub mod simulator;
pub mod store;

use cli::Args;
use log::info;
use simulator::TimelineSimulator;
use std::error::Error;
use std::sync::Arc;
use store::initialize_chat_store;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!("Chat LLM Type: {}", args.chat_llm_type);
    info!("Fallback Models: {}", args.fallback_models.join(", "));
    info!("Chat Store Type: {}", args.store_type);
    if args.store_type.eq_ignore_ascii_case("redis") {
        info!("Chat Store Redis URL: {}", args.store_redis_url);
    }
    info!("Rate Limit Per Second: {}", args.rate_limit_per_second);
    info!("-------------------------");

    let simulator = Arc::new(
        TimelineSimulator::from_settings(
            &args.chat_llm_type,
            &args.chat_api_key,
            args.chat_base_url.as_deref(),
            &args.fallback_models
        )?
    );
    let store = initialize_chat_store(&args)?;

    server::run_server(&args, simulator, store).await?;

    Ok(())
}
