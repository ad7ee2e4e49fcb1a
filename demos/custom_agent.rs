//! A small agent wrapper around a session: fixed instructions, a handful of
//! sample queries, one line of metadata per answer.
//!
//! Run with: cargo run --example custom_agent
//!
//! Expects a local service at FOUNDRY_LOCAL_ENDPOINT (default
//! http://localhost:5273/v1) serving a model whose alias is `qwen2.5-0.5b`.

use foundry_session::{Result, RunResult, ServiceConfig, ServiceManager, Session};

struct LocalAgent {
    session: Session,
}

impl LocalAgent {
    async fn start(manager: &ServiceManager, alias: &str, instructions: &str) -> Result<Self> {
        println!("Initializing agent with model alias: {}", alias);
        let session = Session::connect(manager, alias, instructions).await?;
        if let Some(model) = session.model() {
            println!("Model info: {}", model);
        }
        Ok(Self { session })
    }

    async fn ask(&self, query: &str) -> Result<RunResult> {
        println!("Processing user input: {}", query);
        self.session.run(query).await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let manager = ServiceManager::new(ServiceConfig::load()?)?;

    println!("=== Service ===");
    manager.start_service().await?;
    let loaded = manager.list_loaded().await?;
    let ids: Vec<_> = loaded.iter().map(|m| m.id()).collect();
    println!("Models running in the service: {:?}", ids);

    println!("\n=== Custom Agent ===");
    let agent = LocalAgent::start(
        &manager,
        "qwen2.5-0.5b",
        "You are a helpful AI assistant powered by a local model.",
    )
    .await?;

    let queries = [
        "What is the capital of France?",
        "Tell me a programming joke",
        "How does machine learning work?",
    ];

    for (i, query) in queries.iter().enumerate() {
        println!("\n--- Test {} ---", i + 1);
        match agent.ask(query).await {
            Ok(result) => {
                println!("Query: {}", query);
                println!("Response: {}", result.text);
                println!("Model Alias: {}", result.metadata.alias);
                println!("Model ID: {}", result.metadata.resolved_model_id);
                println!("Source: {}", result.metadata.source);
            }
            // A failed call is reported, never printed as if it were an answer
            Err(e) => println!("Query failed: {}", e),
        }
    }

    // Dropping the agent closes its session; the service keeps running
    drop(agent);
    Ok(())
}
