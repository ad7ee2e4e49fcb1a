use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use foundry_session::{
    LaunchMode, RunOptions, RunResult, ServiceConfig, ServiceManager, Session,
    DEFAULT_INSTRUCTIONS,
};
use futures::StreamExt;
use std::io::Write;

const DEFAULT_ALIAS: &str = "qwen2.5-0.5b";

const DEMO_PROMPTS: &[&str] = &[
    "What is the capital of France?",
    "Tell me a programming joke",
    "How does machine learning work?",
];

#[derive(Parser)]
#[command(name = "foundry-session")]
#[command(about = "Chat with models served by a local OpenAI-compatible inference service")]
struct Cli {
    /// Base URL of the service API, including /v1 (http:// or https://)
    #[arg(long, global = true, env = "FOUNDRY_LOCAL_ENDPOINT")]
    endpoint: Option<String>,
    /// API key; local services usually need none
    #[arg(long, global = true, env = "FOUNDRY_LOCAL_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    /// Start the service with this program when it is not running
    #[arg(long, global = true)]
    spawn: Option<String>,
    /// Argument passed to the --spawn program (repeatable)
    #[arg(long = "spawn-arg", global = true, allow_hyphen_values = true)]
    spawn_args: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SessionArgs {
    /// Model alias to resolve against the service catalog
    #[arg(short, long, default_value = DEFAULT_ALIAS)]
    alias: String,
    /// System instructions sent with every prompt
    #[arg(short, long, default_value = DEFAULT_INSTRUCTIONS)]
    instructions: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the service URI and whether it is reachable
    Status,
    /// List models currently served
    Models,
    /// Resolve an alias to a concrete model id
    Resolve { alias: String },
    /// Send one prompt and print the collected answer with its metadata
    Run {
        #[command(flatten)]
        session: SessionArgs,
        /// Request a single non-streamed completion
        #[arg(long)]
        no_stream: bool,
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(long)]
        temperature: Option<f32>,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
        prompt: String,
    },
    /// Send one prompt and print the answer as it streams in
    Chat {
        #[command(flatten)]
        session: SessionArgs,
        prompt: String,
    },
    /// Run a fixed set of sample prompts through one session
    Demo {
        #[command(flatten)]
        session: SessionArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;
    let manager = ServiceManager::new(config)?;

    match cli.command {
        Commands::Status => status(&manager).await?,
        Commands::Models => {
            manager.start_service().await?;
            for model in manager.list_loaded().await? {
                println!("{}", model);
            }
        }
        Commands::Resolve { alias } => {
            manager.start_service().await?;
            println!("{}", manager.resolve(&alias).await?);
        }
        Commands::Run {
            session,
            no_stream,
            max_tokens,
            temperature,
            json,
            prompt,
        } => {
            let options = RunOptions {
                stream: !no_stream,
                max_tokens,
                temperature,
            };
            let session = Session::connect(&manager, session.alias, session.instructions).await?;
            let result = session.run_with(&prompt, &options).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_result(&result);
            }
        }
        Commands::Chat { session, prompt } => {
            let session = Session::connect(&manager, session.alias, session.instructions).await?;
            let mut stream = session.run_stream(&prompt, &RunOptions::default()).await?;
            let mut stdout = std::io::stdout();
            while let Some(fragment) = stream.next().await {
                write!(stdout, "{}", fragment?)?;
                stdout.flush()?;
            }
            writeln!(stdout)?;
        }
        Commands::Demo { session } => demo(&manager, session).await?,
    }

    Ok(())
}

fn build_config(cli: &Cli) -> anyhow::Result<ServiceConfig> {
    let mut config = ServiceConfig::load().context("Failed to load service config")?;
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(key) = &cli.api_key {
        config = config.with_api_key(key.clone());
    }
    if let Some(program) = &cli.spawn {
        config = config.with_launch(LaunchMode::Spawn {
            program: program.clone(),
            args: cli.spawn_args.clone(),
        });
    }
    config.validate()?;
    Ok(config)
}

async fn status(manager: &ServiceManager) -> anyhow::Result<()> {
    println!("Service URI: {}", manager.service_uri());
    println!("Endpoint:    {}", manager.endpoint());
    let running = manager.is_service_running().await;
    println!("Running:     {}", running);
    if running {
        let models = manager.list_loaded().await?;
        println!("Models:      {}", models.len());
    }
    Ok(())
}

fn print_result(result: &RunResult) {
    println!("Response: {}", result.text);
    println!("Model Alias: {}", result.metadata.alias);
    println!("Model ID: {}", result.metadata.resolved_model_id);
    println!("Source: {}", result.metadata.source);
}

async fn demo(manager: &ServiceManager, args: SessionArgs) -> anyhow::Result<()> {
    let session = Session::connect(manager, args.alias, args.instructions).await?;
    tracing::info!(model_id = ?session.model(), "Demo session opened");

    let mut failures = 0;
    for (i, prompt) in DEMO_PROMPTS.iter().enumerate() {
        println!("\n--- Test {} ---", i + 1);
        println!("Query: {}", prompt);
        match session.run(prompt).await {
            Ok(result) => print_result(&result),
            Err(e) => {
                failures += 1;
                eprintln!("Error: {}", e);
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} of {} demo prompts failed", failures, DEMO_PROMPTS.len());
    }
    Ok(())
}
