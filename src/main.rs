use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand};
use schemars::schema_for;
use tokio::io::AsyncBufReadExt;
use tracing::{error, info};

use flowbench::config::EngineConfig;
use flowbench::execution::listener::LoggingListener;
use flowbench::logger::init_tracing;
use flowbench::remote::handler::{CollectingResponseHandler, LoggingRequestHandler};
use flowbench::remote::logging::LogBus;
use flowbench::{
    CommandRequest, Connection, ConnectionSpec, EngineContext, EngineScope, Flow, FlowDef,
    FlowRegistry, RemoteCommand, ScriptingEngine,
};

#[derive(Parser, Debug)]
#[command(
    name = "flowbench",
    about = "Actor dataflow workbench core",
    version = "0.1.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a flow file locally
    Run(RunArgs),

    /// Start the remote scripting engine
    Serve(ServeArgs),

    /// Send a command to a running engine
    Send(SendArgs),

    /// Receive a remote log tap from a running engine
    Tap(TapArgs),

    /// Check a flow file without running it
    Validate { file: PathBuf },

    /// Emit JSON schemas for commands, config and leaf actors
    Schema(SchemaArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    file: PathBuf,

    /// Log level override (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 12345)]
    port: u16,

    #[arg(long, default_value = "flows")]
    flows_dir: PathBuf,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SendArgs {
    /// Command as JSON, e.g. '{"type":"ListFlows"}'
    command: String,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 12345)]
    port: u16,

    /// Listen on this port for the reply and print it
    #[arg(long)]
    reply_port: Option<u16>,

    /// Address the engine can reach this process on
    #[arg(long, default_value = "127.0.0.1")]
    reply_host: String,
}

#[derive(Args, Debug)]
struct TapArgs {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 12345)]
    port: u16,

    /// Local port the engine streams log records to
    #[arg(long, default_value_t = 21346)]
    listen_port: u16,

    /// Address the engine can reach this process on
    #[arg(long, default_value = "127.0.0.1")]
    advertise: String,

    /// Connection failures the tap tolerates (-1 = unlimited)
    #[arg(long, default_value_t = 3)]
    max_failures: i32,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    #[arg(long, default_value = "schemas")]
    out_dir: PathBuf,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Serve(args) => serve(args).await,
        Commands::Send(args) => send(args).await,
        Commands::Tap(args) => tap(args).await,
        Commands::Validate { file } => validate(file),
        Commands::Schema(args) => schema(args),
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let _guard = init_tracing(&args.log_level, args.log_dir.as_deref())?;
    let def = FlowDef::load(&args.file).map_err(|e| anyhow!("{}", e))?;
    let flow = Flow::from_def(def).map_err(|e| anyhow!("{}", e))?;
    flow.add_listener(Box::new(LoggingListener::new()));

    let report = tokio::task::spawn_blocking(move || {
        let report = flow.run();
        report
    })
    .await?
    .map_err(|e| anyhow!("{}", e))?;

    println!(
        "{} actor invocations in {} ms",
        report.records.len(),
        report.total_ms
    );
    if let Some((actor, err)) = &report.error {
        error!("flow failed at '{}': {}", actor, err);
        process::exit(1);
    }
    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig {
            port: args.port,
            flows_dir: args.flows_dir.clone(),
            log_dir: args.log_dir.clone(),
            log_level: args.log_level.clone(),
            ..EngineConfig::default()
        },
    };
    config.apply_env();
    let _guard = init_tracing(&config.log_level, config.log_dir.as_deref())?;

    let registry = Arc::new(FlowRegistry::new());
    if config.flows_dir.exists() {
        let count = registry
            .load_dir(&config.flows_dir)
            .map_err(|e| anyhow!("{}", e))?;
        info!("{} flows registered from {}", count, config.flows_dir.display());
    } else {
        info!("flows directory {} missing, starting empty", config.flows_dir.display());
    }

    let context = EngineContext::new(registry, LogBus::default());
    let engine = ScriptingEngine::new(config.port, EngineScope::Request, context);
    engine.add_request_handler(Box::new(LoggingRequestHandler));

    let runner = Arc::clone(&engine);
    let task = tokio::spawn(async move { runner.execute().await });
    if !engine.wait_until_listening(Duration::from_secs(5)).await {
        bail!("engine did not reach the listening state");
    }
    println!("engine listening on port {}; press Ctrl-C to stop", config.port);

    tokio::signal::ctrl_c().await?;
    println!("\nstopping engine…");
    engine.stop_execution();
    task.await??;
    Ok(())
}

async fn send(args: SendArgs) -> Result<()> {
    let _guard = init_tracing("info", None)?;
    let request: CommandRequest = serde_json::from_str(&args.command)?;
    let mut command = RemoteCommand::new(request);

    let reply = match args.reply_port {
        Some(port) => {
            let context = EngineContext::new(Arc::new(FlowRegistry::new()), LogBus::default());
            let engine = ScriptingEngine::new(port, EngineScope::Response, context);
            let handler = CollectingResponseHandler::new();
            let received = handler.received();
            let failed = handler.failed();
            engine.add_response_handler(Box::new(handler));
            let runner = Arc::clone(&engine);
            let task = tokio::spawn(async move { runner.execute().await });
            if !engine.wait_until_listening(Duration::from_secs(5)).await {
                bail!("response listener did not start");
            }
            command = command
                .with_response_connection(ConnectionSpec::new(&args.reply_host, port));
            Some((engine, task, received, failed))
        }
        None => None,
    };

    Connection::new(ConnectionSpec::new(&args.host, args.port))
        .send(&command)
        .await?;

    if let Some((engine, task, received, failed)) = reply {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        let response = loop {
            if let Some(cmd) = received.lock().unwrap().first().cloned() {
                break Some(cmd);
            }
            if let Some(cmd) = failed.lock().unwrap().first().cloned() {
                break Some(cmd);
            }
            if tokio::time::Instant::now() > deadline {
                break None;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        engine.stop_execution();
        task.await??;
        match response {
            Some(cmd) => println!("{}", serde_json::to_string_pretty(&cmd)?),
            None => bail!("no reply within 30 s"),
        }
    }
    Ok(())
}

async fn tap(args: TapArgs) -> Result<()> {
    let _guard = init_tracing("info", None)?;
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.listen_port)).await?;

    let engine = ConnectionSpec::new(&args.host, args.port);
    Connection::new(engine.clone())
        .send(&RemoteCommand::new(CommandRequest::StartRemoteLogging {
            host: args.advertise.clone(),
            port: args.listen_port,
            max_failures: args.max_failures,
        }))
        .await?;
    println!("waiting for log records on port {}…", args.listen_port);

    let (stream, peer) = listener.accept().await?;
    info!("tap connected from {}", peer);
    let mut lines = tokio::io::BufReader::new(stream).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => println!("{}", line),
                None => break,
            }
        }
    }
    Connection::new(engine)
        .send(&RemoteCommand::new(CommandRequest::StopRemoteLogging))
        .await
        .ok();
    Ok(())
}

fn validate(file: PathBuf) -> Result<()> {
    let def = FlowDef::load(&file).map_err(|e| anyhow!("{}", e))?;
    let flow = Flow::from_def(def).map_err(|e| anyhow!("{}", e))?;
    flow.check().map_err(|e| anyhow!("{}", e))?;
    println!("flow '{}' is valid ({} actors)", flow.id(), flow.actor_count());
    Ok(())
}

fn schema(args: SchemaArgs) -> Result<()> {
    use flowbench::actors::{Expression, Null, SetStorageValue, SetVariable, StorageValue, StringConstants};

    fs::create_dir_all(&args.out_dir)?;
    let schemas = vec![
        ("remote_command", serde_json::to_value(schema_for!(RemoteCommand))?),
        ("engine_config", serde_json::to_value(schema_for!(EngineConfig))?),
        ("string_constants", serde_json::to_value(schema_for!(StringConstants))?),
        ("storage_value", serde_json::to_value(schema_for!(StorageValue))?),
        ("set_storage_value", serde_json::to_value(schema_for!(SetStorageValue))?),
        ("set_variable", serde_json::to_value(schema_for!(SetVariable))?),
        ("expression", serde_json::to_value(schema_for!(Expression))?),
        ("null", serde_json::to_value(schema_for!(Null))?),
    ];
    for (name, schema) in schemas {
        let path = args.out_dir.join(format!("{}.json", name));
        fs::write(&path, serde_json::to_string_pretty(&schema)?)?;
    }
    println!("schemas written to {}", args.out_dir.display());
    Ok(())
}
