//! MCP Runtime - talk to Model Context Protocol servers from the command line

use std::collections::HashMap;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use serde_json::{Value, json};
use tracing::{debug, info};

use mcp_runtime::{
    ClassifiedError, Error, McpService,
    cli::{Cli, Command, Target},
    config::Config,
    daemon::methods,
    setup_tracing,
};

/// One facade operation, independent of where it runs
enum Operation {
    Tools,
    Call { tool: String, arguments: Value },
    Resources,
    Read { uri: String },
    Prompts,
    Prompt { name: String, arguments: HashMap<String, String> },
    Info,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    if cli.log_format.is_some() {
        config.log.format = cli.log_format;
    }
    if cli.debug {
        config.transport.debug = true;
    }
    if let Some(timeout) = cli.timeout {
        config.transport.request_timeout = timeout;
        config.transport.connect_timeout = config.transport.connect_timeout.min(timeout);
        config.session.handshake_timeout = timeout;
    }

    // Setup tracing
    if let Err(e) = setup_tracing(&config.log.level, config.log.format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Command::Daemon { target } => run_daemon(&config, &target).await,
        command => {
            let (target, operation) = operation(command);
            match operation {
                Ok(operation) => run_operation(&config, &target, operation).await,
                Err(e) => Err(e),
            }
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

fn operation(command: Command) -> (Target, anyhow::Result<Operation>) {
    match command {
        Command::Tools { target } => (target, Ok(Operation::Tools)),
        Command::Call { tool, args, target } => {
            let arguments = serde_json::from_str(&args)
                .with_context(|| format!("--args is not valid JSON: {args}"));
            (target, arguments.map(|arguments| Operation::Call { tool, arguments }))
        }
        Command::Resources { target } => (target, Ok(Operation::Resources)),
        Command::Read { uri, target } => (target, Ok(Operation::Read { uri })),
        Command::Prompts { target } => (target, Ok(Operation::Prompts)),
        Command::Prompt {
            name,
            arguments,
            target,
        } => (
            target,
            Ok(Operation::Prompt {
                name,
                arguments: arguments.into_iter().collect(),
            }),
        ),
        Command::Info { target } => (target, Ok(Operation::Info)),
        Command::Daemon { target } => (
            target,
            Err(anyhow::anyhow!("daemon is not a client operation")),
        ),
    }
}

async fn run_operation(config: &Config, target: &Target, operation: Operation) -> anyhow::Result<()> {
    let output = if let Some(socket) = &target.socket {
        via_daemon(socket, target, operation).await?
    } else {
        direct(config, target, operation).await?
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Connect, run one operation, disconnect
async fn direct(config: &Config, target: &Target, operation: Operation) -> anyhow::Result<Value> {
    if !target.is_specified() {
        anyhow::bail!("name a server: a command after `--` for stdio, or --url");
    }
    let descriptor = target.connect_params()?.to_descriptor()?;

    let service = McpService::new(config);
    let result = async {
        let server = service.connect(descriptor).await?;
        debug!(server = %server.name, "Connected");
        execute(&service, operation).await
    }
    .await;
    service.shutdown().await;
    result
}

async fn execute(service: &McpService, operation: Operation) -> anyhow::Result<Value> {
    Ok(match operation {
        Operation::Tools => json!({ "tools": service.list_tools().await? }),
        Operation::Call { tool, arguments } => {
            serde_json::to_value(service.call_tool(&tool, arguments).await?)?
        }
        Operation::Resources => json!({ "resources": service.list_resources().await? }),
        Operation::Read { uri } => json!({ "contents": service.read_resource(&uri).await? }),
        Operation::Prompts => json!({ "prompts": service.list_prompts().await? }),
        Operation::Prompt { name, arguments } => {
            serde_json::to_value(service.get_prompt(&name, arguments).await?)?
        }
        Operation::Info => json!({
            "server": service.server_info()?,
            "diagnostics": service.diagnostics(),
        }),
    })
}

#[cfg(unix)]
async fn via_daemon(
    socket: &std::path::Path,
    target: &Target,
    operation: Operation,
) -> anyhow::Result<Value> {
    use mcp_runtime::daemon::DaemonClient;

    let mut client = DaemonClient::connect(socket).await?;

    if target.is_specified() {
        let status = client.call(methods::IS_CONNECTED, None).await?;
        if status["connected"] != Value::Bool(true) {
            let params = serde_json::to_value(target.connect_params()?)?;
            client.call(methods::CONNECT, Some(params)).await?;
        }
    }

    let value = match operation {
        Operation::Tools => client.call(methods::LIST_TOOLS, None).await?,
        Operation::Call { tool, arguments } => {
            client
                .call(
                    methods::CALL_TOOL,
                    Some(json!({ "name": tool, "arguments": arguments })),
                )
                .await?
        }
        Operation::Resources => client.call(methods::LIST_RESOURCES, None).await?,
        Operation::Read { uri } => {
            client
                .call(methods::READ_RESOURCE, Some(json!({ "uri": uri })))
                .await?
        }
        Operation::Prompts => client.call(methods::LIST_PROMPTS, None).await?,
        Operation::Prompt { name, arguments } => {
            client
                .call(
                    methods::GET_PROMPT,
                    Some(json!({ "name": name, "arguments": arguments })),
                )
                .await?
        }
        Operation::Info => {
            let server = client.call(methods::SERVER_INFO, None).await?;
            let diagnostics = client.call(methods::DIAGNOSTICS, None).await?;
            json!({ "server": server, "diagnostics": diagnostics })
        }
    };
    Ok(value)
}

#[cfg(not(unix))]
async fn via_daemon(
    _socket: &std::path::Path,
    _target: &Target,
    _operation: Operation,
) -> anyhow::Result<Value> {
    anyhow::bail!("the daemon requires unix domain sockets")
}

#[cfg(unix)]
async fn run_daemon(config: &Config, target: &Target) -> anyhow::Result<()> {
    use mcp_runtime::daemon::DaemonServer;

    let socket = target
        .socket
        .clone()
        .unwrap_or_else(|| config.daemon.resolved_socket_path());

    let service = McpService::new(config);
    if target.is_specified() {
        let descriptor = target.connect_params()?.to_descriptor()?;
        let server = service.connect(descriptor).await?;
        info!(server = %server.name, version = %server.version, "Daemon session ready");
    }

    let server = DaemonServer::bind(service, &socket)
        .with_context(|| format!("cannot listen on {}", socket.display()))?;
    tokio::spawn(shutdown_signal(server.shutdown_token()));
    server.run().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn run_daemon(_config: &Config, _target: &Target) -> anyhow::Result<()> {
    anyhow::bail!("the daemon requires unix domain sockets")
}

/// Cancel `token` on Ctrl+C or SIGTERM
#[cfg(unix)]
async fn shutdown_signal(token: tokio_util::sync::CancellationToken) {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    token.cancel();
}

/// Print an error with its classification and guidance
fn report(error: &anyhow::Error) {
    if let Some(classified) = error.downcast_ref::<ClassifiedError>() {
        eprintln!("Error [{}]: {}", classified.category(), classified.user_message());
        eprintln!("  {}", classified.message());
        for action in classified.recovery_actions() {
            eprintln!("  - {action}");
        }
        return;
    }

    // Classified errors relayed by the daemon arrive as JSON-RPC errors
    if let Some(Error::JsonRpc {
        message,
        data: Some(data),
        ..
    }) = error.downcast_ref::<Error>()
    {
        let category = data["category"].as_str().unwrap_or("unknown");
        let user_message = data["userMessage"].as_str().unwrap_or(message);
        eprintln!("Error [{category}]: {user_message}");
        eprintln!("  {message}");
        if let Some(actions) = data["recoveryActions"].as_array() {
            for action in actions.iter().filter_map(Value::as_str) {
                eprintln!("  - {action}");
            }
        }
        return;
    }

    eprintln!("Error: {error:#}");
}
