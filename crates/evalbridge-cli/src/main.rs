//! evalbridge CLI: evaluate on a protocol peer, run bridge nodes, send
//! requests through them.

mod cli;
mod cmd;
mod config;
mod ui;

use crate::cli::*;
use clap::Parser;
use evalbridge_types::config::BridgeConfig;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    let config = config::load_config(cli.config.as_deref());

    let result = match cli.command {
        Commands::Id(IdCommands::New { count, tag }) => {
            cmd::id::cmd_id_new(count, tag.as_deref());
            Ok(())
        }
        Commands::Id(IdCommands::Inspect { id }) => cmd::id::cmd_id_inspect(&id),
        Commands::Config(ConfigCommands::Show) => cmd::config::cmd_config_show(&config),
        Commands::Config(ConfigCommands::Path) => {
            cmd::config::cmd_config_path();
            Ok(())
        }
        command => match tokio::runtime::Runtime::new() {
            Ok(rt) => rt.block_on(run_async(command, &config)),
            Err(e) => Err(anyhow::anyhow!("failed to start the async runtime: {e}")),
        },
    };

    if let Err(e) = result {
        report_error(&e);
        std::process::exit(1);
    }
}

fn report_error(e: &anyhow::Error) {
    let msg = format!("{e:#}");
    if msg.contains("cannot connect") || msg.contains("cannot reach") {
        ui::failure(
            &msg,
            Some("Check the address, or the [peer] and [bridge] sections of `evalbridge config show`"),
        );
    } else if msg.contains("cannot listen") {
        ui::failure(&msg, Some("Pick another address with --listen"));
    } else {
        ui::failure(&msg, None);
    }
}

async fn run_async(command: Commands, config: &BridgeConfig) -> anyhow::Result<()> {
    match command {
        Commands::Eval {
            code,
            host,
            port,
            timeout_ms,
            ns,
            json,
        } => cmd::eval::cmd_eval(config, &code, host, port, timeout_ms, ns, json).await,
        Commands::Describe { host, port } => cmd::eval::cmd_describe(config, host, port).await,
        Commands::Serve { listen, connect } => {
            cmd::bridge::cmd_serve(config, listen, connect).await
        }
        Commands::Call {
            op,
            args,
            bridge,
            local,
            json,
        } => cmd::bridge::cmd_call(config, &op, args, bridge, local, json).await,
        Commands::Id(_) | Commands::Config(_) => Ok(()),
    }
}
