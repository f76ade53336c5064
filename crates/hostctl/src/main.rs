mod cli;

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use host_control::config::load_config;
use host_control::{HostConfig, HostController, MountOptions, TraceOptions};
use host_exec::{Endpoint, ExecOptions};
use tracing::Level;

use crate::cli::{Args, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_to_stderr)?;

    let config = if args.config.exists() {
        load_config(&args.config)
            .with_context(|| format!("failed to load config {}", args.config.display()))?
    } else {
        HostConfig::default()
    };
    let endpoint = match args.host.as_deref() {
        Some(host) if !host.is_empty() => Endpoint::remote(host, args.user.clone()),
        _ => Endpoint::local(),
    };
    let mut controller = HostController::new(endpoint, config)
        .await
        .context("failed to set up host controller")?;

    let result = dispatch(&mut controller, &args.command).await;
    controller.cleanup().await;
    result
}

async fn dispatch(controller: &mut HostController, command: &Command) -> anyhow::Result<()> {
    match command {
        Command::Run {
            sudo,
            timeout,
            command,
        } => {
            let cmd = command.join(" ");
            let mut opts = ExecOptions::default().at(Level::INFO).with_msg("Run: ");
            opts.elevate = *sudo;
            let run = controller.run_cmd(&cmd, &opts);
            let output = match timeout {
                Some(secs) => tokio::time::timeout(Duration::from_secs_f64(*secs), run)
                    .await
                    .with_context(|| format!("command timed out after {secs}s"))??,
                None => run.await?,
            };
            print!("{}", output.stdout);
            Ok(())
        }
        Command::Capture {
            duration,
            interface,
            peers,
        } => {
            let opts = TraceOptions {
                interface: interface.clone(),
                peers: peers.clone(),
                ..TraceOptions::default()
            };
            let file = controller.trace_start(&opts).await?;
            tokio::time::sleep(Duration::from_secs_f64(*duration)).await;
            controller.trace_stop().await;
            println!("{}", controller.trace_open(Some(&file))?.display());
            Ok(())
        }
        Command::Mount => {
            match controller.mount(&MountOptions::default()).await? {
                Some(data_path) => println!("{}", data_path.display()),
                None => tracing::info!("mounting is disabled"),
            }
            Ok(())
        }
        Command::Umount => controller.umount().await,
        Command::Drop { target, duration } => {
            let (ipaddr, port) = target
                .rsplit_once(':')
                .with_context(|| format!("expected ADDR:PORT, got {target}"))?;
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid port in {target}"))?;
            controller
                .network_drop(ipaddr.trim_matches(['[', ']']), port)
                .await?;
            tracing::info!(rule = %target, "partition in place, Ctrl-C lifts it");
            match duration {
                Some(secs) => tokio::time::sleep(Duration::from_secs_f64(*secs)).await,
                None => tokio::signal::ctrl_c()
                    .await
                    .context("failed to wait for Ctrl-C")?,
            }
            Ok(())
        }
        Command::Reset => {
            controller.network_reset().await;
            Ok(())
        }
    }
}

fn init_tracing(log_to_stderr: bool) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt().with_env_filter(
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
    );
    if log_to_stderr {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
    Ok(())
}
