use anyhow::{Context, Result, bail};
use clap::Parser;
use corevisor::cli::{Cli, Commands, settings_path, version_text};
use corevisor::shutdown::spawn_signal_listener;
use corevisor::{
    ControlServer, FileCommandSource, PlatformProcessManagerFactory, ProcessManagerFactory,
    Supervisor, logging, privilege, pump,
};
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.command == Some(Commands::Version) {
        println!("{}", version_text());
        return ExitCode::SUCCESS;
    }

    let _logging = match logging::init(&cli.log_options()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("corevisor: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli).await {
        Ok(()) => {
            info!("corevisor shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "corevisor failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.load_config()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        platform = PlatformProcessManagerFactory::platform_name(),
        settings = ?settings_path(&cli, &config),
        base_dir = %config.base_dir.display(),
        "Starting corevisor"
    );

    if config.require_elevated && !privilege::is_elevated() {
        bail!("corevisor must be run as an administrator/root");
    }

    let supervisor = Supervisor::builder(config.clone()).build();
    let token = supervisor.shutdown_coordinator().token();

    if config.rpc {
        let server = ControlServer::bind(config.listen.as_str(), supervisor.clone())
            .await
            .with_context(|| format!("Cannot serve control surface on {}", config.listen))?;
        tokio::spawn(server.serve(token.clone()));
    }

    if let Some(path) = config.command_file_path() {
        info!(path = %path.display(), "Watching command file");
        let source = FileCommandSource::new(path, config.command_poll());
        tokio::spawn(pump(source, supervisor.clone(), token.clone()));
    }

    let signals = spawn_signal_listener(supervisor.clone());
    supervisor.shutdown_coordinator().terminated().await;
    signals.abort();
    Ok(())
}
