use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use minibroker::{
    setup_tracing, AppError, AppResult, HelloHandler, LengthPrefixedCodec, Server, ServerConfig,
};
use tokio::{runtime, signal};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory for the rolling log files
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// print the effective configuration and exit
    PrintConfig,
}

type BrokerServer = Server<LengthPrefixedCodec, HelloHandler>;

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let config = ServerConfig::set_up_config(config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let _tracing_guard = setup_tracing(&commandline.log_dir, commandline.verbose)?;

    let codec = LengthPrefixedCodec::new(config.max_frame_size());
    let server = Arc::new(Server::new(config, codec, HelloHandler)?);

    rt.block_on(run(server))
}

async fn run(server: Arc<BrokerServer>) -> AppResult<()> {
    let mut serving = tokio::spawn({
        let server = server.clone();
        async move { server.start().await }
    });

    tokio::select! {
        res = &mut serving => {
            return match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    error!("Error starting broker server: {}", err);
                    Err(err)
                }
                Err(err) => Err(AppError::IllegalStateError(format!(
                    "accept loop task failed: {}",
                    err
                ))),
            };
        }
        res = wait_for_signal() => {
            res?;
            info!("get shutdown signal");
        }
    }

    tokio::select! {
        res = server.shutdown() => {
            if let Err(err) = &res {
                error!("Error closing broker server: {}", err);
            }
            res?;
        }
        res = wait_for_signal() => {
            res?;
            warn!("second shutdown signal, forcing shutdown");
            server.force_shutdown()?;
        }
    }

    match serving.await {
        Ok(res) => res,
        Err(err) => Err(AppError::IllegalStateError(format!(
            "accept loop task failed: {}",
            err
        ))),
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> AppResult<()> {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};

    let mut sigterm = unix_signal(SignalKind::terminate())?;
    tokio::select! {
        res = signal::ctrl_c() => res?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> AppResult<()> {
    signal::ctrl_c().await?;
    Ok(())
}
