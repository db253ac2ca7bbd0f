use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use stonelink::{
    current_system_time, setup_local_tracing, AppConfig, AppError, AppResult, Connection,
    ConnectionHandler, ConnectionOwner, WireMessage,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Echo every received body back to its sender
    Server {
        /// exit after echoing this many messages
        #[arg(long)]
        max_messages: Option<usize>,
    },
    /// Send messages to the server and wait for the echoes
    Client {
        #[arg(long, default_value_t = 128)]
        count: usize,
        #[arg(long, default_value = "Hello World")]
        message: String,
    },
    PrintConfig,
}

#[derive(Default)]
struct EchoHandler;

impl ConnectionHandler for EchoHandler {
    fn on_message(&mut self, connection: &Arc<Connection>, message: WireMessage) {
        if let Err(e) = connection.send(message.body()) {
            warn!("<{}> echo failed: {}", connection.peer_name(), e);
        }
    }
}

#[derive(Default)]
struct CountingHandler {
    received: usize,
}

impl ConnectionHandler for CountingHandler {
    fn on_message(&mut self, _connection: &Arc<Connection>, _message: WireMessage) {
        self.received += 1;
    }
}

fn main() -> AppResult<()> {
    // load .env before tracing reads RUST_LOG
    dotenv().ok();
    let commandline: CommandLine = CommandLine::parse();
    if std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }
    setup_local_tracing()?;

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let app_config = if config_path.exists() {
        AppConfig::set_up_config(&config_path)?
    } else {
        AppConfig::default()
    };
    let network = app_config.network.clone();

    match commandline.command.unwrap_or(Command::Server { max_messages: None }) {
        Command::PrintConfig => {
            println!("{:#?}", app_config);
            Ok(())
        }
        Command::Server { max_messages } => {
            let mut server = ConnectionOwner::new(network.clone(), EchoHandler)?;
            let address = server.listen(&network.ip, network.port)?;
            info!("{} echo server listening on {}", current_system_time(), address);
            let mut echoed = 0;
            loop {
                let processed = server.process_event();
                echoed += processed;
                if max_messages.is_some_and(|max| echoed >= max) {
                    break;
                }
                if processed == 0 {
                    thread::sleep(Duration::from_millis(1));
                }
            }
            info!("echo server exit after {} messages", echoed);
            Ok(())
        }
        Command::Client { count, message } => {
            let mut client = ConnectionOwner::new(
                network.clone().with_worker_threads(1),
                CountingHandler::default(),
            )?;
            let pending = client.connect_to_server(&network.ip, network.port, |_| {});
            let connection = pending
                .blocking_recv()
                .map_err(|e| AppError::ChannelRecvError(e.to_string()))?
                .ok_or_else(|| {
                    AppError::DetailedIoError(format!(
                        "connect to {}:{} failed",
                        network.ip, network.port
                    ))
                })?;
            for i in 0..count {
                let body = format!("{} {}", message, i);
                loop {
                    match connection.send(&body) {
                        Ok(_) => break,
                        Err(AppError::SendQueueFull(_)) => {
                            client.process_event();
                            thread::sleep(Duration::from_millis(1));
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            while client.handler().received < count {
                if client.process_event() == 0 {
                    thread::sleep(Duration::from_millis(1));
                }
            }
            info!(
                "{} client received {} echoes from {}",
                current_system_time(),
                count,
                connection.peer_name()
            );
            drop(connection);
            Ok(())
        }
    }
}
