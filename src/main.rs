use std::error::Error;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use popmsg::config::{Settings, load_config};
use popmsg::flow::Endpoint;
use popmsg::message::{Destination, Message};
use popmsg::request_reply::{run_replier, run_requester};
use popmsg::router::Router;
use popmsg::session::Session;
use popmsg::transport::{WebSocketTransport, start_websocket_server};
use popmsg::utils::logging;

#[derive(Parser, Debug)]
#[command(name = "popmsg", version, about = "Messaging runtime, router and request/reply demos")]
struct Cli {
    /// Router URL for the client commands; overrides `session.url`.
    #[arg(long, global = true, env = "POPMSG_URL")]
    url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the router behind a WebSocket listener.
    Server,
    /// Answer arithmetic requests until interrupted.
    Replier {
        #[command(flatten)]
        target: Target,
    },
    /// Send one request per operation and wait for each reply.
    Requester {
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value_t = 9)]
        left: i32,
        #[arg(long, default_value_t = 5)]
        right: i32,
    },
}

/// Requests travel over either a queue or a topic, never both.
#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct Target {
    /// Request queue name.
    queue: Option<String>,
    /// Request topic.
    #[arg(short, long)]
    topic: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut settings = load_config()?;
    logging::init(&settings.logging);
    if let Some(url) = cli.url {
        settings.session.url = url;
    }

    match cli.command {
        Command::Server => serve(&settings).await,
        Command::Replier { target } => {
            let endpoint = match (target.queue, target.topic) {
                (Some(queue), _) => Endpoint::queue(queue),
                (None, Some(topic)) => {
                    Endpoint::topic_endpoint(format!("replier-{}", Uuid::new_v4()), topic)
                }
                (None, None) => return Err("a request queue or topic is required".into()),
            };
            let session = connect(&settings).await?;
            let shutdown = CancellationToken::new();
            let token = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    token.cancel();
                }
            });
            let report = run_replier(&session, endpoint, shutdown).await;
            session.disconnect();
            info!("answered {} requests", report?.served);
            Ok(())
        }
        Command::Requester {
            target,
            left,
            right,
        } => {
            let destination = match (target.queue, target.topic) {
                (Some(queue), _) => Destination::queue(queue),
                (None, Some(topic)) => Destination::topic(topic),
                (None, None) => return Err("a request queue or topic is required".into()),
            };
            let session = connect(&settings).await?;
            let answered = run_requester(&session, destination, left, right).await;
            session.disconnect();
            info!("{} of 5 requests answered", answered?.len());
            Ok(())
        }
    }
}

async fn serve(settings: &Settings) -> Result<(), Box<dyn Error>> {
    let router = Router::new(settings.router.clone())?;
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = TcpListener::bind(&addr).await?;
    tokio::select! {
        _ = start_websocket_server(listener, router) => {}
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}

async fn connect(settings: &Settings) -> Result<Session, Box<dyn Error>> {
    let transport = WebSocketTransport::new(settings.session.url.clone());
    let session = Session::connect(
        settings,
        Arc::new(transport),
        Arc::new(|message: Message| {
            warn!(destination = %message.destination.name(), "unexpected direct message");
        }),
    )
    .await?;
    Ok(session)
}
