mod chat;
mod config;
mod console;
mod error;
mod render;

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use centrifuge_client::{Client, Event, Events, HistoryPager, issue_token};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::FormatTime;

use crate::config::{ChatConfig, Overrides};
use crate::error::{ConsoleError, ConsoleResult};
use crate::render::EventRenderer;

/// How long to wait for the renderer to drain after the client closed.
const RENDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "chat-console", version)]
struct Cli {
    /// YAML config file; flags and environment take precedence over it
    #[arg(long, env = "CHAT_CONFIG")]
    config: Option<PathBuf>,
    /// WebSocket endpoint [default: ws://localhost:8088/connection/websocket]
    #[arg(long, env = "CHAT_ENDPOINT")]
    endpoint: Option<String>,
    /// Secret the connection token is signed with
    #[arg(long, env = "CHAT_TOKEN_SECRET", hide_env_values = true)]
    secret: Option<String>,
    /// User ID put in the token subject [default: user-4]
    #[arg(long, env = "CHAT_USER")]
    user: Option<String>,
    /// Channel to read history from, subscribe to, and publish on [default: parser-3]
    #[arg(long, env = "CHAT_CHANNEL")]
    channel: Option<String>,
    /// Number of history publications printed at startup [default: 100]
    #[arg(long)]
    history_limit: Option<u32>,
    /// Token lifetime in seconds, 0 for no expiry [default: 0]
    #[arg(long)]
    token_ttl: Option<i64>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            endpoint: self.endpoint.clone(),
            secret: self.secret.clone(),
            user: self.user.clone(),
            channel: self.channel.clone(),
            history_limit: self.history_limit,
            token_ttl: self.token_ttl,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!("{e}");
            eprintln!("error: {e}");
            1
        }
    };
    // A pending stdin read holds a blocking thread; exit without joining it.
    std::process::exit(code);
}

async fn run(cli: Cli) -> ConsoleResult<()> {
    let config = config::resolve(cli.config.as_deref(), cli.overrides()).await?;
    info!(
        endpoint = %config.endpoint,
        user = %config.user,
        channel = %config.channel,
        "starting chat console"
    );

    let token = issue_token(config.secret.as_bytes(), &config.user, config.token_expiry())?;
    let (client, mut events) = Client::new(config.client_config(token));
    let mut renderer = EventRenderer::new();

    client.connect()?;
    wait_connected(&mut events, &mut renderer).await?;

    print_history(&client, &config).await;

    let sub = client.new_subscription(&config.channel, config.subscription_config())?;
    sub.subscribe()?;

    info!("Print something and press ENTER to send");

    let renderer_task = tokio::spawn(renderer.run(events));
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let console_task = tokio::spawn(console::run_console(stdin, client.clone(), sub));

    tokio::select! {
        _ = client.closed() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("failed to listen for Ctrl-C: {e}");
            }
            info!("interrupted, closing client");
            client.close().await;
        }
    }

    if let Err(e) = console_task.await {
        warn!("console task failed: {e}");
    }
    match tokio::time::timeout(RENDER_DRAIN_TIMEOUT, renderer_task).await {
        Ok(Ok(renderer)) => {
            info!(decode_errors = renderer.decode_errors(), "event stream closed");
        }
        Ok(Err(e)) => warn!("renderer task failed: {e}"),
        Err(_) => warn!("renderer did not finish in time"),
    }
    Ok(())
}

/// Render events until the first connect attempt settles.
async fn wait_connected(events: &mut Events, renderer: &mut EventRenderer) -> ConsoleResult<()> {
    while let Some(event) = events.next().await {
        match event {
            Event::Connected { .. } => {
                renderer.render(event);
                return Ok(());
            }
            Event::Disconnected { code, ref reason } => {
                let message = format!("{reason} (code {code})");
                renderer.render(event);
                return Err(ConsoleError::Connect(message));
            }
            Event::Closed => {
                renderer.render(event);
                return Err(ConsoleError::Connect("client closed".to_string()));
            }
            other => renderer.render(other),
        }
    }
    Err(ConsoleError::Connect("event stream ended".to_string()))
}

/// Print one page of channel history to stdout. Failures are logged only.
async fn print_history(client: &Client, config: &ChatConfig) {
    let mut pager = HistoryPager::new(config.channel.as_str(), config.history_limit);
    match pager.next_page(client).await {
        Ok(page) => {
            info!(
                channel = %config.channel,
                count = page.publications.len(),
                end_reached = page.end_reached,
                "history"
            );
            for publication in page.publications {
                println!("{}", String::from_utf8_lossy(&publication.data));
            }
        }
        Err(e) => warn!(channel = %config.channel, "history unavailable: {e}"),
    }
}
