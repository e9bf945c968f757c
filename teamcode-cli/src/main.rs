//! TeamCode terminal client.
//!
//! Opens one shared file, prints it, and reprints it whenever another
//! user changes it. Ctrl-C leaves the file and exits.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;
use teamcode_collab::{ChangeOutcome, ClientConfig, SessionController, WsTransport};
use teamcode_core::PieceTable;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "teamcode")]
#[command(about = "Follow a shared document from the terminal")]
#[command(version)]
struct Cli {
    /// Path of the file on the server
    file: String,
    /// JSON settings file
    settings: Option<PathBuf>,
    /// Override the configured username
    #[arg(long)]
    username: Option<String>,
    /// Override the configured server URL
    #[arg(long)]
    server: Option<String>,
    /// Seconds between reconnect attempts, 0 to give up on disconnect
    #[arg(long, default_value_t = 2)]
    reconnect_secs: u64,
}

/// Print the document with line numbers, marking locked pieces.
fn print_document(table: &PieceTable) {
    let mut line_no = 1;
    for piece in table.project() {
        let marker = if piece.username.is_empty() {
            ' '
        } else {
            '*'
        };
        for line in &piece.text {
            println!("{line_no:>5}{marker} {line}");
            line_no += 1;
        }
        if !piece.username.is_empty() {
            println!("      ^ locked by {}", piece.username);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.settings {
        Some(path) => ClientConfig::from_json_file(path)?,
        None => ClientConfig::default(),
    };
    let config = config.with_overrides(cli.username, cli.server)?;

    info!("Connecting to {} as {}", config.server_url, config.username);
    let reconnect = (cli.reconnect_secs > 0).then(|| Duration::from_secs(cli.reconnect_secs));
    let transport = Arc::new(WsTransport::from_config(&config, reconnect).await?);
    let controller = SessionController::new(transport.clone(), config);

    let username = controller.login().await?;
    info!("Logged in as {username}");
    controller.open_file(&cli.file).await?;
    print_document(&controller.table().await);

    let (changed_tx, mut changed_rx) = mpsc::unbounded_channel();
    let printer = controller.clone();
    tokio::spawn(async move {
        while changed_rx.recv().await.is_some() {
            let state = printer.state().lock().await;
            println!();
            print_document(state.table());
        }
    });

    tokio::select! {
        result = controller.run(move |outcome| {
            info!("{outcome:?}");
            if !matches!(outcome, ChangeOutcome::CursorsChanged) {
                let _ = changed_tx.send(());
            }
        }) => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted, leaving {}", cli.file),
    }

    controller.close_file().await?;
    transport.close().await;
    Ok(())
}
