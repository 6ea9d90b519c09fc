#![deny(dead_code)] // DO NOT REMOVE THIS EVER
use anyhow::{anyhow, Result};
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use hubline::config::{self, RealtimeConfig};
use hubline::credentials::{load_credentials, save_credentials, Credentials, StaticTokenProvider};
use hubline::hub::AccessTokenProvider;
use hubline::models::{Message, Notification, UserId};
use hubline::utils;
use hubline::{ClientDeps, RealtimeClient};

/// Command line arguments for hubline
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "hubline: terminal client for project chat and notifications.",
    long_about = "hubline connects to the chat and notification hubs of the project server, \
    keeps per-conversation unread counts and shows system notifications as they arrive.\n\n\
    Commands once running:\n\
    /open <user id>   open a conversation\n\
    /close            close the current conversation\n\
    /read             mark all notifications read\n\
    /unread           show unread counters\n\
    /notifications    list stored notifications\n\
    /clear            clear all notifications\n\
    /quit             exit\n\
    Any other line is sent to the open conversation."
)]
struct Args {
    /// Alternative configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Local user id (overrides saved credentials)
    #[arg(long, value_name = "ID")]
    user_id: Option<UserId>,

    /// Server base URL (overrides the configuration)
    #[arg(long, value_name = "URL")]
    server: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Remember the user id and token for the next start
    #[arg(long)]
    save_credentials: bool,
}

/// User id and token from the environment, saved credentials, or a prompt
fn resolve_credentials(server: &str, user_id: Option<UserId>) -> Result<Credentials> {
    let saved = load_credentials()?.filter(|creds| creds.server == server);
    let credentials = match saved {
        Some(creds) => {
            info!("Using saved credentials for user {}", creds.user_id);
            creds.apply_env()
        }
        None => Credentials {
            server: server.to_string(),
            user_id: 0,
            token: None,
        }
        .apply_env(),
    };

    let user_id = match user_id.or(Some(credentials.user_id).filter(|id| *id != 0)) {
        Some(id) => id,
        None => {
            eprintln!("Enter your user id:");
            utils::read_line()?
                .parse()
                .map_err(|e| anyhow!("invalid user id: {}", e))?
        }
    };

    let token = match credentials.get_token() {
        Some(token) => token,
        None => {
            eprintln!("Enter access token:");
            utils::read_line()?
        }
    };

    Ok(Credentials::new(server, user_id, &token))
}

fn print_message(message: &Message, local_user: UserId) {
    let who = if message.sender_id == local_user {
        "you".to_string()
    } else {
        message
            .sender_name
            .clone()
            .unwrap_or_else(|| format!("user {}", message.sender_id))
    };
    println!(
        "[{}] {}: {}",
        message.sent_at.with_timezone(&chrono::Local).format("%H:%M"),
        who,
        message.content
    );
}

fn print_notification(notification: &Notification) {
    let marker = if notification.is_read { " " } else { "*" };
    println!(
        "{} #{} {} ({})",
        marker, notification.id, notification.message, notification.link
    );
}

/// Returns false when the user asked to quit
async fn handle_command(client: &RealtimeClient, line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return true;
    }

    let mut parts = line.splitn(2, ' ');
    match (parts.next(), parts.next().map(str::trim)) {
        (Some("/quit"), _) => return false,
        (Some("/open"), Some(arg)) => match arg.parse::<UserId>() {
            Ok(other) => match client.open_conversation(other).await {
                Ok(messages) => {
                    println!("--- conversation with {} ({} messages) ---", other, messages.len());
                    for message in &messages {
                        print_message(message, client.local_user());
                    }
                }
                Err(e) => println!("Cannot open conversation: {}", e),
            },
            Err(_) => println!("Usage: /open <user id>"),
        },
        (Some("/open"), None) => println!("Usage: /open <user id>"),
        (Some("/close"), _) => {
            client.close_conversation();
            println!("Conversation closed");
        }
        (Some("/read"), _) => {
            let changed = client.mark_all_read();
            println!("{} notifications marked read", changed);
        }
        (Some("/unread"), _) => {
            let snapshot = client.unread_snapshot();
            println!(
                "Unread: {} messages, {} notifications",
                snapshot.messages, snapshot.notifications
            );
            for (key, count) in &snapshot.per_conversation {
                println!("  {}: {}", key, count);
            }
        }
        (Some("/notifications"), _) => {
            let notifications = client.notifications();
            if notifications.is_empty() {
                println!("No notifications");
            }
            for notification in &notifications {
                print_notification(notification);
            }
        }
        (Some("/clear"), _) => {
            client.clear_all();
            println!("Notifications cleared");
        }
        (Some(command), _) if command.starts_with('/') => {
            println!("Unknown command {}", command);
        }
        _ => match client.active_conversation() {
            Some(other) => {
                if let Err(e) = client.send_message(other, line).await {
                    if e.is_retryable() {
                        println!("Not sent ({}), try again once reconnected", e);
                    } else {
                        println!("Not sent: {}", e);
                    }
                }
            }
            None => println!("Open a conversation first: /open <user id>"),
        },
    }
    true
}

async fn run_main_loop(client: &RealtimeClient) -> Result<()> {
    let mut messages = client.subscribe_messages();
    let mut notifications = client.subscribe_notifications();
    let mut chat_state = client.chat_state();
    let mut notification_state = client.notification_state();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = stdin.next_line() => match line? {
                Some(line) => {
                    if !handle_command(client, &line).await {
                        break;
                    }
                }
                None => break,
            },
            message = messages.recv() => match message {
                Ok(message) => print_message(&message, client.local_user()),
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} live messages", skipped),
                Err(RecvError::Closed) => break,
            },
            notification = notifications.recv() => match notification {
                Ok(notification) => print_notification(&notification),
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} notifications", skipped),
                Err(RecvError::Closed) => break,
            },
            Ok(()) = chat_state.changed() => {
                let state = *chat_state.borrow_and_update();
                println!("(chat hub: {:?})", state);
            },
            Ok(()) = notification_state.changed() => {
                let state = *notification_state.borrow_and_update();
                println!("(notification hub: {:?})", state);
            },
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_file = args.log_file.as_ref().and_then(|path| path.to_str());
    utils::setup_logging(log_file, LevelFilter::Info)?;
    info!("System information: {} {}", env::consts::OS, env::consts::ARCH);

    if let Some(path) = args.config.clone() {
        config::set_config_path(path);
    }
    let mut config: RealtimeConfig = config::load_config()?;
    if let Some(server) = &args.server {
        config.server_url = server.clone();
        config.validate()?;
    }

    let credentials = resolve_credentials(&config.server_url, args.user_id)?;
    if args.save_credentials {
        if let Err(e) = save_credentials(&credentials) {
            eprintln!("Warning: Failed to save credentials: {}", e);
        }
    }

    let tokens: Arc<dyn AccessTokenProvider> =
        Arc::new(StaticTokenProvider::from_credentials(&credentials));
    let deps = ClientDeps::from_config(&config, tokens.clone())?;
    let client = RealtimeClient::new(&config, credentials.user_id, deps);

    println!("Connecting to {} as user {}...", config.server_url, credentials.user_id);
    let report = client.start(tokens).await;
    if report.reset {
        println!("Saved notifications were unreadable and have been cleared");
    }
    println!(
        "{} notifications, {} unread. Type /open <user id> to start chatting.",
        report.notifications,
        client.unread_snapshot().notifications
    );

    let result = run_main_loop(&client).await;
    if let Err(e) = &result {
        error!("Main loop failed: {}", e);
    }

    client.shutdown().await;
    println!("Session ended.");
    result
}
