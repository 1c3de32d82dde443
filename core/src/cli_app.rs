use crate::backend::HttpBackend;
use crate::client::Client;
use crate::config::Config;
use crate::model::Principal;
use crate::reconciler::SendOutcome;
use crate::utils::{Notice, NoticeLevel};
use crate::view::{Composer, ConversationSnapshot, ViewState};
use colored::*;
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Terminal front-end for the `proconnect` binary.
pub async fn run(args: Vec<String>) -> anyhow::Result<()> {
    let bin = args
        .first()
        .map(|s| s.as_str())
        .unwrap_or("proconnect")
        .to_string();

    let (config, rest) = Config::from_args(args.get(1..).unwrap_or(&[]))
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let Some(command) = rest.first() else {
        print_usage(&bin);
        return Ok(());
    };

    let client = Client::connect_http(config)?;

    match command.as_str() {
        "login" => {
            if rest.len() < 3 {
                eprintln!("{}", format!("Usage: {} login <email> <password>", bin).yellow());
                return Ok(());
            }
            login(&client, &rest[1], &rest[2]).await?;
        }
        "whoami" => {
            whoami(&client).await?;
        }
        "logout" => {
            require_session(&client).await?;
            client.logout().await?;
            println!("{} Logged out", "✓".green().bold());
        }
        "inbox" => {
            require_session(&client).await?;
            inbox(&client).await?;
        }
        "history" => {
            if rest.len() < 2 {
                eprintln!("{}", format!("Usage: {} history <peer_id>", bin).yellow());
                return Ok(());
            }
            require_session(&client).await?;
            history(&client, &rest[1]).await?;
        }
        "send" => {
            if rest.len() < 3 {
                eprintln!("{}", format!("Usage: {} send <peer_id> <message>", bin).yellow());
                return Ok(());
            }
            require_session(&client).await?;
            let message = rest[2..].join(" ");
            send(&client, &rest[1], &message).await?;
        }
        "delete" => {
            if rest.len() < 3 {
                eprintln!("{}", format!("Usage: {} delete <peer_id> <message_id>", bin).yellow());
                return Ok(());
            }
            require_session(&client).await?;
            client.reconciler()?.delete(&rest[1], &rest[2]).await?;
            println!("{} Message {} deleted", "✓".green().bold(), rest[2].cyan());
        }
        "chat" => {
            if rest.len() < 2 {
                eprintln!("{}", format!("Usage: {} chat <peer_id>", bin).yellow());
                return Ok(());
            }
            require_session(&client).await?;
            chat(&client, &rest[1]).await?;
        }
        _ => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), command.red());
            print_usage(&bin);
        }
    }

    Ok(())
}

fn print_usage(bin: &str) {
    println!("{}", "⚡ ProConnect messaging".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  {} [--backend <url>] [--push <host:port>] <command> [args]", bin.cyan());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {} <email> <password>      Log in and print the session cookie", "login".cyan());
    println!("  {}                         Show the logged-in identity", "whoami".cyan());
    println!("  {}                         End the session", "logout".cyan());
    println!("  {}                          List connections you can message", "inbox".cyan());
    println!("  {} <peer_id>             Print a conversation", "history".cyan());
    println!("  {} <peer_id> <message>      Send a message", "send".cyan());
    println!("  {} <peer_id> <message_id> Delete one of your messages", "delete".cyan());
    println!("  {} <peer_id>                Live conversation (/retry, /delete <id>, /quit)", "chat".cyan());
    println!();
    println!("Set {} to reuse a session between invocations.", "PROCONNECT_SESSION".yellow());
}

async fn require_session(client: &Client<HttpBackend>) -> anyhow::Result<Principal> {
    match client.restore_session().await? {
        Some(principal) => Ok(principal),
        None => Err(anyhow::anyhow!(
            "Not logged in. Run `login` and export PROCONNECT_SESSION"
        )),
    }
}

async fn login(client: &Client<HttpBackend>, email: &str, password: &str) -> anyhow::Result<()> {
    let principal = client.login(email, password).await?;
    println!(
        "{} Logged in as {}",
        "✓".green().bold(),
        principal.identity().display_name.cyan()
    );
    if let Some(cookie) = client.backend().session_cookie().await {
        println!("  export PROCONNECT_SESSION='{}'", cookie);
    }
    Ok(())
}

async fn whoami(client: &Client<HttpBackend>) -> anyhow::Result<()> {
    match client.restore_session().await? {
        Some(Principal::User(user)) => {
            println!("{} {} ({})", "user".green(), user.display_name.cyan(), user.id.dimmed())
        }
        Some(Principal::Company(company)) => println!(
            "{} {} ({})",
            "company".green(),
            company.display_name.cyan(),
            company.id.dimmed()
        ),
        None => println!("{}", "Not logged in".yellow()),
    }
    Ok(())
}

async fn inbox(client: &Client<HttpBackend>) -> anyhow::Result<()> {
    let connections = client.inbox().await?;
    if connections.is_empty() {
        println!("{}", "No connections yet! Start exploring and connect.".yellow());
        return Ok(());
    }
    println!(
        "{}",
        format!("Conversations ({})", connections.len()).bright_cyan().bold()
    );
    println!("{}", "─".repeat(60).dimmed());
    for c in connections {
        println!(
            "  {} {} {}",
            c.fullname.bright_white().bold(),
            c.headline.unwrap_or_default().dimmed(),
            format!("[{}]", c.next_user_id).cyan()
        );
    }
    Ok(())
}

async fn history(client: &Client<HttpBackend>, peer_id: &str) -> anyhow::Result<()> {
    let self_id = client.reconciler()?.self_id()?;
    match client.conversation(peer_id).await? {
        None => println!("{}", "Not a valid conversation partner".yellow()),
        Some(conversation) => {
            let snapshot = ConversationSnapshot::build(peer_id, &self_id, &conversation);
            if snapshot.lines.is_empty() {
                print_empty();
            } else {
                print_snapshot(&snapshot);
            }
        }
    }
    Ok(())
}

async fn send(client: &Client<HttpBackend>, peer_id: &str, message: &str) -> anyhow::Result<()> {
    match client.reconciler()?.send(peer_id, message).await {
        SendOutcome::Settled(m) => {
            println!("{} Message sent! ID: {}", "✓".green().bold(), m.id.cyan());
            Ok(())
        }
        SendOutcome::Rejected => {
            eprintln!("{}", "Nothing to send".yellow());
            Ok(())
        }
        SendOutcome::Failed(e) => Err(e.into()),
    }
}

async fn chat(client: &Client<HttpBackend>, peer_id: &str) -> anyhow::Result<()> {
    let view = client.open_conversation(peer_id)?;
    let composer = Composer::new();

    let mut updates = Box::pin(view.updates());
    let mut notices = client.notifier().subscribe();
    let printer = tokio::spawn(async move {
        loop {
            tokio::select! {
                state = updates.next() => match state {
                    Some(state) => print_state(&state),
                    None => break,
                },
                notice = notices.recv() => match notice {
                    Ok(notice) => print_notice(&notice),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(_) => break,
                },
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        match input {
            "/quit" | "/q" => break,
            "/retry" => view.retry(),
            _ if input.starts_with("/delete ") => {
                let id = input.trim_start_matches("/delete ").trim();
                // Failures are already reported as notices
                let _ = view.delete(id).await;
            }
            _ => {
                composer.set(line.as_str());
                if let SendOutcome::Rejected = view.submit(&composer).await {
                    eprintln!("{}", "Type a message first".dimmed());
                }
            }
        }
    }

    view.close();
    printer.abort();
    Ok(())
}

fn print_state(state: &ViewState) {
    match state {
        ViewState::Disabled => println!("{}", "Not a valid conversation partner".yellow()),
        ViewState::Loading => println!("{}", "Loading conversation...".dimmed()),
        ViewState::Empty { .. } => print_empty(),
        ViewState::Ready(snapshot) => print_snapshot(snapshot),
        ViewState::Error {
            message,
            retryable,
            last_good,
        } => {
            if let Some(snapshot) = last_good {
                print_snapshot(snapshot);
            }
            eprintln!("{} {}", "✗ Error:".red().bold(), message.red());
            if *retryable {
                eprintln!("  type {} to try again", "/retry".yellow());
            }
        }
    }
}

fn print_empty() {
    println!("{}", "Let's start the conversation!".bright_cyan().bold());
    println!("{}", "Share your thoughts and send a message.".dimmed());
}

fn print_snapshot(snapshot: &ConversationSnapshot) {
    println!(
        "{}",
        format!("╭─ {} ", snapshot.title()).bright_cyan()
    );
    for line in &snapshot.lines {
        let time = line.created_at.format("%Y-%m-%d %H:%M");
        let name = if line.mine {
            line.sender.display_name.green().bold()
        } else {
            line.sender.display_name.cyan().bold()
        };
        println!(
            "{} {} {}: {}",
            "│".bright_cyan(),
            time.to_string().dimmed(),
            name,
            line.content
        );
        if line.deletable {
            println!("{}   {}", "│".bright_cyan(), format!("id {}", line.id).dimmed());
        }
    }
    println!("{}", "╰─".bright_cyan());
}

fn print_notice(notice: &Notice) {
    match notice.level {
        NoticeLevel::Info => println!("{} {}", "ℹ".blue(), notice.text),
        NoticeLevel::Error => eprintln!("{} {}", "✗".red().bold(), notice.text.red()),
    }
}
