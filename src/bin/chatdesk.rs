use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use log::info;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};

use chatdesk::backend::memory::MemoryBackend;
use chatdesk::backend::Backend;
use chatdesk::client::app::{ChatApp, NoticeLevel};
use chatdesk::client::config::{BackendKind, ClientConfig};
use chatdesk::utils::logger;

#[derive(Parser)]
#[command(name = "chatdesk")]
#[command(about = "Friends and private chat over a realtime document store")]
struct Args {
    /// Document store to use: memory or sqlite
    #[arg(short, long)]
    backend: Option<BackendKind>,
    /// SQLite database URL, used with --backend sqlite
    #[arg(long)]
    database_url: Option<String>,
}

const HELP: &str = "\
/register <email> <password> <name...>   create an account and sign in
/login <email> <password>                sign in
/logout                                  sign out
/whoami                                  show the signed-in user
/users                                   list the user directory
/friends                                 list friends
/requests                                list incoming friend requests
/suggestions                             list people you may know
/request <uid>                           send a friend request
/accept <uid> | /reject <uid>            answer a request from <uid>
/chat <uid>                              open the conversation with <uid>
/close                                   close the conversation
/say <text> or plain text                send a message
/messages                                show the open conversation
/help | /quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = ClientConfig::from_env();
    if let Some(kind) = args.backend {
        config.backend = kind;
    }
    if let Some(url) = args.database_url {
        config.database_url = url;
    }
    logger::init(&config.log_level)?;

    let backend = open_backend(&config).await?;
    let mut app = ChatApp::new(backend, config);
    println!("[CHATDESK] Welcome! Type /help for the list of commands.");

    let mut lines = BufReader::new(stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let next = tokio::select! {
            line = lines.next_line() => Some(line?),
            changed = app.session_changed() => {
                if app.report(changed).is_none() {
                    break;
                }
                let result = app.sync_session().await;
                app.report(result);
                None
            }
        };
        if let Some(next) = next {
            let Some(line) = next else {
                break;
            };
            let line = line.trim();
            if !line.is_empty() && !handle_command(&mut app, line).await {
                break;
            }
        }
        for notice in app.take_notices() {
            match notice.level {
                NoticeLevel::Info => println!("[CHATDESK] {}", notice.message),
                NoticeLevel::Error => println!("[CHATDESK] Error: {}", notice.message),
            }
        }
    }

    if app.user().is_some() {
        let result = app.logout().await;
        app.report(result);
    }
    info!("[CHATDESK] Bye");
    Ok(())
}

async fn open_backend(config: &ClientConfig) -> anyhow::Result<Arc<dyn Backend>> {
    match config.backend {
        BackendKind::Memory => {
            info!("[CHATDESK] Using in-memory store");
            Ok(Arc::new(MemoryBackend::new()))
        }
        #[cfg(feature = "sqlite")]
        BackendKind::Sqlite => {
            use chatdesk::backend::sqlite::{SqliteBackend, SqliteStore};
            info!("[CHATDESK] Using SQLite store at {}", config.database_url);
            let store = SqliteStore::connect(&config.database_url, config.argon2_salt_length).await?;
            Ok(Arc::new(SqliteBackend::connect(&store)))
        }
        #[cfg(not(feature = "sqlite"))]
        BackendKind::Sqlite => anyhow::bail!("this build has no sqlite support"),
    }
}

/// Runs one input line. Returns false when the user asked to quit.
async fn handle_command(app: &mut ChatApp, line: &str) -> bool {
    if !line.starts_with('/') {
        send_text(app, line).await;
        return true;
    }
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or("");
    let args: Vec<&str> = parts.collect();

    match (command, args.as_slice()) {
        ("/quit", _) => return false,
        ("/help", _) => println!("{}", HELP),
        ("/register", [email, password, name @ ..]) => {
            let result = app.register(&name.join(" "), email, password).await;
            if let Some(user) = app.report(result) {
                println!("[CHATDESK] Registered {} ({})", user.name, user.uid);
            }
        }
        ("/login", [email, password]) => {
            let result = app.login(email, password).await;
            if let Some(user) = app.report(result) {
                println!("[CHATDESK] Signed in as {} ({})", user.display_name, user.uid);
            }
        }
        ("/logout", []) => {
            let result = app.logout().await;
            if app.report(result).is_some() {
                println!("[CHATDESK] Signed out");
            }
        }
        ("/whoami", []) => match app.user() {
            Some(user) => println!("{} <{}> {}", user.display_name, user.email, user.uid),
            None => println!("[CHATDESK] Not signed in"),
        },
        ("/users", []) => {
            for user in app.directory() {
                println!("  {}  {} <{}>", user.uid, user.name, user.email);
            }
        }
        ("/friends", []) => {
            for edge in app.friends() {
                println!("  {}  {}", edge.friend_id, app.friend_name(&edge.friend_id));
            }
        }
        ("/requests", []) => {
            for request in app.incoming_requests() {
                println!("  {}  {}", request.from, app.friend_name(&request.from));
            }
        }
        ("/suggestions", []) => {
            for user in app.suggestions() {
                println!("  {}  {}", user.uid, user.name);
            }
        }
        ("/request", [uid]) => {
            let result = app.send_friend_request(uid).await;
            app.report(result);
        }
        ("/accept", [uid]) => {
            let result = app.accept_request(uid).await;
            if app.report(result).is_some() {
                println!("[CHATDESK] You are now friends with {}", app.friend_name(uid));
            }
        }
        ("/reject", [uid]) => {
            let result = app.reject_request(uid).await;
            if app.report(result).is_some() {
                println!("[CHATDESK] Request from {} rejected", app.friend_name(uid));
            }
        }
        ("/chat", [uid]) => {
            let result = app.select_friend(uid).await;
            if app.report(result).is_some() {
                println!("[CHATDESK] Chatting with {}", app.friend_name(uid));
            }
        }
        ("/close", []) => app.close_conversation(),
        ("/say", words) if !words.is_empty() => send_text(app, &words.join(" ")).await,
        ("/messages", []) => print_messages(app),
        _ => println!("[CHATDESK] Unknown command or wrong arguments. Type /help."),
    }
    true
}

async fn send_text(app: &mut ChatApp, text: &str) {
    let result = app.set_draft(text);
    if app.report(result).is_none() {
        return;
    }
    let result = app.send_message().await;
    app.report(result);
}

fn print_messages(app: &ChatApp) {
    let Some(partner) = app.partner() else {
        println!("[CHATDESK] No conversation open");
        return;
    };
    let me = app.user().map(|u| u.uid.clone()).unwrap_or_default();
    let partner_name = app.friend_name(partner);
    for message in app.messages() {
        let who = if message.is_from(&me) { "me" } else { partner_name.as_str() };
        println!("  [{}] {}: {}", message.timestamp.format("%H:%M:%S"), who, message.text);
    }
}
