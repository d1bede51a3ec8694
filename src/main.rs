use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use nostr_dm::config::Config;
use nostr_dm::envelope::MessageContext;
use nostr_dm::keystore;
use nostr_dm::messaging::{DirectMessage, Messenger, MessagingError};
use nostr_dm::relay::RelayPool;
use nostr_dm::signer::{LocalSigner, Signer};
use nostr_dm::util;

#[derive(Parser, Debug)]
#[command(name = "nostr-dm", version, about = "NIP-17 direct messages over Nostr relays")]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "warn")]
    log_level: String,
    /// Hex secret key to import when the keystore is created.
    #[arg(long)]
    secret_key: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the local public key.
    Whoami,
    /// Send a direct message.
    Send {
        pubkey: String,
        message: String,
        /// Listing reference as `type/id`.
        #[arg(long)]
        context: Option<String>,
    },
    /// List conversations, newest first.
    Conversations,
    /// Show the history with one counterpart.
    Messages {
        pubkey: String,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Print incoming messages until interrupted.
    Listen,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if std::env::var("RUST_LOG").is_err() {
        let level = util::normalize_log_level(&args.log_level)
            .ok_or_else(|| anyhow!("invalid log level: {}", args.log_level))?;
        std::env::set_var("RUST_LOG", level);
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider already installed");
    }

    let cfg = Config::load(args.config.as_deref())?;
    let loaded = keystore::load_or_init(Path::new(&cfg.data_dir), args.secret_key.as_deref())?;
    if loaded.created {
        let path = keystore::store_path(Path::new(&cfg.data_dir));
        info!(path = %path.display(), source = %loaded.source, "new key stored");
    }
    let signer = Arc::new(LocalSigner::new(loaded.keys));
    let me = signer.pubkey();
    info!(relays = cfg.relays.len(), pubkey = %me, "starting");

    let messenger = Messenger::new(RelayPool::new(cfg.pool_config()), cfg.messaging_config());

    match args.command {
        Command::Whoami => println!("{}", me),
        Command::Send {
            pubkey,
            message,
            context,
        } => {
            let context = match context {
                Some(raw) => Some(
                    MessageContext::parse(&raw)
                        .ok_or_else(|| anyhow!("context must look like type/id: {}", raw))?,
                ),
                None => None,
            };
            match messenger
                .send_message(&pubkey, &message, &*signer, context.as_ref())
                .await
            {
                Ok(sent) => {
                    let total = sent.report.published.len() + sent.report.failed.len();
                    println!(
                        "sent {} to {}/{} relays",
                        sent.message.id,
                        sent.report.published.len(),
                        total
                    );
                    for failure in &sent.report.failed {
                        println!("  failed {}", failure);
                    }
                }
                Err(MessagingError::Publish { message, report }) => {
                    for failure in &report.failed {
                        eprintln!("  failed {}", failure);
                    }
                    return Err(anyhow!("message {} was not accepted by any relay", message.id));
                }
                Err(err) => return Err(err.into()),
            }
        }
        Command::Conversations => {
            let list = messenger.get_conversations(&*signer).await?;
            if list.is_empty() {
                println!("no conversations");
            }
            for conv in &list {
                let who = if conv.last_outgoing { "you: " } else { "" };
                let ctx = conv
                    .context
                    .as_ref()
                    .map(|c| format!(" [{}]", c))
                    .unwrap_or_default();
                println!(
                    "{} {}{} {}{}",
                    conv.last_message_at,
                    conv.pubkey,
                    ctx,
                    who,
                    first_line(&conv.last_message)
                );
            }
            report_skipped(&messenger);
        }
        Command::Messages { pubkey, limit } => {
            let history = messenger
                .get_messages(&pubkey, &*signer, limit)
                .await?;
            for msg in &history {
                print_message(msg);
            }
            report_skipped(&messenger);
        }
        Command::Listen => {
            let signer_dyn: Arc<dyn Signer> = signer.clone();
            let sub = messenger
                .subscribe_to_messages(signer_dyn, |msg| print_message(&msg))
                .await?;
            println!("listening as {} (ctrl-c to stop)", me);
            tokio::signal::ctrl_c().await?;
            sub.closed().await;
            report_skipped(&messenger);
        }
    }

    Ok(())
}

fn print_message(msg: &DirectMessage) {
    let arrow = if msg.outgoing { "->" } else { "<-" };
    let ctx = msg
        .context
        .as_ref()
        .map(|c| format!(" [{}]", c))
        .unwrap_or_default();
    println!(
        "{} {} {}{} {}",
        msg.created_at,
        arrow,
        msg.counterpart(),
        ctx,
        msg.content
    );
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

fn report_skipped(messenger: &Messenger) {
    let skipped = messenger.skipped_events();
    if skipped > 0 {
        warn!(skipped, "some gift wraps could not be opened");
    }
}
