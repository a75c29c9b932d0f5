use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tracing::{error, info, warn};

use crate::{
    database::Database,
    service::FeedService,
    stores::PostStore,
    types::{FeedKind, FeedType},
};

pub struct AdminSocket {
    db: Arc<Database>,
    service: Arc<FeedService>,
    socket_path: String,
}

impl AdminSocket {
    pub fn new(db: Arc<Database>, service: Arc<FeedService>, socket_path: String) -> Self {
        Self {
            db,
            service,
            socket_path,
        }
    }

    pub async fn start(&self) -> Result<()> {
        // Remove old socket if it exists
        let _ = std::fs::remove_file(&self.socket_path);

        let listener = UnixListener::bind(&self.socket_path)?;
        info!("Admin socket listening on {}", self.socket_path);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&self.socket_path)?.permissions();
            perms.set_mode(0o660);
            std::fs::set_permissions(&self.socket_path, perms)?;
        }

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let db = Arc::clone(&self.db);
                    let service = Arc::clone(&self.service);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, db, service).await {
                            error!("Error handling admin connection: {}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Failed to accept admin connection: {}", e);
                }
            }
        }
    }
}

const HELP: &str = "Available commands:
  stats                              - Show database and cache statistics
  refresh <owner> <feed_type> [id]   - Force a recompute of one feed
  notify <post_id>                   - Fan a stored post out to cached feeds
  help                               - Show this help message
  quit                               - Close connection
";

enum AdminCommand {
    Stats,
    Refresh {
        owner: String,
        kind: String,
        filter: Option<String>,
    },
    Notify(String),
    Usage(&'static str),
    Help,
    Quit,
    Unknown(String),
}

impl AdminCommand {
    fn parse(command: &str) -> Self {
        let parts: Vec<&str> = command.split_whitespace().collect();
        match parts.as_slice() {
            ["stats"] => AdminCommand::Stats,
            ["refresh", owner, kind] => AdminCommand::Refresh {
                owner: owner.to_string(),
                kind: kind.to_string(),
                filter: None,
            },
            ["refresh", owner, kind, filter] => AdminCommand::Refresh {
                owner: owner.to_string(),
                kind: kind.to_string(),
                filter: Some(filter.to_string()),
            },
            ["refresh", ..] => AdminCommand::Usage("Usage: refresh <owner> <feed_type> [id]\n"),
            ["notify", post_id] => AdminCommand::Notify(post_id.to_string()),
            ["notify", ..] => AdminCommand::Usage("Usage: notify <post_id>\n"),
            ["help"] => AdminCommand::Help,
            ["quit"] | ["exit"] => AdminCommand::Quit,
            _ => AdminCommand::Unknown(command.to_string()),
        }
    }
}

async fn handle_connection<S>(
    stream: S,
    db: Arc<Database>,
    service: Arc<FeedService>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    writer.write_all(b"Feed Ranker Admin Console\n").await?;
    writer
        .write_all(b"Commands: stats, refresh, notify, help, quit\n> ")
        .await?;
    writer.flush().await?;

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            break; // Connection closed
        }

        let command = line.trim();
        if command.is_empty() {
            writer.write_all(b"> ").await?;
            writer.flush().await?;
            continue;
        }

        let reply = match AdminCommand::parse(command) {
            AdminCommand::Stats => match db.stats().await {
                Ok(stats) => format!("{}  Cache: {}\n", stats, service.stats()),
                Err(e) => format!("Failed to get stats: {}\n", e),
            },
            AdminCommand::Refresh {
                owner,
                kind,
                filter,
            } => match refresh(&service, &owner, &kind, filter.as_deref()).await {
                Ok(summary) => summary,
                Err(e) => format!("Refresh failed: {:#}\n", e),
            },
            AdminCommand::Notify(post_id) => match notify(&db, &service, &post_id).await {
                Ok(summary) => summary,
                Err(e) => format!("Notify failed: {:#}\n", e),
            },
            AdminCommand::Usage(usage) => usage.to_string(),
            AdminCommand::Help => HELP.to_string(),
            AdminCommand::Quit => {
                writer.write_all(b"Goodbye!\n").await?;
                writer.flush().await?;
                break;
            }
            AdminCommand::Unknown(command) => format!(
                "Unknown command: {}. Type 'help' for available commands.\n",
                command
            ),
        };

        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"> ").await?;
        writer.flush().await?;
    }

    Ok(())
}

async fn refresh(
    service: &Arc<FeedService>,
    owner: &str,
    kind: &str,
    filter: Option<&str>,
) -> Result<String> {
    let feed_type = FeedType::from_parts(kind.parse::<FeedKind>()?, filter)?;
    let response = service.refresh_feed(owner, feed_type).await?;
    Ok(format!(
        "Refreshed {}/{}: {} entries, degraded={}\n",
        owner, kind, response.pagination.total, response.degraded
    ))
}

async fn notify(db: &Database, service: &FeedService, post_id: &str) -> Result<String> {
    let post = db
        .get_post_snapshot(post_id)
        .await?
        .with_context(|| format!("post {} not found", post_id))?;
    let report = service.fan_out(&post).await?;
    Ok(format!(
        "Fan-out of {}: {} targets, {} updated, {} skipped, {} failed\n",
        report.post_id,
        report.targets,
        report.updated,
        report.skipped,
        report.failed.len()
    ))
}
