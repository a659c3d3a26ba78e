use std::error::Error;
use log::{debug, info};
use crate::config::ServerConfig;
use crate::server::ChatServer;

/// Run the chat relay until the process is stopped.
///
/// The room key (or per-peer keys) live only in memory, so restarting the
/// server starts a fresh room.
pub async fn run(config: ServerConfig) -> Result<(), Box<dyn Error>> {
    debug!("Attempting to bind to {}", config.addr());
    let listener = ChatServer::bind(&config).await?;
    let local = listener.local_addr()?;
    println!("Server listening on {}", local);
    info!(
        "Chat server started on {} (keys: {:?}, room secret: {})",
        local,
        config.key_mode,
        if config.room_secret.is_some() { "required" } else { "none" }
    );

    ChatServer::new(&config).serve(listener).await?;
    Ok(())
}
