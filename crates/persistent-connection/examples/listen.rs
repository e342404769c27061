//! Listen to a location and print every update.
//!
//! ```sh
//! cargo run -p persistent-connection --example listen -- <HOST> <NAMESPACE> <PATH>
//! ```
//!
//! Pass a credential via environment variable:
//! ```sh
//! DB_AUTH_TOKEN=... cargo run -p persistent-connection --example listen \
//!     -- my-db.example.com my-db /messages
//! ```
//!
//! Updates are printed to stdout (pipe to `jq` for formatting).

use std::sync::Arc;

use async_trait::async_trait;

use persistent_connection::{
    BoxError, ClientConfig, Event, PersistentConnection, Query, RepoInfo, TokenProvider,
    WebSocketConnector,
};

struct EnvToken(Option<String>);

#[async_trait]
impl TokenProvider for EnvToken {
    async fn get_token(&self, _force_refresh: bool) -> Result<Option<String>, BoxError> {
        Ok(self.0.clone())
    }

    fn notify_for_invalid_token(&self) {
        eprintln!("[warning] the server keeps rejecting DB_AUTH_TOKEN");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let usage = "usage: listen <HOST> <NAMESPACE> <PATH>";
    let host = args.first().ok_or(usage)?;
    let namespace = args.get(1).ok_or(usage)?;
    let path = args.get(2).ok_or(usage)?;

    let config = ClientConfig::new(
        RepoInfo::new(host.as_str(), namespace.as_str()),
        Arc::new(WebSocketConnector::default()),
        Arc::new(EnvToken(std::env::var("DB_AUTH_TOKEN").ok())),
    );
    let mut client = PersistentConnection::new(config);

    eprintln!("listening to '{path}' ...");
    let mut status = client.listen(Query::default_at(path.as_str()), String::new, None);
    tokio::spawn(async move {
        while let Some(result) = status.next().await {
            match result {
                Ok(_) => eprintln!("[listen] ok"),
                Err(e) => {
                    eprintln!("[listen] {e}");
                    break;
                }
            }
        }
    });

    while let Some(event) = client.next_event().await {
        match event {
            Event::DataUpdate {
                path,
                data,
                is_merge,
                ..
            } => {
                eprintln!("[{}] {path}", if is_merge { "merge" } else { "data" });
                println!("{data}");
            }
            Event::ConnectStatus(true) => eprintln!("[connected]"),
            Event::ConnectStatus(false) => eprintln!("[disconnected]"),
            Event::ServerInfo {
                server_time_offset_ms,
            } => eprintln!("[server] clock offset {server_time_offset_ms}ms"),
            Event::SecurityDebug(packet) => eprintln!("[security] {packet}"),
        }
    }

    Ok(())
}
