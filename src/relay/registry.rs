//! Connection and username registry for the local relay

use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace, warn};
use warp::ws::Message;

/// Outbound queue of one socket; drained by that socket's writer task
pub type FrameSender = mpsc::UnboundedSender<Message>;

/// Normalize a username into its registry key, `None` when blank
pub fn normalize_username(username: &str) -> Option<String> {
    let key = username.trim().to_lowercase();
    (!key.is_empty()).then_some(key)
}

/// Live relay connections and the username associated with each.
///
/// A username maps to at most one connection id; registering it again
/// overwrites the previous mapping.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, FrameSender>>,
    users: RwLock<HashMap<String, String>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_connection(&self, connection_id: &str, sender: FrameSender) {
        self.connections
            .write()
            .await
            .insert(connection_id.to_string(), sender);
    }

    /// Remove a connection and every username mapped to it
    pub async fn remove_connection(&self, connection_id: &str) -> Vec<String> {
        let removed = self.connections.write().await.remove(connection_id);

        let mut users = self.users.write().await;
        let usernames: Vec<String> = users
            .iter()
            .filter(|(_, id)| id.as_str() == connection_id)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &usernames {
            users.remove(name);
        }

        if removed.is_some() {
            debug!(
                "Relay connection {} removed (users: {:?})",
                connection_id, usernames
            );
        }
        usernames
    }

    /// Associate `username` with a connection; returns the registry key used
    pub async fn register_user(&self, username: &str, connection_id: &str) -> Option<String> {
        let key = normalize_username(username)?;
        let previous = self
            .users
            .write()
            .await
            .insert(key.clone(), connection_id.to_string());

        if let Some(previous) = previous.filter(|id| id != connection_id) {
            debug!(
                "User {} moved from connection {} to {}",
                key, previous, connection_id
            );
        }
        Some(key)
    }

    pub async fn connection_for(&self, username: &str) -> Option<String> {
        let key = normalize_username(username)?;
        self.users.read().await.get(&key).cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.users.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Queue a text frame for one connection; a dead connection is evicted
    pub async fn send_to(&self, connection_id: &str, text: &str) -> bool {
        let sender = self.connections.read().await.get(connection_id).cloned();
        let Some(sender) = sender else {
            trace!("Relay connection {} is gone", connection_id);
            return false;
        };

        if sender.send(Message::text(text)).is_err() {
            warn!("Relay connection {} failed, evicting", connection_id);
            self.evict(connection_id, &sender).await;
            return false;
        }
        true
    }

    /// Queue a text frame for every connection; returns how many accepted it
    pub async fn broadcast(&self, text: &str) -> usize {
        let targets: Vec<(String, FrameSender)> = self
            .connections
            .read()
            .await
            .iter()
            .map(|(id, sender)| (id.clone(), sender.clone()))
            .collect();

        let mut delivered = 0;
        for (connection_id, sender) in targets {
            if sender.send(Message::text(text)).is_ok() {
                delivered += 1;
            } else {
                warn!("Relay connection {} failed, evicting", connection_id);
                self.evict(&connection_id, &sender).await;
            }
        }
        delivered
    }

    /// Ask every connection to close
    pub async fn close_all(&self, code: u16, reason: &'static str) {
        let ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        for connection_id in ids {
            self.close(&connection_id, code, reason).await;
        }
    }

    /// Send a close frame, then evict
    pub async fn close(&self, connection_id: &str, code: u16, reason: &'static str) {
        let sender = self.connections.read().await.get(connection_id).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(Message::close_with(code, reason));
        }
        self.remove_connection(connection_id).await;
    }

    async fn evict(&self, connection_id: &str, sender: &FrameSender) {
        // Graceful close first; the writer may still be alive even if the socket is not
        let _ = sender.send(Message::close_with(1011u16, "Send failure"));
        self.remove_connection(connection_id).await;
    }
}
