//! Authentication seam for new object sessions.
//!
//! The credential store behind the [`Authenticator`] trait is an external
//! collaborator: its contract is ticket lookup with single-use deletion.
//! Two reference implementations live here: an in-memory ticket store
//! matching that contract, and an allow-all authenticator for development.

use async_trait::async_trait;
use meridian_location_system::EntityId;
use std::collections::HashSet;
use tokio::sync::RwLock;
use tracing::debug;

/// Validates session credentials before location replication begins.
///
/// Invoked exactly once per new session.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns whether `credential` authorizes a session for `object_id`.
    async fn authenticate(&self, object_id: EntityId, credential: &[u8]) -> bool;
}

/// Development authenticator that accepts every session.
#[derive(Debug, Default)]
pub struct AllowAllAuthenticator;

#[async_trait]
impl Authenticator for AllowAllAuthenticator {
    async fn authenticate(&self, _object_id: EntityId, _credential: &[u8]) -> bool {
        true
    }
}

/// In-memory single-use ticket store.
///
/// A ticket authorizes exactly one session: validation deletes it, so a
/// replayed credential fails.
#[derive(Debug, Default)]
pub struct TicketAuthenticator {
    tickets: RwLock<HashSet<String>>,
}

impl TicketAuthenticator {
    /// Creates an empty ticket store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a ticket that will authorize one future session.
    pub async fn issue(&self, ticket: impl Into<String>) {
        self.tickets.write().await.insert(ticket.into());
    }
}

#[async_trait]
impl Authenticator for TicketAuthenticator {
    async fn authenticate(&self, object_id: EntityId, credential: &[u8]) -> bool {
        let Ok(ticket) = std::str::from_utf8(credential) else {
            return false;
        };
        // Lookup and deletion are one operation: tickets are single-use.
        let valid = self.tickets.write().await.remove(ticket);
        debug!(
            "🎫 Ticket check for {}: {}",
            object_id,
            if valid { "accepted" } else { "rejected" }
        );
        valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tickets_are_single_use() {
        let auth = TicketAuthenticator::new();
        auth.issue("session-ticket-1").await;

        let object = EntityId::new();
        assert!(auth.authenticate(object, b"session-ticket-1").await);
        // The ticket was deleted on first use.
        assert!(!auth.authenticate(object, b"session-ticket-1").await);
    }

    #[tokio::test]
    async fn test_unknown_ticket_is_rejected() {
        let auth = TicketAuthenticator::new();
        assert!(!auth.authenticate(EntityId::new(), b"never-issued").await);
        assert!(!auth.authenticate(EntityId::new(), &[0xff, 0xfe]).await);
    }
}
