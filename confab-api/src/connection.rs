//! Connection supervision for the authenticated chat surface.
//!
//! Upgrades a raw socket into a session: validates the bearer token,
//! enforces the single-socket-per-user invariant (evicted sockets are
//! force-disconnected through the cluster adapter), pulls the user's
//! conversation rooms from the jobs service, and joins them. Disconnects
//! unwind the registry binding.

use std::time::Duration;

use confab_core::models::{JobId, SocketId, UserId};
use confab_core::service::{Claims, JobsClient, SessionRegistry, TokenValidator};
use confab_core::Result;

use crate::hub::ClusterHub;

/// Result of a successful handshake.
#[derive(Debug, Clone)]
pub struct AuthedSession {
    pub user_id: UserId,
    pub claims: Claims,
    pub rooms: Vec<JobId>,
}

pub struct ConnectionSupervisor {
    validator: TokenValidator,
    sessions: SessionRegistry,
    jobs: JobsClient,
    hub: ClusterHub,
    handshake_timeout: Duration,
}

impl ConnectionSupervisor {
    #[must_use]
    pub fn new(
        validator: TokenValidator,
        sessions: SessionRegistry,
        jobs: JobsClient,
        hub: ClusterHub,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            validator,
            sessions,
            jobs,
            hub,
            handshake_timeout,
        }
    }

    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Token lookup order: query parameter, `Authorization: Bearer` header,
    /// then the handshake auth payload.
    #[must_use]
    pub fn extract_token(
        query_token: Option<&str>,
        authorization: Option<&str>,
        handshake_token: Option<&str>,
    ) -> Option<String> {
        if let Some(token) = query_token.filter(|t| !t.is_empty()) {
            return Some(token.to_string());
        }
        if let Some(header) = authorization {
            if let Some(token) = header.strip_prefix("Bearer ") {
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
        handshake_token
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }

    /// Authenticate a socket and wire up its session.
    ///
    /// Any failure here is fatal for the connection, including a non-2xx
    /// answer from the jobs service.
    pub async fn authenticate(&self, socket: &SocketId, token: &str) -> Result<AuthedSession> {
        let claims = self.validator.validate(token)?;
        let user_id = UserId::from_string(claims.sub.clone());

        let evicted = self.sessions.bind(&user_id, socket).await?;
        if !evicted.is_empty() {
            tracing::info!(
                user_id = %user_id,
                socket_id = %socket,
                evicted = evicted.len(),
                "Disconnecting stale sockets for reconnecting user"
            );
            self.hub.disconnect_sockets(&evicted);
        }

        let rooms = self.jobs.fetch_job_ids(token).await?;
        self.sessions.add_rooms(&user_id, &rooms).await?;
        for room in &rooms {
            self.hub.hub().join(socket, room.as_str());
        }

        tracing::info!(
            user_id = %user_id,
            socket_id = %socket,
            rooms = rooms.len(),
            wallet_type = claims.wallet_type.as_deref().unwrap_or("-"),
            "Session authenticated"
        );

        Ok(AuthedSession {
            user_id,
            claims,
            rooms,
        })
    }

    /// Unwind a socket's registry binding on disconnect.
    pub async fn on_disconnect(&self, socket: &SocketId) {
        match self.sessions.unbind(socket).await {
            Ok(Some(user_id)) => {
                tracing::info!(user_id = %user_id, socket_id = %socket, "Session closed");
            }
            Ok(None) => {
                tracing::debug!(socket_id = %socket, "Unauthenticated socket closed");
            }
            Err(e) => {
                tracing::warn!(socket_id = %socket, error = %e, "Failed to unbind socket");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_priority_order() {
        let token = ConnectionSupervisor::extract_token(
            Some("query-token"),
            Some("Bearer header-token"),
            Some("auth-token"),
        );
        assert_eq!(token.as_deref(), Some("query-token"));

        let token =
            ConnectionSupervisor::extract_token(None, Some("Bearer header-token"), Some("auth-token"));
        assert_eq!(token.as_deref(), Some("header-token"));

        let token = ConnectionSupervisor::extract_token(None, None, Some("auth-token"));
        assert_eq!(token.as_deref(), Some("auth-token"));

        assert!(ConnectionSupervisor::extract_token(None, None, None).is_none());
    }

    #[test]
    fn test_malformed_authorization_ignored() {
        let token = ConnectionSupervisor::extract_token(None, Some("Basic abc"), None);
        assert!(token.is_none());

        let token = ConnectionSupervisor::extract_token(Some(""), Some("Bearer "), None);
        assert!(token.is_none());
    }
}
