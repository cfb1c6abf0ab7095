//! Session registry: user↔socket and user→rooms mappings in the shared store.
//!
//! Keys: `user:sockets:{u}` (set), `socket:user:{s}` (string),
//! `user:rooms:{u}` (set). Every mutation executes as one atomic pipeline so
//! the single-socket-per-user invariant holds even when two nodes bind the
//! same user concurrently.

use redis::aio::ConnectionManager as RedisConnectionManager;

use crate::models::{JobId, SocketId, UserId};
use crate::Result;

#[derive(Clone)]
pub struct SessionRegistry {
    redis: RedisConnectionManager,
}

impl SessionRegistry {
    #[must_use]
    pub const fn new(redis: RedisConnectionManager) -> Self {
        Self { redis }
    }

    fn sockets_key(user: &UserId) -> String {
        format!("user:sockets:{user}")
    }

    fn reverse_key(socket: &SocketId) -> String {
        format!("socket:user:{socket}")
    }

    fn rooms_key(user: &UserId) -> String {
        format!("user:rooms:{user}")
    }

    /// Bind `socket` as the user's only live socket.
    ///
    /// Any other socket id currently in `user:sockets:{u}` is removed along
    /// with its reverse mapping, then the new binding is written, all in a
    /// single atomic pipeline. Returns the evicted socket ids so the caller
    /// can force-disconnect them through the cluster adapter.
    pub async fn bind(&self, user: &UserId, socket: &SocketId) -> Result<Vec<SocketId>> {
        let mut conn = self.redis.clone();

        let existing: Vec<String> = redis::cmd("SMEMBERS")
            .arg(Self::sockets_key(user))
            .query_async(&mut conn)
            .await?;

        let stale: Vec<SocketId> = existing
            .into_iter()
            .filter(|s| s != socket.as_str())
            .map(SocketId::from_string)
            .collect();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for old in &stale {
            pipe.cmd("SREM")
                .arg(Self::sockets_key(user))
                .arg(old.as_str())
                .ignore();
            pipe.cmd("DEL").arg(Self::reverse_key(old)).ignore();
        }
        pipe.cmd("SADD")
            .arg(Self::sockets_key(user))
            .arg(socket.as_str())
            .ignore();
        pipe.cmd("SET")
            .arg(Self::reverse_key(socket))
            .arg(user.as_str())
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;

        if !stale.is_empty() {
            tracing::info!(
                user_id = %user,
                socket_id = %socket,
                evicted = stale.len(),
                "Evicted stale sockets on bind"
            );
        }

        Ok(stale)
    }

    /// Remove the socket's binding. Returns the user it belonged to, if any.
    pub async fn unbind(&self, socket: &SocketId) -> Result<Option<UserId>> {
        let mut conn = self.redis.clone();

        let user: Option<String> = redis::cmd("GET")
            .arg(Self::reverse_key(socket))
            .query_async(&mut conn)
            .await?;

        let Some(user) = user.map(UserId::from_string) else {
            return Ok(None);
        };

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("SREM")
            .arg(Self::sockets_key(&user))
            .arg(socket.as_str())
            .ignore();
        pipe.cmd("DEL").arg(Self::reverse_key(socket)).ignore();
        pipe.query_async::<()>(&mut conn).await?;

        Ok(Some(user))
    }

    /// Record the rooms a user should auto-join on connect.
    pub async fn add_rooms(&self, user: &UserId, rooms: &[JobId]) -> Result<()> {
        if rooms.is_empty() {
            return Ok(());
        }

        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("SADD");
        cmd.arg(Self::rooms_key(user));
        for room in rooms {
            cmd.arg(room.as_str());
        }
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    pub async fn rooms_of(&self, user: &UserId) -> Result<Vec<JobId>> {
        let mut conn = self.redis.clone();
        let rooms: Vec<String> = redis::cmd("SMEMBERS")
            .arg(Self::rooms_key(user))
            .query_async(&mut conn)
            .await?;
        Ok(rooms.into_iter().map(JobId::from_string).collect())
    }

    pub async fn user_of(&self, socket: &SocketId) -> Result<Option<UserId>> {
        let mut conn = self.redis.clone();
        let user: Option<String> = redis::cmd("GET")
            .arg(Self::reverse_key(socket))
            .query_async(&mut conn)
            .await?;
        Ok(user.map(UserId::from_string))
    }

    pub async fn sockets_of(&self, user: &UserId) -> Result<Vec<SocketId>> {
        let mut conn = self.redis.clone();
        let sockets: Vec<String> = redis::cmd("SMEMBERS")
            .arg(Self::sockets_key(user))
            .query_async(&mut conn)
            .await?;
        Ok(sockets.into_iter().map(SocketId::from_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry() -> SessionRegistry {
        let client = redis::Client::open("redis://localhost:6379").unwrap();
        let redis = RedisConnectionManager::new(client).await.unwrap();
        SessionRegistry::new(redis)
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_bind_enforces_single_socket() {
        let registry = registry().await;
        let user = UserId::from("test-sess-u1");

        let evicted = registry.bind(&user, &SocketId::from("S1")).await.unwrap();
        assert!(evicted.is_empty());

        let evicted = registry.bind(&user, &SocketId::from("S2")).await.unwrap();
        assert_eq!(evicted, vec![SocketId::from("S1")]);

        let sockets = registry.sockets_of(&user).await.unwrap();
        assert_eq!(sockets, vec![SocketId::from("S2")]);
        assert!(registry
            .user_of(&SocketId::from("S1"))
            .await
            .unwrap()
            .is_none());

        registry.unbind(&SocketId::from("S2")).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_bind_is_idempotent() {
        let registry = registry().await;
        let user = UserId::from("test-sess-u2");

        registry.bind(&user, &SocketId::from("S3")).await.unwrap();
        let evicted = registry.bind(&user, &SocketId::from("S3")).await.unwrap();
        assert!(evicted.is_empty());

        let sockets = registry.sockets_of(&user).await.unwrap();
        assert_eq!(sockets.len(), 1);

        registry.unbind(&SocketId::from("S3")).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_unbind_unknown_socket() {
        let registry = registry().await;
        let user = registry.unbind(&SocketId::from("never-bound")).await.unwrap();
        assert!(user.is_none());
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_rooms_round_trip() {
        let registry = registry().await;
        let user = UserId::from("test-sess-u3");

        registry
            .add_rooms(&user, &[JobId::from("j1"), JobId::from("j2")])
            .await
            .unwrap();
        let mut rooms = registry.rooms_of(&user).await.unwrap();
        rooms.sort();
        assert_eq!(rooms, vec![JobId::from("j1"), JobId::from("j2")]);
    }
}
