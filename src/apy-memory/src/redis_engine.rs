use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tracing::debug;

/// Redis-backed engine. Keys are stored as plain strings in the selected
/// database; `keys` scans with `*` so the database should be dedicated to
/// the gateway.
pub(crate) struct RedisEngine {
    conn: MultiplexedConnection,
}

impl RedisEngine {
    pub(crate) async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).context("invalid redis url")?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .context("connect to redis")?;
        debug!("redis connection established");
        Ok(Self { conn })
    }

    pub(crate) async fn save(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    pub(crate) async fn load(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    pub(crate) async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    pub(crate) async fn keys(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.keys::<_, Vec<String>>("*").await?)
    }
}
