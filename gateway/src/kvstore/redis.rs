//! Redis-backed store. Connections go through a multiplexed connection
//! manager; locks are SET NX PX with a UUID fence and release through a
//! check-and-delete script.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use uuid::Uuid;

use super::{KvError, KvStore, LockLease, ReleaseFence};
use crate::auth;
use crate::config::RedisSettings;

const RELEASE_SCRIPT: &str = r#"if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end"#;

const CONNECT_CHECK_TIMEOUT: Duration = Duration::from_millis(200);

impl From<redis::RedisError> for KvError {
    fn from(err: redis::RedisError) -> Self {
        KvError::Store(err.to_string())
    }
}

struct RedisFence {
    conn: ConnectionManager,
    script: redis::Script,
}

#[async_trait]
impl ReleaseFence for RedisFence {
    async fn release_fenced(&self, key: &str, fence: &str) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .script
            .key(key)
            .arg(fence)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    fence: Arc<RedisFence>,
}

impl RedisStore {
    /// Connects using credentials read from the configured auth file and
    /// verifies the server answers a PING before the gateway starts.
    pub async fn connect(settings: &RedisSettings) -> Result<Self, KvError> {
        let credentials = auth::file_credentials(&settings.auth_file)
            .map_err(|err| KvError::Store(err.to_string()))?;
        let (host, port) = split_server(&settings.server)?;
        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(host, port),
            redis: RedisConnectionInfo {
                db: settings.db_index,
                username: (!credentials.user.is_empty()).then(|| credentials.user.clone()),
                password: (!credentials.password.is_empty()).then(|| credentials.password.clone()),
                ..Default::default()
            },
        };
        let client = redis::Client::open(info)?;
        let conn = client.get_connection_manager().await?;

        let mut check = conn.clone();
        let ping = tokio::time::timeout(CONNECT_CHECK_TIMEOUT, async move {
            let reply: String = ::redis::cmd("PING").query_async(&mut check).await?;
            Ok::<String, ::redis::RedisError>(reply)
        })
        .await;
        match ping {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                return Err(KvError::Store(format!(
                    "redis at {} did not answer ping",
                    settings.server
                )));
            }
        }

        let fence = Arc::new(RedisFence {
            conn: conn.clone(),
            script: redis::Script::new(RELEASE_SCRIPT),
        });
        Ok(Self { conn, fence })
    }
}

fn split_server(server: &str) -> Result<(String, u16), KvError> {
    let (host, port) = server
        .rsplit_once(':')
        .ok_or_else(|| KvError::Store(format!("redis server {server} must be host:port")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| KvError::Store(format!("redis server {server} has an invalid port")))?;
    Ok((host.to_string(), port))
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<String, KvError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        value.ok_or(KvError::Missing)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn flush_all(&self) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("FLUSHALL").query_async(&mut conn).await?;
        Ok(())
    }

    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, KvError> {
        let fence = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&fence)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.map(|_| LockLease::new(self.fence.clone(), key.to_string(), fence)))
    }
}
