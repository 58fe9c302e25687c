use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use trakx_core::error::TrackerError;
use trakx_core::types::LockStatus;

use crate::provider::{AcquireOutcome, LockProvider};

/// Deletes the reservation only when the stored owner tag matches.
const RELEASE_BODY: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

fn backend_err(e: redis::RedisError) -> TrackerError {
    TrackerError::Backend(e.to_string())
}

fn monitor_key(resource: &str, id: &str) -> String {
    format!("{resource}\u{0}{id}")
}

/// Single-node lock protocol: `SET resource id NX PX ttl`, released by a
/// compare-and-delete script.
///
/// Each acquisition spawns a watchdog that re-reads the reservation a few
/// times per TTL; when the stored tag no longer matches, or the backend
/// stops answering, the lost signal fires. A voluntary release stops the
/// watchdog first, so it never fires for a hold the owner gave up.
pub struct RedisLockProvider {
    conn: ConnectionManager,
    monitors: Mutex<HashMap<String, CancellationToken>>,
}

impl RedisLockProvider {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    pub async fn connect(url: &str) -> Result<Self, TrackerError> {
        let client = redis::Client::open(url).map_err(backend_err)?;
        let conn = ConnectionManager::new(client).await.map_err(backend_err)?;
        Ok(Self::new(conn))
    }

    fn spawn_watchdog(
        &self,
        resource: String,
        id: String,
        ttl: Duration,
        lost_tx: watch::Sender<bool>,
        stop: CancellationToken,
    ) {
        let mut conn = self.conn.clone();
        let interval = (ttl / 3).max(Duration::from_millis(100));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let reply: Result<Option<String>, _> = redis::cmd("GET")
                    .arg(&resource)
                    .query_async(&mut conn)
                    .await;
                match reply {
                    Ok(Some(owner)) if owner == id => {}
                    Ok(_) => {
                        let _ = lost_tx.send(true);
                        return;
                    }
                    Err(e) => {
                        warn!(resource = %resource, "lock watchdog lost the backend: {e}");
                        let _ = lost_tx.send(true);
                        return;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl LockProvider for RedisLockProvider {
    async fn try_acquire(
        &self,
        resource: &str,
        id: &str,
        ttl: Duration,
    ) -> Result<AcquireOutcome, TrackerError> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("SET")
            .arg(resource)
            .arg(id)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;

        match reply {
            Value::Okay => {
                let (lost_tx, lost_rx) = watch::channel(false);
                let stop = CancellationToken::new();
                self.monitors
                    .lock()
                    .unwrap()
                    .insert(monitor_key(resource, id), stop.clone());
                self.spawn_watchdog(resource.to_string(), id.to_string(), ttl, lost_tx, stop);
                Ok(AcquireOutcome::acquired(lost_rx))
            }
            Value::Nil => Ok(AcquireOutcome::unavailable(LockStatus::Conflicted)),
            unexpected => Err(TrackerError::UnexpectedBackendResult(format!(
                "{unexpected:?}"
            ))),
        }
    }

    async fn release(&self, resource: &str, id: &str) -> Result<(), TrackerError> {
        if let Some(stop) = self
            .monitors
            .lock()
            .unwrap()
            .remove(&monitor_key(resource, id))
        {
            stop.cancel();
        }
        let mut conn = self.conn.clone();
        let script = redis::Script::new(RELEASE_BODY);
        script
            .key(resource)
            .arg(id)
            .invoke_async::<_, i64>(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }
}
