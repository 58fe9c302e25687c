use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Value;
use tracing::warn;

use trakx_core::error::TrackerError;
use trakx_core::settings::TrackerSettings;

use crate::scripts::LuaScript;

/// Seam between the compartment engine and whatever evaluates its scripts.
///
/// `keys` are the compartment key names; `args` are positional script
/// arguments, binary-safe because payload bytes travel through them.
#[async_trait]
pub trait ScriptBackend: Send + Sync {
    async fn eval(
        &self,
        script: &LuaScript,
        keys: &[String],
        args: &[Vec<u8>],
    ) -> Result<Value, TrackerError>;
}

fn backend_err(e: redis::RedisError) -> TrackerError {
    TrackerError::Backend(e.to_string())
}

/// Redis-backed script evaluation over a multiplexed connection manager.
///
/// With proxy optimisation on, scripts are dispatched by digest (`EVALSHA`)
/// and a NOSCRIPT reply is repaired with `SCRIPT LOAD` up to `retry_limit`
/// times; proxies that penalise repeated script bodies only ever see the
/// body once. Without it the full body is sent on every call.
pub struct RedisBackend {
    conn: ConnectionManager,
    use_proxy_optimisation: bool,
    retry_limit: u32,
}

impl RedisBackend {
    pub fn new(conn: ConnectionManager, settings: &TrackerSettings) -> Self {
        Self {
            conn,
            use_proxy_optimisation: settings.use_proxy_optimisation,
            retry_limit: settings.proxy_retry_limit,
        }
    }

    pub async fn connect(url: &str, settings: &TrackerSettings) -> Result<Self, TrackerError> {
        let client = redis::Client::open(url).map_err(backend_err)?;
        let conn = ConnectionManager::new(client).await.map_err(backend_err)?;
        Ok(Self::new(conn, settings))
    }

    async fn eval_full(
        &self,
        script: &LuaScript,
        keys: &[String],
        args: &[Vec<u8>],
    ) -> Result<Value, TrackerError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(script.body).arg(keys.len());
        for key in keys {
            cmd.arg(key);
        }
        for arg in args {
            cmd.arg(arg.as_slice());
        }
        cmd.query_async(&mut conn).await.map_err(backend_err)
    }

    async fn eval_by_digest(
        &self,
        script: &LuaScript,
        keys: &[String],
        args: &[Vec<u8>],
    ) -> Result<Value, TrackerError> {
        let mut conn = self.conn.clone();
        let mut attempts = 0u32;
        loop {
            let mut cmd = redis::cmd("EVALSHA");
            cmd.arg(&script.sha1_hex).arg(keys.len());
            for key in keys {
                cmd.arg(key);
            }
            for arg in args {
                cmd.arg(arg.as_slice());
            }
            match cmd.query_async(&mut conn).await {
                Ok(value) => return Ok(value),
                Err(e) if e.kind() == redis::ErrorKind::NoScriptError
                    && attempts < self.retry_limit =>
                {
                    attempts += 1;
                    warn!(
                        sha1 = %script.sha1_hex,
                        attempt = attempts,
                        "script missing from server cache, reloading"
                    );
                    redis::cmd("SCRIPT")
                        .arg("LOAD")
                        .arg(script.body)
                        .query_async::<_, String>(&mut conn)
                        .await
                        .map_err(backend_err)?;
                }
                Err(e) => return Err(backend_err(e)),
            }
        }
    }
}

#[async_trait]
impl ScriptBackend for RedisBackend {
    async fn eval(
        &self,
        script: &LuaScript,
        keys: &[String],
        args: &[Vec<u8>],
    ) -> Result<Value, TrackerError> {
        if self.use_proxy_optimisation {
            self.eval_by_digest(script, keys, args).await
        } else {
            self.eval_full(script, keys, args).await
        }
    }
}
