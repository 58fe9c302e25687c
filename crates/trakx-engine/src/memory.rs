use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redis::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use trakx_core::clock::Clock;
use trakx_core::constants::{NO_EXPIRY, OTHER_COMPARTMENT_SENTINEL, UNIT_SENTINEL};
use trakx_core::error::TrackerError;

use crate::backend::ScriptBackend;
use crate::scripts::{LuaScript, ScriptName};

#[derive(Debug, Clone)]
struct StoredEntry {
    data: Vec<u8>,
    absexp: i64,
    sldexp: i64,
    expires_at: Option<DateTime<Utc>>,
}

/// In-process interpretation of the five compartment scripts over a guarded
/// map, with clock-driven lazy expiry.
///
/// Behaves observably like the Redis backend for everything the engine
/// does, which makes it the backend for the test suites and a usable store
/// for single-process deployments.
pub struct MemoryBackend {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, StoredEntry>>,
}

impl MemoryBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// True when the key currently holds a live entry. Test hook.
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap();
        live(&mut entries, key, now).is_some()
    }
}

fn parse_i64(arg: &[u8]) -> Result<i64, TrackerError> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            TrackerError::Backend(format!(
                "non-numeric script argument: {:?}",
                String::from_utf8_lossy(arg)
            ))
        })
}

fn is_flag_set(arg: &[u8]) -> bool {
    arg == b"1"
}

/// Drops the entry if its TTL has lapsed, then returns what is left.
fn live<'a>(
    entries: &'a mut HashMap<String, StoredEntry>,
    key: &str,
    now: DateTime<Utc>,
) -> Option<&'a mut StoredEntry> {
    if let Some(entry) = entries.get(key) {
        if entry.expires_at.is_some_and(|at| at <= now) {
            entries.remove(key);
            return None;
        }
    }
    entries.get_mut(key)
}

fn apply_sliding_refresh(entry: &mut StoredEntry, now_unix: i64, now: DateTime<Utc>) {
    if entry.sldexp == NO_EXPIRY {
        return;
    }
    let mut ttl = entry.sldexp;
    if entry.absexp != NO_EXPIRY {
        let remaining = entry.absexp - now_unix;
        if remaining < ttl {
            ttl = remaining;
        }
    }
    if ttl > 0 {
        entry.expires_at = Some(now + ChronoDuration::seconds(ttl));
    }
}

fn data(bytes: &[u8]) -> Value {
    Value::Data(bytes.to_vec())
}

fn other_compartment() -> Value {
    data(OTHER_COMPARTMENT_SENTINEL.as_bytes())
}

fn unit() -> Value {
    data(UNIT_SENTINEL.as_bytes())
}

#[async_trait]
impl ScriptBackend for MemoryBackend {
    async fn eval(
        &self,
        script: &LuaScript,
        keys: &[String],
        args: &[Vec<u8>],
    ) -> Result<Value, TrackerError> {
        let now = self.clock.now();
        let now_unix = now.timestamp();
        let mut entries = self.entries.lock().unwrap();

        match script.name {
            ScriptName::AddIfAbsent => {
                // KEYS: [active, evicted]. ARGV: [payload, absexp, sldexp, ttl].
                if live(&mut entries, &keys[1], now).is_some() {
                    return Ok(other_compartment());
                }
                if let Some(existing) = live(&mut entries, &keys[0], now) {
                    return Ok(data(&existing.data));
                }
                let absexp = parse_i64(&args[1])?;
                let sldexp = parse_i64(&args[2])?;
                let ttl = parse_i64(&args[3])?;
                let expires_at =
                    (ttl != NO_EXPIRY).then(|| now + ChronoDuration::seconds(ttl));
                entries.insert(
                    keys[0].clone(),
                    StoredEntry {
                        data: args[0].clone(),
                        absexp,
                        sldexp,
                        expires_at,
                    },
                );
                Ok(unit())
            }

            ScriptName::GetAndRefresh => {
                // KEYS: [primary, other]. ARGV: [now, return_data, do_refresh].
                if live(&mut entries, &keys[0], now).is_none() {
                    if live(&mut entries, &keys[1], now).is_some() {
                        return Ok(other_compartment());
                    }
                    return Ok(Value::Nil);
                }
                let Some(entry) = entries.get_mut(&keys[0]) else {
                    return Ok(Value::Nil);
                };
                if is_flag_set(&args[2]) {
                    apply_sliding_refresh(entry, now_unix, now);
                }
                if is_flag_set(&args[1]) {
                    return Ok(data(&entry.data));
                }
                Ok(unit())
            }

            ScriptName::UpdateIfPresent => {
                // KEYS: [active, evicted]. ARGV: [payload, now, return_data].
                if live(&mut entries, &keys[0], now).is_none() {
                    if live(&mut entries, &keys[1], now).is_some() {
                        return Ok(other_compartment());
                    }
                    return Ok(Value::Nil);
                }
                let Some(entry) = entries.get_mut(&keys[0]) else {
                    return Ok(Value::Nil);
                };
                entry.data = args[0].clone();
                apply_sliding_refresh(entry, now_unix, now);
                if is_flag_set(&args[2]) {
                    return Ok(data(&entry.data));
                }
                Ok(unit())
            }

            ScriptName::MoveActiveToEvicted | ScriptName::MoveEvictedToActive => {
                // KEYS: [source, destination]. ARGV: [absexp, sldexp, ttl, return_data].
                if live(&mut entries, &keys[0], now).is_none() {
                    if live(&mut entries, &keys[1], now).is_some() {
                        return Ok(other_compartment());
                    }
                    return Ok(Value::Nil);
                }
                let Some(moved) = entries.remove(&keys[0]) else {
                    return Ok(Value::Nil);
                };
                let absexp = parse_i64(&args[0])?;
                let sldexp = parse_i64(&args[1])?;
                let ttl = parse_i64(&args[2])?;
                let expires_at =
                    (ttl != NO_EXPIRY).then(|| now + ChronoDuration::seconds(ttl));
                let payload = moved.data.clone();
                entries.insert(
                    keys[1].clone(),
                    StoredEntry {
                        data: moved.data,
                        absexp,
                        sldexp,
                        expires_at,
                    },
                );
                if is_flag_set(&args[3]) {
                    return Ok(data(&payload));
                }
                Ok(unit())
            }
        }
    }
}
