//! The five server-side scripts the compartment engine runs, with their
//! SHA-1 digests precomputed once per process.
//!
//! Every script receives both compartment keys and speaks the same return
//! protocol: `'1'` success without payload, a payload string for success
//! with data, `'-1'` when the other compartment already holds the key, nil
//! when neither compartment does.

use once_cell::sync::Lazy;
use sha1::{Digest, Sha1};

// ── Script bodies ─────────────────────────────────────────────────────────────

/// KEYS: [active, evicted]. ARGV: [payload, absexp, sldexp, ttl].
const ADD_IF_ABSENT_BODY: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 1 then
  return '-1'
end
local existing = redis.call('HGET', KEYS[1], 'data')
if existing then
  return existing
end
redis.call('HSET', KEYS[1], 'data', ARGV[1], 'absexp', ARGV[2], 'sldexp', ARGV[3])
if tonumber(ARGV[4]) ~= -1 then
  redis.call('EXPIRE', KEYS[1], ARGV[4])
end
return '1'
"#;

/// KEYS: [primary, other]. ARGV: [now, return_data, do_refresh].
///
/// The sliding window is re-armed from the *stored* fields: the new TTL is
/// `min(absexp - now, sldexp)`, so a refresh can never push the entry past
/// its absolute bound.
const GET_AND_REFRESH_BODY: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  if redis.call('EXISTS', KEYS[2]) == 1 then
    return '-1'
  end
  return nil
end
if ARGV[3] == '1' then
  local absexp = tonumber(redis.call('HGET', KEYS[1], 'absexp'))
  local sldexp = tonumber(redis.call('HGET', KEYS[1], 'sldexp'))
  if sldexp ~= -1 then
    local ttl = sldexp
    if absexp ~= -1 then
      local remaining = absexp - tonumber(ARGV[1])
      if remaining < ttl then
        ttl = remaining
      end
    end
    if ttl > 0 then
      redis.call('EXPIRE', KEYS[1], ttl)
    end
  end
end
if ARGV[2] == '1' then
  return redis.call('HGET', KEYS[1], 'data')
end
return '1'
"#;

/// KEYS: [active, evicted]. ARGV: [payload, now, return_data].
const UPDATE_IF_PRESENT_BODY: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  if redis.call('EXISTS', KEYS[2]) == 1 then
    return '-1'
  end
  return nil
end
redis.call('HSET', KEYS[1], 'data', ARGV[1])
local absexp = tonumber(redis.call('HGET', KEYS[1], 'absexp'))
local sldexp = tonumber(redis.call('HGET', KEYS[1], 'sldexp'))
if sldexp ~= -1 then
  local ttl = sldexp
  if absexp ~= -1 then
    local remaining = absexp - tonumber(ARGV[2])
    if remaining < ttl then
      ttl = remaining
    end
  end
  if ttl > 0 then
    redis.call('EXPIRE', KEYS[1], ttl)
  end
end
if ARGV[3] == '1' then
  return redis.call('HGET', KEYS[1], 'data')
end
return '1'
"#;

/// KEYS: [source, destination]. ARGV: [absexp, sldexp, ttl, return_data].
///
/// The destination is deleted before the move so a stale twin (which the
/// state machine never produces, but a flushed-and-restored backend might)
/// cannot leave both compartments populated.
const MOVE_BODY: &str = r#"
local data = redis.call('HGET', KEYS[1], 'data')
if not data then
  if redis.call('EXISTS', KEYS[2]) == 1 then
    return '-1'
  end
  return nil
end
redis.call('DEL', KEYS[1])
redis.call('DEL', KEYS[2])
redis.call('HSET', KEYS[2], 'data', data, 'absexp', ARGV[1], 'sldexp', ARGV[2])
if tonumber(ARGV[3]) ~= -1 then
  redis.call('EXPIRE', KEYS[2], ARGV[3])
end
if ARGV[4] == '1' then
  return data
end
return '1'
"#;

// ── Script table ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptName {
    AddIfAbsent,
    GetAndRefresh,
    UpdateIfPresent,
    MoveActiveToEvicted,
    MoveEvictedToActive,
}

/// One script with its digest, ready for hash-based or full-body dispatch.
#[derive(Debug, Clone)]
pub struct LuaScript {
    pub name: ScriptName,
    pub body: &'static str,
    pub sha1_hex: String,
}

impl LuaScript {
    fn new(name: ScriptName, body: &'static str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(body.as_bytes());
        Self {
            name,
            body,
            sha1_hex: hex::encode(hasher.finalize()),
        }
    }
}

/// The full script table. Built once, shared process-wide.
#[derive(Debug)]
pub struct ScriptSet {
    add_if_absent: LuaScript,
    get_and_refresh: LuaScript,
    update_if_present: LuaScript,
    move_active_to_evicted: LuaScript,
    move_evicted_to_active: LuaScript,
}

impl ScriptSet {
    fn build() -> Self {
        Self {
            add_if_absent: LuaScript::new(ScriptName::AddIfAbsent, ADD_IF_ABSENT_BODY),
            get_and_refresh: LuaScript::new(ScriptName::GetAndRefresh, GET_AND_REFRESH_BODY),
            update_if_present: LuaScript::new(ScriptName::UpdateIfPresent, UPDATE_IF_PRESENT_BODY),
            move_active_to_evicted: LuaScript::new(ScriptName::MoveActiveToEvicted, MOVE_BODY),
            move_evicted_to_active: LuaScript::new(ScriptName::MoveEvictedToActive, MOVE_BODY),
        }
    }

    pub fn get(&self, name: ScriptName) -> &LuaScript {
        match name {
            ScriptName::AddIfAbsent => &self.add_if_absent,
            ScriptName::GetAndRefresh => &self.get_and_refresh,
            ScriptName::UpdateIfPresent => &self.update_if_present,
            ScriptName::MoveActiveToEvicted => &self.move_active_to_evicted,
            ScriptName::MoveEvictedToActive => &self.move_evicted_to_active,
        }
    }
}

pub static SCRIPTS: Lazy<ScriptSet> = Lazy::new(ScriptSet::build);
