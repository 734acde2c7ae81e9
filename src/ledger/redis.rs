//! Redis ledger backend.
//!
//! Enable with the `redis-backend` feature flag. A period lives in one hash
//! (`ceiling`, `total`, `reserved`, the limit flag, timestamps and
//! `cost:<op>` / `count:<op>` counters) next to a set of applied commit keys
//! and a hash of outstanding holds. Every mutation is one Lua script, so the
//! server applies it atomically.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::store::{Charge, ChargeOutcome, Hold, LedgerStore, ReserveOutcome};
use super::{LedgerError, LedgerResult, StorageResultExt, check_ceiling};
use crate::budget::DenyReason;
use crate::clock::{Clock, SystemClock};
use crate::types::{CategoryUsage, OperationType, PeriodKey, ReservationId, UsagePeriod};

#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub key_prefix: String,
    pub connection_timeout: Duration,
    pub response_timeout: Duration,
    /// Maximum retry attempts for transient connection failures.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            key_prefix: "usage:".to_string(),
            connection_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
            max_retries: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RedisConfig {
    pub fn prefix(mut self, prefix: impl Into<String>) -> LedgerResult<Self> {
        let prefix = prefix.into();
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
        {
            return Err(LedgerError::Unavailable {
                message: format!(
                    "Invalid key prefix '{}': only ASCII alphanumeric, underscore, and colon allowed",
                    prefix
                ),
            });
        }
        self.key_prefix = prefix;
        Ok(self)
    }
}

const SNAPSHOT: &str = r#"
local function snapshot(status)
  local out = {status}
  local fields = redis.call('HGETALL', KEYS[1])
  for i = 1, #fields do out[#out + 1] = fields[i] end
  return out
end

local function drop_hold(rid, now)
  local held = redis.call('HGET', KEYS[3], rid)
  if not held then return false end
  local amount = tonumber(string.match(held, '^(%d+)'))
  redis.call('HDEL', KEYS[3], rid)
  local reserved = redis.call('HINCRBY', KEYS[1], 'reserved', -amount)
  if reserved < 0 then redis.call('HSET', KEYS[1], 'reserved', '0') end
  redis.call('HSET', KEYS[1], 'updated_at', now)
  return true
end

local function apply(op, cost, idem, now)
  if idem ~= '' and redis.call('SISMEMBER', KEYS[2], idem) == 1 then
    return snapshot('duplicate')
  end
  if redis.call('HGET', KEYS[1], 'limit_reached') == '1' then
    return snapshot('rejected')
  end
  local total = redis.call('HINCRBY', KEYS[1], 'total', cost)
  redis.call('HINCRBY', KEYS[1], 'cost:' .. op, cost)
  redis.call('HINCRBY', KEYS[1], 'count:' .. op, 1)
  redis.call('HSET', KEYS[1], 'updated_at', now)
  if idem ~= '' then redis.call('SADD', KEYS[2], idem) end
  if total >= tonumber(redis.call('HGET', KEYS[1], 'ceiling')) then
    redis.call('HSET', KEYS[1], 'limit_reached', '1', 'limit_reached_at', now)
    return snapshot('crossed')
  end
  return snapshot('applied')
end
"#;

// KEYS: period. ARGV: ceiling, now.
const CREATE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  redis.call('HSET', KEYS[1], 'ceiling', ARGV[1], 'total', '0', 'reserved', '0',
    'limit_reached', '0', 'created_at', ARGV[2], 'updated_at', ARGV[2])
end
return snapshot('ok')
"#;

// KEYS: period, commits. ARGV: op, cost, idempotency key, now.
const APPLY: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return {'missing'} end
return apply(ARGV[1], tonumber(ARGV[2]), ARGV[3], ARGV[4])
"#;

// KEYS: period, commits, holds. ARGV: op, cost, idempotency key, now, reservation id.
const SETTLE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return {'missing'} end
drop_hold(ARGV[5], ARGV[4])
return apply(ARGV[1], tonumber(ARGV[2]), ARGV[3], ARGV[4])
"#;

// KEYS: period, commits, holds. ARGV: reservation id, amount, now, now millis.
const RESERVE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return {'missing'} end
if redis.call('HEXISTS', KEYS[3], ARGV[1]) == 1 then return snapshot('granted') end
if redis.call('HGET', KEYS[1], 'limit_reached') == '1' then return snapshot('already_at_limit') end
local amount = tonumber(ARGV[2])
local used = tonumber(redis.call('HGET', KEYS[1], 'total')) + tonumber(redis.call('HGET', KEYS[1], 'reserved'))
if used + amount > tonumber(redis.call('HGET', KEYS[1], 'ceiling')) then
  return snapshot('would_exceed')
end
redis.call('HINCRBY', KEYS[1], 'reserved', amount)
redis.call('HSET', KEYS[1], 'updated_at', ARGV[3])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[2] .. '|' .. ARGV[4])
return snapshot('granted')
"#;

// KEYS: period, commits, holds. ARGV: reservation id, now.
const RELEASE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return {'missing'} end
if drop_hold(ARGV[1], ARGV[2]) then return {'released'} end
return {'absent'}
"#;

// KEYS: period, commits, holds. ARGV: cutoff millis, now.
const EXPIRE: &str = r#"
local released = 0
local holds = redis.call('HGETALL', KEYS[3])
for i = 1, #holds, 2 do
  local taken = tonumber(string.match(holds[i + 1], '|(%d+)$'))
  if taken and taken < tonumber(ARGV[1]) then
    if redis.call('EXISTS', KEYS[1]) == 1 then
      drop_hold(holds[i], ARGV[2])
    else
      redis.call('HDEL', KEYS[3], holds[i])
    end
    released = released + 1
  end
end
return released
"#;

struct Scripts {
    create: redis::Script,
    apply: redis::Script,
    settle: redis::Script,
    reserve: redis::Script,
    release: redis::Script,
    expire: redis::Script,
}

impl Scripts {
    fn load() -> Self {
        let with_prelude = |body: &str| redis::Script::new(&format!("{}{}", SNAPSHOT, body));
        Self {
            create: with_prelude(CREATE),
            apply: with_prelude(APPLY),
            settle: with_prelude(SETTLE),
            reserve: with_prelude(RESERVE),
            release: with_prelude(RELEASE),
            expire: with_prelude(EXPIRE),
        }
    }
}

pub struct RedisLedgerStore {
    client: Arc<redis::Client>,
    config: RedisConfig,
    scripts: Scripts,
    clock: Arc<dyn Clock>,
}

impl RedisLedgerStore {
    pub fn new(redis_url: &str) -> Result<Self, redis::RedisError> {
        Self::from_config(redis_url, RedisConfig::default())
    }

    pub fn from_config(redis_url: &str, config: RedisConfig) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
            config,
            scripts: Scripts::load(),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> LedgerResult<Self> {
        self.config = self.config.prefix(prefix)?;
        Ok(self)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Hash tag shared by a period's keys so every script touches a single
    /// cluster slot. Braces are rejected in both user ids and prefixes.
    fn suffix(key: &PeriodKey) -> String {
        format!("{{{}:{}}}", key.user_id, key.month_label())
    }

    fn period_key(&self, key: &PeriodKey) -> String {
        format!("{}period:{}", self.config.key_prefix, Self::suffix(key))
    }

    fn commits_key(&self, key: &PeriodKey) -> String {
        format!("{}commits:{}", self.config.key_prefix, Self::suffix(key))
    }

    fn holds_key(&self, key: &PeriodKey) -> String {
        format!("{}holds:{}", self.config.key_prefix, Self::suffix(key))
    }

    async fn get_connection(&self) -> LedgerResult<redis::aio::MultiplexedConnection> {
        super::with_retry(
            self.config.max_retries,
            self.config.initial_backoff,
            self.config.max_backoff,
            Self::is_retryable,
            || async {
                tokio::time::timeout(
                    self.config.connection_timeout,
                    self.client.get_multiplexed_async_connection(),
                )
                .await
                .storage_err_ctx("connection timeout")?
                .storage_err()
            },
        )
        .await
    }

    fn is_retryable(error: &LedgerError) -> bool {
        match error {
            LedgerError::Unavailable { message } => {
                message.contains("timeout")
                    || message.contains("connection")
                    || message.contains("BUSY")
                    || message.contains("LOADING")
                    || message.contains("CLUSTERDOWN")
            }
            _ => false,
        }
    }

    async fn scan_keys(
        conn: &mut redis::aio::MultiplexedConnection,
        pattern: &str,
    ) -> LedgerResult<Vec<String>> {
        let mut cursor: u64 = 0;
        let mut all_keys = Vec::new();

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(conn)
                .await
                .storage_err()?;

            all_keys.extend(keys);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(all_keys)
    }

    async fn invoke(
        &self,
        invocation: &redis::ScriptInvocation<'_>,
    ) -> LedgerResult<Vec<String>> {
        let mut conn = self.get_connection().await?;
        tokio::time::timeout(self.config.response_timeout, invocation.invoke_async(&mut conn))
            .await
            .storage_err_ctx("response timeout")?
            .storage_err()
    }

    fn not_found(key: &PeriodKey) -> LedgerError {
        LedgerError::NotFound {
            key: key.to_string(),
        }
    }

    /// Split a script reply into its status and the period hash.
    fn parse_reply(
        key: &PeriodKey,
        reply: Vec<String>,
    ) -> LedgerResult<(String, Option<UsagePeriod>)> {
        let mut iter = reply.into_iter();
        let status = iter.next().ok_or_else(|| LedgerError::Corrupt {
            message: format!("empty script reply for {}", key),
        })?;
        let rest: Vec<String> = iter.collect();
        if rest.is_empty() {
            return Ok((status, None));
        }

        let fields: HashMap<String, String> = rest
            .chunks(2)
            .filter_map(|pair| match pair {
                [field, value] => Some((field.clone(), value.clone())),
                _ => None,
            })
            .collect();
        Ok((status, Some(Self::period_from_hash(key, &fields)?)))
    }

    fn period_from_hash(
        key: &PeriodKey,
        fields: &HashMap<String, String>,
    ) -> LedgerResult<UsagePeriod> {
        let number = |field: &str| -> LedgerResult<u64> {
            fields
                .get(field)
                .map(|v| v.parse::<u64>())
                .transpose()
                .map_err(|e| LedgerError::Corrupt {
                    message: format!("{} field {}: {}", key, field, e),
                })
                .map(|v| v.unwrap_or(0))
        };
        let timestamp = |field: &str| -> LedgerResult<Option<DateTime<Utc>>> {
            fields
                .get(field)
                .map(|v| DateTime::parse_from_rfc3339(v).map(|d| d.with_timezone(&Utc)))
                .transpose()
                .map_err(|e| LedgerError::Corrupt {
                    message: format!("{} field {}: {}", key, field, e),
                })
        };

        let mut categories: BTreeMap<OperationType, CategoryUsage> = BTreeMap::new();
        for (field, _) in fields.iter() {
            let Some(op) = field.strip_prefix("cost:") else {
                continue;
            };
            let operation = OperationType::from_str(op).map_err(|e| LedgerError::Corrupt {
                message: e.to_string(),
            })?;
            categories.insert(
                operation,
                CategoryUsage {
                    cost_cents: number(field)?,
                    count: number(&format!("count:{}", op))?,
                },
            );
        }

        let created_at = timestamp("created_at")?.ok_or_else(|| LedgerError::Corrupt {
            message: format!("{} has no created_at", key),
        })?;

        Ok(UsagePeriod {
            key: key.clone(),
            ceiling_cents: number("ceiling")?,
            total_cost_cents: number("total")?,
            reserved_cents: number("reserved")?,
            categories,
            limit_reached: fields.get("limit_reached").map(String::as_str) == Some("1"),
            limit_reached_at: timestamp("limit_reached_at")?,
            created_at,
            updated_at: timestamp("updated_at")?.unwrap_or(created_at),
        })
    }

    fn charge_outcome(key: &PeriodKey, reply: Vec<String>) -> LedgerResult<ChargeOutcome> {
        let (status, period) = Self::parse_reply(key, reply)?;
        let period = period.ok_or_else(|| Self::not_found(key))?;
        match status.as_str() {
            "applied" => Ok(ChargeOutcome::Applied {
                period,
                crossed_limit: false,
            }),
            "crossed" => Ok(ChargeOutcome::Applied {
                period,
                crossed_limit: true,
            }),
            "duplicate" => Ok(ChargeOutcome::Duplicate(period)),
            "rejected" => Ok(ChargeOutcome::Rejected(period)),
            other => Err(LedgerError::Corrupt {
                message: format!("unexpected script status '{}'", other),
            }),
        }
    }
}

#[async_trait]
impl LedgerStore for RedisLedgerStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &PeriodKey) -> LedgerResult<Option<UsagePeriod>> {
        let mut conn = self.get_connection().await?;
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.period_key(key))
            .query_async(&mut conn)
            .await
            .storage_err()?;
        if fields.is_empty() {
            return Ok(None);
        }
        Self::period_from_hash(key, &fields).map(Some)
    }

    async fn create_if_absent(
        &self,
        key: &PeriodKey,
        ceiling_cents: u64,
    ) -> LedgerResult<UsagePeriod> {
        check_ceiling(key, ceiling_cents)?;
        let now = self.clock.now().to_rfc3339();
        let mut invocation = self.scripts.create.key(self.period_key(key));
        invocation.arg(ceiling_cents).arg(now);
        let (_, period) = Self::parse_reply(key, self.invoke(&invocation).await?)?;
        period.ok_or_else(|| Self::not_found(key))
    }

    async fn apply_charge(&self, key: &PeriodKey, charge: &Charge) -> LedgerResult<ChargeOutcome> {
        let now = self.clock.now().to_rfc3339();
        let mut invocation = self.scripts.apply.key(self.period_key(key));
        invocation
            .key(self.commits_key(key))
            .arg(charge.operation.as_str())
            .arg(charge.cost_cents)
            .arg(charge.idempotency_key.as_deref().unwrap_or(""))
            .arg(now);
        Self::charge_outcome(key, self.invoke(&invocation).await?)
    }

    async fn reserve(&self, key: &PeriodKey, hold: &Hold) -> LedgerResult<ReserveOutcome> {
        let now = self.clock.now();
        let mut invocation = self.scripts.reserve.key(self.period_key(key));
        invocation
            .key(self.commits_key(key))
            .key(self.holds_key(key))
            .arg(hold.reservation_id.to_string())
            .arg(hold.amount_cents)
            .arg(now.to_rfc3339())
            .arg(now.timestamp_millis());

        let (status, period) = Self::parse_reply(key, self.invoke(&invocation).await?)?;
        let period = period.ok_or_else(|| Self::not_found(key))?;
        match status.as_str() {
            "granted" => Ok(ReserveOutcome::Granted(period)),
            "already_at_limit" => Ok(ReserveOutcome::Denied {
                period,
                reason: DenyReason::AlreadyAtLimit,
            }),
            "would_exceed" => Ok(ReserveOutcome::Denied {
                period,
                reason: DenyReason::WouldExceed,
            }),
            other => Err(LedgerError::Corrupt {
                message: format!("unexpected script status '{}'", other),
            }),
        }
    }

    async fn settle(
        &self,
        key: &PeriodKey,
        reservation_id: ReservationId,
        charge: &Charge,
    ) -> LedgerResult<ChargeOutcome> {
        let now = self.clock.now().to_rfc3339();
        let mut invocation = self.scripts.settle.key(self.period_key(key));
        invocation
            .key(self.commits_key(key))
            .key(self.holds_key(key))
            .arg(charge.operation.as_str())
            .arg(charge.cost_cents)
            .arg(charge.idempotency_key.as_deref().unwrap_or(""))
            .arg(now)
            .arg(reservation_id.to_string());
        Self::charge_outcome(key, self.invoke(&invocation).await?)
    }

    async fn release(&self, key: &PeriodKey, reservation_id: ReservationId) -> LedgerResult<bool> {
        let now = self.clock.now().to_rfc3339();
        let mut invocation = self.scripts.release.key(self.period_key(key));
        invocation
            .key(self.commits_key(key))
            .key(self.holds_key(key))
            .arg(reservation_id.to_string())
            .arg(now);
        let reply = self.invoke(&invocation).await?;
        Ok(reply.first().map(String::as_str) == Some("released"))
    }

    async fn release_expired(&self, older_than: DateTime<Utc>) -> LedgerResult<usize> {
        let mut conn = self.get_connection().await?;
        let holds_prefix = format!("{}holds:", self.config.key_prefix);
        let keys = Self::scan_keys(&mut conn, &format!("{}*", holds_prefix)).await?;
        let now = self.clock.now().to_rfc3339();

        let mut released = 0usize;
        for holds_key in keys {
            let Some(suffix) = holds_key.strip_prefix(&holds_prefix) else {
                continue;
            };
            let period_key = format!("{}period:{}", self.config.key_prefix, suffix);
            let commits_key = format!("{}commits:{}", self.config.key_prefix, suffix);

            let mut invocation = self.scripts.expire.key(period_key);
            invocation
                .key(commits_key)
                .key(holds_key.as_str())
                .arg(older_than.timestamp_millis())
                .arg(now.as_str());
            let count: i64 = tokio::time::timeout(
                self.config.response_timeout,
                invocation.invoke_async(&mut conn),
            )
            .await
            .storage_err_ctx("response timeout")?
            .storage_err()?;
            released += count.max(0) as usize;
        }

        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserId;

    fn key() -> PeriodKey {
        PeriodKey::new(UserId::new("user@example.com").unwrap(), 2026, 5).unwrap()
    }

    fn reply(status: &str, fields: &[(&str, &str)]) -> Vec<String> {
        let mut out = vec![status.to_string()];
        for (field, value) in fields {
            out.push(field.to_string());
            out.push(value.to_string());
        }
        out
    }

    #[test]
    fn test_prefix_validation() {
        assert!(RedisConfig::default().prefix("fitness:usage:").is_ok());
        assert!(RedisConfig::default().prefix("bad prefix*").is_err());
    }

    #[test]
    fn test_period_keys_share_one_hash_slot() {
        let store = RedisLedgerStore::new("redis://127.0.0.1:6379")
            .unwrap()
            .prefix("fitness:")
            .unwrap();
        let k = key();

        let tag = "{user@example.com:2026-05}";
        assert_eq!(store.period_key(&k), format!("fitness:period:{}", tag));
        assert_eq!(store.commits_key(&k), format!("fitness:commits:{}", tag));
        assert_eq!(store.holds_key(&k), format!("fitness:holds:{}", tag));
    }

    #[tokio::test]
    async fn test_zero_ceiling_rejected_before_round_trip() {
        // Nothing listens on this port; the check must fail first.
        let store = RedisLedgerStore::new("redis://127.0.0.1:1").unwrap();
        let err = store.create_if_absent(&key(), 0).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidCeiling { .. }));
    }

    #[test]
    fn test_parse_reply_builds_period() {
        let fields = [
            ("ceiling", "200"),
            ("total", "120"),
            ("reserved", "30"),
            ("limit_reached", "0"),
            ("created_at", "2026-05-01T00:00:00+00:00"),
            ("updated_at", "2026-05-03T10:00:00+00:00"),
            ("cost:scan_image", "80"),
            ("count:scan_image", "2"),
            ("cost:chat", "40"),
            ("count:chat", "4"),
        ];
        let (status, period) = RedisLedgerStore::parse_reply(&key(), reply("applied", &fields)).unwrap();
        let period = period.unwrap();

        assert_eq!(status, "applied");
        assert_eq!(period.ceiling_cents, 200);
        assert_eq!(period.remaining_cents(), 50);
        assert_eq!(period.category_count(OperationType::Chat), 4);
        assert!(period.is_consistent());
        assert!(!period.limit_reached);
    }

    #[test]
    fn test_charge_outcome_statuses() {
        let fields = [
            ("ceiling", "100"),
            ("total", "100"),
            ("reserved", "0"),
            ("limit_reached", "1"),
            ("limit_reached_at", "2026-05-04T09:30:00+00:00"),
            ("created_at", "2026-05-01T00:00:00+00:00"),
            ("cost:meal_plan", "100"),
            ("count:meal_plan", "1"),
        ];
        let crossed = RedisLedgerStore::charge_outcome(&key(), reply("crossed", &fields)).unwrap();
        assert!(matches!(
            crossed,
            ChargeOutcome::Applied {
                crossed_limit: true,
                ..
            }
        ));
        assert!(crossed.period().limit_reached_at.is_some());

        let missing = RedisLedgerStore::charge_outcome(&key(), vec!["missing".into()]);
        assert!(matches!(missing, Err(LedgerError::NotFound { .. })));
    }

    #[test]
    fn test_unknown_category_is_corrupt() {
        let fields = [
            ("ceiling", "100"),
            ("total", "5"),
            ("created_at", "2026-05-01T00:00:00+00:00"),
            ("cost:teleport", "5"),
        ];
        let result = RedisLedgerStore::parse_reply(&key(), reply("applied", &fields));
        assert!(matches!(result, Err(LedgerError::Corrupt { .. })));
    }
}
