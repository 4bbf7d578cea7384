//! Lua scripts backing [`super::Queue`]'s atomic multi-key operations.
//!
//! Each job record is stored as a single JSON blob (`Q:<name>:job:<id>`);
//! scripts that need to inspect or mutate a record's fields do so with
//! Redis' built-in `cjson` library rather than a hand-rolled hash-field
//! codec, since the record's shape (typed payload, nested metadata) isn't a
//! flat set of scalars. Timestamps on [`crate::job::JobRecord`] are encoded
//! as epoch milliseconds (`chrono::serde::ts_milliseconds`) specifically so
//! these scripts can do arithmetic on them directly.

use chrono::Utc;
use lazy_static::lazy_static;

use crate::error::Error;
use crate::job::JobStatus;

use super::Queue;

/// `(100 - priority) * PRIORITY_SCALE + created_at_ms` gives an ascending
/// sort key where higher priority sorts first and, within a priority,
/// earlier submission sorts first. `PRIORITY_SCALE` must exceed any
/// plausible epoch-millisecond value for this to hold; 1e13 is good until
/// the year 2286.
pub const PRIORITY_SCALE: i64 = 10_000_000_000_000;

pub fn waiting_score(priority: i32, created_at_ms: i64) -> f64 {
    ((100 - priority) as i64 * PRIORITY_SCALE + created_at_ms) as f64
}

// KEYS: 1. waiting zset, 2. delayed zset, 3. job key
// ARGV: 1. job id, 2. job json, 3. waiting score, 4. is_delayed (0/1), 5. due score (if delayed)
const ENQUEUE_SCRIPT: &str = r##"
    redis.call("SET", KEYS[3], ARGV[2])
    if ARGV[4] == "1" then
        redis.call("ZADD", KEYS[2], ARGV[5], ARGV[1])
    else
        redis.call("ZADD", KEYS[1], ARGV[3], ARGV[1])
    end
    return 1
"##;

lazy_static! {
    static ref ENQUEUE: redis::Script = redis::Script::new(ENQUEUE_SCRIPT);
}

pub struct EnqueueScript(&'static redis::Script);

impl EnqueueScript {
    pub fn new() -> Self {
        EnqueueScript(&ENQUEUE)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        queue: &Queue,
        conn: &mut deadpool_redis::Connection,
        job_id: &str,
        job_json: &str,
        waiting_score: f64,
        delayed: bool,
        due_score: f64,
    ) -> Result<(), Error> {
        let keys = queue.inner();
        let _: i64 = self
            .0
            .key(keys.keys.waiting())
            .key(keys.keys.delayed())
            .key(keys.keys.job(job_id))
            .arg(job_id)
            .arg(job_json)
            .arg(waiting_score)
            .arg(if delayed { "1" } else { "0" })
            .arg(due_score)
            .invoke_async(&mut **conn)
            .await?;
        Ok(())
    }
}

// KEYS: 1. waiting zset, 2. delayed zset
// ARGV: 1. job key prefix, then groups of (id, json, waiting_score, is_delayed, due_score)
const ENQUEUE_BULK_SCRIPT: &str = r##"
    local prefix = ARGV[1]
    local count = 0
    for i = 2, #ARGV, 5 do
        local id = ARGV[i]
        local json = ARGV[i + 1]
        local wscore = ARGV[i + 2]
        local delayed = ARGV[i + 3]
        local dscore = ARGV[i + 4]
        redis.call("SET", prefix .. id, json)
        if delayed == "1" then
            redis.call("ZADD", KEYS[2], dscore, id)
        else
            redis.call("ZADD", KEYS[1], wscore, id)
        end
        count = count + 1
    end
    return count
"##;

lazy_static! {
    static ref ENQUEUE_BULK: redis::Script = redis::Script::new(ENQUEUE_BULK_SCRIPT);
}

pub struct EnqueueBulkScript(&'static redis::Script);

pub struct BulkItem<'a> {
    pub id: &'a str,
    pub json: String,
    pub waiting_score: f64,
    pub delayed: bool,
    pub due_score: f64,
}

impl EnqueueBulkScript {
    pub fn new() -> Self {
        EnqueueBulkScript(&ENQUEUE_BULK)
    }

    pub async fn run(
        &self,
        queue: &Queue,
        conn: &mut deadpool_redis::Connection,
        items: &[BulkItem<'_>],
    ) -> Result<usize, Error> {
        if items.is_empty() {
            return Ok(0);
        }
        let keys = queue.inner();
        let mut invocation = self.0.key(keys.keys.waiting()).key(keys.keys.delayed());
        invocation = invocation.arg(&keys.job_key_prefix);
        for item in items {
            invocation = invocation
                .arg(item.id)
                .arg(&item.json)
                .arg(item.waiting_score)
                .arg(if item.delayed { "1" } else { "0" })
                .arg(item.due_score);
        }
        let count: i64 = invocation.invoke_async(&mut **conn).await?;
        Ok(count as usize)
    }
}

// KEYS: 1. waiting zset, 2. delayed zset, 3. active hash, 4. pause flag
// ARGV: 1. now_ms, 2. job key prefix, 3. priority scale
const CLAIM_SCRIPT: &str = r##"
    if redis.call("EXISTS", KEYS[4]) == 1 then
        return false
    end

    local now = tonumber(ARGV[1])
    local prefix = ARGV[2]
    local scale = tonumber(ARGV[3])

    local due = redis.call("ZRANGEBYSCORE", KEYS[2], "-inf", now)
    for _, id in ipairs(due) do
        local key = prefix .. id
        local raw = redis.call("GET", key)
        if raw then
            local rec = cjson.decode(raw)
            local score = (100 - rec["priority"]) * scale + rec["created_at"]
            rec["status"] = "waiting"
            redis.call("SET", key, cjson.encode(rec))
            redis.call("ZADD", KEYS[1], score, id)
        end
        redis.call("ZREM", KEYS[2], id)
    end

    local top = redis.call("ZRANGE", KEYS[1], 0, 0)
    if #top == 0 then
        return false
    end

    local id = top[1]
    redis.call("ZREM", KEYS[1], id)

    local key = prefix .. id
    local raw = redis.call("GET", key)
    if not raw then
        -- record vanished (e.g. cleaned concurrently); treat as no job available.
        return false
    end

    local rec = cjson.decode(raw)
    rec["status"] = "active"
    rec["processed_at"] = now
    local updated = cjson.encode(rec)
    redis.call("SET", key, updated)
    redis.call("HSET", KEYS[3], id, now)

    return {id, updated}
"##;

lazy_static! {
    static ref CLAIM: redis::Script = redis::Script::new(CLAIM_SCRIPT);
}

pub struct ClaimScript(&'static redis::Script);

impl ClaimScript {
    pub fn new() -> Self {
        ClaimScript(&CLAIM)
    }

    pub async fn run(
        &self,
        queue: &Queue,
        conn: &mut deadpool_redis::Connection,
    ) -> Result<Option<(String, String)>, Error> {
        let keys = queue.inner();
        let now = Utc::now().timestamp_millis();
        let result: Option<(String, String)> = self
            .0
            .key(keys.keys.waiting())
            .key(keys.keys.delayed())
            .key(keys.keys.active())
            .key(keys.keys.pause())
            .arg(now)
            .arg(&keys.job_key_prefix)
            .arg(PRIORITY_SCALE)
            .invoke_async(&mut **conn)
            .await?;
        Ok(result)
    }
}

// KEYS: 1. active hash, 2. job key, 3. completed list
// ARGV: 1. job id, 2. now_ms, 3. result json ("" if none), 4. cap
const COMPLETE_SCRIPT: &str = r##"
    if redis.call("HEXISTS", KEYS[1], ARGV[1]) == 0 then
        return 0
    end
    redis.call("HDEL", KEYS[1], ARGV[1])

    local raw = redis.call("GET", KEYS[2])
    if not raw then
        return 0
    end
    local rec = cjson.decode(raw)
    rec["status"] = "completed"
    rec["finished_at"] = tonumber(ARGV[2])
    if ARGV[3] ~= "" then
        rec["result"] = cjson.decode(ARGV[3])
    end
    redis.call("SET", KEYS[2], cjson.encode(rec))

    redis.call("LPUSH", KEYS[3], ARGV[1])
    redis.call("LTRIM", KEYS[3], 0, tonumber(ARGV[4]) - 1)
    return 1
"##;

lazy_static! {
    static ref COMPLETE: redis::Script = redis::Script::new(COMPLETE_SCRIPT);
}

pub struct CompleteScript(&'static redis::Script);

impl CompleteScript {
    pub fn new() -> Self {
        CompleteScript(&COMPLETE)
    }

    pub async fn run(
        &self,
        queue: &Queue,
        conn: &mut deadpool_redis::Connection,
        job_id: &str,
        result_json: Option<&str>,
        cap: usize,
    ) -> Result<bool, Error> {
        let keys = queue.inner();
        let now = Utc::now().timestamp_millis();
        let marked: i64 = self
            .0
            .key(keys.keys.active())
            .key(keys.keys.job(job_id))
            .key(keys.keys.completed())
            .arg(job_id)
            .arg(now)
            .arg(result_json.unwrap_or(""))
            .arg(cap as i64)
            .invoke_async(&mut **conn)
            .await?;
        Ok(marked == 1)
    }
}

/// Outcome of [`FailScript::run`].
pub enum FailOutcome {
    /// The job was no longer owned by the caller (already reclaimed by
    /// stalled recovery, or already terminal). No mutation occurred.
    Stale,
    /// Requeued for another attempt; carries the attempt number reached.
    Retried(u32),
    /// Exhausted retries; moved to `failed` or `dead-lettered`.
    Terminal(u32),
}

// KEYS: 1. active hash, 2. job key, 3. waiting zset, 4. delayed zset, 5. failed list, 6. dead list
// ARGV: 1. job id, 2. now_ms, 3. error json, 4. cap, 5. dead_letter_enabled (0/1),
//       6. retry_delay_ms (0 means requeue immediately), 7. priority scale
const FAIL_SCRIPT: &str = r##"
    if redis.call("HEXISTS", KEYS[1], ARGV[1]) == 0 then
        return {"stale", 0}
    end
    redis.call("HDEL", KEYS[1], ARGV[1])

    local raw = redis.call("GET", KEYS[2])
    if not raw then
        return {"stale", 0}
    end

    local rec = cjson.decode(raw)
    local attempts = rec["attempts"] + 1
    rec["attempts"] = attempts
    rec["error"] = cjson.decode(ARGV[3])

    if attempts < rec["max_attempts"] then
        local delay = tonumber(ARGV[6])
        if delay > 0 then
            local due = tonumber(ARGV[2]) + delay
            rec["status"] = "delayed"
            rec["run_at"] = due
            redis.call("SET", KEYS[2], cjson.encode(rec))
            redis.call("ZADD", KEYS[4], due, ARGV[1])
        else
            local scale = tonumber(ARGV[7])
            local score = (100 - rec["priority"]) * scale + rec["created_at"]
            rec["status"] = "waiting"
            rec["run_at"] = cjson.null
            redis.call("SET", KEYS[2], cjson.encode(rec))
            redis.call("ZADD", KEYS[3], score, ARGV[1])
        end
        return {"retry", attempts}
    end

    rec["finished_at"] = tonumber(ARGV[2])
    rec["failed_at"] = tonumber(ARGV[2])

    local dead_letter = ARGV[5] == "1"
    local target
    if dead_letter then
        rec["status"] = "dead-lettered"
        target = KEYS[6]
    else
        rec["status"] = "failed"
        target = KEYS[5]
    end
    redis.call("SET", KEYS[2], cjson.encode(rec))
    redis.call("LPUSH", target, ARGV[1])
    redis.call("LTRIM", target, 0, tonumber(ARGV[4]) - 1)

    return {"terminal", attempts}
"##;

lazy_static! {
    static ref FAIL: redis::Script = redis::Script::new(FAIL_SCRIPT);
}

pub struct FailScript(&'static redis::Script);

impl FailScript {
    pub fn new() -> Self {
        FailScript(&FAIL)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        queue: &Queue,
        conn: &mut deadpool_redis::Connection,
        job_id: &str,
        error_json: &str,
        cap: usize,
        dead_letter: bool,
        retry_delay_ms: u64,
    ) -> Result<FailOutcome, Error> {
        let keys = queue.inner();
        let now = Utc::now().timestamp_millis();
        let (kind, attempts): (String, i64) = self
            .0
            .key(keys.keys.active())
            .key(keys.keys.job(job_id))
            .key(keys.keys.waiting())
            .key(keys.keys.delayed())
            .key(keys.keys.failed())
            .key(keys.keys.dead())
            .arg(job_id)
            .arg(now)
            .arg(error_json)
            .arg(cap as i64)
            .arg(if dead_letter { "1" } else { "0" })
            .arg(retry_delay_ms)
            .arg(PRIORITY_SCALE)
            .invoke_async(&mut **conn)
            .await?;

        Ok(match kind.as_str() {
            "retry" => FailOutcome::Retried(attempts as u32),
            "terminal" => FailOutcome::Terminal(attempts as u32),
            _ => FailOutcome::Stale,
        })
    }
}

// KEYS: 1. waiting zset, 2. delayed zset, 3. active hash, 4. job key
// ARGV: 1. job id, 2. now_ms, 3. cancel_if_active (0/1)
const CANCEL_SCRIPT: &str = r##"
    local raw = redis.call("GET", KEYS[4])
    if not raw then
        return "missing"
    end
    local rec = cjson.decode(raw)

    local removed_waiting = redis.call("ZREM", KEYS[1], ARGV[1])
    local removed_delayed = redis.call("ZREM", KEYS[2], ARGV[1])

    if removed_waiting == 1 or removed_delayed == 1 then
        rec["status"] = "cancelled"
        rec["finished_at"] = tonumber(ARGV[2])
        redis.call("SET", KEYS[4], cjson.encode(rec))
        return "cancelled"
    end

    local active = redis.call("HEXISTS", KEYS[3], ARGV[1])
    if active == 1 then
        if ARGV[3] == "1" then
            redis.call("HDEL", KEYS[3], ARGV[1])
            rec["status"] = "cancelled"
            rec["finished_at"] = tonumber(ARGV[2])
            redis.call("SET", KEYS[4], cjson.encode(rec))
            return "cancelled"
        end
        return "active"
    end

    return rec["status"]
"##;

lazy_static! {
    static ref CANCEL: redis::Script = redis::Script::new(CANCEL_SCRIPT);
}

pub struct CancelScript(&'static redis::Script);

impl CancelScript {
    pub fn new() -> Self {
        CancelScript(&CANCEL)
    }

    pub async fn run(
        &self,
        queue: &Queue,
        conn: &mut deadpool_redis::Connection,
        job_id: &str,
        cancel_if_active: bool,
    ) -> Result<JobStatus, Error> {
        let keys = queue.inner();
        let now = Utc::now().timestamp_millis();
        let status: String = self
            .0
            .key(keys.keys.waiting())
            .key(keys.keys.delayed())
            .key(keys.keys.active())
            .key(keys.keys.job(job_id))
            .arg(job_id)
            .arg(now)
            .arg(if cancel_if_active { "1" } else { "0" })
            .invoke_async(&mut **conn)
            .await?;

        Ok(match status.as_str() {
            "waiting" => JobStatus::Waiting,
            "delayed" => JobStatus::Delayed,
            "active" => JobStatus::Active,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            "dead-lettered" => JobStatus::DeadLettered,
            // "missing" or any other sentinel: treat as already gone.
            _ => JobStatus::Cancelled,
        })
    }
}

// KEYS: 1. job key
// ARGV: 1. percent, 2. detail json ("" if none)
const UPDATE_PROGRESS_SCRIPT: &str = r##"
    local raw = redis.call("GET", KEYS[1])
    if not raw then
        return 0
    end
    local rec = cjson.decode(raw)
    rec["progress"] = { percent = tonumber(ARGV[1]) }
    if ARGV[2] ~= "" then
        rec["progress"]["detail"] = cjson.decode(ARGV[2])
    end
    redis.call("SET", KEYS[1], cjson.encode(rec))
    return 1
"##;

lazy_static! {
    static ref UPDATE_PROGRESS: redis::Script = redis::Script::new(UPDATE_PROGRESS_SCRIPT);
}

pub struct UpdateProgressScript(&'static redis::Script);

impl UpdateProgressScript {
    pub fn new() -> Self {
        UpdateProgressScript(&UPDATE_PROGRESS)
    }

    pub async fn run(
        &self,
        queue: &Queue,
        conn: &mut deadpool_redis::Connection,
        job_id: &str,
        percent: u8,
        detail_json: Option<&str>,
    ) -> Result<bool, Error> {
        let keys = queue.inner();
        let updated: i64 = self
            .0
            .key(keys.keys.job(job_id))
            .arg(percent)
            .arg(detail_json.unwrap_or(""))
            .invoke_async(&mut **conn)
            .await?;
        Ok(updated == 1)
    }
}

// KEYS: 1. terminal list
// ARGV: 1. job key prefix, 2. now_ms, 3. grace_ms, 4. cap
const CLEAN_SCRIPT: &str = r##"
    local prefix = ARGV[1]
    local now = tonumber(ARGV[2])
    local grace = tonumber(ARGV[3])
    local cap = tonumber(ARGV[4])
    local removed = 0

    for _ = 1, cap do
        local id = redis.call("RPOP", KEYS[1])
        if not id then
            break
        end

        local key = prefix .. id
        local raw = redis.call("GET", key)
        if raw then
            local rec = cjson.decode(raw)
            local finished = rec["finished_at"] or rec["failed_at"] or rec["created_at"]
            if now - finished >= grace then
                redis.call("DEL", key)
                removed = removed + 1
            else
                redis.call("RPUSH", KEYS[1], id)
                break
            end
        else
            removed = removed + 1
        end
    end

    return removed
"##;

lazy_static! {
    static ref CLEAN: redis::Script = redis::Script::new(CLEAN_SCRIPT);
}

pub struct CleanScript(&'static redis::Script);

impl CleanScript {
    pub fn new() -> Self {
        CleanScript(&CLEAN)
    }

    pub async fn run(
        &self,
        queue: &Queue,
        conn: &mut deadpool_redis::Connection,
        list_key: &str,
        grace_ms: i64,
        cap: usize,
    ) -> Result<usize, Error> {
        let keys = queue.inner();
        let now = Utc::now().timestamp_millis();
        let removed: i64 = self
            .0
            .key(list_key)
            .arg(&keys.job_key_prefix)
            .arg(now)
            .arg(grace_ms)
            .arg(cap as i64)
            .invoke_async(&mut **conn)
            .await?;
        Ok(removed as usize)
    }
}

// KEYS: 1. job key
// ARGV: 1. log entry json, 2. max entries
const APPEND_LOG_SCRIPT: &str = r##"
    local raw = redis.call("GET", KEYS[1])
    if not raw then
        return 0
    end
    local rec = cjson.decode(raw)
    if rec["log"] == nil or rec["log"] == cjson.null then
        rec["log"] = {}
    end
    table.insert(rec["log"], cjson.decode(ARGV[1]))
    local max_entries = tonumber(ARGV[2])
    while #rec["log"] > max_entries do
        table.remove(rec["log"], 1)
    end
    redis.call("SET", KEYS[1], cjson.encode(rec))
    return 1
"##;

lazy_static! {
    static ref APPEND_LOG: redis::Script = redis::Script::new(APPEND_LOG_SCRIPT);
}

pub struct AppendLogScript(&'static redis::Script);

impl AppendLogScript {
    pub fn new() -> Self {
        AppendLogScript(&APPEND_LOG)
    }

    pub async fn run(
        &self,
        queue: &Queue,
        conn: &mut deadpool_redis::Connection,
        job_id: &str,
        entry_json: &str,
        max_entries: usize,
    ) -> Result<bool, Error> {
        let keys = queue.inner();
        let updated: i64 = self
            .0
            .key(keys.keys.job(job_id))
            .arg(entry_json)
            .arg(max_entries as i64)
            .invoke_async(&mut **conn)
            .await?;
        Ok(updated == 1)
    }
}
