//! The atomic script catalog: every multi-key state transition in one place.
//!
//! Every mutation that must be atomic across more than one key is expressed
//! as a Lua script invoked via `redis::Script`, mirroring the reference
//! implementation's `Scripts` wrapper (which loads one `.lua` file per
//! operation and registers it with the client) but with the script bodies
//! inlined as constants, in the style this codebase already uses for its
//! single-key leader-lock script.
//!
//! Read-only introspection (`getCounts`, `getRanges`, `getState`,
//! `isJobInList`) is implemented directly against plain Redis commands in
//! `queue.rs` instead of as scripts: correctness here does not depend on
//! cross-key atomicity, only on every *mutation* being atomic, so a script
//! buys nothing beyond one extra round-trip saved — not worth the loss of
//! readability for point-in-time reads that are allowed to reflect a
//! concurrently-changing queue (see DESIGN.md).

use crate::error::{JobError, JobResult, ScriptError};
use crate::job::{Job, KeepJobs};
use crate::keys::QueueKeys;
use redis::aio::ConnectionLike;
use redis::{FromRedisValue, Script};

fn keep_jobs_args(policy: &KeepJobs) -> (i64, i64, i64) {
    match policy {
        KeepJobs::Bool(true) => (1, -1, -1),
        KeepJobs::Bool(false) => (0, 0, 0),
        KeepJobs::Count(count) => (0, *count, -1),
        KeepJobs::AgeAndCount { age, count } => (0, *count, *age),
    }
}

/// Checked conversion of a script's raw integer return into `Ok`, mapping
/// negative codes through [`ScriptError::from_code`].
fn check(code: i64) -> JobResult<i64> {
    if code < 0 {
        match ScriptError::from_code(code) {
            Some(err) => Err(JobError::Script(err)),
            None => Err(JobError::Internal(format!("unknown script error code {code}"))),
        }
    } else {
        Ok(code)
    }
}

/// Lua fragment defining `bump_marker`, the blocking-wake primitive every
/// mutating script touches. Inlined at the top of each script body below
/// since a Lua chunk sent via `EVAL` cannot reference functions defined in
/// another chunk.
const BUMP_MARKER: &str = r#"
local function bump_marker(marker_key, ts)
    redis.call('ZADD', marker_key, ts, '0')
end
"#;

/// Lua fragment defining `dedup_existing`, resolving a dedup key
/// (`prefix:queue:de:<id>`) to an existing job id, optionally extending it.
/// Replacement (overwriting the existing job's data rather than just its
/// TTL) is handled by the caller script, since it needs the existing job's
/// current state to decide whether replace is allowed.
const DEDUP_CHECK: &str = r#"
local function dedup_existing(dedup_key, ttl, extend)
    local existing = redis.call('GET', dedup_key)
    if existing then
        if extend and ttl and tonumber(ttl) and tonumber(ttl) > 0 then
            redis.call('PEXPIRE', dedup_key, tonumber(ttl))
        end
        return existing
    end
    return false
end
"#;

const ADD_JOB_BODY: &str = r#"
-- KEYS[1] wait/paused (destination list, already resolved by caller)
-- KEYS[2] meta
-- KEYS[3] id (incr counter)
-- KEYS[4] destination extra (delayed or prioritized zset, or '' for standard)
-- KEYS[5] completed (unused placeholder kept for wire-shape stability)
-- KEYS[6] events
-- KEYS[7] marker
-- KEYS[8] dependencies key of parent (if any), else ''
-- KEYS[9] delayed zset (replace may only overwrite a duplicate still delayed)
-- KEYS[10] priority counter, incremented to break ties between same-priority jobs
-- ARGV[1] custom id or ''
-- ARGV[2..8] name, data(json), opts(json), timestamp, delay, priority, attempts
-- ARGV[9] kind: 'standard' | 'delayed' | 'prioritized'
-- ARGV[10] score for delayed destination (ignored for prioritized; recomputed from the counter)
-- ARGV[11] job key prefix e.g. 'bull:q'
-- ARGV[12] dedup key or ''
-- ARGV[13] dedup ttl ms or '0'
-- ARGV[14] dedup extend '1'/'0'
-- ARGV[15] dedup replace '1'/'0'
-- ARGV[16] parent id or ''
-- ARGV[17] now ms

local waitOrPaused = KEYS[1]
local idKey = KEYS[3]
local destZsetKey = KEYS[4]
local eventsKey = KEYS[6]
local markerKey = KEYS[7]
local parentDepsKey = KEYS[8]
local delayedKey = KEYS[9]
local pcKey = KEYS[10]

local customId = ARGV[1]
local name = ARGV[2]
local data = ARGV[3]
local opts = ARGV[4]
local timestamp = ARGV[5]
local delay = ARGV[6]
local priority = tonumber(ARGV[7]) or 0
local attempts = ARGV[8]
local kind = ARGV[9]
local score = tonumber(ARGV[10])
local jobPrefix = ARGV[11]
local dedupKey = ARGV[12]
local dedupTtl = ARGV[13]
local dedupExtend = ARGV[14] == '1'
local dedupReplace = ARGV[15] == '1'
local parentId = ARGV[16]
local now = ARGV[17]

-- Inserts jobId into whichever state `kind` resolves to, folding a freshly
-- incremented counter into a prioritized score so same-priority jobs stay
-- ordered by insertion (`priority * 2^32 + counter`, within the 53 bits a
-- double can represent exactly).
local function stage(jobId)
    if kind == 'standard' then
        redis.call('LPUSH', waitOrPaused, jobId)
    elseif kind == 'delayed' then
        redis.call('ZADD', destZsetKey, score, jobId)
    elseif kind == 'prioritized' then
        local counter = redis.call('INCR', pcKey)
        redis.call('ZADD', destZsetKey, priority * 4294967296 + (counter % 4294967296), jobId)
    end
end

if dedupKey ~= '' then
    local existing = dedup_existing(dedupKey, dedupTtl, dedupExtend)
    if existing then
        if dedupReplace and redis.call('ZSCORE', delayedKey, existing) then
            redis.call('ZREM', delayedKey, existing)
            local existingKey = jobPrefix .. ':' .. existing
            redis.call('HSET', existingKey,
                'name', name, 'data', data, 'opts', opts,
                'timestamp', timestamp, 'delay', delay, 'priority', priority,
                'attempts', attempts, 'attemptsMade', '0', 'attemptsStarted', '0',
                'stalledCounter', '0', 'stacktrace', '[]')
            stage(existing)
            redis.call('XADD', eventsKey, '*', 'event', 'added', 'jobId', existing)
            bump_marker(markerKey, now)
        end
        return existing
    end
end

local jobId = customId
if jobId == '' then
    jobId = tostring(redis.call('INCR', idKey))
end

local jobKey = jobPrefix .. ':' .. jobId
if redis.call('EXISTS', jobKey) == 1 and dedupKey == '' then
    -- idempotent add: caller-provided id collision returns the existing id untouched
    return jobId
end

redis.call('HSET', jobKey,
    'name', name, 'data', data, 'opts', opts,
    'timestamp', timestamp, 'delay', delay, 'priority', priority,
    'attempts', attempts, 'attemptsMade', '0', 'attemptsStarted', '0',
    'stalledCounter', '0', 'stacktrace', '[]')

if parentId ~= '' then
    redis.call('SADD', parentDepsKey, jobKey)
end

if dedupKey ~= '' then
    if tonumber(dedupTtl) and tonumber(dedupTtl) > 0 then
        redis.call('SET', dedupKey, jobId, 'PX', dedupTtl)
    else
        redis.call('SET', dedupKey, jobId)
    end
end

stage(jobId)

redis.call('XADD', eventsKey, '*', 'event', 'added', 'jobId', jobId)
bump_marker(markerKey, now)

return jobId
"#;

const ADD_PARENT_JOB: &str = r#"
-- KEYS[1] id counter
-- KEYS[2] dependencies key of this job's own parent (if any), else ''
-- ARGV[1] custom id or ''
-- ARGV[2..6] name, data, opts, timestamp, attempts
-- ARGV[7] job key prefix e.g. 'bull:q'
-- ARGV[8] priority  ARGV[9] delay
local jobId = ARGV[1]
if jobId == '' then
    jobId = tostring(redis.call('INCR', KEYS[1]))
end

local jobKey = ARGV[7] .. ':' .. jobId
if redis.call('EXISTS', jobKey) == 1 then
    return -7
end

redis.call('HSET', jobKey,
    'name', ARGV[2], 'data', ARGV[3], 'opts', ARGV[4],
    'timestamp', ARGV[5], 'delay', ARGV[9], 'priority', ARGV[8],
    'attempts', ARGV[6], 'attemptsMade', '0', 'attemptsStarted', '0',
    'stalledCounter', '0', 'stacktrace', '[]')

-- a non-leaf flow node (one with children of its own) can itself be a
-- dependency of a further ancestor; register it the same way a leaf job
-- registers with its own parent in ADD_JOB_BODY.
if KEYS[2] ~= '' then
    redis.call('SADD', KEYS[2], jobKey)
end

return jobId
"#;

const LINK_CHILD_TO_PARENT_BODY: &str = r#"
-- Moves the parent into waiting-children the first time it gets a dependency.
-- KEYS[1] parent job key
-- KEYS[2] parent dependencies set
-- KEYS[3] waiting-children zset
-- KEYS[4] marker
-- ARGV[1] parent id
-- ARGV[2] now ms
local parentKey = KEYS[1]
if redis.call('EXISTS', parentKey) == 0 then
    return -5
end

local depCount = redis.call('SCARD', KEYS[2])
if depCount == 1 then
    -- first dependency just added by the caller before invoking this script
    redis.call('ZADD', KEYS[3], ARGV[2], ARGV[1])
    bump_marker(KEYS[4], ARGV[2])
end
return 0
"#;

const MOVE_TO_ACTIVE_BODY: &str = r#"
-- KEYS[1] wait  KEYS[2] active  KEYS[3] prioritized  KEYS[4] delayed
-- KEYS[5] meta  KEYS[6] stalled  KEYS[7] limiter  KEYS[8] marker
-- KEYS[9] priority counter, incremented to break ties between same-priority jobs
-- ARGV[1] token  ARGV[2] lockDuration ms  ARGV[3] now ms
-- ARGV[4] limiter max (0 disables)  ARGV[5] limiter duration ms
-- ARGV[6] job key prefix
local waitKey, activeKey, prioritizedKey, delayedKey = KEYS[1], KEYS[2], KEYS[3], KEYS[4]
local metaKey, stalledKey, limiterKey, markerKey = KEYS[5], KEYS[6], KEYS[7], KEYS[8]
local pcKey = KEYS[9]
local token, lockDuration, now = ARGV[1], ARGV[2], tonumber(ARGV[3])
local limiterMax, limiterDuration, jobPrefix = tonumber(ARGV[4]), tonumber(ARGV[5]), ARGV[6]

if redis.call('HEXISTS', metaKey, 'paused') == 1 then
    return {false, 0, 0}
end

-- promote any delayed jobs whose score is due before reserving
local due = redis.call('ZRANGEBYSCORE', delayedKey, '-inf', now, 'LIMIT', 0, 1)
if due[1] then
    redis.call('ZREM', delayedKey, due[1])
    local priority = tonumber(redis.call('HGET', jobPrefix .. ':' .. due[1], 'priority') or '0')
    if priority > 0 then
        local counter = redis.call('INCR', pcKey)
        redis.call('ZADD', prioritizedKey, priority * 4294967296 + (counter % 4294967296), due[1])
    else
        redis.call('RPUSH', waitKey, due[1])
    end
end

if limiterMax and limiterMax > 0 then
    local count = redis.call('INCR', limiterKey)
    if count == 1 then
        redis.call('PEXPIRE', limiterKey, limiterDuration)
    end
    if count > limiterMax then
        local ttl = redis.call('PTTL', limiterKey)
        if ttl < 0 then ttl = limiterDuration end
        return {false, now + ttl, 0}
    end
end

local jobId = redis.call('ZPOPMIN', prioritizedKey, 1)[1]
if not jobId then
    jobId = redis.call('RPOP', waitKey)
end

if not jobId then
    local nextDelayed = redis.call('ZRANGE', delayedKey, 0, 0, 'WITHSCORES')
    local delayUntil = 0
    if nextDelayed[2] then delayUntil = tonumber(nextDelayed[2]) end
    return {false, 0, delayUntil}
end

local jobKey = jobPrefix .. ':' .. jobId
redis.call('LPUSH', activeKey, jobId)
redis.call('SET', jobKey .. ':lock', token, 'PX', lockDuration)
redis.call('HSET', jobKey, 'processedOn', now)
redis.call('HINCRBY', jobKey, 'attemptsStarted', 1)
redis.call('SADD', stalledKey, jobId)
bump_marker(markerKey, now)

local jobHash = redis.call('HGETALL', jobKey)
return {jobId, 0, 0, jobHash}
"#;

const EXTEND_LOCK: &str = r#"
-- KEYS[1] lock key
-- ARGV[1] token  ARGV[2] lockDuration ms
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return 1
end
return 0
"#;

const MOVE_TO_FINISHED_BODY: &str = r#"
-- KEYS[1] active  KEYS[2] stalled  KEYS[3] lock  KEYS[4] target(completed|failed)
-- KEYS[5] job  KEYS[6] events  KEYS[7] marker  KEYS[8] parent processed hash
-- KEYS[9] parent dependencies set  KEYS[10] parent job key
-- KEYS[11] parent wait  KEYS[12] parent prioritized  KEYS[13] parent waiting-children
-- KEYS[14] parent delayed  KEYS[15] parent failed  KEYS[16] parent events
-- KEYS[17] parent's priority counter, incremented to break ties between
--          same-priority jobs re-entering `prioritized`
-- ARGV[1] token  ARGV[2] target name 'completed'|'failed'
-- ARGV[3] now  ARGV[4] result/reason json-or-string
-- ARGV[5] removeAll(0/1)  ARGV[6] removeCount  ARGV[7] removeAge
-- ARGV[8] parentKey string or ''  ARGV[9] fpof(0/1)  ARGV[10] jobKey (own)
local activeKey, stalledKey, lockKey, targetKey = KEYS[1], KEYS[2], KEYS[3], KEYS[4]
local jobKey, eventsKey, markerKey = KEYS[5], KEYS[6], KEYS[7]
local parentProcessedKey, parentDepsKey, parentJobKey = KEYS[8], KEYS[9], KEYS[10]
local parentWait, parentPrioritized, parentWaitingChildren, parentDelayed = KEYS[11], KEYS[12], KEYS[13], KEYS[14]
local parentFailedKey, parentEventsKey, pcKey = KEYS[15], KEYS[16], KEYS[17]

local token, target, now = ARGV[1], ARGV[2], ARGV[3]
local payload = ARGV[4]
local removeAll, removeCount, removeAge = ARGV[5], tonumber(ARGV[6]), tonumber(ARGV[7])
local parentKeyStr, fpof, ownJobKey = ARGV[8], ARGV[9] == '1', ARGV[10]

if redis.call('EXISTS', lockKey) == 0 then
    return -2
end
if redis.call('GET', lockKey) ~= token then
    return -6
end
if redis.call('LREM', activeKey, 1, string.match(jobKey, ':([^:]+)$')) == 0 then
    -- allow idempotent re-finalization attempts to proceed without hard-failing on LREM miss
end

local jobId = string.match(jobKey, ':([^:]+)$')
redis.call('SREM', stalledKey, jobId)
redis.call('DEL', lockKey)
redis.call('ZADD', targetKey, now, jobId)
redis.call('HINCRBY', jobKey, 'attemptsMade', 1)

if target == 'completed' then
    redis.call('HSET', jobKey, 'returnvalue', payload, 'finishedOn', now)
    redis.call('XADD', eventsKey, '*', 'event', 'completed', 'jobId', jobId)
else
    redis.call('HSET', jobKey, 'failedReason', payload, 'finishedOn', now)
    redis.call('XADD', eventsKey, '*', 'event', 'failed', 'jobId', jobId)
end

if removeAll == '1' then
    redis.call('ZREM', targetKey, jobId)
    redis.call('DEL', jobKey, jobKey .. ':logs', jobKey .. ':dependencies', jobKey .. ':processed')
elseif removeCount and removeCount >= 0 then
    if removeCount == 0 then
        redis.call('ZREM', targetKey, jobId)
        redis.call('DEL', jobKey, jobKey .. ':logs', jobKey .. ':dependencies', jobKey .. ':processed')
    else
        local extra = redis.call('ZCARD', targetKey) - removeCount
        if extra > 0 then
            local victims = redis.call('ZRANGE', targetKey, 0, extra - 1)
            for _, vId in ipairs(victims) do
                redis.call('ZREM', targetKey, vId)
            end
        end
    end
end

if parentKeyStr ~= '' then
    local parentId = string.match(parentJobKey, ':([^:]+)$')
    if target == 'completed' then
        redis.call('HSET', parentProcessedKey, ownJobKey, payload)
        redis.call('SREM', parentDepsKey, ownJobKey)
        if redis.call('SCARD', parentDepsKey) == 0 and redis.call('EXISTS', parentJobKey) == 1 then
            redis.call('ZREM', parentWaitingChildren, parentId)
            local parentPriority = tonumber(redis.call('HGET', parentJobKey, 'priority') or '0')
            local parentDelay = tonumber(redis.call('HGET', parentJobKey, 'delay') or '0')
            if parentDelay > 0 then
                redis.call('ZADD', parentDelayed, tonumber(now) + parentDelay, parentId)
            elseif parentPriority > 0 then
                local counter = redis.call('INCR', pcKey)
                redis.call('ZADD', parentPrioritized, parentPriority * 4294967296 + (counter % 4294967296), parentId)
            else
                redis.call('RPUSH', parentWait, parentId)
            end
            bump_marker(markerKey, now)
        end
    elseif fpof then
        -- fail-parent-on-failure: the dependency can never be satisfied now,
        -- so fail the parent in the same stroke. The worker continues the
        -- cascade one level further for each ancestor that also opted in.
        redis.call('SREM', parentDepsKey, ownJobKey)
        if redis.call('EXISTS', parentJobKey) == 1 then
            redis.call('ZREM', parentWaitingChildren, parentId)
            local parentReason = 'child ' .. string.match(jobKey, ':([^:]+)$') .. ' failed: ' .. payload
            redis.call('HSET', parentJobKey, 'failedReason', parentReason, 'finishedOn', now)
            redis.call('ZADD', parentFailedKey, now, parentId)
            redis.call('XADD', parentEventsKey, '*', 'event', 'failed', 'jobId', parentId)
        end
    else
        redis.call('SREM', parentDepsKey, ownJobKey)
    end
end

bump_marker(markerKey, now)
return jobId
"#;

/// Fails one ancestor a level beyond the immediate parent already handled
/// inline by `MOVE_TO_FINISHED_BODY`'s fpof branch. The worker calls this
/// once per further ancestor level, since each ancestor may live in a
/// different queue and the chain's depth isn't known up front.
const FAIL_PARENT_BODY: &str = r#"
-- KEYS[1] this ancestor's own dependencies set (as seen by its parent)
-- KEYS[2] this ancestor's own job key  KEYS[3] this ancestor's waiting-children
-- KEYS[4] this ancestor's failed zset  KEYS[5] this ancestor's events
-- ARGV[1] child's own job key (member of KEYS[1])  ARGV[2] this ancestor's id
-- ARGV[3] now  ARGV[4] failure reason
local depsKey, ancestorKey, waitingChildrenKey, failedKey, eventsKey = KEYS[1], KEYS[2], KEYS[3], KEYS[4], KEYS[5]
local childKey, ancestorId, now, reason = ARGV[1], ARGV[2], ARGV[3], ARGV[4]

redis.call('SREM', depsKey, childKey)
if redis.call('EXISTS', ancestorKey) == 0 then
    return 0
end

redis.call('ZREM', waitingChildrenKey, ancestorId)
redis.call('HSET', ancestorKey, 'failedReason', reason, 'finishedOn', now)
redis.call('ZADD', failedKey, now, ancestorId)
redis.call('XADD', eventsKey, '*', 'event', 'failed', 'jobId', ancestorId)
return 1
"#;

const MOVE_TO_DELAYED_BODY: &str = r#"
-- KEYS[1] active  KEYS[2] stalled  KEYS[3] lock  KEYS[4] delayed  KEYS[5] marker  KEYS[6] job
-- ARGV[1] token  ARGV[2] deliverAt ms  ARGV[3] now
local jobId = ARGV[4]
if redis.call('GET', KEYS[3]) ~= ARGV[1] then
    return -6
end
redis.call('LREM', KEYS[1], 1, jobId)
redis.call('SREM', KEYS[2], jobId)
redis.call('DEL', KEYS[3])
redis.call('ZADD', KEYS[4], ARGV[2], jobId)
redis.call('HINCRBY', KEYS[6], 'attemptsMade', 1)
bump_marker(KEYS[5], ARGV[3])
return 0
"#;

const MOVE_TO_WAITING_CHILDREN: &str = r#"
-- KEYS[1] active  KEYS[2] stalled  KEYS[3] lock  KEYS[4] waiting-children
-- ARGV[1] token  ARGV[2] now  ARGV[3] jobId
if redis.call('GET', KEYS[3]) ~= ARGV[1] then
    return -6
end
redis.call('LREM', KEYS[1], 1, ARGV[3])
redis.call('SREM', KEYS[2], ARGV[3])
redis.call('DEL', KEYS[3])
redis.call('ZADD', KEYS[4], ARGV[2], ARGV[3])
return 0
"#;

const RETRY_JOB_BODY: &str = r#"
-- KEYS[1] active  KEYS[2] stalled  KEYS[3] lock  KEYS[4] wait  KEYS[5] prioritized  KEYS[6] marker  KEYS[7] job
-- KEYS[8] priority counter, incremented to break ties between same-priority jobs
-- ARGV[1] token  ARGV[2] jobId  ARGV[3] lifo(0/1)  ARGV[4] priority  ARGV[5] now
if redis.call('GET', KEYS[3]) ~= ARGV[1] then
    return -6
end
redis.call('LREM', KEYS[1], 1, ARGV[2])
redis.call('SREM', KEYS[2], ARGV[2])
redis.call('DEL', KEYS[3])
redis.call('HINCRBY', KEYS[7], 'attemptsMade', 1)

local priority = tonumber(ARGV[4]) or 0
if priority > 0 then
    local counter = redis.call('INCR', KEYS[8])
    redis.call('ZADD', KEYS[5], priority * 4294967296 + (counter % 4294967296), ARGV[2])
else
    if ARGV[3] == '1' then
        redis.call('RPUSH', KEYS[4], ARGV[2])
    else
        redis.call('LPUSH', KEYS[4], ARGV[2])
    end
end
bump_marker(KEYS[6], ARGV[5])
return 0
"#;

const MOVE_STALLED_JOBS_TO_WAIT_BODY: &str = r#"
-- KEYS[1] stalled  KEYS[2] active  KEYS[3] wait  KEYS[4] failed  KEYS[5] stalled-check
-- KEYS[6] marker  KEYS[7] job key prefix (no trailing colon)
-- ARGV[1] maxStalledCount  ARGV[2] stalledIntervalMs  ARGV[3] now
local stalledKey, activeKey, waitKey, failedKey, checkKey, markerKey = KEYS[1], KEYS[2], KEYS[3], KEYS[4], KEYS[5], KEYS[6]
local jobPrefix = KEYS[7]
local maxStalled = tonumber(ARGV[1])
local now = ARGV[3]

if redis.call('SET', checkKey, now, 'PX', ARGV[2], 'NX') == false then
    return {{}, {}}
end

local stalledIds = redis.call('SMEMBERS', stalledKey)
local failedIds = {}
local recoveredIds = {}

for _, jobId in ipairs(stalledIds) do
    local jobKey = jobPrefix .. ':' .. jobId
    local lockKey = jobKey .. ':lock'
    if redis.call('EXISTS', lockKey) == 0 then
        redis.call('SREM', stalledKey, jobId)
        redis.call('LREM', activeKey, 1, jobId)
        local count = redis.call('HINCRBY', jobKey, 'stalledCounter', 1)
        local attempts = tonumber(redis.call('HGET', jobKey, 'attempts') or '1')
        local attemptsMade = tonumber(redis.call('HGET', jobKey, 'attemptsMade') or '0')
        if count > maxStalled or attemptsMade + 1 >= attempts then
            redis.call('ZADD', failedKey, now, jobId)
            redis.call('HSET', jobKey, 'failedReason', 'job stalled more than allowable limit', 'finishedOn', now)
            table.insert(failedIds, jobId)
        else
            redis.call('RPUSH', waitKey, jobId)
            table.insert(recoveredIds, jobId)
        end
    end
end

if #recoveredIds > 0 then
    bump_marker(markerKey, now)
end

return {failedIds, recoveredIds}
"#;

const MOVE_JOBS_TO_WAIT_BODY: &str = r#"
-- KEYS[1] source state zset  KEYS[2] wait  KEYS[3] prioritized  KEYS[4] marker  KEYS[5] job key prefix
-- KEYS[6] priority counter, incremented to break ties between same-priority jobs
-- ARGV[1] count  ARGV[2] timestamp cutoff (inclusive, or '' for none)  ARGV[3] now
local sourceKey, waitKey, prioritizedKey, markerKey, jobPrefix, pcKey = KEYS[1], KEYS[2], KEYS[3], KEYS[4], KEYS[5], KEYS[6]
local count = tonumber(ARGV[1])
local cutoff = ARGV[2]
local now = ARGV[3]

local candidates
if cutoff ~= '' then
    candidates = redis.call('ZRANGEBYSCORE', sourceKey, '-inf', cutoff, 'LIMIT', 0, count)
else
    candidates = redis.call('ZRANGE', sourceKey, 0, count - 1)
end

for _, jobId in ipairs(candidates) do
    redis.call('ZREM', sourceKey, jobId)
    local jobKey = jobPrefix .. ':' .. jobId
    local priority = tonumber(redis.call('HGET', jobKey, 'priority') or '0')
    redis.call('HSET', jobKey, 'finishedOn', '', 'failedReason', '')
    if priority > 0 then
        local counter = redis.call('INCR', pcKey)
        redis.call('ZADD', prioritizedKey, priority * 4294967296 + (counter % 4294967296), jobId)
    else
        redis.call('RPUSH', waitKey, jobId)
    end
end

if #candidates > 0 then
    bump_marker(markerKey, now)
end

return {#candidates, redis.call('ZCARD', sourceKey)}
"#;

const PAUSE: &str = r#"
-- KEYS[1] src  KEYS[2] dst  KEYS[3] meta  KEYS[4] events
-- ARGV[1] 'paused' | 'resumed'
if redis.call('EXISTS', KEYS[1]) == 1 then
    redis.call('RENAME', KEYS[1], KEYS[2])
end
if ARGV[1] == 'paused' then
    redis.call('HSET', KEYS[3], 'paused', '1')
else
    redis.call('HDEL', KEYS[3], 'paused')
end
redis.call('XADD', KEYS[4], '*', 'event', ARGV[1])
return 1
"#;

const OBLITERATE: &str = r#"
-- KEYS[1] meta  KEYS[2] active  KEYS[3] base (prefix:queue, for SCAN)
-- ARGV[1] count per chunk  ARGV[2] force '1'/''
if redis.call('HEXISTS', KEYS[1], 'paused') == 0 then
    return -1
end
if ARGV[2] ~= '1' and redis.call('LLEN', KEYS[2]) > 0 then
    return -2
end

local cursor = '0'
local pattern = KEYS[3] .. ':*'
local scanned = redis.call('SCAN', cursor, 'MATCH', pattern, 'COUNT', ARGV[1])
local nextCursor = scanned[1]
local keysToDelete = scanned[2]
if #keysToDelete > 0 then
    redis.call('DEL', unpack(keysToDelete))
end
if nextCursor == '0' then
    redis.call('DEL', KEYS[3] .. ':wait', KEYS[3] .. ':paused', KEYS[3] .. ':meta',
        KEYS[3] .. ':id', KEYS[3] .. ':events', KEYS[3] .. ':marker')
    return 0
end
return tonumber(nextCursor)
"#;

const UPDATE_PROGRESS: &str = r#"
-- KEYS[1] job  KEYS[2] events
-- ARGV[1] jobId  ARGV[2] progress json
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -1
end
redis.call('HSET', KEYS[1], 'progress', ARGV[2])
redis.call('XADD', KEYS[2], '*', 'event', 'progress', 'jobId', ARGV[1], 'data', ARGV[2])
return 0
"#;

const UPDATE_DATA: &str = r#"
-- KEYS[1] job
-- ARGV[1] data json
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -1
end
redis.call('HSET', KEYS[1], 'data', ARGV[1])
return 0
"#;

const SAVE_STACKTRACE: &str = r#"
-- KEYS[1] job
-- ARGV[1] stacktrace json array  ARGV[2] failedReason
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -1
end
redis.call('HSET', KEYS[1], 'stacktrace', ARGV[1], 'failedReason', ARGV[2])
return 0
"#;

const APPEND_LOG: &str = r#"
-- KEYS[1] logs list
-- ARGV[1] row  ARGV[2] keepLogs (0 = unlimited)
redis.call('RPUSH', KEYS[1], ARGV[1])
local keep = tonumber(ARGV[2]) or 0
if keep > 0 then
    redis.call('LTRIM', KEYS[1], -keep, -1)
end
return redis.call('LLEN', KEYS[1])
"#;

const REMOVE_JOB: &str = r#"
-- KEYS[1] job  KEYS[2] wait  KEYS[3] paused  KEYS[4] active  KEYS[5] delayed
-- KEYS[6] prioritized  KEYS[7] waiting-children  KEYS[8] completed  KEYS[9] failed
-- ARGV[1] jobId
local jobId = ARGV[1]
redis.call('LREM', KEYS[2], 1, jobId)
redis.call('LREM', KEYS[3], 1, jobId)
redis.call('LREM', KEYS[4], 1, jobId)
redis.call('ZREM', KEYS[5], jobId)
redis.call('ZREM', KEYS[6], jobId)
redis.call('ZREM', KEYS[7], jobId)
redis.call('ZREM', KEYS[8], jobId)
redis.call('ZREM', KEYS[9], jobId)
redis.call('DEL', KEYS[1], KEYS[1] .. ':logs', KEYS[1] .. ':lock',
    KEYS[1] .. ':dependencies', KEYS[1] .. ':processed')
return 1
"#;

const CLEAN_JOBS_IN_SET: &str = r#"
-- KEYS[1] state set (zset)  KEYS[2] job key prefix
-- ARGV[1] cutoff (finishedOn/score must be < cutoff)  ARGV[2] limit
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, jobId in ipairs(ids) do
    redis.call('ZREM', KEYS[1], jobId)
    local jobKey = KEYS[2] .. ':' .. jobId
    redis.call('DEL', jobKey, jobKey .. ':logs', jobKey .. ':dependencies', jobKey .. ':processed')
end
return ids
"#;

/// Joins Lua fragments into one script body. Each fragment is its own
/// top-level `local function` declaration or statement block, so plain
/// string concatenation is all Lua needs to share them across scripts that
/// are otherwise sent to Redis as independent `EVAL` chunks.
fn assemble(fragments: &[&str]) -> String {
    fragments.concat()
}

/// Holds one compiled [`redis::Script`] per catalog entry plus the key
/// builder for the queue it was constructed against.
pub struct Scripts {
    keys: QueueKeys,
    job_prefix: String,
    add_job: Script,
    add_parent_job: Script,
    link_child_to_parent: Script,
    move_to_active: Script,
    extend_lock: Script,
    move_to_finished: Script,
    fail_parent: Script,
    move_to_delayed: Script,
    move_to_waiting_children: Script,
    retry_job: Script,
    move_stalled_jobs_to_wait: Script,
    move_jobs_to_wait: Script,
    pause: Script,
    obliterate: Script,
    update_progress: Script,
    update_data: Script,
    save_stacktrace: Script,
    append_log: Script,
    remove_job: Script,
    clean_jobs_in_set: Script,
}

/// Raw tuple returned by `moveToActive`: `(jobId, limitUntil, delayUntil, jobHash)`.
pub struct ActiveReservation {
    pub job: Job,
}

pub enum MoveToActiveResult {
    Reserved(Box<ActiveReservation>),
    RateLimited { limit_until: i64 },
    Empty { delay_until: i64 },
}

/// Result of one `moveJobsToWait` batch: how many jobs this call moved, and
/// how many remain in the source set matching the same cutoff.
pub struct MoveJobsToWaitProgress {
    pub processed: i64,
    pub remaining: i64,
}

impl Scripts {
    pub fn new(prefix: impl AsRef<str>, queue_name: impl AsRef<str>) -> Self {
        Self::from_base(format!("{}:{}", prefix.as_ref(), queue_name.as_ref()))
    }

    /// Builds directly from an already-joined `prefix:queue` string, as found
    /// on a [`crate::job::ParentRef`] — used to reach into an ancestor's own
    /// queue when that ancestor lives apart from the job pointing to it.
    pub fn from_base(base: impl Into<String>) -> Self {
        let keys = QueueKeys::from_base(base);
        let job_prefix = keys.base().to_string();
        Self {
            keys,
            job_prefix,
            add_job: Script::new(&assemble(&[BUMP_MARKER, DEDUP_CHECK, ADD_JOB_BODY])),
            add_parent_job: Script::new(ADD_PARENT_JOB),
            link_child_to_parent: Script::new(&assemble(&[BUMP_MARKER, LINK_CHILD_TO_PARENT_BODY])),
            move_to_active: Script::new(&assemble(&[BUMP_MARKER, MOVE_TO_ACTIVE_BODY])),
            extend_lock: Script::new(EXTEND_LOCK),
            move_to_finished: Script::new(&assemble(&[BUMP_MARKER, MOVE_TO_FINISHED_BODY])),
            fail_parent: Script::new(FAIL_PARENT_BODY),
            move_to_delayed: Script::new(&assemble(&[BUMP_MARKER, MOVE_TO_DELAYED_BODY])),
            move_to_waiting_children: Script::new(MOVE_TO_WAITING_CHILDREN),
            retry_job: Script::new(&assemble(&[BUMP_MARKER, RETRY_JOB_BODY])),
            move_stalled_jobs_to_wait: Script::new(&assemble(&[BUMP_MARKER, MOVE_STALLED_JOBS_TO_WAIT_BODY])),
            move_jobs_to_wait: Script::new(&assemble(&[BUMP_MARKER, MOVE_JOBS_TO_WAIT_BODY])),
            pause: Script::new(PAUSE),
            obliterate: Script::new(OBLITERATE),
            update_progress: Script::new(UPDATE_PROGRESS),
            update_data: Script::new(UPDATE_DATA),
            save_stacktrace: Script::new(SAVE_STACKTRACE),
            append_log: Script::new(APPEND_LOG),
            remove_job: Script::new(REMOVE_JOB),
            clean_jobs_in_set: Script::new(CLEAN_JOBS_IN_SET),
        }
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add_job<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        job: &Job,
        kind: &str,
        score: i64,
        now: i64,
    ) -> JobResult<String> {
        let dest_zset = match kind {
            "delayed" => self.keys.delayed(),
            "prioritized" => self.keys.prioritized(),
            _ => String::new(),
        };
        let dedup_key = job
            .opts
            .deduplication
            .as_ref()
            .map(|d| self.keys.dedup(&d.id))
            .unwrap_or_default();
        let dedup_ttl = job
            .opts
            .deduplication
            .as_ref()
            .and_then(|d| d.ttl)
            .unwrap_or(0);
        let dedup_extend = job
            .opts
            .deduplication
            .as_ref()
            .map(|d| d.extend)
            .unwrap_or(false);
        let dedup_replace = job
            .opts
            .deduplication
            .as_ref()
            .map(|d| d.replace)
            .unwrap_or(false);
        // A parent may live in a different queue than its child, so its keys
        // are derived from `ParentRef.queue` rather than `self.keys`.
        let parent_keys = job.parent.as_ref().map(|p| QueueKeys::from_base(p.queue.clone()));
        let parent_deps_key = match (&job.parent, &parent_keys) {
            (Some(p), Some(pk)) => pk.dependencies(&p.id),
            _ => String::new(),
        };
        let parent_id = job.parent.as_ref().map(|p| p.id.clone()).unwrap_or_default();

        let value: redis::Value = self
            .add_job
            .key(self.keys.wait())
            .key(self.keys.meta())
            .key(self.keys.id())
            .key(&dest_zset)
            .key(self.keys.completed())
            .key(self.keys.events())
            .key(self.keys.marker())
            .key(&parent_deps_key)
            .key(self.keys.delayed())
            .key(self.keys.pc())
            .arg(job.id.clone())
            .arg(job.name.clone())
            .arg(serde_json::to_string(&job.data)?)
            .arg(serde_json::to_string(&job.opts)?)
            .arg(job.timestamp)
            .arg(job.delay)
            .arg(job.priority)
            .arg(job.attempts)
            .arg(kind)
            .arg(score)
            .arg(&self.job_prefix)
            .arg(&dedup_key)
            .arg(dedup_ttl)
            .arg(if dedup_extend { "1" } else { "0" })
            .arg(if dedup_replace { "1" } else { "0" })
            .arg(&parent_id)
            .arg(now)
            .invoke_async(conn)
            .await?;

        let job_id = String::from_redis_value(&value)?;

        if let (Some(p), Some(pk)) = (&job.parent, &parent_keys) {
            let linked: i64 = self
                .link_child_to_parent
                .key(pk.job(&p.id))
                .key(pk.dependencies(&p.id))
                .key(pk.waiting_children())
                .key(pk.marker())
                .arg(&p.id)
                .arg(now)
                .invoke_async(conn)
                .await?;
            check(linked)?;
        }

        Ok(job_id)
    }

    pub async fn add_parent_job<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        job: &Job,
        now: i64,
    ) -> JobResult<String> {
        let parent_keys = job.parent.as_ref().map(|p| QueueKeys::from_base(p.queue.clone()));
        let parent_deps_key = match (&job.parent, &parent_keys) {
            (Some(p), Some(pk)) => pk.dependencies(&p.id),
            _ => String::new(),
        };

        let value: redis::Value = self
            .add_parent_job
            .key(self.keys.id())
            .key(&parent_deps_key)
            .arg(job.id.clone())
            .arg(job.name.clone())
            .arg(serde_json::to_string(&job.data)?)
            .arg(serde_json::to_string(&job.opts)?)
            .arg(job.timestamp)
            .arg(job.attempts)
            .arg(&self.job_prefix)
            .arg(job.priority)
            .arg(job.delay)
            .invoke_async(conn)
            .await?;

        let job_id = match value {
            redis::Value::Int(code) if code < 0 => {
                check(code)?;
                unreachable!()
            }
            other => String::from_redis_value(&other)?,
        };

        if let (Some(p), Some(pk)) = (&job.parent, &parent_keys) {
            let linked: i64 = self
                .link_child_to_parent
                .key(pk.job(&p.id))
                .key(pk.dependencies(&p.id))
                .key(pk.waiting_children())
                .key(pk.marker())
                .arg(&p.id)
                .arg(now)
                .invoke_async(conn)
                .await?;
            check(linked)?;
        }

        Ok(job_id)
    }

    /// Fails one ancestor beyond the immediate parent, which
    /// `move_to_finished`'s fpof branch already handles inline. `self` must
    /// be the ancestor's own queue (build via [`Scripts::from_base`] against
    /// its `ParentRef.queue`).
    pub async fn fail_parent<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        child_job_key: &str,
        ancestor_id: &str,
        reason: &str,
        now: i64,
    ) -> JobResult<bool> {
        let code: i64 = self
            .fail_parent
            .key(self.keys.dependencies(ancestor_id))
            .key(self.keys.job(ancestor_id))
            .key(self.keys.waiting_children())
            .key(self.keys.failed())
            .key(self.keys.events())
            .arg(child_job_key)
            .arg(ancestor_id)
            .arg(now)
            .arg(reason)
            .invoke_async(conn)
            .await?;
        Ok(code == 1)
    }

    pub async fn move_to_active<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        token: &str,
        lock_duration_ms: i64,
        now: i64,
        limiter_max: u32,
        limiter_duration_ms: u64,
    ) -> JobResult<MoveToActiveResult> {
        let result: (redis::Value, i64, i64, Option<Vec<(String, String)>>) = self
            .move_to_active
            .key(self.keys.wait())
            .key(self.keys.active())
            .key(self.keys.prioritized())
            .key(self.keys.delayed())
            .key(self.keys.meta())
            .key(self.keys.stalled())
            .key(self.keys.limiter())
            .key(self.keys.marker())
            .key(self.keys.pc())
            .arg(token)
            .arg(lock_duration_ms)
            .arg(now)
            .arg(limiter_max)
            .arg(limiter_duration_ms)
            .arg(&self.job_prefix)
            .invoke_async(conn)
            .await?;

        let (job_id_val, limit_until, delay_until, hash) = result;
        let job_id = match job_id_val {
            redis::Value::Nil => None,
            redis::Value::Boolean(false) => None,
            other => Some(String::from_redis_value(&other)?),
        };

        match (job_id, hash) {
            (Some(id), Some(fields)) => {
                let map: std::collections::HashMap<String, String> = fields.into_iter().collect();
                let job = Job::from_hash(&id, &map)?;
                Ok(MoveToActiveResult::Reserved(Box::new(ActiveReservation { job })))
            }
            _ if limit_until > 0 => Ok(MoveToActiveResult::RateLimited { limit_until }),
            _ => Ok(MoveToActiveResult::Empty { delay_until }),
        }
    }

    pub async fn extend_lock<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        job_id: &str,
        token: &str,
        lock_duration_ms: i64,
    ) -> JobResult<bool> {
        let renewed: i64 = self
            .extend_lock
            .key(self.keys.lock(job_id))
            .arg(token)
            .arg(lock_duration_ms)
            .invoke_async(conn)
            .await?;
        Ok(renewed == 1)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn move_to_finished<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        job: &Job,
        token: &str,
        target: &str,
        payload: &str,
        keep: &KeepJobs,
        now: i64,
    ) -> JobResult<()> {
        let (remove_all, remove_count, remove_age) = keep_jobs_args(keep);
        let target_key = if target == "completed" {
            self.keys.completed()
        } else {
            self.keys.failed()
        };

        let fpof = matches!(
            job.opts.dependency_policy,
            Some(crate::job::DependencyFailurePolicy::FailParentOnFailure)
        );

        // A parent may live in a different queue than this job, so its keys
        // are derived from `ParentRef.queue` rather than `self.keys`.
        let parent_keys = job.parent.as_ref().map(|p| QueueKeys::from_base(p.queue.clone()));
        let (parent_key, parent_processed, parent_deps, parent_job_key, parent_wait, parent_prioritized, parent_waiting_children, parent_delayed, parent_failed, parent_events, parent_pc) =
            match (&job.parent, &parent_keys) {
                (Some(p), Some(pk)) => (
                    format!("{}:{}", p.queue, p.id),
                    pk.processed(&p.id),
                    pk.dependencies(&p.id),
                    pk.job(&p.id),
                    pk.wait(),
                    pk.prioritized(),
                    pk.waiting_children(),
                    pk.delayed(),
                    pk.failed(),
                    pk.events(),
                    pk.pc(),
                ),
                _ => (
                    String::new(),
                    String::new(),
                    String::new(),
                    String::new(),
                    String::new(),
                    String::new(),
                    String::new(),
                    String::new(),
                    String::new(),
                    String::new(),
                    String::new(),
                ),
            };

        let code: redis::Value = self
            .move_to_finished
            .key(self.keys.active())
            .key(self.keys.stalled())
            .key(self.keys.lock(&job.id))
            .key(&target_key)
            .key(self.keys.job(&job.id))
            .key(self.keys.events())
            .key(self.keys.marker())
            .key(&parent_processed)
            .key(&parent_deps)
            .key(&parent_job_key)
            .key(&parent_wait)
            .key(&parent_prioritized)
            .key(&parent_waiting_children)
            .key(&parent_delayed)
            .key(&parent_failed)
            .key(&parent_events)
            .key(&parent_pc)
            .arg(token)
            .arg(target)
            .arg(now)
            .arg(payload)
            .arg(remove_all)
            .arg(remove_count)
            .arg(remove_age)
            .arg(&parent_key)
            .arg(if fpof { "1" } else { "0" })
            .arg(self.keys.job(&job.id))
            .invoke_async(conn)
            .await?;

        if let redis::Value::Int(c) = code {
            check(c)?;
        }
        Ok(())
    }

    pub async fn move_to_delayed<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        job_id: &str,
        token: &str,
        deliver_at: i64,
        now: i64,
    ) -> JobResult<()> {
        let code: i64 = self
            .move_to_delayed
            .key(self.keys.active())
            .key(self.keys.stalled())
            .key(self.keys.lock(job_id))
            .key(self.keys.delayed())
            .key(self.keys.marker())
            .key(self.keys.job(job_id))
            .arg(token)
            .arg(deliver_at)
            .arg(now)
            .arg(job_id)
            .invoke_async(conn)
            .await?;
        check(code)?;
        Ok(())
    }

    pub async fn move_to_waiting_children<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        job_id: &str,
        token: &str,
        now: i64,
    ) -> JobResult<()> {
        let code: i64 = self
            .move_to_waiting_children
            .key(self.keys.active())
            .key(self.keys.stalled())
            .key(self.keys.lock(job_id))
            .key(self.keys.waiting_children())
            .arg(token)
            .arg(now)
            .arg(job_id)
            .invoke_async(conn)
            .await?;
        check(code)?;
        Ok(())
    }

    pub async fn retry_job<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        job_id: &str,
        token: &str,
        lifo: bool,
        priority: i64,
        now: i64,
    ) -> JobResult<()> {
        let code: i64 = self
            .retry_job
            .key(self.keys.active())
            .key(self.keys.stalled())
            .key(self.keys.lock(job_id))
            .key(self.keys.wait())
            .key(self.keys.prioritized())
            .key(self.keys.marker())
            .key(self.keys.job(job_id))
            .key(self.keys.pc())
            .arg(token)
            .arg(job_id)
            .arg(if lifo { "1" } else { "0" })
            .arg(priority)
            .arg(now)
            .invoke_async(conn)
            .await?;
        check(code)?;
        Ok(())
    }

    pub async fn move_stalled_jobs_to_wait<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        max_stalled_count: u32,
        stalled_interval_ms: i64,
        now: i64,
    ) -> JobResult<(Vec<String>, Vec<String>)> {
        let (failed, recovered): (Vec<String>, Vec<String>) = self
            .move_stalled_jobs_to_wait
            .key(self.keys.stalled())
            .key(self.keys.active())
            .key(self.keys.wait())
            .key(self.keys.failed())
            .key(self.keys.stalled_check())
            .key(self.keys.marker())
            .key(&self.job_prefix)
            .arg(max_stalled_count)
            .arg(stalled_interval_ms)
            .arg(now)
            .invoke_async(conn)
            .await?;
        Ok((failed, recovered))
    }

    pub async fn move_jobs_to_wait<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        state: &str,
        count: u32,
        timestamp: Option<i64>,
        now: i64,
    ) -> JobResult<MoveJobsToWaitProgress> {
        let source = self.keys.by_state(state);
        let cutoff = timestamp.map(|t| t.to_string()).unwrap_or_default();
        let (processed, remaining): (i64, i64) = self
            .move_jobs_to_wait
            .key(&source)
            .key(self.keys.wait())
            .key(self.keys.prioritized())
            .key(self.keys.marker())
            .key(&self.job_prefix)
            .key(self.keys.pc())
            .arg(count)
            .arg(cutoff)
            .arg(now)
            .invoke_async(conn)
            .await?;
        Ok(MoveJobsToWaitProgress { processed, remaining })
    }

    pub async fn pause<C: ConnectionLike + Send>(&self, conn: &mut C, pause: bool) -> JobResult<()> {
        let (src, dst) = if pause {
            (self.keys.wait(), self.keys.paused())
        } else {
            (self.keys.paused(), self.keys.wait())
        };
        let event = if pause { "paused" } else { "resumed" };
        let _: i64 = self
            .pause
            .key(src)
            .key(dst)
            .key(self.keys.meta())
            .key(self.keys.events())
            .arg(event)
            .invoke_async(conn)
            .await?;
        Ok(())
    }

    pub async fn obliterate<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        count: u32,
        force: bool,
    ) -> JobResult<i64> {
        let cursor: i64 = self
            .obliterate
            .key(self.keys.meta())
            .key(self.keys.active())
            .key(self.keys.base())
            .arg(count)
            .arg(if force { "1" } else { "" })
            .invoke_async(conn)
            .await?;
        if cursor == -1 {
            return Err(JobError::NotPaused);
        }
        if cursor == -2 {
            return Err(JobError::ActiveJobsPresent);
        }
        Ok(cursor)
    }

    pub async fn update_progress<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        job_id: &str,
        progress: &serde_json::Value,
    ) -> JobResult<()> {
        let code: i64 = self
            .update_progress
            .key(self.keys.job(job_id))
            .key(self.keys.events())
            .arg(job_id)
            .arg(serde_json::to_string(progress)?)
            .invoke_async(conn)
            .await?;
        check(code)?;
        Ok(())
    }

    pub async fn update_data<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        job_id: &str,
        data: &serde_json::Value,
    ) -> JobResult<()> {
        let code: i64 = self
            .update_data
            .key(self.keys.job(job_id))
            .arg(serde_json::to_string(data)?)
            .invoke_async(conn)
            .await?;
        check(code)?;
        Ok(())
    }

    pub async fn save_stacktrace<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        job_id: &str,
        stacktrace: &[String],
        failed_reason: &str,
    ) -> JobResult<()> {
        let code: i64 = self
            .save_stacktrace
            .key(self.keys.job(job_id))
            .arg(serde_json::to_string(stacktrace)?)
            .arg(failed_reason)
            .invoke_async(conn)
            .await?;
        check(code)?;
        Ok(())
    }

    pub async fn append_log<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        job_id: &str,
        row: &str,
        keep_logs: i64,
    ) -> JobResult<i64> {
        let count: i64 = self
            .append_log
            .key(self.keys.logs(job_id))
            .arg(row)
            .arg(keep_logs)
            .invoke_async(conn)
            .await?;
        Ok(count)
    }

    pub async fn remove_job<C: ConnectionLike + Send>(&self, conn: &mut C, job_id: &str) -> JobResult<()> {
        let _: i64 = self
            .remove_job
            .key(self.keys.job(job_id))
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.active())
            .key(self.keys.delayed())
            .key(self.keys.prioritized())
            .key(self.keys.waiting_children())
            .key(self.keys.completed())
            .key(self.keys.failed())
            .arg(job_id)
            .invoke_async(conn)
            .await?;
        Ok(())
    }

    pub async fn clean_jobs_in_set<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        state: &str,
        cutoff: i64,
        limit: u32,
    ) -> JobResult<Vec<String>> {
        let set_key = self.keys.by_state(state);
        let removed: Vec<String> = self
            .clean_jobs_in_set
            .key(&set_key)
            .key(&self.job_prefix)
            .arg(cutoff)
            .arg(limit)
            .invoke_async(conn)
            .await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_jobs_args_cover_every_variant() {
        assert_eq!(keep_jobs_args(&KeepJobs::Bool(true)), (1, -1, -1));
        assert_eq!(keep_jobs_args(&KeepJobs::Bool(false)), (0, 0, 0));
        assert_eq!(keep_jobs_args(&KeepJobs::Count(5)), (0, 5, -1));
        assert_eq!(
            keep_jobs_args(&KeepJobs::AgeAndCount { age: 60, count: 5 }),
            (0, 5, 60)
        );
    }

    #[test]
    fn check_maps_every_known_code() {
        assert!(matches!(
            check(-1).unwrap_err(),
            JobError::Script(ScriptError::JobNotExist)
        ));
        assert!(matches!(
            check(-6).unwrap_err(),
            JobError::Script(ScriptError::JobLockMismatch)
        ));
        assert_eq!(check(0).unwrap(), 0);
        assert_eq!(check(42).unwrap(), 42);
    }

    #[test]
    fn scripts_construct_without_panicking() {
        let scripts = Scripts::new("bull", "emails");
        assert_eq!(scripts.keys().base(), "bull:emails");
    }
}
