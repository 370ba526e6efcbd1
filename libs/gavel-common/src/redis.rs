use crate::types::{CaseRun, GroupRun, ProblemVersion, ProgramSource, SubmissionRun};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

/// Redis storage layout - keys and operations only
/// Keeps the API, the CLI and the worker agreeing on one key scheme.
/// Every run lives in one JSON document; the pending sorted set is the
/// backlog index the worker scans on start-up.

pub const KEY_PREFIX: &str = "gavel";
pub const PENDING_RUNS: &str = "gavel:runs:pending";
pub const RUN_ID_COUNTER: &str = "gavel:run_id";
pub const SUBMISSION_ID_COUNTER: &str = "gavel:submission_id";

/// Pub/sub topic carrying the id of every newly queued run.
pub const NEW_RUN_CHANNEL: &str = "gavel:new_run";

pub fn run_key(run_id: i64) -> String {
    format!("{}:run:{}", KEY_PREFIX, run_id)
}

pub fn case_runs_key(run_id: i64) -> String {
    format!("{}:run:{}:cases", KEY_PREFIX, run_id)
}

pub fn group_runs_key(run_id: i64) -> String {
    format!("{}:run:{}:groups", KEY_PREFIX, run_id)
}

pub fn problem_key(problem_version_id: i64) -> String {
    format!("{}:problem:{}", KEY_PREFIX, problem_version_id)
}

pub fn file_key(hash: &str) -> String {
    format!("{}:file:{}", KEY_PREFIX, hash)
}

fn encode<T: Serialize>(value: &T) -> RedisResult<String> {
    serde_json::to_string(value)
        .map_err(|e| redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string())))
}

fn decode<T: DeserializeOwned>(payload: &str) -> RedisResult<T> {
    serde_json::from_str(payload)
        .map_err(|e| redis::RedisError::from((redis::ErrorKind::TypeError, "deserialization error", e.to_string())))
}

/// Allocates the run id, stores the run, indexes it as pending and
/// announces it, all in one step. Ids therefore become visible in the
/// pending index in allocation order, which the worker's high-water mark
/// relies on. A missing submission id is allocated in the same step.
///
/// KEYS: run counter, submission counter, pending index.
/// ARGV: run template, submission id or "", run key prefix, channel.
const QUEUE_RUN_SCRIPT: &str = r#"
local run = cjson.decode(ARGV[1])
local id = redis.call('INCR', KEYS[1])
run['id'] = id
if ARGV[2] == '' then
  run['submission_id'] = redis.call('INCR', KEYS[2])
else
  run['submission_id'] = tonumber(ARGV[2])
end
local payload = cjson.encode(run)
redis.call('SET', ARGV[3] .. id, payload)
redis.call('ZADD', KEYS[3], id, id)
redis.call('PUBLISH', ARGV[4], tostring(id))
return payload
"#;

fn run_key_prefix() -> String {
    format!("{}:run:", KEY_PREFIX)
}

/// Queue a new run of `program`. Returns the stored run with its ids.
pub async fn queue_run(
    conn: &mut ConnectionManager,
    submission_id: Option<i64>,
    problem_version_id: i64,
    program: ProgramSource,
) -> RedisResult<SubmissionRun> {
    let template = encode(&SubmissionRun::new(0, submission_id.unwrap_or(0), problem_version_id, program))?;
    let payload: String = redis::Script::new(QUEUE_RUN_SCRIPT)
        .key(RUN_ID_COUNTER)
        .key(SUBMISSION_ID_COUNTER)
        .key(PENDING_RUNS)
        .arg(template)
        .arg(submission_id.map(|id| id.to_string()).unwrap_or_default())
        .arg(run_key_prefix())
        .arg(NEW_RUN_CHANNEL)
        .invoke_async(conn)
        .await?;
    decode(&payload)
}

pub async fn get_run(conn: &mut ConnectionManager, run_id: i64) -> RedisResult<Option<SubmissionRun>> {
    let payload: Option<String> = conn.get(run_key(run_id)).await?;
    payload.map(|data| decode(&data)).transpose()
}

/// Overwrite a run. Terminal runs leave the pending index.
pub async fn save_run(conn: &mut ConnectionManager, run: &SubmissionRun) -> RedisResult<()> {
    let payload = encode(run)?;
    let _: () = conn.set(run_key(run.id), payload).await?;
    if run.status.is_terminal() {
        let _: () = conn.zrem(PENDING_RUNS, run.id).await?;
    } else {
        let _: () = conn.zadd(PENDING_RUNS, run.id, run.id).await?;
    }
    Ok(())
}

/// Ids of every run that has not reached a terminal state, ascending.
pub async fn pending_run_ids(conn: &mut ConnectionManager) -> RedisResult<Vec<i64>> {
    conn.zrange(PENDING_RUNS, 0, -1).await
}

/// Queue a fresh run of the same submission and program.
/// Workers only ever pick up ids above those they have seen, so a rejudge
/// gets a new id instead of resetting the old run.
pub async fn rejudge_run(conn: &mut ConnectionManager, run_id: i64) -> RedisResult<Option<SubmissionRun>> {
    let Some(previous) = get_run(conn, run_id).await? else {
        return Ok(None);
    };
    let run = queue_run(conn, Some(previous.submission_id), previous.problem_version_id, previous.program).await?;
    Ok(Some(run))
}

pub async fn store_case_run(conn: &mut ConnectionManager, row: &CaseRun) -> RedisResult<()> {
    let payload = encode(row)?;
    conn.hset(case_runs_key(row.run_id), row.test_case_id, payload).await
}

pub async fn store_group_run(conn: &mut ConnectionManager, row: &GroupRun) -> RedisResult<()> {
    let payload = encode(row)?;
    conn.hset(group_runs_key(row.run_id), row.test_group_id, payload).await
}

async fn rows<T: DeserializeOwned>(conn: &mut ConnectionManager, key: String) -> RedisResult<Vec<T>> {
    let raw: BTreeMap<i64, String> = conn.hgetall(key).await?;
    raw.values().map(|payload| decode(payload)).collect()
}

pub async fn get_case_runs(conn: &mut ConnectionManager, run_id: i64) -> RedisResult<Vec<CaseRun>> {
    rows(conn, case_runs_key(run_id)).await
}

pub async fn get_group_runs(conn: &mut ConnectionManager, run_id: i64) -> RedisResult<Vec<GroupRun>> {
    rows(conn, group_runs_key(run_id)).await
}

pub async fn get_problem(conn: &mut ConnectionManager, problem_version_id: i64) -> RedisResult<Option<ProblemVersion>> {
    let payload: Option<String> = conn.get(problem_key(problem_version_id)).await?;
    payload.map(|data| decode(&data)).transpose()
}

pub async fn put_problem(conn: &mut ConnectionManager, problem: &ProblemVersion) -> RedisResult<()> {
    let payload = encode(problem)?;
    conn.set(problem_key(problem.id), payload).await
}

pub async fn get_file(conn: &mut ConnectionManager, hash: &str) -> RedisResult<Option<Vec<u8>>> {
    conn.get(file_key(hash)).await
}

pub async fn put_file(conn: &mut ConnectionManager, hash: &str, contents: &[u8]) -> RedisResult<()> {
    conn.set(file_key(hash), contents).await
}

/// Parse a notification payload into a run id.
pub fn parse_run_notification(payload: &str) -> Option<i64> {
    payload.trim().parse().ok()
}
