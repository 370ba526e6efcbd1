/// Run Store - Persistence Seam of the Engine
///
/// The executor, the persister and the file cache talk to storage only
/// through `RunStore`. Production backs it with the shared Redis layout in
/// `gavel_common::redis`.
use crate::error::{JudgeError, JudgeResult};
use async_trait::async_trait;
use gavel_common::redis as keys;
use gavel_common::types::{CaseRun, GroupRun, ProblemVersion, RunUpdate, SubmissionRun};
use redis::aio::ConnectionManager;

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn get_run(&self, run_id: i64) -> JudgeResult<Option<SubmissionRun>>;
    /// Apply a partial update; terminal statuses leave the backlog.
    async fn update_run(&self, run_id: i64, update: &RunUpdate) -> JudgeResult<()>;
    async fn store_case_run(&self, row: &CaseRun) -> JudgeResult<()>;
    async fn store_group_run(&self, row: &GroupRun) -> JudgeResult<()>;
    async fn get_problem(&self, problem_version_id: i64) -> JudgeResult<Option<ProblemVersion>>;
    async fn get_file(&self, hash: &str) -> JudgeResult<Option<Vec<u8>>>;
    /// Ids of runs not yet in a terminal status, ascending.
    async fn pending_runs(&self) -> JudgeResult<Vec<i64>>;
}

/// `ConnectionManager` is a cheap handle; every call works on its own clone.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl RunStore for RedisStore {
    async fn get_run(&self, run_id: i64) -> JudgeResult<Option<SubmissionRun>> {
        Ok(keys::get_run(&mut self.conn.clone(), run_id).await?)
    }

    async fn update_run(&self, run_id: i64, update: &RunUpdate) -> JudgeResult<()> {
        let mut conn = self.conn.clone();
        let mut run = keys::get_run(&mut conn, run_id)
            .await?
            .ok_or_else(|| JudgeError::Storage(format!("run {} disappeared", run_id)))?;
        run.apply(update);
        keys::save_run(&mut conn, &run).await?;
        Ok(())
    }

    async fn store_case_run(&self, row: &CaseRun) -> JudgeResult<()> {
        Ok(keys::store_case_run(&mut self.conn.clone(), row).await?)
    }

    async fn store_group_run(&self, row: &GroupRun) -> JudgeResult<()> {
        Ok(keys::store_group_run(&mut self.conn.clone(), row).await?)
    }

    async fn get_problem(&self, problem_version_id: i64) -> JudgeResult<Option<ProblemVersion>> {
        Ok(keys::get_problem(&mut self.conn.clone(), problem_version_id).await?)
    }

    async fn get_file(&self, hash: &str) -> JudgeResult<Option<Vec<u8>>> {
        Ok(keys::get_file(&mut self.conn.clone(), hash).await?)
    }

    async fn pending_runs(&self) -> JudgeResult<Vec<i64>> {
        Ok(keys::pending_run_ids(&mut self.conn.clone()).await?)
    }
}
