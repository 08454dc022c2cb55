//! PostgreSQL-backed store.
//!
//! Ids are stored as TEXT. Full records live in JSONB `data` columns next to
//! the handful of columns the queries filter on. Every [`Transition`] is
//! applied inside one SQL transaction.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction as SqlTransaction};
use weft_bytecode::{Program, ProgramHash};
use weft_core::{FiberId, IncidentId, InstanceId, NodeKey};
use weft_execution::{
    ArmWaitTrigger, CompletionRecord, DeadLetter, EventRecord, Fiber, Incident, InstanceState,
    Job, JobKey, JobWrite, JoinBarrier, ProcessInstance, RuntimeEvent, Transition, WaitState,
};

use crate::error::StoreError;
use crate::store::{FiberRef, ProcessStore};

/// Connection settings for [`PgStore`].
#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    /// Schema holding the tables; created if missing.
    pub schema: String,
    /// Pool size.
    pub max_connections: u32,
    /// Run the bundled migrations on connect.
    pub run_migrations: bool,
}

impl Default for PgStoreConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_owned(),
            max_connections: 10,
            run_migrations: true,
        }
    }
}

/// A [`ProcessStore`] on PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn valid_schema(schema: &str) -> bool {
    !schema.is_empty()
        && schema
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !schema.starts_with(|c: char| c.is_ascii_digit())
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn to_u64(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

fn corrupt(table: &'static str, reason: impl ToString) -> StoreError {
    StoreError::Corrupt {
        table,
        reason: reason.to_string(),
    }
}

impl PgStore {
    /// Connect, select the schema, and optionally migrate.
    pub async fn connect(url: &str, config: PgStoreConfig) -> Result<Self, StoreError> {
        if !valid_schema(&config.schema) {
            return Err(StoreError::Config(format!(
                "schema name {:?} must be lowercase ascii, digits or '_'",
                config.schema
            )));
        }
        let schema = config.schema.clone();
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .after_connect(move |conn, _meta| {
                let statement = format!("SET search_path TO {schema}");
                Box::pin(async move {
                    sqlx::query(&statement).execute(conn).await?;
                    Ok(())
                })
            })
            .connect(url)
            .await?;

        let store = Self { pool };
        if config.run_migrations {
            store.migrate(&config.schema).await?;
        }
        Ok(store)
    }

    /// Wrap an existing pool whose connections already use the right schema.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn migrate(&self, schema: &str) -> Result<(), StoreError> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
            .execute(&self.pool)
            .await?;
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!(schema, "process store migrated");
        Ok(())
    }

    async fn write_instance(
        tx: &mut SqlTransaction<'_, Postgres>,
        transition: &Transition,
    ) -> Result<(), StoreError> {
        let instance = &transition.instance;
        let id = instance.id.to_string();
        let written = match transition.base_version {
            None => sqlx::query(
                "INSERT INTO process_instances \
                 (id, program_hash, status, version, correlation_id, data, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) ON CONFLICT (id) DO NOTHING",
            )
            .bind(&id)
            .bind(instance.program.as_str())
            .bind(instance.status.as_str())
            .bind(to_i64(instance.version))
            .bind(&instance.correlation_id)
            .bind(Json(instance))
            .bind(instance.created_at)
            .bind(instance.updated_at)
            .execute(&mut **tx)
            .await?
            .rows_affected(),
            Some(base) => sqlx::query(
                "UPDATE process_instances \
                 SET status = $1, version = $2, data = $3, updated_at = $4 \
                 WHERE id = $5 AND version = $6",
            )
            .bind(instance.status.as_str())
            .bind(to_i64(instance.version))
            .bind(Json(instance))
            .bind(instance.updated_at)
            .bind(&id)
            .bind(to_i64(base))
            .execute(&mut **tx)
            .await?
            .rows_affected(),
        };

        if written == 0 {
            let found: Option<i64> =
                sqlx::query_scalar("SELECT version FROM process_instances WHERE id = $1")
                    .bind(&id)
                    .fetch_optional(&mut **tx)
                    .await?;
            return Err(StoreError::Conflict {
                instance: instance.id,
                expected: transition.base_version,
                found: found.map(to_u64),
            });
        }
        Ok(())
    }

    async fn write_fiber(
        tx: &mut SqlTransaction<'_, Postgres>,
        fiber: &Fiber,
    ) -> Result<(), StoreError> {
        let instance = fiber.instance.to_string();
        let id = fiber.id.to_string();
        sqlx::query(
            "INSERT INTO fibers (instance_id, fiber_id, seq, ready, due_at, epoch, data) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (instance_id, fiber_id) DO UPDATE \
             SET ready = EXCLUDED.ready, due_at = EXCLUDED.due_at, \
                 epoch = EXCLUDED.epoch, data = EXCLUDED.data",
        )
        .bind(&instance)
        .bind(&id)
        .bind(to_i64(fiber.seq))
        .bind(fiber.wait.is_ready())
        .bind(fiber.wait.due_at())
        .bind(to_i64(fiber.loop_epoch))
        .bind(Json(fiber))
        .execute(&mut **tx)
        .await?;

        sqlx::query("DELETE FROM message_waits WHERE instance_id = $1 AND fiber_id = $2")
            .bind(&instance)
            .bind(&id)
            .execute(&mut **tx)
            .await?;
        for (name, correlation) in message_triggers(&fiber.wait) {
            sqlx::query(
                "INSERT INTO message_waits (instance_id, fiber_id, name, correlation) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(&instance)
            .bind(&id)
            .bind(name)
            .bind(correlation)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn write_job(
        tx: &mut SqlTransaction<'_, Postgres>,
        write: &JobWrite,
    ) -> Result<(), StoreError> {
        let job = write.job();
        let conflict = match write {
            JobWrite::Dispatch(_) => "DO NOTHING",
            JobWrite::Update(_) => {
                "DO UPDATE SET status = EXCLUDED.status, not_before = EXCLUDED.not_before, \
                 claimed_at = EXCLUDED.claimed_at, data = EXCLUDED.data"
            }
        };
        let statement = format!(
            "INSERT INTO jobs \
             (job_key, instance_id, task_type, status, not_before, claimed_at, created_at, data) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) ON CONFLICT (job_key) {conflict}"
        );
        sqlx::query(&statement)
            .bind(job.key.as_str())
            .bind(job.instance.to_string())
            .bind(&job.task_type)
            .bind(job.status.as_str())
            .bind(job.not_before)
            .bind(job.claimed_at)
            .bind(job.created_at)
            .bind(Json(job))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn append_events(
        tx: &mut SqlTransaction<'_, Postgres>,
        instance: InstanceId,
        at: DateTime<Utc>,
        events: &[RuntimeEvent],
    ) -> Result<(), StoreError> {
        let id = instance.to_string();
        let last: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM events WHERE instance_id = $1")
                .bind(&id)
                .fetch_one(&mut **tx)
                .await?;
        for (offset, event) in events.iter().enumerate() {
            sqlx::query("INSERT INTO events (instance_id, seq, at, data) VALUES ($1, $2, $3, $4)")
                .bind(&id)
                .bind(last + to_i64(offset as u64) + 1)
                .bind(at)
                .bind(Json(event))
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }
}

fn message_triggers(wait: &WaitState) -> Vec<(&str, &str)> {
    match wait {
        WaitState::Message { name, correlation } => vec![(name.as_str(), correlation.as_str())],
        WaitState::Race { arms, .. } => arms
            .iter()
            .filter_map(|arm| match &arm.trigger {
                ArmWaitTrigger::Message { name, correlation } => {
                    Some((name.as_str(), correlation.as_str()))
                }
                ArmWaitTrigger::Timer { .. } => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn fiber_ref(row: &PgRow) -> Result<FiberRef, StoreError> {
    let instance: String = row.try_get("instance_id")?;
    let fiber: String = row.try_get("fiber_id")?;
    let epoch: i64 = row.try_get("epoch")?;
    Ok(FiberRef {
        instance: InstanceId::parse(&instance).map_err(|e| corrupt("fibers", e))?,
        fiber: FiberId::parse(&fiber).map_err(|e| corrupt("fibers", e))?,
        epoch: to_u64(epoch),
    })
}

fn data<T: serde::de::DeserializeOwned>(row: &PgRow) -> Result<T, StoreError> {
    let Json(value) = row.try_get::<Json<T>, _>("data")?;
    Ok(value)
}

#[async_trait]
impl ProcessStore for PgStore {
    async fn put_program(&self, program: &Program) -> Result<(), StoreError> {
        program.verify_hash()?;
        sqlx::query("INSERT INTO programs (hash, body) VALUES ($1, $2) ON CONFLICT (hash) DO NOTHING")
            .bind(program.hash().as_str())
            .bind(program.to_json()?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_program(&self, hash: &ProgramHash) -> Result<Option<Program>, StoreError> {
        let body: Option<String> = sqlx::query_scalar("SELECT body FROM programs WHERE hash = $1")
            .bind(hash.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(body.map(|b| Program::from_json(&b)).transpose()?)
    }

    async fn commit(&self, transition: &Transition) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::write_instance(&mut tx, transition).await?;

        let instance = transition.instance.id;
        let instance_text = instance.to_string();
        for id in &transition.delete_fibers {
            sqlx::query("DELETE FROM fibers WHERE instance_id = $1 AND fiber_id = $2")
                .bind(&instance_text)
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        for fiber in &transition.upsert_fibers {
            Self::write_fiber(&mut tx, fiber).await?;
        }
        for barrier in &transition.barriers {
            sqlx::query(
                "INSERT INTO join_barriers (instance_id, join_key, activation, arrived) \
                 VALUES ($1, $2, $3, $4) ON CONFLICT (instance_id, join_key) DO UPDATE \
                 SET activation = EXCLUDED.activation, arrived = EXCLUDED.arrived",
            )
            .bind(&instance_text)
            .bind(barrier.join.as_str())
            .bind(to_i64(barrier.activation))
            .bind(i64::from(barrier.arrived))
            .execute(&mut *tx)
            .await?;
        }
        for write in &transition.jobs {
            Self::write_job(&mut tx, write).await?;
        }
        for key in &transition.cancel_jobs {
            sqlx::query(
                "UPDATE jobs SET status = 'cancelled', \
                 data = jsonb_set(data, '{status}', '\"cancelled\"') \
                 WHERE job_key = $1 AND status IN ('pending', 'claimed')",
            )
            .bind(key.as_str())
            .execute(&mut *tx)
            .await?;
        }
        for record in &transition.completions {
            sqlx::query(
                "INSERT INTO dedupe_cache (job_key, recorded_at, data) VALUES ($1, $2, $3) \
                 ON CONFLICT (job_key) DO NOTHING",
            )
            .bind(record.job_key.as_str())
            .bind(record.recorded_at)
            .bind(Json(record))
            .execute(&mut *tx)
            .await?;
        }
        for incident in &transition.incidents {
            sqlx::query(
                "INSERT INTO incidents (id, instance_id, status, raised_at, data) \
                 VALUES ($1, $2, $3, $4, $5) ON CONFLICT (id) DO UPDATE \
                 SET status = EXCLUDED.status, data = EXCLUDED.data",
            )
            .bind(incident.id.to_string())
            .bind(incident.instance.to_string())
            .bind(if incident.is_open() { "open" } else { "resolved" })
            .bind(incident.raised_at)
            .bind(Json(incident))
            .execute(&mut *tx)
            .await?;
        }
        for (task_type, key) in &transition.remove_dead_letters {
            sqlx::query("DELETE FROM dead_letters WHERE task_type = $1 AND job_key = $2")
                .bind(task_type)
                .bind(key.as_str())
                .execute(&mut *tx)
                .await?;
        }
        for entry in &transition.dead_letters {
            sqlx::query(
                "INSERT INTO dead_letters (task_type, job_key, dead_lettered_at, expires_at, data) \
                 VALUES ($1, $2, $3, $4, $5) ON CONFLICT (task_type, job_key) DO UPDATE \
                 SET dead_lettered_at = EXCLUDED.dead_lettered_at, \
                     expires_at = EXCLUDED.expires_at, data = EXCLUDED.data",
            )
            .bind(&entry.task_type)
            .bind(entry.job_key.as_str())
            .bind(entry.dead_lettered_at)
            .bind(entry.expires_at)
            .bind(Json(entry))
            .execute(&mut *tx)
            .await?;
        }
        Self::append_events(&mut tx, instance, transition.at, &transition.events).await?;

        tx.commit().await?;
        tracing::trace!(instance = %instance, version = transition.instance.version, "committed");
        Ok(())
    }

    async fn load_state(&self, id: InstanceId) -> Result<Option<InstanceState>, StoreError> {
        let key = id.to_string();
        let Some(row) = sqlx::query("SELECT data FROM process_instances WHERE id = $1")
            .bind(&key)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let instance: ProcessInstance = data(&row)?;
        let mut state = InstanceState::new(instance);

        let fibers = sqlx::query("SELECT data FROM fibers WHERE instance_id = $1 ORDER BY seq")
            .bind(&key)
            .fetch_all(&self.pool)
            .await?;
        for row in &fibers {
            let fiber: Fiber = data(row)?;
            state.fibers.insert(fiber.id, fiber);
        }

        let barriers = sqlx::query(
            "SELECT join_key, activation, arrived FROM join_barriers WHERE instance_id = $1",
        )
        .bind(&key)
        .fetch_all(&self.pool)
        .await?;
        for row in &barriers {
            let join: String = row.try_get("join_key")?;
            let join = NodeKey::new(&join).map_err(|e| corrupt("join_barriers", e))?;
            let activation: i64 = row.try_get("activation")?;
            let arrived: i64 = row.try_get("arrived")?;
            state.barriers.insert(
                join.clone(),
                JoinBarrier {
                    join,
                    activation: to_u64(activation),
                    arrived: u32::try_from(arrived).map_err(|e| corrupt("join_barriers", e))?,
                },
            );
        }
        Ok(Some(state))
    }

    async fn list_runnable(&self) -> Result<Vec<InstanceId>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT i.id FROM process_instances i WHERE i.status = 'running' \
             AND EXISTS (SELECT 1 FROM fibers f WHERE f.instance_id = i.id AND f.ready) \
             ORDER BY i.created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        ids.iter()
            .map(|id| InstanceId::parse(id).map_err(|e| corrupt("process_instances", e)))
            .collect()
    }

    async fn get_job(&self, key: &JobKey) -> Result<Option<Job>, StoreError> {
        sqlx::query("SELECT data FROM jobs WHERE job_key = $1")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(data)
            .transpose()
    }

    async fn jobs_for_instance(&self, id: InstanceId) -> Result<Vec<Job>, StoreError> {
        sqlx::query("SELECT data FROM jobs WHERE instance_id = $1 ORDER BY created_at")
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(data)
            .collect()
    }

    async fn claim_jobs(
        &self,
        task_types: &[String],
        worker: &str,
        max: usize,
        now: DateTime<Utc>,
        lease: TimeDelta,
    ) -> Result<Vec<Job>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT data FROM jobs WHERE task_type = ANY($1) \
             AND ((status = 'pending' AND not_before <= $2) \
               OR (status = 'claimed' AND claimed_at <= $3)) \
             ORDER BY not_before, created_at LIMIT $4 FOR UPDATE SKIP LOCKED",
        )
        .bind(task_types.to_vec())
        .bind(now)
        .bind(now - lease)
        .bind(to_i64(max as u64))
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut job: Job = data(row)?;
            job.claim(worker, now);
            sqlx::query("UPDATE jobs SET status = $1, claimed_at = $2, data = $3 WHERE job_key = $4")
                .bind(job.status.as_str())
                .bind(job.claimed_at)
                .bind(Json(&job))
                .bind(job.key.as_str())
                .execute(&mut *tx)
                .await?;
            claimed.push(job);
        }
        tx.commit().await?;
        Ok(claimed)
    }

    async fn get_completion(&self, key: &JobKey) -> Result<Option<CompletionRecord>, StoreError> {
        sqlx::query("SELECT data FROM dedupe_cache WHERE job_key = $1")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(data)
            .transpose()
    }

    async fn read_events(
        &self,
        id: InstanceId,
        from_seq: u64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT seq, at, data FROM events WHERE instance_id = $1 AND seq >= $2 ORDER BY seq",
        )
        .bind(id.to_string())
        .bind(to_i64(from_seq))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<EventRecord, StoreError> {
                let seq: i64 = row.try_get("seq")?;
                Ok(EventRecord {
                    instance: id,
                    seq: to_u64(seq),
                    at: row.try_get("at")?,
                    event: data(row)?,
                })
            })
            .collect()
    }

    async fn get_incident(&self, id: IncidentId) -> Result<Option<Incident>, StoreError> {
        sqlx::query("SELECT data FROM incidents WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(data)
            .transpose()
    }

    async fn list_incidents(
        &self,
        instance: Option<InstanceId>,
    ) -> Result<Vec<Incident>, StoreError> {
        sqlx::query(
            "SELECT data FROM incidents WHERE ($1::TEXT IS NULL OR instance_id = $1) \
             ORDER BY raised_at",
        )
        .bind(instance.map(|id| id.to_string()))
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(data)
        .collect()
    }

    async fn get_dead_letter(
        &self,
        task_type: &str,
        key: &JobKey,
    ) -> Result<Option<DeadLetter>, StoreError> {
        sqlx::query("SELECT data FROM dead_letters WHERE task_type = $1 AND job_key = $2")
            .bind(task_type)
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(data)
            .transpose()
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError> {
        sqlx::query("SELECT data FROM dead_letters ORDER BY dead_lettered_at")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(data)
            .collect()
    }

    async fn purge_expired_dead_letters(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let purged = sqlx::query("DELETE FROM dead_letters WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(usize::try_from(purged).unwrap_or(usize::MAX))
    }

    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<FiberRef>, StoreError> {
        sqlx::query(
            "SELECT f.instance_id, f.fiber_id, f.epoch FROM fibers f \
             JOIN process_instances i ON i.id = f.instance_id \
             WHERE i.status = 'running' AND f.due_at <= $1 \
             ORDER BY f.due_at, i.created_at, f.seq",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(fiber_ref)
        .collect()
    }

    async fn find_message_waiters(
        &self,
        name: &str,
        correlation: &str,
    ) -> Result<Vec<FiberRef>, StoreError> {
        sqlx::query(
            "SELECT DISTINCT f.instance_id, f.fiber_id, f.epoch, i.created_at, f.seq \
             FROM message_waits m \
             JOIN fibers f ON f.instance_id = m.instance_id AND f.fiber_id = m.fiber_id \
             JOIN process_instances i ON i.id = f.instance_id \
             WHERE i.status = 'running' AND m.name = $1 AND m.correlation = $2 \
             ORDER BY i.created_at, f.seq",
        )
        .bind(name)
        .bind(correlation)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(fiber_ref)
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("public", true)]
    #[case("weft_2", true)]
    #[case("", false)]
    #[case("2weft", false)]
    #[case("weft; DROP TABLE jobs", false)]
    #[case("Weft", false)]
    fn schema_names_are_validated(#[case] schema: &str, #[case] ok: bool) {
        assert_eq!(valid_schema(schema), ok);
    }

    #[test]
    fn race_message_arms_are_indexed() {
        use weft_execution::ArmWait;
        let wait = WaitState::Race {
            race: NodeKey::new("race").unwrap(),
            arms: vec![
                ArmWait {
                    trigger: ArmWaitTrigger::Timer { due_at: Utc::now() },
                    target: 3,
                },
                ArmWait {
                    trigger: ArmWaitTrigger::Message {
                        name: "m".into(),
                        correlation: "c".into(),
                    },
                    target: 5,
                },
            ],
        };
        assert_eq!(message_triggers(&wait), vec![("m", "c")]);
    }
}
