//! SQLite adapter for the Breeder entity store.
//!
//! One database file holds a whole run, so an interrupted run can be resumed
//! by population id. Writes take a store-level lock and run inside a
//! transaction; busy/locked and uniqueness errors surface as
//! [`StoreError::Conflict`] for [`crate::retry_on_conflict`].

use crate::traits::{ClusterStore, InteractionStore, PopulationStore, SystemStore};
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use breeder_types::{
    Agent, AgentId, Chat, ChatId, Cluster, ClusterId, ConfidenceInterval, Generation,
    GenerationId, Meeting, MeetingId, MonotonicClock, NewSystem, Population, PopulationId, System,
    SystemId, SystemStatus, SystemUpdate,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite, Transaction};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;

const SCHEMA: [&str; 11] = [
    r#"
    CREATE TABLE IF NOT EXISTS populations (
        id TEXT PRIMARY KEY,
        benchmark TEXT NOT NULL,
        safety INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS generations (
        id TEXT PRIMARY KEY,
        population_id TEXT NOT NULL REFERENCES populations(id),
        number INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE (population_id, number)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS clusters (
        id TEXT PRIMARY KEY,
        population_id TEXT NOT NULL REFERENCES populations(id),
        generation_id TEXT NOT NULL REFERENCES generations(id),
        label INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS systems (
        id TEXT PRIMARY KEY,
        population_id TEXT NOT NULL REFERENCES populations(id),
        name TEXT NOT NULL,
        code TEXT NOT NULL,
        rationale TEXT NOT NULL,
        first_parent_id TEXT REFERENCES systems(id),
        second_parent_id TEXT REFERENCES systems(id),
        mutation_prompt TEXT,
        descriptor TEXT,
        cluster_id TEXT REFERENCES clusters(id),
        capability_ci TEXT,
        safety_ci TEXT,
        truth_ci TEXT,
        sample_size INTEGER,
        confidence_level REAL,
        status TEXT NOT NULL,
        properties TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cluster_assignments (
        generation_id TEXT NOT NULL REFERENCES generations(id),
        system_id TEXT NOT NULL REFERENCES systems(id),
        cluster_id TEXT NOT NULL REFERENCES clusters(id),
        PRIMARY KEY (generation_id, system_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS meetings (
        id TEXT PRIMARY KEY,
        system_id TEXT NOT NULL,
        name TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS agents (
        id TEXT PRIMARY KEY,
        system_id TEXT NOT NULL,
        name TEXT NOT NULL,
        temperature REAL NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS meeting_agents (
        meeting_id TEXT NOT NULL REFERENCES meetings(id),
        agent_id TEXT NOT NULL REFERENCES agents(id),
        joined_at INTEGER NOT NULL,
        PRIMARY KEY (meeting_id, agent_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chats (
        id TEXT PRIMARY KEY,
        meeting_id TEXT NOT NULL REFERENCES meetings(id),
        speaker_id TEXT NOT NULL REFERENCES agents(id),
        speaker_name TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_systems_population ON systems (population_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_chats_meeting ON chats (meeting_id, created_at)",
];

/// SQLite-backed entity store.
pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
    clock: MonotonicClock,
}

impl SqliteStore {
    /// Open (or create) a database file and initialise the schema.
    pub async fn connect(path: impl AsRef<Path>) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to open sqlite database: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Private in-memory database, mostly for tests.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to open sqlite database: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Wrap an open pool, creating the schema if needed.
    pub async fn from_pool(pool: SqlitePool) -> StoreResult<Self> {
        let store = Self {
            pool,
            write_lock: Mutex::new(()),
            clock: MonotonicClock::new(),
        };
        store.init_schema().await?;
        store.resume_clock().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> StoreResult<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }

    /// Keep new timestamps after every persisted one.
    async fn resume_clock(&self) -> StoreResult<()> {
        let row = sqlx::query(
            r#"
            SELECT MAX(ts) AS latest FROM (
                SELECT MAX(created_at) AS ts FROM chats
                UNION ALL SELECT MAX(created_at) FROM systems
                UNION ALL SELECT MAX(created_at) FROM generations
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        let latest: Option<i64> = row.try_get("latest").map_err(map_sqlx_error)?;
        if let Some(micros) = latest {
            self.clock.observe(from_micros(micros)?);
        }
        Ok(())
    }

    async fn begin(&self) -> StoreResult<Transaction<'_, Sqlite>> {
        self.pool.begin().await.map_err(map_sqlx_error)
    }

    async fn fetch_system(
        tx: &mut Transaction<'_, Sqlite>,
        id: SystemId,
    ) -> StoreResult<Option<System>> {
        let row = sqlx::query("SELECT * FROM systems WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(system_from_row).transpose()
    }
}

#[async_trait]
impl PopulationStore for SqliteStore {
    async fn create_population(&self, benchmark: &str, safety: bool) -> StoreResult<Population> {
        let _guard = self.write_lock.lock().await;
        let population = Population {
            id: PopulationId::generate(),
            benchmark: benchmark.to_string(),
            safety,
            created_at: self.clock.now(),
        };
        sqlx::query(
            "INSERT INTO populations (id, benchmark, safety, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(population.id.to_string())
        .bind(&population.benchmark)
        .bind(population.safety)
        .bind(population.created_at.timestamp_micros())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(population)
    }

    async fn get_population(&self, id: PopulationId) -> StoreResult<Option<Population>> {
        let row = sqlx::query("SELECT * FROM populations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.map(|row| {
            Ok(Population {
                id: parse_id(&row, "id")?,
                benchmark: get(&row, "benchmark")?,
                safety: get(&row, "safety")?,
                created_at: timestamp(&row, "created_at")?,
            })
        })
        .transpose()
    }

    async fn append_generation(&self, population_id: PopulationId) -> StoreResult<Generation> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.begin().await?;
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM populations WHERE id = ?) AS found,
                   (SELECT MAX(number) FROM generations WHERE population_id = ?) AS last
            "#,
        )
        .bind(population_id.to_string())
        .bind(population_id.to_string())
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        let found: i64 = get(&row, "found")?;
        if found == 0 {
            return Err(StoreError::NotFound(format!(
                "population {} not found",
                population_id
            )));
        }
        let last: Option<i64> = get(&row, "last")?;
        let generation = Generation {
            id: GenerationId::generate(),
            population_id,
            number: last.map_or(1, |n| n as u32 + 1),
            created_at: self.clock.now(),
        };
        sqlx::query(
            "INSERT INTO generations (id, population_id, number, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(generation.id.to_string())
        .bind(population_id.to_string())
        .bind(i64::from(generation.number))
        .bind(generation.created_at.timestamp_micros())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(generation)
    }

    async fn list_generations(&self, population_id: PopulationId) -> StoreResult<Vec<Generation>> {
        let rows = sqlx::query("SELECT * FROM generations WHERE population_id = ? ORDER BY number")
            .bind(population_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter()
            .map(|row| {
                let number: i64 = get(row, "number")?;
                Ok(Generation {
                    id: parse_id(row, "id")?,
                    population_id: parse_id(row, "population_id")?,
                    number: number as u32,
                    created_at: timestamp(row, "created_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl SystemStore for SqliteStore {
    async fn append_system(&self, new: NewSystem) -> StoreResult<System> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.begin().await?;

        for parent in [new.first_parent_id, new.second_parent_id].into_iter().flatten() {
            let row = sqlx::query("SELECT population_id FROM systems WHERE id = ?")
                .bind(parent.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
            let owner: Option<PopulationId> =
                row.as_ref().map(|r| parse_id(r, "population_id")).transpose()?;
            if owner != Some(new.population_id) {
                return Err(StoreError::InvariantViolation(format!(
                    "parent {} is not in population {}",
                    parent, new.population_id
                )));
            }
        }

        let system = System {
            id: SystemId::generate(),
            population_id: new.population_id,
            name: new.name,
            code: new.code,
            rationale: new.rationale,
            first_parent_id: new.first_parent_id,
            second_parent_id: new.second_parent_id,
            mutation_prompt: new.mutation_prompt,
            descriptor: None,
            cluster_id: None,
            capability_ci: None,
            safety_ci: None,
            truth_ci: None,
            sample_size: None,
            confidence_level: None,
            status: new.status,
            properties: BTreeMap::new(),
            created_at: self.clock.now(),
        };

        sqlx::query(
            r#"
            INSERT INTO systems
                (id, population_id, name, code, rationale, first_parent_id, second_parent_id,
                 mutation_prompt, status, properties, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, '{}', ?)
            "#,
        )
        .bind(system.id.to_string())
        .bind(system.population_id.to_string())
        .bind(&system.name)
        .bind(&system.code)
        .bind(&system.rationale)
        .bind(system.first_parent_id.map(|id| id.to_string()))
        .bind(system.second_parent_id.map(|id| id.to_string()))
        .bind(system.mutation_prompt.as_deref())
        .bind(system.status.as_str())
        .bind(system.created_at.timestamp_micros())
        .execute(&mut *tx)
        .await
        .map_err(|e| match map_sqlx_error(e) {
            StoreError::InvariantViolation(_) => StoreError::NotFound(format!(
                "population {} not found",
                system.population_id
            )),
            other => other,
        })?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(system)
    }

    async fn get_system(&self, id: SystemId) -> StoreResult<Option<System>> {
        let row = sqlx::query("SELECT * FROM systems WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(system_from_row).transpose()
    }

    async fn update_system(&self, id: SystemId, update: SystemUpdate) -> StoreResult<System> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.begin().await?;
        let mut system = Self::fetch_system(&mut tx, id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("system {} not found", id)))?;
        update.apply(&mut system);

        sqlx::query(
            r#"
            UPDATE systems
               SET descriptor = ?, cluster_id = ?, capability_ci = ?, safety_ci = ?,
                   truth_ci = ?, sample_size = ?, confidence_level = ?, status = ?,
                   properties = ?
             WHERE id = ?
            "#,
        )
        .bind(to_json_opt(&system.descriptor)?)
        .bind(system.cluster_id.map(|id| id.to_string()))
        .bind(to_json_opt(&system.capability_ci)?)
        .bind(to_json_opt(&system.safety_ci)?)
        .bind(to_json_opt(&system.truth_ci)?)
        .bind(system.sample_size.map(i64::from))
        .bind(system.confidence_level)
        .bind(system.status.as_str())
        .bind(serde_json::to_string(&system.properties)?)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(system)
    }

    async fn list_systems(&self, population_id: PopulationId) -> StoreResult<Vec<System>> {
        let rows =
            sqlx::query("SELECT * FROM systems WHERE population_id = ? ORDER BY created_at")
                .bind(population_id.to_string())
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        rows.iter().map(system_from_row).collect()
    }
}

#[async_trait]
impl ClusterStore for SqliteStore {
    async fn create_cluster(
        &self,
        generation_id: GenerationId,
        label: i64,
    ) -> StoreResult<Cluster> {
        let _guard = self.write_lock.lock().await;
        let row = sqlx::query("SELECT population_id FROM generations WHERE id = ?")
            .bind(generation_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .ok_or_else(|| {
                StoreError::NotFound(format!("generation {} not found", generation_id))
            })?;
        let cluster = Cluster {
            id: ClusterId::generate(),
            population_id: parse_id(&row, "population_id")?,
            generation_id,
            label,
            created_at: self.clock.now(),
        };
        sqlx::query(
            r#"
            INSERT INTO clusters (id, population_id, generation_id, label, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(cluster.id.to_string())
        .bind(cluster.population_id.to_string())
        .bind(generation_id.to_string())
        .bind(label)
        .bind(cluster.created_at.timestamp_micros())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(cluster)
    }

    async fn list_clusters(&self, generation_id: GenerationId) -> StoreResult<Vec<Cluster>> {
        let rows = sqlx::query("SELECT * FROM clusters WHERE generation_id = ? ORDER BY created_at")
            .bind(generation_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(cluster_from_row).collect()
    }

    async fn assign_clusters(
        &self,
        generation_id: GenerationId,
        assignments: &[(SystemId, ClusterId)],
    ) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.begin().await?;

        let row = sqlx::query("SELECT population_id FROM generations WHERE id = ?")
            .bind(generation_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
            .ok_or_else(|| {
                StoreError::NotFound(format!("generation {} not found", generation_id))
            })?;
        let population_id: PopulationId = parse_id(&row, "population_id")?;

        let mut seen = HashSet::new();
        for (system_id, cluster_id) in assignments {
            if !seen.insert(*system_id) {
                return Err(StoreError::InvariantViolation(format!(
                    "system {} assigned twice in generation {}",
                    system_id, generation_id
                )));
            }
            let check = sqlx::query(
                r#"
                SELECT (SELECT population_id FROM systems WHERE id = ?) AS system_population,
                       (SELECT generation_id FROM clusters WHERE id = ?) AS cluster_generation
                "#,
            )
            .bind(system_id.to_string())
            .bind(cluster_id.to_string())
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
            let system_population: Option<String> = get(&check, "system_population")?;
            let cluster_generation: Option<String> = get(&check, "cluster_generation")?;
            if system_population != Some(population_id.to_string()) {
                return Err(StoreError::InvariantViolation(format!(
                    "system {} is not in population {}",
                    system_id, population_id
                )));
            }
            if cluster_generation != Some(generation_id.to_string()) {
                return Err(StoreError::InvariantViolation(format!(
                    "cluster {} is not in generation {}",
                    cluster_id, generation_id
                )));
            }
        }

        sqlx::query("DELETE FROM cluster_assignments WHERE generation_id = ?")
            .bind(generation_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        for (system_id, cluster_id) in assignments {
            sqlx::query(
                "INSERT INTO cluster_assignments (generation_id, system_id, cluster_id) VALUES (?, ?, ?)",
            )
            .bind(generation_id.to_string())
            .bind(system_id.to_string())
            .bind(cluster_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
            sqlx::query("UPDATE systems SET cluster_id = ? WHERE id = ?")
                .bind(cluster_id.to_string())
                .bind(system_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn cluster_assignments(
        &self,
        generation_id: GenerationId,
    ) -> StoreResult<Vec<(SystemId, ClusterId)>> {
        let rows = sqlx::query(
            r#"
            SELECT a.system_id, a.cluster_id
              FROM cluster_assignments a
              JOIN systems s ON s.id = a.system_id
             WHERE a.generation_id = ?
             ORDER BY s.created_at
            "#,
        )
        .bind(generation_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        rows.iter()
            .map(|row| Ok((parse_id(row, "system_id")?, parse_id(row, "cluster_id")?)))
            .collect()
    }

    async fn cluster_members(&self, cluster_id: ClusterId) -> StoreResult<Vec<System>> {
        let exists = sqlx::query("SELECT 1 FROM clusters WHERE id = ?")
            .bind(cluster_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!(
                "cluster {} not found",
                cluster_id
            )));
        }
        let rows = sqlx::query(
            r#"
            SELECT s.*
              FROM cluster_assignments a
              JOIN systems s ON s.id = a.system_id
             WHERE a.cluster_id = ?
             ORDER BY s.created_at
            "#,
        )
        .bind(cluster_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        rows.iter().map(system_from_row).collect()
    }
}

#[async_trait]
impl InteractionStore for SqliteStore {
    async fn create_meeting(&self, system_id: SystemId, name: &str) -> StoreResult<Meeting> {
        let _guard = self.write_lock.lock().await;
        let meeting = Meeting {
            id: MeetingId::generate(),
            system_id,
            name: name.to_string(),
            created_at: self.clock.now(),
        };
        sqlx::query("INSERT INTO meetings (id, system_id, name, created_at) VALUES (?, ?, ?, ?)")
            .bind(meeting.id.to_string())
            .bind(system_id.to_string())
            .bind(name)
            .bind(meeting.created_at.timestamp_micros())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(meeting)
    }

    async fn create_agent(
        &self,
        system_id: SystemId,
        name: &str,
        temperature: f64,
    ) -> StoreResult<Agent> {
        let _guard = self.write_lock.lock().await;
        let agent = Agent {
            id: AgentId::generate(),
            system_id,
            name: name.to_string(),
            temperature,
            created_at: self.clock.now(),
        };
        sqlx::query(
            "INSERT INTO agents (id, system_id, name, temperature, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(agent.id.to_string())
        .bind(system_id.to_string())
        .bind(name)
        .bind(temperature)
        .bind(agent.created_at.timestamp_micros())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(agent)
    }

    async fn get_agent(&self, id: AgentId) -> StoreResult<Option<Agent>> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.map(|row| {
            Ok(Agent {
                id: parse_id(&row, "id")?,
                system_id: parse_id(&row, "system_id")?,
                name: get(&row, "name")?,
                temperature: get(&row, "temperature")?,
                created_at: timestamp(&row, "created_at")?,
            })
        })
        .transpose()
    }

    async fn add_agent_to_meeting(
        &self,
        meeting_id: MeetingId,
        agent_id: AgentId,
    ) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.begin().await?;
        self.join(&mut tx, meeting_id, agent_id).await?;
        tx.commit().await.map_err(map_sqlx_error)
    }

    async fn append_chat(
        &self,
        meeting_id: MeetingId,
        speaker_id: AgentId,
        content: &str,
    ) -> StoreResult<Chat> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.begin().await?;
        let speaker_name = self.join(&mut tx, meeting_id, speaker_id).await?;
        let chat = Chat {
            id: ChatId::generate(),
            meeting_id,
            speaker_id,
            speaker_name,
            content: content.to_string(),
            created_at: self.clock.now(),
        };
        sqlx::query(
            r#"
            INSERT INTO chats (id, meeting_id, speaker_id, speaker_name, content, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(chat.id.to_string())
        .bind(meeting_id.to_string())
        .bind(speaker_id.to_string())
        .bind(&chat.speaker_name)
        .bind(content)
        .bind(chat.created_at.timestamp_micros())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(chat)
    }

    async fn meeting_chats(&self, meeting_id: MeetingId) -> StoreResult<Vec<Chat>> {
        let rows =
            sqlx::query("SELECT * FROM chats WHERE meeting_id = ? ORDER BY created_at, id")
                .bind(meeting_id.to_string())
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        rows.iter()
            .map(|row| {
                Ok(Chat {
                    id: parse_id(row, "id")?,
                    meeting_id: parse_id(row, "meeting_id")?,
                    speaker_id: parse_id(row, "speaker_id")?,
                    speaker_name: get(row, "speaker_name")?,
                    content: get(row, "content")?,
                    created_at: timestamp(row, "created_at")?,
                })
            })
            .collect()
    }

    async fn agent_meetings(&self, agent_id: AgentId) -> StoreResult<Vec<MeetingId>> {
        let rows =
            sqlx::query("SELECT meeting_id FROM meeting_agents WHERE agent_id = ? ORDER BY joined_at")
                .bind(agent_id.to_string())
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        rows.iter().map(|row| parse_id(row, "meeting_id")).collect()
    }
}

impl SqliteStore {
    /// Add the agent to the meeting if needed and return the agent's name.
    async fn join(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        meeting_id: MeetingId,
        agent_id: AgentId,
    ) -> StoreResult<String> {
        let meeting = sqlx::query("SELECT 1 FROM meetings WHERE id = ?")
            .bind(meeting_id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;
        if meeting.is_none() {
            return Err(StoreError::NotFound(format!(
                "meeting {} not found",
                meeting_id
            )));
        }
        let agent = sqlx::query("SELECT name FROM agents WHERE id = ?")
            .bind(agent_id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_sqlx_error)?
            .ok_or_else(|| StoreError::NotFound(format!("agent {} not found", agent_id)))?;
        let name: String = get(&agent, "name")?;

        sqlx::query(
            "INSERT OR IGNORE INTO meeting_agents (meeting_id, agent_id, joined_at) VALUES (?, ?, ?)",
        )
        .bind(meeting_id.to_string())
        .bind(agent_id.to_string())
        .bind(self.clock.now().timestamp_micros())
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(name)
    }
}

fn get<'r, T>(row: &'r SqliteRow, column: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(column).map_err(map_sqlx_error)
}

fn parse_id<T>(row: &SqliteRow, column: &str) -> StoreResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = get(row, column)?;
    raw.parse()
        .map_err(|e: T::Err| StoreError::Serialization(format!("bad {column} '{raw}': {e}")))
}

fn parse_opt_id<T>(row: &SqliteRow, column: &str) -> StoreResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: Option<String> = get(row, column)?;
    raw.map(|raw| {
        raw.parse()
            .map_err(|e: T::Err| StoreError::Serialization(format!("bad {column} '{raw}': {e}")))
    })
    .transpose()
}

fn from_micros(micros: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Serialization(format!("timestamp out of range: {micros}")))
}

fn timestamp(row: &SqliteRow, column: &str) -> StoreResult<DateTime<Utc>> {
    from_micros(get(row, column)?)
}

fn from_json_opt<T: DeserializeOwned>(row: &SqliteRow, column: &str) -> StoreResult<Option<T>> {
    let raw: Option<String> = get(row, column)?;
    raw.map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
        .transpose()
}

fn to_json_opt<T: Serialize>(value: &Option<T>) -> StoreResult<Option<String>> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v).map_err(StoreError::from))
        .transpose()
}

fn system_from_row(row: &SqliteRow) -> StoreResult<System> {
    let status: String = get(row, "status")?;
    let properties: String = get(row, "properties")?;
    let sample_size: Option<i64> = get(row, "sample_size")?;
    let capability_ci: Option<ConfidenceInterval> = from_json_opt(row, "capability_ci")?;
    Ok(System {
        id: parse_id(row, "id")?,
        population_id: parse_id(row, "population_id")?,
        name: get(row, "name")?,
        code: get(row, "code")?,
        rationale: get(row, "rationale")?,
        first_parent_id: parse_opt_id(row, "first_parent_id")?,
        second_parent_id: parse_opt_id(row, "second_parent_id")?,
        mutation_prompt: get(row, "mutation_prompt")?,
        descriptor: from_json_opt(row, "descriptor")?,
        cluster_id: parse_opt_id(row, "cluster_id")?,
        capability_ci,
        safety_ci: from_json_opt(row, "safety_ci")?,
        truth_ci: from_json_opt(row, "truth_ci")?,
        sample_size: sample_size.map(|n| n as u32),
        confidence_level: get(row, "confidence_level")?,
        status: SystemStatus::from_str(&status).map_err(StoreError::Serialization)?,
        properties: serde_json::from_str(&properties)?,
        created_at: timestamp(row, "created_at")?,
    })
}

fn cluster_from_row(row: &SqliteRow) -> StoreResult<Cluster> {
    Ok(Cluster {
        id: parse_id(row, "id")?,
        population_id: parse_id(row, "population_id")?,
        generation_id: parse_id(row, "generation_id")?,
        label: get(row, "label")?,
        created_at: timestamp(row, "created_at")?,
    })
}

fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
        let message = db_err.message().to_string();
        // SQLITE_BUSY, SQLITE_LOCKED, UNIQUE and PRIMARY KEY violations
        if matches!(code.as_str(), "5" | "6" | "517" | "262" | "2067" | "1555") {
            return StoreError::Conflict(message);
        }
        // SQLITE_CONSTRAINT_FOREIGNKEY
        if code == "787" {
            return StoreError::InvariantViolation(message);
        }
    }
    if let sqlx::Error::PoolTimedOut = err {
        return StoreError::Conflict("connection pool timed out".to_string());
    }
    StoreError::Backend(err.to_string())
}
