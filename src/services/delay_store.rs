use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::DateTime;
use redis::aio::ConnectionManager;
use tokio::sync::{Mutex, mpsc, oneshot, watch};

use crate::config::{Config, StoreBackend};
use crate::model::error::StoreError;
use crate::model::{DelayState, Raise};

use super::i_delay_store::DelayStore;

struct RaiseRequest {
    candidate: DelayState,
    reply: oneshot::Sender<Raise>,
}

/// In-process store. A single task owns the state and applies raises one at a
/// time; readers see the snapshot it publishes after each completed write.
#[derive(Debug, Clone)]
pub struct MemoryDelayStore {
    requests: mpsc::Sender<RaiseRequest>,
    snapshot: watch::Receiver<DelayState>,
}

impl MemoryDelayStore {
    pub fn spawn() -> Self {
        Self::spawn_with(DelayState::default())
    }

    pub fn spawn_with(initial: DelayState) -> Self {
        let (requests, rx) = mpsc::channel(1024);
        let (publish, snapshot) = watch::channel(initial);
        tokio::spawn(own_state(rx, publish));
        Self { requests, snapshot }
    }
}

async fn own_state(mut requests: mpsc::Receiver<RaiseRequest>, publish: watch::Sender<DelayState>) {
    tracing::debug!("delay state owner started");
    while let Some(RaiseRequest { candidate, reply }) = requests.recv().await {
        let outcome = publish.borrow().raise(candidate);
        if let Raise::Raised(state) = outcome {
            publish.send_replace(state);
            tracing::debug!("raised shared delay to {state:?}");
        }
        if reply.send(outcome).is_err() {
            tracing::debug!("raise requester went away before the reply");
        }
    }
    tracing::debug!("delay state owner stopped");
}

impl DelayStore for MemoryDelayStore {
    async fn read(&self) -> Result<DelayState, StoreError> {
        Ok(*self.snapshot.borrow())
    }

    async fn raise(&self, candidate: DelayState) -> Result<Raise, StoreError> {
        let (reply, outcome) = oneshot::channel();
        self.requests
            .send(RaiseRequest { candidate, reply })
            .await
            .map_err(|_| StoreError::Closed)?;
        outcome.await.map_err(|_| StoreError::Closed)
    }
}

/// JSON record on disk. Raises are serialized within the process and land via
/// rename, so a concurrent read sees either the old or the new record.
#[derive(Debug)]
pub struct FileDelayStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileDelayStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn persist(&self, state: DelayState) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&state)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }
}

impl DelayStore for FileDelayStore {
    async fn read(&self) -> Result<DelayState, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DelayState::default()),
            Err(e) => Err(e.into()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn raise(&self, candidate: DelayState) -> Result<Raise, StoreError> {
        let _guard = self.write_lock.lock().await;
        let current = self.read().await.unwrap_or_else(|e| {
            tracing::warn!("unreadable delay state at {:?}, starting from zero: {e}", self.path);
            DelayState::default()
        });
        let outcome = current.raise(candidate);
        if let Raise::Raised(state) = outcome {
            self.persist(state).await?;
        }
        Ok(outcome)
    }
}

const FIELD_DELAY: &str = "latest_delay";
const FIELD_TIMESTAMP: &str = "latest_delay_ts_ms";

// KEYS[1] = state hash, ARGV[1] = candidate delay (s), ARGV[2] = candidate timestamp (ms)
const RAISE_SCRIPT: &str = r#"
local cur = tonumber(redis.call('HGET', KEYS[1], 'latest_delay')) or 0
local ts = tonumber(redis.call('HGET', KEYS[1], 'latest_delay_ts_ms')) or 0
local cand = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local decayed = math.max(0, cur - math.max(0, now - ts) / 1000)
if cand > decayed then
  redis.call('HSET', KEYS[1], 'latest_delay', ARGV[1], 'latest_delay_ts_ms', ARGV[2])
  return {1, ARGV[1], ARGV[2]}
end
return {0, tostring(cur), tostring(ts)}
"#;

/// Redis hash shared by several server instances. The conditional update runs
/// as one Lua script, which redis executes atomically.
#[derive(Clone)]
pub struct RedisDelayStore {
    conn: ConnectionManager,
    key: String,
    script: redis::Script,
}

impl fmt::Debug for RedisDelayStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisDelayStore")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl RedisDelayStore {
    pub fn new(conn: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            conn,
            key: key.into(),
            script: redis::Script::new(RAISE_SCRIPT),
        }
    }
}

fn state_from_redis(delay: f64, timestamp_ms: i64) -> DelayState {
    DelayState::new(
        delay,
        DateTime::from_timestamp_millis(timestamp_ms).unwrap_or(DateTime::UNIX_EPOCH),
    )
}

impl DelayStore for RedisDelayStore {
    async fn read(&self) -> Result<DelayState, StoreError> {
        let mut conn = self.conn.clone();
        let (delay, timestamp_ms): (Option<f64>, Option<i64>) = redis::cmd("HMGET")
            .arg(&self.key)
            .arg(FIELD_DELAY)
            .arg(FIELD_TIMESTAMP)
            .query_async(&mut conn)
            .await?;
        match (delay, timestamp_ms) {
            (Some(delay), Some(timestamp_ms)) => Ok(state_from_redis(delay, timestamp_ms)),
            _ => Ok(DelayState::default()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn raise(&self, candidate: DelayState) -> Result<Raise, StoreError> {
        if !DelayState::is_sleepable(candidate.latest_delay) {
            return Ok(Raise::Kept(self.read().await?));
        }
        let mut conn = self.conn.clone();
        let mut invocation = self.script.prepare_invoke();
        invocation
            .key(&self.key)
            .arg(candidate.latest_delay)
            .arg(candidate.latest_delay_timestamp.timestamp_millis());
        let (raised, delay, timestamp_ms): (i64, f64, f64) =
            invocation.invoke_async(&mut conn).await?;
        let state = state_from_redis(delay, timestamp_ms as i64);
        Ok(if raised == 1 {
            Raise::Raised(state)
        } else {
            Raise::Kept(state)
        })
    }
}

/// The backend chosen by `DELAY_STORE`.
#[derive(Debug)]
pub enum AnyDelayStore {
    Memory(MemoryDelayStore),
    File(FileDelayStore),
    Redis(RedisDelayStore),
}

impl AnyDelayStore {
    pub async fn from_config(cnf: &Config) -> anyhow::Result<Self> {
        Ok(match cnf.delay_store {
            StoreBackend::Memory => AnyDelayStore::Memory(MemoryDelayStore::spawn()),
            StoreBackend::File => {
                AnyDelayStore::File(FileDelayStore::new(&cnf.delay_state_file))
            }
            StoreBackend::Redis => {
                let url = cnf
                    .redis_url
                    .as_deref()
                    .context("DELAY_STORE=redis requires REDIS_URL")?;
                let redis_cli =
                    redis::Client::open(url).context("failed to init redis client")?;
                let conn = ConnectionManager::new(redis_cli)
                    .await
                    .context("failed to connect to redis")?;
                AnyDelayStore::Redis(RedisDelayStore::new(conn, cnf.redis_state_key.clone()))
            }
        })
    }
}

impl DelayStore for AnyDelayStore {
    async fn read(&self) -> Result<DelayState, StoreError> {
        match self {
            AnyDelayStore::Memory(store) => store.read().await,
            AnyDelayStore::File(store) => store.read().await,
            AnyDelayStore::Redis(store) => store.read().await,
        }
    }

    async fn raise(&self, candidate: DelayState) -> Result<Raise, StoreError> {
        match self {
            AnyDelayStore::Memory(store) => store.raise(candidate).await,
            AnyDelayStore::File(store) => store.raise(candidate).await,
            AnyDelayStore::Redis(store) => store.raise(candidate).await,
        }
    }
}
