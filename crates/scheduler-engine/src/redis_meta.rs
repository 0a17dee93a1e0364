//! Redis-backed metadata store.
//!
//! Task-table entries live in hashes at `TASK_TABLE:<hex task id>` with
//! fields `status`, `owner`, `spec`, `updated_at`; object locations are sets
//! at `OBJECT_TABLE:<hex object id>`. Writes that can race across nodes run
//! as Lua scripts so that status precedence and compare-and-set semantics
//! are atomic on the store. Task-table writes are published on
//! `TASK_TABLE:<hex owner id>` for the owning node's subscription.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use taskforge_core::{NodeId, ObjectId, TaskId, TaskSpec};

use crate::meta::{MetadataStore, StoreError, TaskStatus, TaskTableEntry};

const TASK_ADD_SCRIPT: &str = r#"
local rank = { waiting = 1, scheduled = 2, running = 3, done = 4, lost = 0 }
local current = redis.call('HGET', KEYS[1], 'status')
if current then
  if ARGV[1] == 'lost' then
    if current == 'done' then return 0 end
  elseif rank[ARGV[1]] <= rank[current] then
    return 0
  end
end
redis.call('HSET', KEYS[1],
  'status', ARGV[1], 'owner', ARGV[2], 'spec', ARGV[3], 'updated_at', ARGV[4])
return 1
"#;

const TASK_CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'status')
if not current then return 0 end
for i = 3, #ARGV do
  if ARGV[i] == current then
    redis.call('HSET', KEYS[1], 'status', ARGV[1], 'updated_at', ARGV[2])
    return 1
  end
end
return 0
"#;

fn task_key(task_id: TaskId) -> String {
    format!("TASK_TABLE:{task_id}")
}

fn object_key(oid: ObjectId) -> String {
    format!("OBJECT_TABLE:{oid}")
}

fn node_channel(node: NodeId) -> String {
    format!("TASK_TABLE:{node}")
}

fn backend_err(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// Metadata store client speaking to a shared Redis instance.
pub struct RedisMetaStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    add_script: Script,
    cas_script: Script,
}

impl RedisMetaStore {
    /// Connect to the store at `address` (`host:port` or a full redis URL).
    /// Connection failure here is fatal to engine startup.
    pub async fn connect(address: &str) -> Result<Self, StoreError> {
        let url = if address.contains("://") {
            address.to_string()
        } else {
            format!("redis://{address}")
        };
        let client = redis::Client::open(url)
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;

        Ok(Self {
            client,
            conn,
            add_script: Script::new(TASK_ADD_SCRIPT),
            cas_script: Script::new(TASK_CAS_SCRIPT),
        })
    }

    async fn publish(&self, entry: &TaskTableEntry) -> Result<(), StoreError> {
        let payload =
            serde_json::to_string(entry).map_err(|err| StoreError::Backend(err.to_string()))?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(node_channel(entry.owner), payload)
            .await
            .map_err(backend_err)
    }

    async fn read_entry(&self, task_id: TaskId) -> Result<Option<TaskTableEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: std::collections::HashMap<String, String> =
            conn.hgetall(task_key(task_id)).await.map_err(backend_err)?;
        if fields.is_empty() {
            return Ok(None);
        }

        let status = fields
            .get("status")
            .and_then(|s| TaskStatus::parse(s))
            .ok_or_else(|| StoreError::Backend(format!("bad status for task {task_id}")))?;
        let owner = fields
            .get("owner")
            .and_then(|s| NodeId::from_hex(s))
            .ok_or_else(|| StoreError::Backend(format!("bad owner for task {task_id}")))?;
        let spec = fields
            .get("spec")
            .map(|s| TaskSpec::from_bytes(s.as_bytes()))
            .transpose()
            .map_err(|err| StoreError::Backend(format!("bad spec for task {task_id}: {err}")))?
            .ok_or_else(|| StoreError::Backend(format!("missing spec for task {task_id}")))?;
        let updated_at = fields
            .get("updated_at")
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        Ok(Some(TaskTableEntry {
            task_id,
            spec,
            status,
            owner,
            updated_at,
        }))
    }
}

#[async_trait]
impl MetadataStore for RedisMetaStore {
    async fn task_add(&self, entry: TaskTableEntry) -> Result<(), StoreError> {
        let spec_json = String::from_utf8(entry.spec.to_bytes())
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let mut conn = self.conn.clone();
        let applied: i64 = self
            .add_script
            .key(task_key(entry.task_id))
            .arg(entry.status.as_str())
            .arg(entry.owner.to_string())
            .arg(spec_json)
            .arg(entry.updated_at)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)?;
        if applied == 1 {
            self.publish(&entry).await?;
        }
        Ok(())
    }

    async fn task_update(
        &self,
        task_id: TaskId,
        expected: &[TaskStatus],
        new: TaskStatus,
    ) -> Result<bool, StoreError> {
        let mut invocation = self.cas_script.key(task_key(task_id));
        invocation.arg(new.as_str()).arg(Utc::now().timestamp());
        for status in expected {
            invocation.arg(status.as_str());
        }
        let mut conn = self.conn.clone();
        let applied: i64 = invocation.invoke_async(&mut conn).await.map_err(backend_err)?;
        if applied != 1 {
            return Ok(false);
        }

        match self.read_entry(task_id).await? {
            Some(entry) => self.publish(&entry).await?,
            None => debug!(%task_id, "entry vanished between CAS and publish"),
        }
        Ok(true)
    }

    async fn task_get(&self, task_id: TaskId) -> Result<Option<TaskTableEntry>, StoreError> {
        self.read_entry(task_id).await
    }

    async fn object_add(
        &self,
        oid: ObjectId,
        node: NodeId,
        size: u64,
        hash: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(object_key(oid), node.to_string())
            .await
            .map_err(backend_err)?;
        conn.hset_multiple::<_, _, _, ()>(
            format!("OBJECT_INFO:{oid}"),
            &[("size", size), ("hash", hash)],
        )
        .await
        .map_err(backend_err)
    }

    async fn object_remove(&self, oid: ObjectId, node: NodeId) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(object_key(oid), node.to_string())
            .await
            .map_err(backend_err)
    }

    async fn object_lookup(&self, oid: ObjectId) -> Result<Vec<NodeId>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(object_key(oid)).await.map_err(backend_err)?;
        Ok(members
            .iter()
            .filter_map(|raw| NodeId::from_hex(raw))
            .collect())
    }

    async fn subscribe(
        &self,
        node: NodeId,
    ) -> Result<mpsc::UnboundedReceiver<TaskTableEntry>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let channel = node_channel(node);

        tokio::spawn(async move {
            loop {
                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(pubsub) => pubsub,
                    Err(err) => {
                        warn!(error = %err, "task table subscription connect failed");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                };
                if let Err(err) = pubsub.subscribe(&channel).await {
                    warn!(error = %err, "task table subscribe failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }

                let mut messages = pubsub.on_message();
                while let Some(message) = messages.next().await {
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(err) => {
                            warn!(error = %err, "unreadable task table notification");
                            continue;
                        }
                    };
                    match serde_json::from_str::<TaskTableEntry>(&payload) {
                        Ok(entry) => {
                            if tx.send(entry).is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "malformed task table notification")
                        }
                    }
                }
                warn!("task table subscription dropped; reconnecting");
            }
        });

        Ok(rx)
    }
}
