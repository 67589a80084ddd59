use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rdkafka::producer::{FutureProducer, FutureRecord};

use shared::{Error, Result, Task};

/// At-least-once dispatch into the broker. Handlers must tolerate
/// replay; ordering is only guaranteed per task key.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: Task) -> Result<()>;
}

pub struct KafkaTaskQueue {
    producer: FutureProducer,
    topic: String,
}

impl KafkaTaskQueue {
    pub fn new(producer: FutureProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl TaskQueue for KafkaTaskQueue {
    async fn enqueue(&self, task: Task) -> Result<()> {
        let json = serde_json::to_string(&task).map_err(|e| Error::Internal(e.into()))?;
        let key = task.payload.key();
        let record = FutureRecord::to(&self.topic).payload(&json).key(&key);
        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| Error::external(format!("failed to enqueue task: {e}")))?;
        Ok(())
    }
}

/// Broker stand-in for tests and the `--memory-backend` profile. Tests
/// drain it explicitly so retries stay deterministic.
#[derive(Default)]
pub struct MemoryTaskQueue {
    tasks: Mutex<VecDeque<Task>>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pops the oldest task whose `not_before` has passed. Held-back
    /// retries stay buffered without blocking tasks behind them.
    pub fn pop(&self) -> Option<Task> {
        let mut tasks = self.tasks.lock().ok()?;
        let now = Utc::now();
        let position = tasks.iter().position(|t| t.is_due(now))?;
        tasks.remove(position)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, task: Task) -> Result<()> {
        self.tasks
            .lock()
            .map_err(|_| Error::Internal(anyhow::anyhow!("queue state poisoned")))?
            .push_back(task);
        Ok(())
    }
}
