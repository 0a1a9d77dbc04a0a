/*!
Builders for stream messages and resource readings used in tests
*/

use chrono::Utc;
use serde_json::{json, Map, Value};
use symbion_throttle::consumer::StreamMessage;
use symbion_throttle::sampler::ResourceReading;

pub fn reading(unit_id: u32, utilization_percent: f64, occupied_capacity_percent: f64) -> ResourceReading {
    ResourceReading {
        unit_id,
        utilization_percent,
        occupied_capacity_percent,
    }
}

/// A job message with only an id and a timestamp
pub fn job_message(topic: &str, job_id: &str) -> StreamMessage {
    JobMessageBuilder::new(topic).job_id(job_id).build()
}

/// JSON job payloads, shaped like what producers put on the jobs topic
pub struct JobMessageBuilder {
    topic: String,
    payload: Map<String, Value>,
}

impl JobMessageBuilder {
    pub fn new(topic: &str) -> Self {
        let mut payload = Map::new();
        payload.insert("job_id".to_string(), json!(uuid::Uuid::new_v4().to_string()));
        Self {
            topic: topic.to_string(),
            payload,
        }
    }

    pub fn job_id(mut self, job_id: &str) -> Self {
        self.payload.insert("job_id".to_string(), json!(job_id));
        self
    }

    pub fn field(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    pub fn build(mut self) -> StreamMessage {
        self.payload
            .entry("submitted_at".to_string())
            .or_insert_with(|| json!(Utc::now().to_rfc3339()));
        StreamMessage {
            topic: self.topic,
            payload: Value::Object(self.payload).to_string().into_bytes(),
        }
    }

    /// `count` messages with ids `{prefix}-1..={prefix}-{count}`
    pub fn batch(topic: &str, prefix: &str, count: usize) -> Vec<StreamMessage> {
        (1..=count)
            .map(|n| Self::new(topic).job_id(&format!("{prefix}-{n}")).build())
            .collect()
    }
}
