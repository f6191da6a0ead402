//! # Events
//!
//! The unit delivered to `Module::on_event`, either by the interval scheduler
//! (`TIMER` on topic `cron`) or by a publisher on the topic bus.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EVENT_TIMER: &str = "TIMER";
pub const TOPIC_CRON: &str = "cron";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Local>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, topic: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            topic: topic.into(),
            payload,
            timestamp: Local::now(),
        }
    }

    /// The tick an interval job delivers.
    pub fn timer() -> Self {
        Self::new(EVENT_TIMER, TOPIC_CRON, Value::Null)
    }

    pub fn is_timer(&self) -> bool {
        self.event_type == EVENT_TIMER
    }
}
