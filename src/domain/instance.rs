use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const INSTANCE_INFIX: &str = "-inst-";

/// Deterministic identifier of the `index`-th instance of a group.
pub fn instance_id(group_id: &str, index: u32) -> String {
    format!("{}{}{}", group_id, INSTANCE_INFIX, index)
}

/// True when `instance_id` is `group_id` itself or starts with `group_id-`.
pub fn belongs_to_group(instance_id: &str, group_id: &str) -> bool {
    match instance_id.strip_prefix(group_id) {
        Some("") => true,
        Some(rest) => rest.starts_with('-'),
        None => false,
    }
}

/// Trims names, drops blanks and repeated topics. First occurrence wins.
pub fn normalize_topics(topics: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(topics.len());
    for topic in topics.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
        if !out.iter().any(|t| t == topic) {
            out.push(topic.to_string());
        }
    }
    out
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Active,
    Inactive,
    Error,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Active => "active",
            InstanceStatus::Inactive => "inactive",
            InstanceStatus::Error => "error",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(InstanceStatus::Active),
            "inactive" => Ok(InstanceStatus::Inactive),
            "error" => Ok(InstanceStatus::Error),
            other => Err(format!("unknown instance status '{}'", other)),
        }
    }
}

/// Durable record of one consumer instance.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInstance {
    pub id: String,
    pub group_id: String,
    pub topics: Vec<String>,
    pub status: InstanceStatus,
    pub should_stop: bool,
    pub pid: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConsumerInstance {
    pub fn new(
        id: &str,
        group_id: &str,
        topics: &[String],
        status: InstanceStatus,
        pid: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.to_string(),
            group_id: group_id.to_string(),
            topics: topics.to_vec(),
            status,
            should_stop: false,
            pid,
            last_heartbeat: now,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn primary_topic(&self) -> Option<&str> {
        self.topics.first().map(String::as_str)
    }

    pub fn topics_joined(&self) -> String {
        self.topics.join(",")
    }

    pub fn split_topics(joined: &str) -> Vec<String> {
        joined
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }
}
