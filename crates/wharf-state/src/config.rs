use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StateConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub lock: LockConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum QueueConfig {
    #[default]
    Memory,
    #[cfg(feature = "postgres")]
    Postgres {
        url: String,
        #[serde(default = "default_queue_table")]
        table: String,
    },
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum LockConfig {
    #[default]
    Memory,
}

#[cfg(feature = "postgres")]
fn default_queue_table() -> String {
    "wharf_queue".to_owned()
}
