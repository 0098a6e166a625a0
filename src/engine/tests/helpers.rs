use std::collections::HashMap;
use std::time::Duration;

use crate::engine::{Engine, TableConfig};
use crate::schema::{Field, FieldType, Schema, Value};
use crate::wal::WalFlushPolicy;

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Schema used by most engine tests: required `id`/`name`, indexed
/// `category`, nullable `email`/`phone`/`age`.
pub fn test_schema() -> Schema {
    Schema::new(vec![
        Field::new("id", FieldType::Uint64),
        Field::new("name", FieldType::String),
        Field::new("category", FieldType::String).indexed(),
        Field::new("email", FieldType::String).nullable(),
        Field::new("phone", FieldType::String).nullable(),
        Field::new("age", FieldType::Int32).nullable(),
    ])
    .unwrap()
}

/// Config with background compaction effectively disabled so tests
/// drive flush/compaction deterministically.
pub fn quiet_config() -> TableConfig {
    TableConfig {
        wal_flush_policy: WalFlushPolicy::Always,
        compaction_interval: Duration::from_secs(3600),
        ..TableConfig::default()
    }
}

pub fn open_engine(dir: &std::path::Path) -> Engine {
    init_tracing();
    Engine::open(dir, test_schema(), quiet_config()).unwrap()
}

/// Minimal valid row for the test schema.
pub fn row_values(id: u64, category: &str) -> HashMap<String, Value> {
    let mut values = HashMap::new();
    values.insert("id".to_string(), Value::Uint64(id));
    values.insert("name".to_string(), Value::String(format!("name-{id}")));
    values.insert("category".to_string(), Value::String(category.to_string()));
    values
}
