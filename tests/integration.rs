//! End-to-end tests driving the public API only.

use std::collections::HashMap;
use std::time::Duration;

use tempfile::TempDir;

use srdb::{Database, Field, FieldType, Schema, TableConfig, Value, WalFlushPolicy};

fn product_schema() -> Schema {
    Schema::new(vec![
        Field::new("sku", FieldType::Uint64),
        Field::new("name", FieldType::String),
        Field::new("category", FieldType::String).indexed(),
        Field::new("price", FieldType::Float64).nullable(),
        Field::new("discontinued", FieldType::Bool).nullable(),
    ])
    .unwrap()
}

fn product(sku: u64, category: &str, price: Option<f64>) -> HashMap<String, Value> {
    let mut values = HashMap::new();
    values.insert("sku".to_string(), Value::Uint64(sku));
    values.insert("name".to_string(), Value::String(format!("product-{sku}")));
    values.insert(
        "category".to_string(),
        Value::String(category.to_string()),
    );
    if let Some(p) = price {
        values.insert("price".to_string(), Value::Float64(p));
    }
    values
}

fn tight_config() -> TableConfig {
    TableConfig {
        memtable_max_bytes: 16 * 1024,
        wal_flush_policy: WalFlushPolicy::Always,
        compaction_interval: Duration::from_secs(3600),
        ..TableConfig::default()
    }
}

#[test]
fn test_full_lifecycle() {
    let tmp = TempDir::new().unwrap();

    // Phase 1: create, load, query.
    {
        let db = Database::open_with_config(tmp.path(), tight_config()).unwrap();
        let table = db.create_table("products", product_schema()).unwrap();

        for sku in 1..=1000u64 {
            let category = match sku % 4 {
                0 => "electronics",
                1 => "books",
                2 => "garden",
                _ => "toys",
            };
            let price = (sku % 10 != 0).then_some(sku as f64 * 1.5);
            table.insert(product(sku, category, price)).unwrap();
        }

        // Point reads from whatever layer currently holds the row.
        let row = table.get(500).unwrap();
        assert_eq!(row.get("sku"), Some(&Value::Uint64(500)));

        // Indexed query.
        let electronics = table
            .query()
            .filter_eq("category", Value::String("electronics".into()))
            .seqs()
            .unwrap();
        assert_eq!(electronics.len(), 250);

        // Predicate query: priceless rows are the sku % 10 == 0 ones.
        let priceless = table
            .query()
            .filter(|row| row.is_null("price"))
            .count()
            .unwrap();
        assert_eq!(priceless, 100);

        table.flush().unwrap();
        let stats = table.stats().unwrap();
        assert_eq!(stats.total_rows, 1000);
        assert!(stats.files_per_level[0] >= 1);

        db.close().unwrap();
    }

    // Phase 2: reopen, verify durability, keep writing.
    {
        let db = Database::open_with_config(tmp.path(), tight_config()).unwrap();
        let table = db.get_table("products").unwrap();
        assert_eq!(table.stats().unwrap().total_rows, 1000);

        let row = table.get(777).unwrap();
        assert_eq!(row.get("name"), Some(&Value::String("product-777".into())));

        let books = table
            .query()
            .filter_eq("category", Value::String("books".into()))
            .count()
            .unwrap();
        assert_eq!(books, 250);

        for sku in 1001..=1100u64 {
            table.insert(product(sku, "clearance", None)).unwrap();
        }
        let clearance = table
            .query()
            .filter_eq("category", Value::String("clearance".into()))
            .seqs()
            .unwrap();
        assert_eq!(clearance.len(), 100);
        assert_eq!(clearance[0], 1001);

        db.close().unwrap();
    }

    // Phase 3: reopen once more; everything is still there.
    {
        let db = Database::open_with_config(tmp.path(), tight_config()).unwrap();
        let table = db.get_table("products").unwrap();
        assert_eq!(table.stats().unwrap().total_rows, 1100);
        db.close().unwrap();
    }
}

#[test]
fn test_crash_recovery_without_flush() {
    let tmp = TempDir::new().unwrap();

    {
        let db = Database::open_with_config(tmp.path(), TableConfig {
            wal_flush_policy: WalFlushPolicy::Always,
            compaction_interval: Duration::from_secs(3600),
            ..TableConfig::default()
        })
        .unwrap();
        let table = db.create_table("events", product_schema()).unwrap();
        for sku in 1..=1000u64 {
            table.insert(product(sku, "event", None)).unwrap();
        }
        // Simulated crash: neither table.close() nor db.close() runs.
    }

    let db = Database::open(tmp.path()).unwrap();
    let table = db.get_table("events").unwrap();

    let stats = table.stats().unwrap();
    assert_eq!(stats.total_rows, 1000);
    assert!(
        stats.files_per_level.iter().all(|&n| n == 0),
        "recovery must come from the WAL, not from tables"
    );

    for seq in 1..=1000u64 {
        assert_eq!(table.get(seq).unwrap().seq, seq);
    }
    db.close().unwrap();
}

#[test]
fn test_multiple_tables_are_isolated() {
    let tmp = TempDir::new().unwrap();
    let db = Database::open(tmp.path()).unwrap();

    let a = db.create_table("a", product_schema()).unwrap();
    let b = db.create_table("b", product_schema()).unwrap();

    a.insert(product(1, "only-a", None)).unwrap();
    b.insert(product(2, "only-b", None)).unwrap();
    b.insert(product(3, "only-b", None)).unwrap();

    assert_eq!(a.stats().unwrap().total_rows, 1);
    assert_eq!(b.stats().unwrap().total_rows, 2);

    // Seq spaces are independent.
    assert_eq!(a.get(1).unwrap().get("sku"), Some(&Value::Uint64(1)));
    assert_eq!(b.get(1).unwrap().get("sku"), Some(&Value::Uint64(2)));

    assert_eq!(
        a.query()
            .filter_eq("category", Value::String("only-b".into()))
            .count()
            .unwrap(),
        0
    );

    db.close().unwrap();
}

#[test]
fn test_background_compaction_converges() {
    let tmp = TempDir::new().unwrap();
    let config = TableConfig {
        memtable_max_bytes: 4 * 1024,
        // Every flushed file is small; stage 0 keeps L0 tidy.
        l0_small_threshold: u64::MAX,
        compaction_interval: Duration::from_millis(50),
        wal_flush_policy: WalFlushPolicy::Batch,
        ..TableConfig::default()
    };

    let db = Database::open_with_config(tmp.path(), config).unwrap();
    let table = db.create_table("busy", product_schema()).unwrap();

    for sku in 1..=2000u64 {
        table.insert(product(sku, "busy", None)).unwrap();
    }
    table.flush().unwrap();

    // Give the background compactor a few ticks to coalesce L0.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let files: usize = table.stats().unwrap().files_per_level.iter().sum();
        if files <= 1 || std::time::Instant::now() > deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    let stats = table.stats().unwrap();
    assert_eq!(stats.total_rows, 2000);
    assert!(
        stats.files_per_level.iter().sum::<usize>() <= 1,
        "compactor should have coalesced L0, got {:?}",
        stats.files_per_level
    );

    // All data survived the churn.
    for seq in [1u64, 1000, 2000] {
        assert_eq!(table.get(seq).unwrap().seq, seq);
    }
    db.close().unwrap();
}
