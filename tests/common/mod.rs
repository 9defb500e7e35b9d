use std::collections::HashMap;
use std::path::PathBuf;

use sqlsession::{CallerId, ConnectionSettings, ExecMode, SqlContext};
use tempfile::TempDir;

/// A context whose pool targets a database file inside a temp dir
pub struct TestContext {
    pub context: SqlContext,
    pub dir: TempDir,
}

impl TestContext {
    #[allow(dead_code)]
    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("session.db")
    }

    /// Settings for an explicit connection to the same database file
    #[allow(dead_code)]
    pub fn explicit_settings(&self) -> ConnectionSettings {
        ConnectionSettings::sqlite(self.db_path().display().to_string())
    }
}

pub fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Pooled context with `items(id, name, price)` seeded with three rows
pub async fn setup_pooled(
    partitions: usize,
    max_connections: usize,
    timeout_seconds: u64,
    autodisconnect: bool,
) -> TestContext {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let dir = tempfile::tempdir().unwrap();
    let database = dir.path().join("session.db").display().to_string();
    let partitions = partitions.to_string();
    let max_connections = max_connections.to_string();
    let timeout_seconds = timeout_seconds.to_string();
    let context = SqlContext::new();
    context
        .configure(
            "connectionpool",
            &values(&[
                ("partitions", partitions.as_str()),
                ("max-connections", max_connections.as_str()),
                ("timeout", timeout_seconds.as_str()),
            ]),
        )
        .unwrap();
    context
        .configure(
            "defaultconnection",
            &values(&[
                ("brand", "sqlite"),
                ("database", database.as_str()),
                ("autodisconnect", if autodisconnect { "on" } else { "off" }),
            ]),
        )
        .unwrap();

    let setup = CallerId::from("setup");
    context
        .execute(
            &setup,
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL, price REAL)",
            vec![],
            ExecMode::Direct,
        )
        .await
        .unwrap();
    context
        .execute(
            &setup,
            "INSERT INTO items (name, price) VALUES ('apple', 1.5), ('pear', 2.25), ('plum', 0.75)",
            vec![],
            ExecMode::Direct,
        )
        .await
        .unwrap();
    context.disconnect(&setup).await;

    TestContext { context, dir }
}
