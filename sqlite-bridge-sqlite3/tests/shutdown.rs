use std::sync::{Arc, Mutex};

use sqlite_bridge::codes::{SQLITE_MISUSE, SQLITE_OK};
use sqlite_bridge::{AutoExtension, Bridge, LogFn, OutDb, OutStmt, Sqlite3Api, ThreadingMode};
use sqlite_bridge_sqlite3::LibSqlite3;

// Process-wide engine state; kept in its own test binary and a single test.
#[test]
fn configure_then_shut_down() {
    let Some(api) = LibSqlite3::load() else { return };
    let bridge = Bridge::new(api);

    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&messages);
    let handler: Arc<LogFn> = Arc::new(move |code: i32, msg: &str| {
        sink.lock().unwrap().push((code, msg.to_owned()));
    });
    assert_eq!(bridge.config_log(Some(handler)), SQLITE_OK);
    if api.threadsafe() != 0 {
        assert_eq!(bridge.config_threading(ThreadingMode::Serialized), SQLITE_OK);
    }
    assert_eq!(bridge.initialize(), SQLITE_OK);
    assert_eq!(bridge.libversion().major, 3);

    bridge.auto_extension(AutoExtension::new(|_: &Bridge<LibSqlite3>, _| Ok(())));
    let mut out = OutDb::new();
    assert_eq!(bridge.open(":memory:", &mut out), SQLITE_OK);
    let db = out.take().unwrap();
    let mut stmt = OutStmt::new();
    assert_eq!(bridge.prepare(db, "SELECT 1", &mut stmt, None), SQLITE_OK);
    let stmt = stmt.take().unwrap();
    bridge.commit_hook(db, || Ok(false));

    // A prepare error is reported to the log handler as well.
    let mut failed = OutStmt::new();
    assert_ne!(bridge.prepare(db, "SELECT * FROM missing_table", &mut failed, None), SQLITE_OK);
    assert!(
        messages
            .lock()
            .unwrap()
            .iter()
            .any(|(_, msg)| msg.contains("missing_table"))
    );

    assert_eq!(bridge.shutdown(), SQLITE_OK);
    assert_eq!(bridge.connection_count(), 0);
    assert_eq!(bridge.statement_count(), 0);
    assert!(bridge.threads().is_empty());
    assert_eq!(bridge.step(stmt), SQLITE_MISUSE);
    assert_eq!(bridge.close(db), SQLITE_MISUSE);

    assert_eq!(bridge.initialize(), SQLITE_OK);
    let mut out = OutDb::new();
    assert_eq!(bridge.open(":memory:", &mut out), SQLITE_OK);
    assert_eq!(bridge.connection_count(), 1);
    assert_eq!(bridge.shutdown(), SQLITE_OK);
}
