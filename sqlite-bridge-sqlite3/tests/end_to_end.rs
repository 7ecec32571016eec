use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use sqlite_bridge::codes::{SQLITE_AUTH, SQLITE_DONE, SQLITE_ERROR, SQLITE_OK, SQLITE_ROW};
use sqlite_bridge::{
    Authorization, AuthorizerAction, AutoExtension, Bridge, DbHandle, Error, FeatureSet,
    FunctionFlags, HostObject, OutDb, OutStmt, OutTail, Sqlite3Api, StmtHandle, TraceEvent,
    TraceMask, UpdateOp, Value, ValueType, WindowFns,
};
use sqlite_bridge_sqlite3::LibSqlite3;
use tracing_subscriber::EnvFilter;

fn bridge() -> Option<Arc<Bridge<LibSqlite3>>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    LibSqlite3::load().map(Bridge::new)
}

fn open_memory(bridge: &Bridge<LibSqlite3>) -> DbHandle {
    let mut out = OutDb::new();
    assert_eq!(bridge.open(":memory:", &mut out), SQLITE_OK);
    out.take().unwrap()
}

fn prepare(bridge: &Bridge<LibSqlite3>, db: DbHandle, sql: &str) -> StmtHandle {
    let mut out = OutStmt::new();
    let rc = bridge.prepare(db, sql, &mut out, None);
    assert_eq!(rc, SQLITE_OK, "{sql}: {}", bridge.errmsg(db));
    out.take().unwrap()
}

/// Run every statement in `sql`, discarding rows.
fn exec(bridge: &Bridge<LibSqlite3>, db: DbHandle, sql: &str) -> i32 {
    let mut rest = sql.as_bytes();
    while !rest.iter().all(|b| b.is_ascii_whitespace()) {
        let mut stmt = OutStmt::new();
        let mut tail = OutTail::new();
        let rc = bridge.prepare_bytes(db, rest, &mut stmt, Some(&mut tail));
        if rc != SQLITE_OK {
            return rc;
        }
        if let Some(stmt) = stmt.take() {
            let rc = loop {
                match bridge.step(stmt) {
                    SQLITE_ROW => continue,
                    rc => break rc,
                }
            };
            bridge.finalize(stmt);
            if rc != SQLITE_DONE {
                return rc;
            }
        }
        match tail.take() {
            Some(consumed) if consumed > 0 => rest = &rest[consumed..],
            _ => break,
        }
    }
    SQLITE_OK
}

fn query_one(bridge: &Bridge<LibSqlite3>, db: DbHandle, sql: &str) -> Value {
    let stmt = prepare(bridge, db, sql);
    assert_eq!(bridge.step(stmt), SQLITE_ROW, "{sql}: {}", bridge.errmsg(db));
    let value = bridge.column_value(stmt, 0);
    assert_eq!(bridge.finalize(stmt), SQLITE_OK);
    value
}

#[test]
fn create_insert_select_round_trip() {
    let Some(bridge) = bridge() else { return };
    let db = open_memory(&bridge);

    let create = prepare(&bridge, db, "CREATE TABLE t(x INTEGER)");
    assert_eq!(bridge.step(create), SQLITE_DONE);
    assert_eq!(bridge.finalize(create), SQLITE_OK);

    let insert = prepare(&bridge, db, "INSERT INTO t VALUES(?)");
    assert_eq!(bridge.bind_parameter_count(insert), 1);
    assert_eq!(bridge.bind_int(insert, 1, 42), SQLITE_OK);
    assert_eq!(bridge.step(insert), SQLITE_DONE);
    assert_eq!(bridge.finalize(insert), SQLITE_OK);
    assert_eq!(bridge.changes(db), 1);
    assert_eq!(bridge.last_insert_rowid(db), 1);

    let select = prepare(&bridge, db, "SELECT x FROM t");
    assert_eq!(bridge.column_name(select, 0).as_deref(), Some("x"));
    assert_eq!(bridge.step(select), SQLITE_ROW);
    assert_eq!(bridge.column_int(select, 0), 42);
    assert_eq!(bridge.column_type(select, 0), ValueType::Integer);
    assert_eq!(bridge.step(select), SQLITE_DONE);
    assert_eq!(bridge.finalize(select), SQLITE_OK);

    assert_eq!(bridge.close(db), SQLITE_OK);
    assert_eq!(bridge.finalize(select), sqlite_bridge::codes::SQLITE_MISUSE);
}

#[test]
fn text_round_trips_in_both_encodings() {
    let Some(bridge) = bridge() else { return };
    let db = open_memory(&bridge);
    let text = "héllo wörld 𝄞";

    let stmt = prepare(&bridge, db, "SELECT ?, ?");
    assert_eq!(bridge.bind_text(stmt, 1, text), SQLITE_OK);
    if bridge.api().feature_set().contains(FeatureSet::UTF16) {
        assert_eq!(bridge.bind_text16(stmt, 2, text), SQLITE_OK);
    } else {
        assert_eq!(bridge.bind_text(stmt, 2, text), SQLITE_OK);
    }
    assert_eq!(bridge.step(stmt), SQLITE_ROW);
    for col in 0..2 {
        assert_eq!(bridge.column_text(stmt, col).as_deref(), Some(text));
        assert_eq!(bridge.column_text16(stmt, col).as_deref(), Some(text));
        assert_eq!(bridge.column_bytes(stmt, col), text.len() as i32);
    }
    assert_eq!(bridge.finalize(stmt), SQLITE_OK);

    assert_eq!(query_one(&bridge, db, "SELECT ''"), Value::Text(String::new()));
    assert_eq!(query_one(&bridge, db, "SELECT NULL"), Value::Null);
}

#[test]
fn invalid_utf8_names_decode_like_column_text() {
    let Some(bridge) = bridge() else { return };
    let db = open_memory(&bridge);

    let mut create = OutStmt::new();
    let sql = b"CREATE TABLE \"a\xc0\x80b\"(x)";
    assert_eq!(bridge.prepare_bytes(db, sql, &mut create, None), SQLITE_OK);
    let create = create.take().unwrap();
    assert_eq!(bridge.step(create), SQLITE_DONE);
    assert_eq!(bridge.finalize(create), SQLITE_OK);

    let tables = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&tables);
    bridge.update_hook(db, move |event| {
        sink.lock().unwrap().push(event.table.to_owned());
        Ok(())
    });
    let mut insert = OutStmt::new();
    let sql = b"INSERT INTO \"a\xc0\x80b\" VALUES(1)";
    assert_eq!(bridge.prepare_bytes(db, sql, &mut insert, None), SQLITE_OK);
    let insert = insert.take().unwrap();
    assert_eq!(bridge.step(insert), SQLITE_DONE);
    assert_eq!(bridge.finalize(insert), SQLITE_OK);

    let stmt = prepare(&bridge, db, "SELECT CAST(x'61C08062' AS TEXT)");
    assert_eq!(bridge.step(stmt), SQLITE_ROW);
    let column = bridge.column_text(stmt, 0);
    assert_eq!(bridge.finalize(stmt), SQLITE_OK);

    let tables = tables.lock().unwrap();
    assert_eq!(tables.len(), 1);
    assert_eq!(Some(tables[0].as_str()), column.as_deref());
    assert!(!tables[0].contains('\0'));
}

#[test]
fn prepare_tail_and_errors() {
    let Some(bridge) = bridge() else { return };
    let db = open_memory(&bridge);

    let mut stmt = OutStmt::new();
    let mut tail = OutTail::new();
    assert_eq!(bridge.prepare(db, "SELECT 1; SELECT 2", &mut stmt, Some(&mut tail)), SQLITE_OK);
    assert_eq!(tail.take(), Some(9));
    bridge.finalize(stmt.take().unwrap());

    assert_eq!(bridge.prepare(db, "  -- only a comment", &mut stmt, None), SQLITE_OK);
    assert!(!stmt.is_set());

    assert_eq!(bridge.prepare(db, "SELEC 1", &mut stmt, None), SQLITE_ERROR);
    assert!(!stmt.is_set());
    assert!(bridge.errmsg(db).contains("syntax error"), "{}", bridge.errmsg(db));
    assert_eq!(bridge.errcode(db), SQLITE_ERROR);
}

#[test]
fn failing_function_surfaces_as_statement_error() {
    let Some(bridge) = bridge() else { return };
    let db = open_memory(&bridge);
    let rc = bridge.create_function(db, "refuse", 0, FunctionFlags::empty(), |_| {
        Err(Error::user("refused by handler"))
    });
    assert_eq!(rc, SQLITE_OK);

    let stmt = prepare(&bridge, db, "SELECT refuse()");
    assert_eq!(bridge.step(stmt), SQLITE_ERROR);
    assert_eq!(bridge.errmsg(db), "refused by handler");
    assert_eq!(bridge.last_callback_error(db).as_deref(), Some("refused by handler"));
    bridge.finalize(stmt);
}

#[test]
fn scalar_and_aggregate_functions() {
    let Some(bridge) = bridge() else { return };
    let db = open_memory(&bridge);
    bridge.create_function(db, "half", 1, FunctionFlags::DETERMINISTIC, |call| {
        Ok(Value::Float(call.arg_f64(0) / 2.0))
    });
    bridge.create_aggregate(
        db,
        "product",
        1,
        FunctionFlags::empty(),
        || 1_i64,
        |acc: &mut i64, call| {
            *acc *= call.arg_i64(0);
            Ok(())
        },
        |acc, _| Ok(Value::Integer(acc)),
    );
    let setup = "CREATE TABLE n(v); INSERT INTO n VALUES (2), (3), (7);";
    assert_eq!(exec(&bridge, db, setup), SQLITE_OK);

    assert_eq!(query_one(&bridge, db, "SELECT half(9)"), Value::Float(4.5));
    assert_eq!(query_one(&bridge, db, "SELECT product(v) FROM n"), Value::Integer(42));
    assert_eq!(query_one(&bridge, db, "SELECT product(v) FROM n WHERE 0"), Value::Integer(1));
}

#[test]
fn window_function_over_sliding_frame() {
    let Some(bridge) = bridge() else { return };
    if !bridge.api().feature_set().contains(FeatureSet::WINDOW_FUNCTIONS) {
        return;
    }
    let db = open_memory(&bridge);
    let callbacks = WindowFns::<LibSqlite3>::typed(
        || 0_i64,
        |sum: &mut i64, call| {
            *sum += call.arg_i64(0);
            Ok(())
        },
        |sum: &mut i64, call| {
            *sum -= call.arg_i64(0);
            Ok(())
        },
        |sum: &i64, _| Ok(Value::Integer(*sum)),
        |sum, _| Ok(Value::Integer(sum)),
    );
    let rc = bridge.create_window_function(db, "wsum", 1, FunctionFlags::empty(), callbacks);
    assert_eq!(rc, SQLITE_OK);
    assert_eq!(
        exec(&bridge, db, "CREATE TABLE w(x); INSERT INTO w VALUES (1), (2), (3), (4);"),
        SQLITE_OK
    );

    let stmt = prepare(&bridge, db, "SELECT wsum(x) OVER (ORDER BY x ROWS 1 PRECEDING) FROM w");
    let mut sums = Vec::new();
    while bridge.step(stmt) == SQLITE_ROW {
        sums.push(bridge.column_value(stmt, 0));
    }
    assert_eq!(bridge.finalize(stmt), SQLITE_OK);
    assert_eq!(sums, [1, 3, 5, 7].map(Value::Integer));

    // Still usable as a plain aggregate.
    assert_eq!(query_one(&bridge, db, "SELECT wsum(x) FROM w"), Value::Integer(10));
}

#[test]
fn host_objects_reach_functions() {
    let Some(bridge) = bridge() else { return };
    if !bridge.api().feature_set().contains(FeatureSet::POINTER_PASSING) {
        return;
    }
    let db = open_memory(&bridge);
    bridge.create_function(db, "label", 1, FunctionFlags::empty(), |call| {
        let object = call.arg_object(0).ok_or_else(|| Error::user("expected a host object"))?;
        let label = object
            .downcast_ref::<String>()
            .ok_or_else(|| Error::user("unexpected host object type"))?;
        Ok(Value::Text(label.clone()))
    });

    let stmt = prepare(&bridge, db, "SELECT label(?), ? IS NULL");
    let object = HostObject::new("tagged".to_owned());
    assert_eq!(bridge.bind_object(stmt, 1, object.clone()), SQLITE_OK);
    assert_eq!(bridge.bind_object(stmt, 2, object), SQLITE_OK);
    assert_eq!(bridge.step(stmt), SQLITE_ROW, "{}", bridge.errmsg(db));
    assert_eq!(bridge.column_text(stmt, 0).as_deref(), Some("tagged"));
    assert_eq!(bridge.column_int(stmt, 1), 1);
    bridge.finalize(stmt);
}

#[test]
fn collation_orders_rows() {
    let Some(bridge) = bridge() else { return };
    let db = open_memory(&bridge);
    assert_eq!(bridge.create_collation(db, "Reverse", |a, b| b.cmp(a)), SQLITE_OK);
    let setup = "CREATE TABLE w(s TEXT); INSERT INTO w VALUES ('b'), ('c'), ('a');";
    assert_eq!(exec(&bridge, db, setup), SQLITE_OK);

    let stmt = prepare(&bridge, db, "SELECT s FROM w ORDER BY s COLLATE reverse");
    let mut seen = Vec::new();
    while bridge.step(stmt) == SQLITE_ROW {
        seen.push(bridge.column_text(stmt, 0).unwrap());
    }
    bridge.finalize(stmt);
    assert_eq!(seen, ["c", "b", "a"]);
}

#[test]
fn hooks_observe_changes_and_replacement_takes_over() {
    let Some(bridge) = bridge() else { return };
    let db = open_memory(&bridge);
    assert_eq!(exec(&bridge, db, "CREATE TABLE t(x)"), SQLITE_OK);

    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&first);
    bridge.commit_hook(db, move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(false)
    });
    assert_eq!(exec(&bridge, db, "INSERT INTO t VALUES (1)"), SQLITE_OK);
    let counter = Arc::clone(&second);
    bridge.commit_hook(db, move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(false)
    });
    assert_eq!(exec(&bridge, db, "INSERT INTO t VALUES (2)"), SQLITE_OK);
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);

    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&updates);
    bridge.update_hook(db, move |event| {
        sink.lock().unwrap().push((event.op, event.table.to_owned(), event.rowid));
        Ok(())
    });
    assert_eq!(exec(&bridge, db, "INSERT INTO t VALUES (3); DELETE FROM t WHERE x = 1"), SQLITE_OK);
    assert_eq!(
        updates.lock().unwrap().as_slice(),
        &[(UpdateOp::Insert, "t".to_owned(), 3), (UpdateOp::Delete, "t".to_owned(), 1)]
    );

    // A commit hook asking for rollback turns the commit into a constraint failure.
    bridge.commit_hook(db, || Ok(true));
    assert_ne!(exec(&bridge, db, "INSERT INTO t VALUES (4)"), SQLITE_OK);
    bridge.clear_callback(db, sqlite_bridge::CallbackSlot::Commit);
    assert_eq!(query_one(&bridge, db, "SELECT count(*) FROM t"), Value::Integer(2));
}

#[test]
fn authorizer_denies_and_trace_reports_statements() {
    let Some(bridge) = bridge() else { return };
    let db = open_memory(&bridge);
    assert_eq!(exec(&bridge, db, "CREATE TABLE t(x)"), SQLITE_OK);

    bridge.set_authorizer(db, |event| match event.action {
        AuthorizerAction::Delete => Ok(Authorization::Deny),
        _ => Ok(Authorization::Allow),
    });
    let mut stmt = OutStmt::new();
    assert_eq!(bridge.prepare(db, "DELETE FROM t", &mut stmt, None), SQLITE_AUTH);
    bridge.clear_callback(db, sqlite_bridge::CallbackSlot::Authorizer);

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    bridge.trace(db, TraceMask::STMT, move |event| {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    });
    let select = prepare(&bridge, db, "SELECT 7");
    assert_eq!(bridge.step(select), SQLITE_ROW);
    bridge.finalize(select);
    assert_eq!(
        events.lock().unwrap().as_slice(),
        &[TraceEvent::Stmt {
            stmt: Some(select),
            sql: "SELECT 7".to_owned()
        }]
    );
}

#[test]
fn auto_extensions_run_in_registration_order() {
    let Some(bridge) = bridge() else { return };
    let order = Arc::new(Mutex::new(Vec::new()));
    for tag in ["first", "second"] {
        let order = Arc::clone(&order);
        bridge.auto_extension(AutoExtension::new(move |bridge: &Bridge<LibSqlite3>, db| {
            order.lock().unwrap().push(tag);
            let rc = bridge.create_function(db, tag, 0, FunctionFlags::empty(), move |_| {
                Ok(Value::from(tag))
            });
            match rc {
                SQLITE_OK => Ok(()),
                rc => Err(Error::from_code(rc, None, None)),
            }
        }));
    }

    let db = open_memory(&bridge);
    assert_eq!(order.lock().unwrap().as_slice(), &["first", "second"]);
    assert_eq!(query_one(&bridge, db, "SELECT second()"), Value::Text("second".to_owned()));
}

#[test]
fn threads_clean_up_their_entries() {
    let Some(bridge) = bridge() else { return };
    let db = open_memory(&bridge);
    let worker = Arc::clone(&bridge);
    std::thread::spawn(move || {
        assert_eq!(query_one(&worker, db, "SELECT 1"), Value::Integer(1));
        assert!(worker.thread_cleanup());
        assert!(!worker.thread_cleanup());
    })
    .join()
    .unwrap();
    assert_eq!(bridge.threads().len(), 1);
    assert!(bridge.thread_cleanup());
    assert!(bridge.threads().is_empty());
}
