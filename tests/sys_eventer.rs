//! Process-wide eventer tests
//!
//! The singleton is global state, so the whole lifecycle runs as one test.

use audit_eventer::{
    init_sys_eventer, sys, sys_eventer, EventError, EventType, Eventer, EventerConfig,
    InitOptions, SinkConfig, SysEvent,
};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn file_config(dir: &Path, file_name: &str) -> EventerConfig {
    EventerConfig {
        sinks: vec![SinkConfig::file(
            "all",
            vec![EventType::Every],
            dir.to_string_lossy().to_string(),
            file_name,
        )],
        ..Default::default()
    }
}

async fn line_count(path: &Path) -> usize {
    tokio::fs::read_to_string(path)
        .await
        .unwrap_or_default()
        .lines()
        .count()
}

#[tokio::test]
async fn test_sys_eventer_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = CancellationToken::new();

    // ─── Uninitialized ───────────────────────────────────────────
    assert!(sys_eventer().is_none());
    let err = sys::write_sys_event(&ctx, SysEvent::new("op")).await.unwrap_err();
    assert!(err.is_invalid_parameter());

    // ─── Bad options leave the singleton untouched ───────────────
    assert!(init_sys_eventer(InitOptions::new()).is_err());
    let bad = EventerConfig {
        audit_enabled: true,
        sinks: vec![SinkConfig::file(
            "errors",
            vec![EventType::Error],
            dir.path().to_string_lossy().to_string(),
            "errors.log",
        )],
        ..Default::default()
    };
    let err = init_sys_eventer(InitOptions::new().with_config(bad)).unwrap_err();
    assert!(matches!(err, EventError::InvalidParameter(_)));
    assert!(sys_eventer().is_none());

    // ─── Init from config ────────────────────────────────────────
    let first = init_sys_eventer(InitOptions::new().with_config(file_config(dir.path(), "first.log"))).unwrap();
    assert!(Arc::ptr_eq(&first, &sys_eventer().unwrap()));
    sys::write_sys_event(&ctx, SysEvent::new("server.Start")).await.unwrap();
    assert_eq!(line_count(&dir.path().join("first.log")).await, 1);

    // ─── Re-init from an eventer ─────────────────────────────────
    let second = Arc::new(Eventer::new(file_config(dir.path(), "second.log")).unwrap());
    init_sys_eventer(InitOptions::new().with_eventer(second.clone())).unwrap();
    assert!(Arc::ptr_eq(&second, &sys_eventer().unwrap()));

    sys::write_error(&ctx, audit_eventer::ErrorEvent::new("op", "boom")).await.unwrap();
    assert_eq!(line_count(&dir.path().join("second.log")).await, 1);

    // the replaced eventer still works for holders of the old reference
    first.write_sys_event(&ctx, SysEvent::new("server.Stop")).await.unwrap();
    assert_eq!(line_count(&dir.path().join("first.log")).await, 2);
    assert_eq!(line_count(&dir.path().join("second.log")).await, 1);
}
