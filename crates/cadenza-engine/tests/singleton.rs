mod common;

use std::sync::Arc;

use cadenza_engine::{instance, EngineError};
use common::test_config;

// the slot is process-wide, so the whole lifecycle lives in one test
#[test]
fn instance_lifecycle() {
    assert!(instance::get().is_none());
    assert!(!instance::destroy());

    let engine = instance::create(test_config()).unwrap();
    assert!(Arc::ptr_eq(&engine, &instance::get().unwrap()));
    assert!(matches!(
        instance::create(test_config()),
        Err(EngineError::AlreadyCreated)
    ));

    engine.discover_builtin().unwrap();
    engine.select("dummy", "", "speed=8").unwrap();
    engine.start(false).unwrap();

    assert!(instance::destroy());
    assert!(!engine.running());
    assert!(engine.current_backend().is_none());
    assert!(instance::get().is_none());

    let again = instance::create(test_config()).unwrap();
    assert!(!Arc::ptr_eq(&engine, &again));
    assert!(instance::destroy());
}
