use super::*;

#[test]
fn test_engine_error_construction() {
    let err = EngineError::config("bad value");
    assert!(matches!(err, EngineError::Config { .. }));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(err.code(), ErrorCode::CONFIG_GENERIC);
    assert!(err.is_config());

    let err = EngineError::memory(ErrorCode::MEMORY_NOT_NUMERIC, "not a number", None);
    assert_eq!(err.exit_code(), 4);
    assert!(!err.is_config());

    let err = EngineError::internal("boom");
    assert_eq!(err.code(), ErrorCode::INTERNAL_GENERIC);
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn test_cycle_error_lists_members() {
    let err = EngineError::cycle(vec!["a".into(), "b".into(), "a".into()]);
    assert!(err.is_config());
    assert_eq!(err.code(), ErrorCode::CONFIG_CYCLE_DETECTED);
    assert!(err.to_string().contains("[E1010]"));
    assert!(err.to_string().contains("a -> b -> a"));
}

#[test]
fn test_error_context_and_source() {
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
    let err = EngineError::journal(ErrorCode::JOURNAL_SNAPSHOT_IO, "cannot read", None)
        .with_source(io_err)
        .with_context("while loading snapshot");

    assert!(err.to_string().contains("[E5001]"));
    assert!(err.to_string().contains("while loading snapshot"));
    assert!(std::error::Error::source(&err).is_some());
}

#[test]
fn test_unknown_routing_target_names_check() {
    let err = EngineError::unknown_routing_target("lint", "ghost");
    assert_eq!(err.code(), ErrorCode::CONFIG_UNKNOWN_ROUTING_TARGET);
    assert!(err.user_message().contains("'lint'"));
    assert!(err.user_message().contains("ghost"));
}

#[test]
fn test_describe_error_code() {
    assert_eq!(
        describe_error_code(ErrorCode::CONFIG_CYCLE_DETECTED),
        "Dependency cycle detected between checks"
    );
    assert_eq!(describe_error_code(4242), "Unknown error code");
}
