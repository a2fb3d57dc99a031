use super::*;
use serde_json::json;
use tempfile::tempdir;

#[test]
fn test_logger_creation() {
    let temp_dir = tempdir().unwrap();
    let log_path = temp_dir.path().join("test.md");

    let logger = Logger::new(Some(&log_path), Some("debug")).unwrap();
    assert_eq!(logger.log_file(), &log_path);
    assert_eq!(logger.log_level(), "DEBUG");
}

#[test]
fn test_log_file_creation() {
    let temp_dir = tempdir().unwrap();
    let log_path = temp_dir.path().join("logs").join("test.md");

    let _logger = Logger::new(Some(&log_path), None).unwrap();
    assert!(log_path.exists());

    let content = std::fs::read_to_string(&log_path).unwrap();
    assert!(content.contains("# Deck Run Journal"));
    assert!(content.contains("Log started:"));
}

#[test]
fn test_run_sections() {
    let temp_dir = tempdir().unwrap();
    let log_path = temp_dir.path().join("test.md");
    let logger = Logger::new(Some(&log_path), None).unwrap();

    logger.log_run_start("run-1", "decks/triage.json", "sort these").unwrap();
    logger
        .log_tool_execution("lookup", r#"{"id":7}"#, r#"{"found":true}"#, true)
        .unwrap();
    logger.log_handler("onBusy", "still working (800ms)").unwrap();
    logger.log_completion("run-1", "responded", 2).unwrap();

    let content = std::fs::read_to_string(&log_path).unwrap();
    assert!(content.contains("## Run Started"));
    assert!(content.contains("**Deck:** decks/triage.json"));
    assert!(content.contains("**Tool:** lookup"));
    assert!(content.contains("### Handler onBusy"));
    assert!(content.contains("**Status:** responded"));
    assert!(content.contains("**Passes:** 2"));
}

#[test]
fn test_model_call_history_depends_on_level() {
    let temp_dir = tempdir().unwrap();
    let history = vec![json!({"role": "user", "content": "Test message"})];

    let info_path = temp_dir.path().join("info.md");
    let logger = Logger::new(Some(&info_path), None).unwrap();
    logger.log_model_call("run-1", 1, &history, "gpt-4o").unwrap();
    let content = std::fs::read_to_string(&info_path).unwrap();
    assert!(content.contains("**History:** 1 entries"));
    assert!(!content.contains("```json"));

    let debug_path = temp_dir.path().join("debug.md");
    let logger = Logger::new(Some(&debug_path), Some("DEBUG")).unwrap();
    logger.log_model_call("run-1", 1, &history, "gpt-4o").unwrap();
    let content = std::fs::read_to_string(&debug_path).unwrap();
    assert!(content.contains("```json"));
    assert!(content.contains("\"role\": \"user\""));
}

#[test]
fn test_empty_model_response_is_skipped() {
    let temp_dir = tempdir().unwrap();
    let log_path = temp_dir.path().join("test.md");
    let logger = Logger::new(Some(&log_path), None).unwrap();

    logger.log_model_response(Some("   "), &[], "m").unwrap();
    let content = std::fs::read_to_string(&log_path).unwrap();
    assert!(!content.contains("Model Response"));

    logger
        .log_model_response(None, &["lookup".to_string()], "m")
        .unwrap();
    let content = std::fs::read_to_string(&log_path).unwrap();
    assert!(content.contains("**Tool calls:** lookup"));
}

#[test]
fn test_error_with_context() {
    let temp_dir = tempdir().unwrap();
    let log_path = temp_dir.path().join("test.md");
    let logger = Logger::new(Some(&log_path), None).unwrap();

    let mut context = HashMap::new();
    context.insert("action".to_string(), json!("lookup"));
    logger.log_error("child failed", Some(&context)).unwrap();
    logger.log_custom("Note", "resumed", Some("WARN")).unwrap();

    let content = std::fs::read_to_string(&log_path).unwrap();
    assert!(content.contains("**Error:** child failed"));
    assert!(content.contains("\"action\": \"lookup\""));
    assert!(content.contains("### Note"));
}
