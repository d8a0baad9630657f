//! Unit tests for storage types.
//!
//! Covers the chain link column encoding, id formatting and serialization,
//! and the canonical timestamp format used for identity lookups.

use super::*;
use chrono::TimeZone;
use serde_json::json;

// ============================================================================
// ChainLink tests
// ============================================================================

#[test]
fn test_chain_link_terminal_column() {
    assert_eq!(ChainLink::from_column(-1), Some(ChainLink::Terminal));
    assert_eq!(ChainLink::Terminal.to_column(), TERMINAL_SENTINEL);
    assert!(ChainLink::Terminal.is_terminal());
}

#[test]
fn test_chain_link_next_column() {
    let link = ChainLink::from_column(42).unwrap();
    assert_eq!(link, ChainLink::Next(ChainNodeId(42)));
    assert_eq!(link.to_column(), 42);
    assert!(!link.is_terminal());
}

#[test]
fn test_chain_link_rejects_invalid_values() {
    assert_eq!(ChainLink::from_column(0), None);
    assert_eq!(ChainLink::from_column(-2), None);
}

#[test]
fn test_chain_link_serialization() {
    assert_eq!(
        serde_json::to_value(ChainLink::Next(ChainNodeId(7))).unwrap(),
        json!({"next": 7})
    );
    assert_eq!(
        serde_json::to_value(ChainLink::Terminal).unwrap(),
        json!("terminal")
    );
}

// ============================================================================
// Id tests
// ============================================================================

#[test]
fn test_ids_display_as_integers() {
    assert_eq!(ConditionAtomId(3).to_string(), "3");
    assert_eq!(FunctionCallId(1234).to_string(), "1234");
}

#[test]
fn test_ids_serialize_transparently() {
    assert_eq!(serde_json::to_value(VerdictId(9)).unwrap(), json!(9));
    let id: InstrumentationPointId = serde_json::from_value(json!(5)).unwrap();
    assert_eq!(id, InstrumentationPointId(5));
}

#[test]
fn test_root_condition_is_first_row() {
    assert_eq!(ROOT_CONDITION, ConditionAtomId(1));
}

#[test]
fn test_chain_node_serialization() {
    let node = ChainNode {
        id: ChainNodeId(2),
        condition_atom: ROOT_CONDITION,
        next: ChainLink::Terminal,
        function_call: FunctionCallId(1),
        depth: 0,
    };
    let value = serde_json::to_value(&node).unwrap();
    assert_eq!(value["condition_atom"], json!(1));
    assert_eq!(value["next"], json!("terminal"));

    let back: ChainNode = serde_json::from_value(value).unwrap();
    assert_eq!(back, node);
}

// ============================================================================
// Timestamp tests
// ============================================================================

#[test]
fn test_format_timestamp_is_stable() {
    let time = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
    assert_eq!(format_timestamp(&time), "2024-05-01T10:00:00Z");
}

#[test]
fn test_format_timestamp_keeps_subseconds() {
    let time = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        + chrono::Duration::milliseconds(250);
    let text = format_timestamp(&time);
    assert_eq!(text, "2024-05-01T10:00:00.250Z");
    assert_eq!(parse_timestamp(&text), time);
}

#[test]
fn test_parse_timestamp_falls_back_to_epoch() {
    assert_eq!(parse_timestamp("not a time"), DateTime::<Utc>::UNIX_EPOCH);
}
