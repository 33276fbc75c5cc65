//! Prefixed ID generation and UTC timestamps.
//!
//! Every persisted entity carries an id of the form `<prefix><uuid4-hex>`
//! (`run_`, `conf_`, `ord_`, `node_`, `evt_`, `snap_`, `batch_`, ...).

use chrono::{SecondsFormat, Utc};
use uuid::Uuid;

/// Generate a new id with the given prefix, e.g. `new_id("run_")`.
pub fn new_id(prefix: &str) -> String {
    format!("{}{}", prefix, Uuid::new_v4().simple())
}

/// Current UTC time as an ISO 8601 string with `Z` suffix.
///
/// Millisecond precision keeps event ordering stable within a run while
/// remaining lexically sortable.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_carries_prefix() {
        let id = new_id("run_");
        assert!(id.starts_with("run_"));
        assert_eq!(id.len(), "run_".len() + 32);
    }

    #[test]
    fn test_new_id_unique() {
        let a = new_id("conf_");
        let b = new_id("conf_");
        assert_ne!(a, b);
    }

    #[test]
    fn test_now_iso_is_utc_z() {
        let ts = now_iso();
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
    }

    #[test]
    fn test_now_iso_lexical_order() {
        let a = now_iso();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = now_iso();
        assert!(a <= b);
    }
}
