//! RFC 6902 patch generation

use json_patch::Patch;
use serde_json::Value;

/// Minimal JSON Patch turning `before` into `after`.
pub fn create_patch(before: &Value, after: &Value) -> Patch {
    if before == after {
        return Patch(Vec::new());
    }
    json_patch::diff(before, after)
}
