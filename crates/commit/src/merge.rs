//! JSON merge patch (RFC 7386) generation.

use serde_json::{Map, Value as Json};

/// Patch that turns `base` into `target` when merged, or `None` when they are equal.
///
/// Objects are walked key by key; keys missing from `target` become `null`. Arrays
/// and scalars are replaced wholesale, as merge patch has no element-level ops.
pub fn merge_patch(base: &Json, target: &Json) -> Option<Json> {
    if base == target {
        return None;
    }
    match (base, target) {
        (Json::Object(bo), Json::Object(to)) => {
            let mut out = Map::new();
            for (k, tv) in to.iter() {
                match bo.get(k) {
                    Some(bv) => {
                        if let Some(p) = merge_patch(bv, tv) {
                            out.insert(k.clone(), p);
                        }
                    }
                    None => {
                        out.insert(k.clone(), tv.clone());
                    }
                }
            }
            for k in bo.keys() {
                if !to.contains_key(k) {
                    out.insert(k.clone(), Json::Null);
                }
            }
            if out.is_empty() { None } else { Some(Json::Object(out)) }
        }
        (_, t) => Some(t.clone()),
    }
}

/// Set `metadata.<field>` on a patch object, creating `metadata` if needed.
pub(crate) fn set_metadata_field(patch: &mut Json, field: &str, value: &str) {
    let Some(obj) = patch.as_object_mut() else { return };
    let meta = obj.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
    if let Some(meta) = meta.as_object_mut() {
        meta.insert(field.to_string(), Json::String(value.to_string()));
    }
}
