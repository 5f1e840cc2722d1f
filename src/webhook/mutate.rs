//! Shoot Mutation Webhook
//!
//! Handles AdmissionReview requests for shoot resources, running them through
//! the [`ShootMutator`] and answering with a JSON patch of whatever changed.

use std::sync::Arc;

use axum::{extract::State, Json};
use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
    DynamicObject,
};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::shoot::{ShootMutator, ShootObject};
use crate::Result;

use super::WebhookState;

/// Handle mutating admission review for shoot resources
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = review(&state.mutator, &req);
    Json(response.into_review())
}

/// Process a single admission request
pub fn review(mutator: &ShootMutator, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let uid = request.uid.as_str();

    let obj = match &request.object {
        Some(obj) => obj.clone(),
        None => {
            debug!(uid = %uid, operation = ?request.operation, "No object in request, allowing unchanged");
            return AdmissionResponse::from(request);
        }
    };

    match build_patch(mutator, obj) {
        Ok(None) => AdmissionResponse::from(request),
        Ok(Some(patch)) => {
            debug!(uid = %uid, patch_ops = patch.0.len(), "Applying patch");
            match AdmissionResponse::from(request).with_patch(patch) {
                Ok(response) => response,
                Err(e) => {
                    error!(uid = %uid, error = %e, "Failed to serialize patch");
                    AdmissionResponse::from(request).deny(format!("patch serialization error: {e}"))
                }
            }
        }
        Err(e) => {
            warn!(
                uid = %uid,
                kind = %request.kind.kind,
                namespace = ?request.namespace,
                name = %request.name,
                error = %e,
                "Denying admission request"
            );
            AdmissionResponse::from(request).deny(e.to_string())
        }
    }
}

/// Mutate the object and diff it against the object as it was admitted.
///
/// Returns `None` when nothing changed.
pub fn build_patch(mutator: &ShootMutator, obj: DynamicObject) -> Result<Option<json_patch::Patch>> {
    let raw = serde_json::to_value(&obj)?;
    let mut object = ShootObject::try_from(obj)?;

    let before = object.to_json()?;
    mutator.mutate(&mut object)?;
    let after = object.to_json()?;

    // The API server applies the patch to the raw object, which may carry
    // fields the typed model drops.
    let raw_after = replay(&raw, &before, &after);
    let patch = json_patch::diff(&raw, &raw_after);
    Ok((!patch.0.is_empty()).then_some(patch))
}

/// Carry the change from `before` to `after` over to `raw`.
///
/// Unchanged subtrees keep their raw form. Lists of named entries are matched
/// by `name` rather than by index, so unknown fields stay with their entry.
fn replay(raw: &Value, before: &Value, after: &Value) -> Value {
    if before == after {
        return raw.clone();
    }

    match (raw, before, after) {
        (Value::Object(raw), Value::Object(before), Value::Object(after)) => {
            let mut merged = raw.clone();
            for key in before.keys() {
                if !after.contains_key(key) {
                    merged.remove(key);
                }
            }
            for (key, value) in after {
                match raw.get(key) {
                    Some(raw_value) => {
                        let before_value = before.get(key).unwrap_or(&Value::Null);
                        merged.insert(key.clone(), replay(raw_value, before_value, value));
                    }
                    None if before.get(key) != Some(value) => {
                        merged.insert(key.clone(), value.clone());
                    }
                    None => {}
                }
            }
            Value::Object(merged)
        }
        (Value::Array(raw), Value::Array(before), Value::Array(after))
            if after.iter().all(|item| entry_name(item).is_some()) =>
        {
            let entries = after
                .iter()
                .map(|item| {
                    let name = entry_name(item).unwrap_or_default();
                    match (find_named(raw, name), find_named(before, name)) {
                        (Some(raw_item), Some(before_item)) => replay(raw_item, before_item, item),
                        _ => item.clone(),
                    }
                })
                .collect();
            Value::Array(entries)
        }
        _ => after.clone(),
    }
}

fn entry_name(item: &Value) -> Option<&str> {
    item.get("name")?.as_str()
}

fn find_named<'a>(items: &'a [Value], name: &str) -> Option<&'a Value> {
    items.iter().find(|item| entry_name(item) == Some(name))
}
