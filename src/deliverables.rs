// Deliverable envelope normalization
//
// Agents produce heterogeneous payloads; downstream consumers expect a
// uniform {type, version, payload, refs, summary} wrapper. Wrapping an
// already-wrapped value is a no-op so callers can apply it defensively.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliverableRefs {
    #[serde(rename = "datasetIds", skip_serializing_if = "Option::is_none")]
    pub dataset_ids: Option<Vec<i64>>,
    #[serde(rename = "chartIds", skip_serializing_if = "Option::is_none")]
    pub chart_ids: Option<Vec<i64>>,
    #[serde(rename = "modelIds", skip_serializing_if = "Option::is_none")]
    pub model_ids: Option<Vec<i64>>,
    #[serde(rename = "documentIds", skip_serializing_if = "Option::is_none")]
    pub document_ids: Option<Vec<i64>>,
}

impl DeliverableRefs {
    fn is_empty(&self) -> bool {
        self.dataset_ids.is_none()
            && self.chart_ids.is_none()
            && self.model_ids.is_none()
            && self.document_ids.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    #[serde(rename = "agentKey", skip_serializing_if = "Option::is_none")]
    pub agent_key: Option<String>,
    #[serde(rename = "stepId", skip_serializing_if = "Option::is_none")]
    pub step_id: Option<i64>,
    #[serde(rename = "deliverableTitle", skip_serializing_if = "Option::is_none")]
    pub deliverable_title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliverableEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: i64,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refs: Option<DeliverableRefs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EnvelopeMetadata>,
}

/// A value is an envelope when it has a string `type`, a numeric `version`
/// and a `payload` key.
pub fn is_envelope(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    obj.get("type").map_or(false, Value::is_string)
        && obj.get("version").map_or(false, Value::is_number)
        && obj.contains_key("payload")
}

fn normalize_ids(value: Option<&Value>) -> Vec<i64> {
    match value {
        None | Some(Value::Null) => vec![],
        Some(Value::Array(items)) => items.iter().filter_map(coerce_id).collect(),
        Some(single) => coerce_id(single).into_iter().collect(),
    }
}

fn coerce_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn collect_ids(obj: &Map<String, Value>, keys: &[&str]) -> Option<Vec<i64>> {
    let mut set = BTreeSet::new();
    for key in keys {
        for id in normalize_ids(obj.get(*key)) {
            set.insert(id);
        }
    }
    if set.is_empty() {
        None
    } else {
        Some(set.into_iter().collect())
    }
}

fn extract_refs(payload: &Value) -> Option<DeliverableRefs> {
    let obj = payload.as_object()?;
    let refs = DeliverableRefs {
        dataset_ids: collect_ids(obj, &["datasetId", "datasetIds", "spreadsheetId"]),
        chart_ids: collect_ids(obj, &["chartId", "chartIds"]),
        model_ids: collect_ids(obj, &["modelId", "modelIds"]),
        document_ids: collect_ids(obj, &["documentId", "documentIds"]),
    };
    if refs.is_empty() {
        None
    } else {
        Some(refs)
    }
}

fn extract_summary(payload: &Value) -> Option<String> {
    let obj = payload.as_object()?;
    for key in ["summaryText", "summary", "headline"] {
        if let Some(Value::String(s)) = obj.get(key) {
            return Some(s.clone());
        }
    }
    None
}

fn infer_type(agent_key: Option<&str>) -> String {
    match agent_key {
        None => "generic".to_string(),
        Some("project_definition") => "project_definition".to_string(),
        Some("issues_tree") => "issues_tree".to_string(),
        Some("hypothesis") => "hypotheses".to_string(),
        Some("execution") => "execution_results".to_string(),
        Some("summary") => "summary".to_string(),
        Some("presentation") => "presentation".to_string(),
        Some("model_runner") => "model_run".to_string(),
        Some(key) if key.starts_with("des_") => "document".to_string(),
        Some(other) => other.to_string(),
    }
}

pub struct WrapInput {
    pub payload: Value,
    pub agent_key: Option<String>,
    pub step_id: Option<i64>,
    pub deliverable_title: Option<String>,
}

/// Wrap an agent payload in an envelope. Idempotent: an already-wrapped
/// payload passes through unchanged.
pub fn wrap_deliverable_content(input: WrapInput) -> Value {
    if is_envelope(&input.payload) {
        return input.payload;
    }

    let refs = extract_refs(&input.payload);
    let summary = extract_summary(&input.payload);

    let envelope = DeliverableEnvelope {
        kind: infer_type(input.agent_key.as_deref()),
        version: 1,
        payload: input.payload,
        refs,
        summary,
        metadata: Some(EnvelopeMetadata {
            agent_key: input.agent_key,
            step_id: input.step_id,
            deliverable_title: input.deliverable_title,
        }),
    };
    serde_json::to_value(envelope).expect("envelope serializes")
}

/// Return the inner payload if the value is an envelope, the value itself
/// otherwise.
pub fn unwrap_deliverable_content(value: &Value) -> &Value {
    if is_envelope(value) {
        &value["payload"]
    } else {
        value
    }
}

/// Replace an envelope's payload in place (refreshing refs and summary),
/// or wrap from scratch when the existing value is not an envelope.
pub fn update_deliverable_envelope(existing: &Value, input: WrapInput) -> Value {
    if is_envelope(existing) {
        let mut updated = existing.clone();
        let obj = updated.as_object_mut().expect("envelope is an object");
        match extract_refs(&input.payload) {
            Some(refs) => {
                obj.insert("refs".into(), serde_json::to_value(refs).expect("refs serialize"));
            }
            None => {
                obj.remove("refs");
            }
        }
        match extract_summary(&input.payload) {
            Some(summary) => {
                obj.insert("summary".into(), Value::String(summary));
            }
            None => {
                obj.remove("summary");
            }
        }
        obj.insert("payload".into(), input.payload);
        return updated;
    }
    wrap_deliverable_content(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wrap(payload: Value, agent_key: &str) -> Value {
        wrap_deliverable_content(WrapInput {
            payload,
            agent_key: Some(agent_key.to_string()),
            step_id: None,
            deliverable_title: None,
        })
    }

    #[test]
    fn test_wrap_is_idempotent() {
        let once = wrap(json!({"summaryText": "hello"}), "summary");
        let twice = wrap(once.clone(), "summary");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_type_inference() {
        assert_eq!(wrap(json!({}), "issues_tree")["type"], "issues_tree");
        assert_eq!(wrap(json!({}), "hypothesis")["type"], "hypotheses");
        assert_eq!(wrap(json!({}), "des_outline")["type"], "document");
        assert_eq!(wrap(json!({}), "something_else")["type"], "something_else");
        let no_key = wrap_deliverable_content(WrapInput {
            payload: json!({}),
            agent_key: None,
            step_id: None,
            deliverable_title: None,
        });
        assert_eq!(no_key["type"], "generic");
    }

    #[test]
    fn test_summary_priority_order() {
        let v = wrap(json!({"summary": "b", "summaryText": "a", "headline": "c"}), "summary");
        assert_eq!(v["summary"], "a");
        let v = wrap(json!({"headline": "c", "summary": "b"}), "summary");
        assert_eq!(v["summary"], "b");
        let v = wrap(json!({"headline": "c"}), "summary");
        assert_eq!(v["summary"], "c");
    }

    #[test]
    fn test_refs_singular_plural_dedup() {
        let v = wrap(
            json!({"datasetId": 3, "datasetIds": [3, "4"], "spreadsheetId": 5, "chartId": "7"}),
            "execution",
        );
        assert_eq!(v["refs"]["datasetIds"], json!([3, 4, 5]));
        assert_eq!(v["refs"]["chartIds"], json!([7]));
        assert!(v["refs"].get("modelIds").is_none());
    }

    #[test]
    fn test_refs_omitted_when_empty() {
        let v = wrap(json!({"text": "no ids here", "datasetId": "not-a-number"}), "summary");
        assert!(v.get("refs").is_none());
    }

    #[test]
    fn test_unwrap_returns_payload() {
        let wrapped = wrap(json!({"a": 1}), "summary");
        assert_eq!(unwrap_deliverable_content(&wrapped), &json!({"a": 1}));
        let bare = json!({"a": 1});
        assert_eq!(unwrap_deliverable_content(&bare), &bare);
    }

    #[test]
    fn test_update_preserves_type_and_metadata() {
        let original = wrap(json!({"summaryText": "v1"}), "summary");
        let updated = update_deliverable_envelope(
            &original,
            WrapInput {
                payload: json!({"summaryText": "v2"}),
                agent_key: Some("summary".into()),
                step_id: None,
                deliverable_title: None,
            },
        );
        assert_eq!(updated["type"], "summary");
        assert_eq!(updated["payload"]["summaryText"], "v2");
        assert_eq!(updated["summary"], "v2");
        assert_eq!(updated["metadata"], original["metadata"]);
    }
}
