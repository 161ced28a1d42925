use std::collections::BTreeMap;

use dashmap::DashMap;
use realtime_core::envelope::PropertyValue;
use realtime_core::query::{self, QueryExpr};
use realtime_core::{MatchId, RealtimeError};

/// A full-text-like index over match `label` strings (spec §4.G), queried
/// with the constrained dialect of spec §6: term equality, AND/OR/NOT,
/// numeric range, string prefix -- explicitly NOT regex, which the
/// matchmaker dialect supports but the label dialect does not.
#[derive(Default)]
pub struct LabelIndex {
    entries: DashMap<MatchId, (String, BTreeMap<String, PropertyValue>)>,
}

impl LabelIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, match_id: MatchId, label: String) {
        let properties = derive_properties(&label);
        self.entries.insert(match_id, (label, properties));
    }

    pub fn remove(&self, match_id: MatchId) {
        self.entries.remove(&match_id);
    }

    pub fn list(&self, query: Option<&str>) -> Result<Vec<MatchId>, RealtimeError> {
        let Some(query) = query else {
            return Ok(self.entries.iter().map(|e| *e.key()).collect());
        };
        let expr = query::parse(query)
            .map_err(|e| RealtimeError::invalid_argument(format!("invalid-query: {e}")))?;
        if !query::only_supports(&expr, false) {
            return Err(RealtimeError::invalid_argument(
                "invalid-query: regex predicates are not supported in match label queries",
            ));
        }
        Ok(self
            .entries
            .iter()
            .filter(|e| query::eval(&expr, &e.value().1))
            .map(|e| *e.key())
            .collect())
    }
}

/// Labels that parse as a flat JSON object of strings/numbers are indexed
/// field-by-field; anything else (a bare string label, the common case for
/// simple deployments) is indexed under the single synthetic field `label`.
fn derive_properties(label: &str) -> BTreeMap<String, PropertyValue> {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(label) {
        let mut props = BTreeMap::new();
        for (k, v) in map {
            let value = match v {
                serde_json::Value::Number(n) => n.as_f64().map(PropertyValue::Number),
                serde_json::Value::String(s) => Some(PropertyValue::Text(s)),
                _ => None,
            };
            if let Some(value) = value {
                props.insert(k, value);
            }
        }
        props
    } else {
        let mut props = BTreeMap::new();
        props.insert("label".to_string(), PropertyValue::Text(label.to_string()));
        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_string_label_is_queryable_by_prefix() {
        let index = LabelIndex::new();
        let id = MatchId::new();
        index.insert(id, "ranked-eu".into());
        let hits = index.list(Some("label:ranked*")).unwrap();
        assert_eq!(hits, vec![id]);
    }

    #[test]
    fn json_label_fields_are_queryable_by_range() {
        let index = LabelIndex::new();
        let id = MatchId::new();
        index.insert(id, r#"{"rank": 12}"#.into());
        let hits = index.list(Some("rank:[8 TO 14]")).unwrap();
        assert_eq!(hits, vec![id]);
    }

    #[test]
    fn regex_predicate_is_rejected_as_invalid_query() {
        let index = LabelIndex::new();
        index.insert(MatchId::new(), "anything".into());
        let err = index.list(Some("label:/anything/")).unwrap_err();
        assert!(matches!(err, RealtimeError::InvalidArgument(_)));
    }
}
