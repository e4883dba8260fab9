use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

use weft_core::config::{MatcherConfig, ThresholdConfig};
use weft_core::{
    CompatibilityResult, FieldMapping, FieldSource, FieldSpec, MatchKind, SchemaDescriptor,
    SchemaHash,
};

/// Scores how well a source schema satisfies a target schema.
///
/// Pure: the same pair always yields the same score and mapping.
pub struct SchemaMatcher {
    config: MatcherConfig,
    thresholds: ThresholdConfig,
    /// Normalized field name -> alias group indices it belongs to.
    alias_index: HashMap<String, Vec<usize>>,
}

/// A candidate source field for one target field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Candidate {
    kind: MatchKind,
    field: String,
}

impl SchemaMatcher {
    pub fn new(config: MatcherConfig, thresholds: ThresholdConfig) -> Self {
        let mut alias_index: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, group) in config.alias_groups.iter().enumerate() {
            for name in group {
                let entry = alias_index.entry(normalize(name)).or_default();
                if !entry.contains(&i) {
                    entry.push(i);
                }
            }
        }
        Self {
            config,
            thresholds,
            alias_index,
        }
    }

    pub fn thresholds(&self) -> &ThresholdConfig {
        &self.thresholds
    }

    pub fn score(&self, source: &SchemaDescriptor, target: &SchemaDescriptor) -> CompatibilityResult {
        if target.is_empty() {
            return CompatibilityResult {
                score: 1.0,
                mapping: FieldMapping::new(),
                classification: self.thresholds.classify(1.0),
                unmatched_required: vec![],
                unmatched_optional: vec![],
            };
        }

        let mut mapping = FieldMapping::new();
        let mut unmatched_required = Vec::new();
        let mut unmatched_optional = Vec::new();
        let mut total_weight = 0.0;
        let mut matched_weight = 0.0;

        for (name, spec) in target.fields() {
            let weight = if spec.required {
                self.config.required_weight
            } else {
                self.config.optional_weight
            };
            total_weight += weight;

            if let Some(best) = self.best_candidate(source, name, spec) {
                let quality = match best.kind {
                    MatchKind::Exact => self.config.exact_quality,
                    MatchKind::Alias => self.config.alias_quality,
                    MatchKind::Coercion => self.config.coercion_quality,
                };
                matched_weight += weight * quality;
                let coerce = (best.kind == MatchKind::Coercion).then_some(spec.ty);
                mapping.insert(
                    name.clone(),
                    FieldSource::Field {
                        field: best.field,
                        via: best.kind,
                        coerce,
                    },
                );
            } else if let Some(ref default) = spec.default {
                matched_weight += weight * self.config.default_quality;
                mapping.insert(name.clone(), FieldSource::literal(default.clone()));
            } else if spec.required {
                unmatched_required.push(name.clone());
            } else {
                unmatched_optional.push(name.clone());
            }
        }

        let mut score = if total_weight > 0.0 {
            matched_weight / total_weight
        } else {
            1.0
        };
        if !unmatched_required.is_empty() {
            score = score.min(self.config.unmatched_required_cap);
        }
        let score = score.clamp(0.0, 1.0);

        debug!(
            score,
            mapped = mapping.len(),
            unmatched_required = unmatched_required.len(),
            "Scored schema pair"
        );

        CompatibilityResult {
            score,
            mapping,
            classification: self.thresholds.classify(score),
            unmatched_required,
            unmatched_optional,
        }
    }

    /// Whether `source` structurally supplies the target field (defaults not considered).
    pub fn supplies(&self, source: &SchemaDescriptor, name: &str, spec: &FieldSpec) -> bool {
        self.best_candidate(source, name, spec).is_some()
    }

    /// Can-ever-satisfy: some source supplies the field, or it has a default.
    pub fn can_satisfy<'a>(
        &self,
        sources: impl IntoIterator<Item = &'a SchemaDescriptor>,
        target: &SchemaDescriptor,
        field: &str,
    ) -> bool {
        let Some(spec) = target.field(field) else {
            return true;
        };
        spec.default.is_some() || sources.into_iter().any(|s| self.supplies(s, field, spec))
    }

    /// Best match for one target field; exact > alias > coercion, then by source name.
    fn best_candidate(
        &self,
        source: &SchemaDescriptor,
        name: &str,
        spec: &FieldSpec,
    ) -> Option<Candidate> {
        source
            .fields()
            .iter()
            .filter_map(|(src_name, src_spec)| {
                let related_exact = src_name == name;
                let related = related_exact || self.is_alias(name, spec, src_name, src_spec);
                if !related {
                    return None;
                }
                let kind = if spec.ty.accepts(src_spec.ty) {
                    if related_exact {
                        MatchKind::Exact
                    } else {
                        MatchKind::Alias
                    }
                } else if spec.ty.coercible_from(src_spec.ty) {
                    MatchKind::Coercion
                } else {
                    return None;
                };
                Some(Candidate {
                    kind,
                    field: src_name.clone(),
                })
            })
            .min()
    }

    fn is_alias(
        &self,
        target_name: &str,
        target_spec: &FieldSpec,
        source_name: &str,
        source_spec: &FieldSpec,
    ) -> bool {
        let t = normalize(target_name);
        let s = normalize(source_name);
        if t == s {
            return true;
        }
        if target_spec.aliases.iter().any(|a| normalize(a) == s)
            || source_spec.aliases.iter().any(|a| normalize(a) == t)
        {
            return true;
        }
        match (self.alias_index.get(&t), self.alias_index.get(&s)) {
            (Some(tg), Some(sg)) => tg.iter().any(|g| sg.contains(g)),
            _ => false,
        }
    }
}

/// Lowercase with `_`, `-`, `.` and spaces removed.
fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '_' | '-' | '.' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Memoizes compatibility results by schema-pair hash.
///
/// Concurrent misses for the same pair may both compute; the first insert wins
/// and both values are identical.
#[derive(Default)]
pub struct SchemaCache {
    entries: RwLock<HashMap<(SchemaHash, SchemaHash), CompatibilityResult>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn score(
        &self,
        matcher: &SchemaMatcher,
        source: &SchemaDescriptor,
        target: &SchemaDescriptor,
    ) -> CompatibilityResult {
        let key = (source.hash(), target.hash());
        if let Ok(entries) = self.entries.read() {
            if let Some(hit) = entries.get(&key) {
                return hit.clone();
            }
        }

        let result = matcher.score(source, target);
        if let Ok(mut entries) = self.entries.write() {
            entries.entry(key).or_insert_with(|| result.clone());
        }
        result
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::{Classification, FieldType};

    fn matcher() -> SchemaMatcher {
        SchemaMatcher::new(MatcherConfig::default(), ThresholdConfig::default())
    }

    fn schema(v: serde_json::Value) -> SchemaDescriptor {
        SchemaDescriptor::from_json(&v).unwrap()
    }

    #[test]
    fn alias_group_match_is_deterministic() {
        let result = matcher().score(&schema(json!({"summary": "string"})), &schema(json!({"text": "string"})));
        assert!(result.score >= 0.70);
        assert_eq!(result.classification, Classification::Deterministic);
        assert_eq!(
            result.mapping.get("text"),
            Some(&FieldSource::field("summary", MatchKind::Alias))
        );
    }

    #[test]
    fn disjoint_required_fields_need_generative() {
        let result = matcher().score(
            &schema(json!({"sentiment": "string", "score": "number"})),
            &schema(json!({"translated": "string", "target": "string"})),
        );
        assert!(result.score < 0.40);
        assert_eq!(result.classification, Classification::Generative);
        assert_eq!(result.unmatched_required, vec!["target", "translated"]);
    }

    #[test]
    fn exact_match_is_direct() {
        let s = schema(json!({"text": "string", "lang": "string?"}));
        let result = matcher().score(&s, &s);
        assert_eq!(result.score, 1.0);
        assert_eq!(result.classification, Classification::Direct);
    }

    #[test]
    fn empty_target_scores_one() {
        let result = matcher().score(&schema(json!({"a": "string"})), &SchemaDescriptor::new());
        assert_eq!(result.score, 1.0);
        assert!(result.mapping.is_empty());
    }

    #[test]
    fn integer_satisfies_number_exactly() {
        let result = matcher().score(&schema(json!({"n": "integer"})), &schema(json!({"n": "number"})));
        assert_eq!(result.mapping.get("n"), Some(&FieldSource::field("n", MatchKind::Exact)));
    }

    #[test]
    fn coercion_match_carries_target_type() {
        let result = matcher().score(&schema(json!({"score": "string"})), &schema(json!({"score": "number"})));
        assert_eq!(
            result.mapping.get("score"),
            Some(&FieldSource::Field {
                field: "score".into(),
                via: MatchKind::Coercion,
                coerce: Some(FieldType::Number),
            })
        );
        assert!((result.score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn normalized_names_are_aliases() {
        let result = matcher().score(
            &schema(json!({"Target-Language": "string"})),
            &schema(json!({"target_language": "string"})),
        );
        assert_eq!(
            result.mapping.get("target_language").map(|s| matches!(s, FieldSource::Field { via: MatchKind::Alias, .. })),
            Some(true)
        );
    }

    #[test]
    fn declared_aliases_are_used() {
        let target = SchemaDescriptor::new().with_field(
            "doc",
            FieldSpec::required(FieldType::String).with_aliases(&["article"]),
        );
        let result = matcher().score(&schema(json!({"article": "string"})), &target);
        assert!(result.unmatched_required.is_empty());
    }

    #[test]
    fn default_fills_as_literal() {
        let target = SchemaDescriptor::new()
            .required("text", FieldType::String)
            .with_field("lang", FieldSpec::required(FieldType::String).with_default(json!("en")));
        let result = matcher().score(&schema(json!({"text": "string"})), &target);
        assert_eq!(result.mapping.get("lang"), Some(&FieldSource::literal(json!("en"))));
        assert!((result.score - 0.85).abs() < 1e-9);
    }

    #[test]
    fn exact_wins_over_alias() {
        let result = matcher().score(
            &schema(json!({"text": "string", "summary": "string", "body": "string"})),
            &schema(json!({"text": "string"})),
        );
        assert_eq!(result.mapping.get("text"), Some(&FieldSource::field("text", MatchKind::Exact)));
    }

    #[test]
    fn alias_ties_break_by_source_name() {
        let result = matcher().score(
            &schema(json!({"summary": "string", "body": "string"})),
            &schema(json!({"text": "string"})),
        );
        assert_eq!(result.mapping.get("text"), Some(&FieldSource::field("body", MatchKind::Alias)));
    }

    #[test]
    fn adding_exact_required_field_is_monotonic() {
        let m = matcher();
        let source = schema(json!({"a": "string", "b": "number", "summary": "string"}));
        let targets = [
            schema(json!({"text": "string", "zzz": "string"})),
            schema(json!({"text": "string"})),
            schema(json!({"x": "boolean?"})),
            SchemaDescriptor::new(),
        ];
        for target in targets {
            let before = m.score(&source, &target).score;
            let extended = target.clone().required("a", FieldType::String);
            let after = m.score(&source, &extended).score;
            assert!(after >= before, "{after} < {before}");
        }
    }

    #[test]
    fn identical_exact_field_sets_are_symmetric() {
        let m = matcher();
        let a = schema(json!({"text": "string", "n": "integer?"}));
        let b = schema(json!({"text": "string?", "n": "integer"}));
        assert_eq!(m.score(&a, &b).score, m.score(&b, &a).score);
    }

    #[test]
    fn scoring_is_idempotent_and_cache_matches() {
        let m = matcher();
        let cache = SchemaCache::new();
        let s = schema(json!({"summary": "string", "score": "string"}));
        let t = schema(json!({"text": "string", "score": "number", "lang": "string?"}));

        let first = m.score(&s, &t);
        assert_eq!(first, m.score(&s, &t));

        let miss = cache.score(&m, &s, &t);
        let hit = cache.score(&m, &s, &t);
        assert_eq!(miss, first);
        assert_eq!(hit, first);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn can_satisfy_uses_structure_or_default() {
        let m = matcher();
        let target = SchemaDescriptor::new()
            .required("text", FieldType::String)
            .with_field("lang", FieldSpec::required(FieldType::String).with_default(json!("en")))
            .required("target", FieldType::String);
        let sources = [schema(json!({"content": "string"}))];
        assert!(m.can_satisfy(sources.iter(), &target, "text"));
        assert!(m.can_satisfy(sources.iter(), &target, "lang"));
        assert!(!m.can_satisfy(sources.iter(), &target, "target"));
    }
}
