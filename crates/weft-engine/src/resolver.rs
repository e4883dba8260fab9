use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use weft_core::config::{GenerativeConfig, PricingConfig};
use weft_core::{
    Classification, CoercionError, CompatibilityResult, ConfirmationDecision,
    ConfirmationRequest, EdgeId, GenerativeRequest, GenerativeTransformer, NodeId, RecipeStore,
    RunId, SchemaDescriptor, TransformRecord, TransformSpec,
};

use crate::confirmation::ConfirmationBroker;

/// Why an edge could not be transformed. Always surfaces as a compatibility failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    #[error(transparent)]
    Coercion(#[from] CoercionError),

    #[error("generative transform needs confirmation for edge '{0}'")]
    ConfirmationRequired(EdgeId),

    #[error("generative transform denied: {0}")]
    ConfirmationDenied(String),

    #[error("generative fallback is disabled")]
    GenerativeDisabled,

    #[error("generative collaborator failed: {0}")]
    Generative(String),

    #[error("generated output rejected: {}", .0.join("; "))]
    InvalidOutput(Vec<String>),
}

/// Pure band decision for an edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformPlan {
    pub method: Classification,
    pub requires_confirmation: bool,
    pub cost: f64,
}

/// Which edges may use the generative tier without asking.
#[derive(Debug, Clone, Default)]
pub struct ConfirmationPolicy {
    pub confirm_all: bool,
    pub confirmed_edges: HashSet<EdgeId>,
    /// Ask through the broker when not pre-confirmed.
    pub interactive: bool,
}

impl ConfirmationPolicy {
    pub fn is_preconfirmed(&self, edge_id: &str) -> bool {
        self.confirm_all || self.confirmed_edges.contains(edge_id)
    }
}

/// Everything the resolver needs to know about the edge it is working on.
#[derive(Debug, Clone)]
pub struct EdgeContext {
    pub run_id: RunId,
    pub edge_id: EdgeId,
    /// Node receiving the transformed value.
    pub node_id: NodeId,
    pub source_agent_id: Option<String>,
    pub target_agent_id: Option<String>,
    pub target_schema: SchemaDescriptor,
    pub method: TransformSpec,
    /// The run's token; a pending confirmation is abandoned when it fires.
    pub cancel: CancellationToken,
}

/// The single record written for an edge, plus the produced fields on success.
#[derive(Debug, Clone)]
pub struct TransformOutcome {
    pub record: TransformRecord,
    pub result: Result<Map<String, Value>, TransformError>,
}

impl TransformOutcome {
    pub fn method(&self) -> Classification {
        self.record.method
    }
}

struct Applied {
    method: Classification,
    fields: Map<String, Value>,
    confidence: f64,
    cost: f64,
}

/// Picks and runs a transform tier for an edge.
pub struct TransformResolver {
    pricing: PricingConfig,
    generative: GenerativeConfig,
    recipes: Option<Arc<dyn RecipeStore>>,
    generator: Option<Arc<dyn GenerativeTransformer>>,
    broker: Arc<ConfirmationBroker>,
}

impl TransformResolver {
    pub fn new(
        pricing: PricingConfig,
        generative: GenerativeConfig,
        recipes: Option<Arc<dyn RecipeStore>>,
        generator: Option<Arc<dyn GenerativeTransformer>>,
        broker: Arc<ConfirmationBroker>,
    ) -> Self {
        Self {
            pricing,
            generative,
            recipes,
            generator,
            broker,
        }
    }

    pub fn generative_enabled(&self) -> bool {
        self.generative.enabled && self.generator.is_some()
    }

    /// Map a compatibility band to a method, confirmation requirement and cost.
    pub fn plan(&self, compat: &CompatibilityResult) -> TransformPlan {
        match compat.classification {
            Classification::Direct | Classification::Deterministic => TransformPlan {
                method: compat.classification,
                requires_confirmation: false,
                cost: 0.0,
            },
            Classification::Assisted => TransformPlan {
                method: Classification::Assisted,
                requires_confirmation: false,
                cost: self.pricing.assisted_cost,
            },
            Classification::Generative if self.generative.enabled => TransformPlan {
                method: Classification::Generative,
                requires_confirmation: true,
                cost: self.pricing.generative_cost,
            },
            Classification::Generative | Classification::Incompatible => TransformPlan {
                method: Classification::Incompatible,
                requires_confirmation: false,
                cost: 0.0,
            },
        }
    }

    /// Transform `upstream` for one edge. Exactly one record is produced.
    pub async fn resolve(
        &self,
        ctx: &EdgeContext,
        compat: &CompatibilityResult,
        upstream: &Value,
        confirm: &ConfirmationPolicy,
    ) -> TransformOutcome {
        let start = Instant::now();
        let mut escalations = Vec::new();
        let initial = match ctx.method {
            TransformSpec::Auto => self.plan(compat).method,
            TransformSpec::Mapping { .. } => Classification::Deterministic,
            TransformSpec::Recipe => Classification::Assisted,
            TransformSpec::Generative { .. } => Classification::Generative,
        };

        let applied = self
            .apply_from(initial, ctx, compat, upstream, confirm, &mut escalations)
            .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (method, output, confidence, cost, error) = match &applied {
            Ok(a) => (
                a.method,
                Some(Value::Object(a.fields.clone())),
                a.confidence,
                a.cost,
                None,
            ),
            Err(e) => (Classification::Incompatible, None, 0.0, 0.0, Some(e.to_string())),
        };

        match &error {
            None => debug!(
                run_id = %ctx.run_id,
                edge_id = %ctx.edge_id,
                method = %method,
                score = compat.score,
                "Edge transformed"
            ),
            Some(e) => warn!(
                run_id = %ctx.run_id,
                edge_id = %ctx.edge_id,
                score = compat.score,
                error = %e,
                "Edge is incompatible"
            ),
        }

        let record = TransformRecord {
            id: Uuid::new_v4().to_string(),
            run_id: ctx.run_id.clone(),
            edge_id: ctx.edge_id.clone(),
            node_id: ctx.node_id.clone(),
            method,
            escalations,
            input: upstream.clone(),
            output,
            confidence,
            cost,
            duration_ms,
            succeeded: error.is_none(),
            error,
            timestamp: Utc::now(),
        };

        TransformOutcome {
            record,
            result: applied.map(|a| a.fields),
        }
    }

    async fn apply_from(
        &self,
        initial: Classification,
        ctx: &EdgeContext,
        compat: &CompatibilityResult,
        upstream: &Value,
        confirm: &ConfirmationPolicy,
        escalations: &mut Vec<Classification>,
    ) -> Result<Applied, TransformError> {
        let mut tier = initial;
        loop {
            escalations.push(tier);
            match tier {
                Classification::Direct | Classification::Deterministic => {
                    let (mapping, confidence) = match ctx.method {
                        TransformSpec::Mapping { ref mapping } => (mapping, 1.0),
                        _ => (&compat.mapping, compat.score),
                    };
                    let fields = mapping.apply(upstream)?;
                    return Ok(Applied {
                        method: tier,
                        fields,
                        confidence,
                        cost: 0.0,
                    });
                }
                Classification::Assisted => {
                    if let Some((fields, confidence)) = self.apply_recipe(ctx, upstream).await {
                        return Ok(Applied {
                            method: Classification::Assisted,
                            fields,
                            confidence,
                            cost: self.pricing.assisted_cost,
                        });
                    }
                    debug!(edge_id = %ctx.edge_id, "No usable recipe, escalating to generative");
                    tier = Classification::Generative;
                }
                Classification::Generative => {
                    let fields = self.generate(ctx, compat, upstream, confirm).await?;
                    return Ok(Applied {
                        method: Classification::Generative,
                        fields,
                        confidence: self.generative.confidence,
                        cost: self.pricing.generative_cost,
                    });
                }
                Classification::Incompatible => return Err(TransformError::GenerativeDisabled),
            }
        }
    }

    /// Highest-confidence recipe whose output carries every required target field.
    async fn apply_recipe(
        &self,
        ctx: &EdgeContext,
        upstream: &Value,
    ) -> Option<(Map<String, Value>, f64)> {
        let store = self.recipes.as_ref()?;
        let source = ctx.source_agent_id.clone()?;
        let target = ctx.target_agent_id.clone()?;

        let mut recipes = match store.lookup(source, target).await {
            Ok(r) => r,
            Err(e) => {
                warn!(edge_id = %ctx.edge_id, error = %e, "Recipe lookup failed");
                return None;
            }
        };
        recipes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        recipes.into_iter().find_map(|recipe| {
            let fields = recipe.mapping.apply(upstream).ok()?;
            let complete = ctx
                .target_schema
                .required_fields()
                .all(|(name, _)| fields.get(name).is_some_and(|v| !v.is_null()));
            complete.then_some((fields, recipe.confidence))
        })
    }

    async fn generate(
        &self,
        ctx: &EdgeContext,
        compat: &CompatibilityResult,
        upstream: &Value,
        confirm: &ConfirmationPolicy,
    ) -> Result<Map<String, Value>, TransformError> {
        if !self.generative.enabled {
            return Err(TransformError::GenerativeDisabled);
        }
        let Some(ref generator) = self.generator else {
            return Err(TransformError::GenerativeDisabled);
        };

        if !confirm.is_preconfirmed(&ctx.edge_id) {
            if !confirm.interactive {
                return Err(TransformError::ConfirmationRequired(ctx.edge_id.clone()));
            }
            let request = ConfirmationRequest {
                id: Uuid::new_v4().to_string(),
                run_id: ctx.run_id.clone(),
                edge_id: ctx.edge_id.clone(),
                node_id: ctx.node_id.clone(),
                score: compat.score,
                estimated_cost: self.pricing.generative_cost,
                unmatched_required: compat.unmatched_required.clone(),
            };
            let timeout = Duration::from_secs(self.generative.confirmation_timeout_secs);
            let decision = self.broker.ask(request, timeout, &ctx.cancel).await;
            if let ConfirmationDecision::Denied { reason } = decision {
                return Err(TransformError::ConfirmationDenied(reason));
            }
        }

        let template = match ctx.method {
            TransformSpec::Generative { ref template } => template.clone(),
            _ => None,
        };
        let upstream_fields = match upstream {
            Value::Object(obj) => obj.clone(),
            other => {
                let mut wrapped = Map::new();
                wrapped.insert("value".into(), other.clone());
                wrapped
            }
        };

        info!(
            run_id = %ctx.run_id,
            edge_id = %ctx.edge_id,
            score = compat.score,
            "Running generative transform"
        );

        let limit = Duration::from_secs(self.generative.timeout_secs);
        let call = generator.generate(GenerativeRequest {
            template,
            upstream: upstream_fields,
            target_schema: ctx.target_schema.clone(),
            max_tokens: self.generative.max_tokens,
            max_output_bytes: self.generative.max_output_bytes,
        });
        let generated = match tokio::time::timeout(limit, call).await {
            Ok(result) => result.map_err(|e| TransformError::Generative(e.to_string()))?,
            Err(_) => {
                warn!(run_id = %ctx.run_id, edge_id = %ctx.edge_id, "Generative transform timed out");
                return Err(TransformError::Generative(format!(
                    "no completion within {}s",
                    limit.as_secs()
                )));
            }
        };

        check_generated(generated, &ctx.target_schema, self.generative.max_output_bytes)
    }
}

/// Generated output is untrusted: bound its size, require an object, check the schema.
pub fn check_generated(
    value: Value,
    schema: &SchemaDescriptor,
    max_bytes: usize,
) -> Result<Map<String, Value>, TransformError> {
    let size = serde_json::to_string(&value).map(|s| s.len()).unwrap_or(usize::MAX);
    if size > max_bytes {
        return Err(TransformError::InvalidOutput(vec![format!(
            "output is {} bytes, limit is {}",
            size, max_bytes
        )]));
    }
    schema
        .validate_instance(&value)
        .map_err(TransformError::InvalidOutput)?;
    match value {
        Value::Object(obj) => Ok(obj),
        _ => Err(TransformError::InvalidOutput(vec!["expected an object".into()])),
    }
}
