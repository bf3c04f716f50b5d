//! Side-effect-free expression evaluation over named data objects.
//!
//! Only the objects an expression actually references are loaded from the
//! [`DataObjectProvider`]; everything else in the candidate set is ignored.

pub mod ast;
pub mod parser;

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult, ExpressionError};
use crate::providers::DataObjectProvider;

pub use ast::{truthy, BinaryOp, Expr};
pub use parser::parse_expression;

/// Candidate names that occur as object roots in `expression`.
///
/// A root outside `candidates` is an [`ExpressionError::UnknownObject`].
pub fn used_objects(
    expression: &str,
    candidates: &BTreeSet<String>,
) -> Result<BTreeSet<String>, ExpressionError> {
    let expr = parse_expression(expression)?;
    referenced(&expr, candidates)
}

fn referenced(
    expr: &Expr,
    candidates: &BTreeSet<String>,
) -> Result<BTreeSet<String>, ExpressionError> {
    let roots = expr.roots();
    if let Some(unknown) = roots.iter().find(|root| !candidates.contains(*root)) {
        return Err(ExpressionError::UnknownObject(unknown.clone()));
    }
    Ok(roots)
}

/// Parse and check an expression without any data. Used at deploy time.
pub fn validate(expression: &str, candidates: &BTreeSet<String>) -> Result<(), ExpressionError> {
    used_objects(expression, candidates).map(|_| ())
}

pub struct ExpressionEvaluator {
    data_objects: Arc<dyn DataObjectProvider>,
}

impl ExpressionEvaluator {
    pub fn new(data_objects: Arc<dyn DataObjectProvider>) -> Self {
        Self { data_objects }
    }

    /// Evaluate to the raw value (computed output bindings).
    pub async fn evaluate(
        &self,
        expression: &str,
        candidates: &BTreeSet<String>,
        process_id: &str,
        instance_id: Uuid,
    ) -> EngineResult<Value> {
        let expr = parse_expression(expression)?;
        let used = referenced(&expr, candidates)?;
        let context = self.bind(&used, process_id, instance_id).await?;
        Ok(expr.eval(&context)?)
    }

    /// Evaluate and coerce to boolean (sequence-flow guards).
    pub async fn evaluate_guard(
        &self,
        expression: &str,
        candidates: &BTreeSet<String>,
        process_id: &str,
        instance_id: Uuid,
    ) -> EngineResult<bool> {
        let value = self
            .evaluate(expression, candidates, process_id, instance_id)
            .await?;
        Ok(truthy(&value))
    }

    async fn bind(
        &self,
        used: &BTreeSet<String>,
        process_id: &str,
        instance_id: Uuid,
    ) -> EngineResult<BTreeMap<String, Value>> {
        let mut context = BTreeMap::new();
        for object_id in used {
            let loaded = self
                .data_objects
                .load(process_id, object_id, instance_id)
                .await
                .map_err(EngineError::provider("data_objects"))?;
            match loaded {
                Some(value) => {
                    context.insert(object_id.clone(), value);
                }
                None => return Err(ExpressionError::MissingObject(object_id.clone()).into()),
            }
        }
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryDataObjects;
    use serde_json::json;

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn used_objects_reports_only_referenced_candidates() {
        let used = used_objects("foo.a > bar.b", &names(&["foo", "car", "bar", "dar"])).unwrap();
        assert_eq!(used, names(&["foo", "bar"]));
    }

    #[test]
    fn unknown_root_is_rejected() {
        assert_eq!(
            used_objects("zed > 1", &names(&["foo"])),
            Err(ExpressionError::UnknownObject("zed".into()))
        );
    }

    #[tokio::test]
    async fn loads_only_what_the_expression_uses() {
        let store = Arc::new(MemoryDataObjects::new());
        let instance = Uuid::now_v7();
        store
            .save("order", "foo", instance, &json!({"a": 10}))
            .await
            .unwrap();
        store
            .save("order", "bar", instance, &json!({"b": 3}))
            .await
            .unwrap();
        let evaluator = ExpressionEvaluator::new(store.clone());
        let candidates = names(&["foo", "car", "bar", "dar"]);

        assert!(evaluator
            .evaluate_guard("foo.a > bar.b", &candidates, "order", instance)
            .await
            .unwrap());
        assert_eq!(
            evaluator
                .evaluate("foo.a * 2 + bar.b", &candidates, "order", instance)
                .await
                .unwrap(),
            json!(23)
        );
        // "car" and "dar" were never stored and never requested.
        assert_eq!(store.load_count("car").await, 0);
        assert_eq!(store.load_count("foo").await, 2);
    }

    #[tokio::test]
    async fn missing_object_is_an_error_not_false() {
        let store = Arc::new(MemoryDataObjects::new());
        let evaluator = ExpressionEvaluator::new(store);
        let err = evaluator
            .evaluate_guard("foo.a > 1", &names(&["foo"]), "order", Uuid::now_v7())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::MalformedExpression(ExpressionError::MissingObject(ref name)) if name == "foo"
        ));
    }

    #[tokio::test]
    async fn type_errors_surface() {
        let store = Arc::new(MemoryDataObjects::new());
        let evaluator = ExpressionEvaluator::new(store);
        let err = evaluator
            .evaluate("'a' * 2", &BTreeSet::new(), "order", Uuid::now_v7())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::MalformedExpression(ExpressionError::Type(_))
        ));
    }
}
