//! Batched, validated data transforms.
//!
//! Reads source rows in primary-key order, applies field mappings and
//! validation rules per row, and writes each batch as one multi-row insert
//! inside the enclosing step's transaction scope. Individual row failures
//! are accounted, not fatal, until the configured error rate is exceeded.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;

use crate::connection::{Connection, ConnectionError, Row, Value};
use crate::model::{
    BuiltinFunction, FieldMapping, FieldTransform, LookupSource, Severity, TransformSpec,
};

/// Transform-engine tuning.
#[derive(Debug, Clone)]
pub struct TransformOptions {
    /// Abort the whole transform once failed rows exceed this share of all
    /// attempted rows.
    pub max_error_rate: f64,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            max_error_rate: 0.5,
        }
    }
}

/// One failed row.
#[derive(Debug, Clone)]
pub struct RowError {
    /// Zero-based index of the row within the transform run.
    pub row: u64,
    /// Value of the ordering key column, when present.
    pub key: Option<Value>,
    /// Field the failure is attributed to, when field-level.
    pub field: Option<String>,
    /// What went wrong.
    pub message: String,
}

/// Outcome of a transform run.
#[derive(Debug, Clone, Default)]
pub struct TransformReport {
    /// Rows mapped, validated, and written.
    pub rows_processed: u64,
    /// Rows skipped due to row-level errors.
    pub rows_failed: u64,
    /// The row-level errors.
    pub errors: Vec<RowError>,
}

/// Transform failures that abort the run.
#[derive(Debug, Error)]
pub enum TransformError {
    /// The row error rate exceeded the configured threshold.
    #[error("transform aborted: {rows_failed} of {rows_attempted} rows failed")]
    Aborted {
        /// Rows written before the abort.
        rows_processed: u64,
        /// Rows failed before the abort.
        rows_failed: u64,
        /// Total rows attempted.
        rows_attempted: u64,
    },

    /// A mapping references an unregistered custom transform.
    #[error("unknown custom transform: {0}")]
    UnknownCustomTransform(String),

    /// A lookup query failed or returned an unusable shape.
    #[error("lookup failed: {0}")]
    LookupFailed(String),

    /// Database access failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// A custom transform function registered by a plugin author.
pub type CustomTransform = Arc<dyn Fn(&Value, &Row) -> Result<Value, String> + Send + Sync>;

/// Registry of author-supplied custom transforms.
#[derive(Default, Clone)]
pub struct TransformRegistry {
    functions: HashMap<String, CustomTransform>,
}

impl TransformRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transform under a name.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&Value, &Row) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    fn get(&self, name: &str) -> Option<&CustomTransform> {
        self.functions.get(name)
    }
}

impl std::fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformRegistry")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Executes batched data transforms.
#[derive(Debug, Default)]
pub struct TransformEngine {
    registry: TransformRegistry,
    options: TransformOptions,
}

impl TransformEngine {
    /// Engine with default options and an empty custom-transform registry.
    pub fn new(registry: TransformRegistry, options: TransformOptions) -> Self {
        Self { registry, options }
    }

    /// Check a spec without touching the database: every custom transform
    /// it names must be registered. Used by dry runs.
    pub fn validate_spec(&self, spec: &TransformSpec) -> Result<(), TransformError> {
        for mapping in &spec.mappings {
            if let Some(FieldTransform::Custom { definition }) = &mapping.transform {
                if self.registry.get(definition).is_none() {
                    return Err(TransformError::UnknownCustomTransform(definition.clone()));
                }
            }
        }
        Ok(())
    }

    /// Run a transform against a connection.
    pub async fn run(
        &self,
        spec: &TransformSpec,
        conn: &dyn Connection,
    ) -> Result<TransformReport, TransformError> {
        // Resolve custom names and lookup tables once, before any row work.
        self.validate_spec(spec)?;
        let lookups = self.resolve_lookups(spec, conn).await?;

        let mut report = TransformReport::default();
        let mut offset = 0usize;
        let mut row_index = 0u64;

        loop {
            let page = self.read_page(spec, conn, offset).await?;
            if page.is_empty() {
                break;
            }
            let page_len = page.len();

            let mut batch = Vec::with_capacity(page_len);
            for source_row in &page {
                match self.map_row(spec, source_row, &lookups, row_index) {
                    Ok(mapped) => batch.push(mapped),
                    Err(error) => {
                        report.rows_failed += 1;
                        report.errors.push(error);
                    }
                }
                row_index += 1;
            }

            if !batch.is_empty() {
                self.write_batch(spec, conn, &batch).await?;
                report.rows_processed += batch.len() as u64;
            }

            let attempted = report.rows_processed + report.rows_failed;
            if attempted > 0
                && report.rows_failed as f64 / attempted as f64 > self.options.max_error_rate
            {
                return Err(TransformError::Aborted {
                    rows_processed: report.rows_processed,
                    rows_failed: report.rows_failed,
                    rows_attempted: attempted,
                });
            }

            tracing::debug!(
                source = %spec.source_table,
                target = %spec.target_table,
                processed = report.rows_processed,
                failed = report.rows_failed,
                "transform batch complete"
            );

            if page_len < spec.batch_size {
                break;
            }
            offset += page_len;
        }

        Ok(report)
    }

    async fn read_page(
        &self,
        spec: &TransformSpec,
        conn: &dyn Connection,
        offset: usize,
    ) -> Result<Vec<Row>, TransformError> {
        let mut sql = format!("SELECT * FROM {}", spec.source_table);
        if let Some(filter) = &spec.filter {
            sql.push_str(&format!(" WHERE {filter}"));
        }
        sql.push_str(&format!(
            " ORDER BY {} LIMIT {} OFFSET {}",
            spec.key_column, spec.batch_size, offset
        ));
        Ok(conn.query(&sql, &[]).await?)
    }

    async fn write_batch(
        &self,
        spec: &TransformSpec,
        conn: &dyn Connection,
        batch: &[Row],
    ) -> Result<(), TransformError> {
        let columns: Vec<&str> = spec.mappings.iter().map(|m| m.target.as_str()).collect();
        let tuple = format!(
            "({})",
            columns.iter().map(|_| "?").collect::<Vec<_>>().join(", ")
        );
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            spec.target_table,
            columns.join(", "),
            vec![tuple; batch.len()].join(", ")
        );

        let mut params = Vec::with_capacity(batch.len() * columns.len());
        for row in batch {
            for column in &columns {
                params.push(row.get(column).cloned().unwrap_or(Value::Null));
            }
        }

        conn.execute(&sql, &params).await?;
        Ok(())
    }

    async fn resolve_lookups(
        &self,
        spec: &TransformSpec,
        conn: &dyn Connection,
    ) -> Result<HashMap<String, BTreeMap<String, Value>>, TransformError> {
        let mut lookups = HashMap::new();
        for mapping in &spec.mappings {
            let Some(FieldTransform::Lookup { definition }) = &mapping.transform else {
                continue;
            };
            let table = match definition {
                LookupSource::Inline(table) => table.clone(),
                LookupSource::Query(query) => {
                    let rows = conn.query(query, &[]).await?;
                    let mut table = BTreeMap::new();
                    for row in rows {
                        let columns = row.columns();
                        if columns.len() < 2 {
                            return Err(TransformError::LookupFailed(format!(
                                "lookup query for {} returned fewer than two columns",
                                mapping.target
                            )));
                        }
                        table.insert(columns[0].1.coerce_text(), columns[1].1.clone());
                    }
                    table
                }
            };
            lookups.insert(mapping.target.clone(), table);
        }
        Ok(lookups)
    }

    fn map_row(
        &self,
        spec: &TransformSpec,
        source: &Row,
        lookups: &HashMap<String, BTreeMap<String, Value>>,
        row_index: u64,
    ) -> Result<Row, RowError> {
        let key = source.get(&spec.key_column).cloned();
        let fail = |field: &str, message: String| RowError {
            row: row_index,
            key: key.clone(),
            field: Some(field.to_string()),
            message,
        };

        let mut target = Row::new();
        for mapping in &spec.mappings {
            let raw = source.get(&mapping.source).cloned().unwrap_or(Value::Null);

            let value = if raw.is_null() {
                match &mapping.default_value {
                    Some(default) => default.clone(),
                    None if mapping.required => {
                        return Err(fail(
                            &mapping.target,
                            format!("required field {} has no value and no default", mapping.source),
                        ));
                    }
                    None => Value::Null,
                }
            } else {
                match self.apply_transform(mapping, &raw, source, lookups) {
                    Ok(value) => value,
                    Err(message) => return Err(fail(&mapping.target, message)),
                }
            };

            target.set(mapping.target.clone(), value);
        }

        for rule in &spec.validations {
            let value = target.get(&rule.field).cloned().unwrap_or(Value::Null);
            if rule.rule.matches(&value) {
                continue;
            }
            match rule.severity {
                Severity::Error => {
                    return Err(fail(&rule.field, rule.message.clone()));
                }
                Severity::Warning => {
                    tracing::warn!(
                        field = %rule.field,
                        row = row_index,
                        "{}",
                        rule.message
                    );
                }
            }
        }

        Ok(target)
    }

    fn apply_transform(
        &self,
        mapping: &FieldMapping,
        value: &Value,
        source: &Row,
        lookups: &HashMap<String, BTreeMap<String, Value>>,
    ) -> Result<Value, String> {
        let Some(transform) = &mapping.transform else {
            return Ok(value.clone());
        };

        match transform {
            FieldTransform::Function {
                definition,
                parameters,
            } => apply_builtin(*definition, value, parameters),
            FieldTransform::Expression { definition } => {
                Ok(Value::Text(render_template(definition, source)))
            }
            FieldTransform::Lookup { .. } => {
                let table = lookups
                    .get(&mapping.target)
                    .expect("lookup resolved before row processing");
                match table.get(&value.coerce_text()) {
                    Some(found) => Ok(found.clone()),
                    None => match &mapping.default_value {
                        Some(default) => Ok(default.clone()),
                        None if mapping.required => {
                            Err(format!("no lookup entry for {}", value.coerce_text()))
                        }
                        None => Ok(Value::Null),
                    },
                }
            }
            FieldTransform::Custom { definition } => {
                let function = self
                    .registry
                    .get(definition)
                    .expect("custom transform resolved before row processing");
                function(value, source)
            }
        }
    }
}

fn apply_builtin(
    function: BuiltinFunction,
    value: &Value,
    parameters: &[Value],
) -> Result<Value, String> {
    match function {
        BuiltinFunction::Upper => Ok(Value::Text(value.coerce_text().to_uppercase())),
        BuiltinFunction::Lower => Ok(Value::Text(value.coerce_text().to_lowercase())),
        BuiltinFunction::Trim => Ok(Value::Text(value.coerce_text().trim().to_string())),
        BuiltinFunction::Round => {
            let number = value
                .as_f64()
                .ok_or_else(|| format!("round applied to non-numeric value {value:?}"))?;
            let digits = parameters
                .first()
                .and_then(Value::as_f64)
                .unwrap_or(0.0) as i32;
            let factor = 10f64.powi(digits);
            let rounded = (number * factor).round() / factor;
            if digits <= 0 {
                Ok(Value::Integer(rounded as i64))
            } else {
                Ok(Value::Float(rounded))
            }
        }
        BuiltinFunction::Concat => {
            let mut out = value.coerce_text();
            for parameter in parameters {
                out.push_str(&parameter.coerce_text());
            }
            Ok(Value::Text(out))
        }
    }
}

/// Replace `{field}` placeholders with values from the source row.
fn render_template(template: &str, row: &Row) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        match rest[open..].find('}') {
            Some(close) => {
                let field = &rest[open + 1..open + close];
                match row.get(field) {
                    Some(value) => out.push_str(&value.coerce_text()),
                    None => {
                        out.push('{');
                        out.push_str(field);
                        out.push('}');
                    }
                }
                rest = &rest[open + close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnection;
    use crate::model::{ValidationRule, ValuePredicate};

    fn row(pairs: &[(&str, Value)]) -> Row {
        Row::from_pairs(
            pairs
                .iter()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect(),
        )
    }

    fn seeded_connection(rows: Vec<Row>) -> MemoryConnection {
        MemoryConnection::default()
            .with_table("old_users", rows)
            .with_table("users", Vec::new())
    }

    fn engine() -> TransformEngine {
        TransformEngine::new(TransformRegistry::new(), TransformOptions::default())
    }

    #[tokio::test]
    async fn test_copy_and_builtin_transforms() {
        let conn = seeded_connection(vec![
            row(&[("id", Value::Integer(1)), ("name", Value::Text("  Alice ".into()))]),
            row(&[("id", Value::Integer(2)), ("name", Value::Text("bob".into()))]),
        ]);

        let spec = TransformSpec::new("old_users", "users")
            .with_mapping(FieldMapping::copy("id", "id").required())
            .with_mapping(FieldMapping::copy("name", "name").with_transform(
                FieldTransform::Function {
                    definition: BuiltinFunction::Trim,
                    parameters: vec![],
                },
            ));

        let report = engine().run(&spec, &conn).await.unwrap();
        assert_eq!(report.rows_processed, 2);
        assert_eq!(report.rows_failed, 0);

        let written = conn.table("users");
        assert_eq!(written[0].get("name"), Some(&Value::Text("Alice".into())));
    }

    #[tokio::test]
    async fn test_required_field_without_default_fails_row() {
        let conn = seeded_connection(vec![
            row(&[("id", Value::Integer(1)), ("email", Value::Text("a@x".into()))]),
            row(&[("id", Value::Integer(2)), ("email", Value::Null)]),
        ]);

        let spec = TransformSpec::new("old_users", "users")
            .with_mapping(FieldMapping::copy("id", "id"))
            .with_mapping(FieldMapping::copy("email", "email").required());

        let report = engine().run(&spec, &conn).await.unwrap();
        assert_eq!(report.rows_processed, 1);
        assert_eq!(report.rows_failed, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].field.as_deref(), Some("email"));
    }

    #[tokio::test]
    async fn test_default_value_fills_missing() {
        let conn = seeded_connection(vec![row(&[("id", Value::Integer(1))])]);

        let spec = TransformSpec::new("old_users", "users")
            .with_mapping(FieldMapping::copy("id", "id"))
            .with_mapping(
                FieldMapping::copy("status", "status")
                    .required()
                    .with_default(Value::Text("active".into())),
            );

        let report = engine().run(&spec, &conn).await.unwrap();
        assert_eq!(report.rows_processed, 1);
        assert_eq!(
            conn.table("users")[0].get("status"),
            Some(&Value::Text("active".into()))
        );
    }

    #[tokio::test]
    async fn test_expression_template() {
        let conn = seeded_connection(vec![row(&[
            ("id", Value::Integer(1)),
            ("first", Value::Text("Ada".into())),
            ("last", Value::Text("Lovelace".into())),
        ])]);

        let spec = TransformSpec::new("old_users", "users")
            .with_mapping(FieldMapping::copy("id", "id"))
            .with_mapping(FieldMapping::copy("first", "full_name").with_transform(
                FieldTransform::Expression {
                    definition: "{first} {last}".to_string(),
                },
            ));

        engine().run(&spec, &conn).await.unwrap();
        assert_eq!(
            conn.table("users")[0].get("full_name"),
            Some(&Value::Text("Ada Lovelace".into()))
        );
    }

    #[tokio::test]
    async fn test_inline_lookup() {
        let conn = seeded_connection(vec![
            row(&[("id", Value::Integer(1)), ("plan", Value::Text("1".into()))]),
            row(&[("id", Value::Integer(2)), ("plan", Value::Text("2".into()))]),
        ]);

        let mut table = BTreeMap::new();
        table.insert("1".to_string(), Value::Text("free".into()));
        table.insert("2".to_string(), Value::Text("pro".into()));

        let spec = TransformSpec::new("old_users", "users")
            .with_mapping(FieldMapping::copy("id", "id"))
            .with_mapping(FieldMapping::copy("plan", "plan").with_transform(
                FieldTransform::Lookup {
                    definition: LookupSource::Inline(table),
                },
            ));

        engine().run(&spec, &conn).await.unwrap();
        let written = conn.table("users");
        assert_eq!(written[0].get("plan"), Some(&Value::Text("free".into())));
        assert_eq!(written[1].get("plan"), Some(&Value::Text("pro".into())));
    }

    #[tokio::test]
    async fn test_custom_transform() {
        let conn = seeded_connection(vec![row(&[
            ("id", Value::Integer(1)),
            ("score", Value::Integer(80)),
        ])]);

        let mut registry = TransformRegistry::new();
        registry.register("double", |value: &Value, _row: &Row| {
            value
                .as_f64()
                .map(|f| Value::Integer((f * 2.0) as i64))
                .ok_or_else(|| "not numeric".to_string())
        });

        let spec = TransformSpec::new("old_users", "users")
            .with_mapping(FieldMapping::copy("id", "id"))
            .with_mapping(FieldMapping::copy("score", "score").with_transform(
                FieldTransform::Custom {
                    definition: "double".to_string(),
                },
            ));

        let engine = TransformEngine::new(registry, TransformOptions::default());
        engine.run(&spec, &conn).await.unwrap();
        assert_eq!(conn.table("users")[0].get("score"), Some(&Value::Integer(160)));
    }

    #[tokio::test]
    async fn test_unknown_custom_transform_rejected_upfront() {
        let conn = seeded_connection(vec![]);
        let spec = TransformSpec::new("old_users", "users").with_mapping(
            FieldMapping::copy("id", "id").with_transform(FieldTransform::Custom {
                definition: "ghost".to_string(),
            }),
        );

        assert!(matches!(
            engine().run(&spec, &conn).await,
            Err(TransformError::UnknownCustomTransform(name)) if name == "ghost"
        ));
    }

    #[tokio::test]
    async fn test_validation_error_skips_row_warning_does_not() {
        let conn = seeded_connection(vec![
            row(&[("id", Value::Integer(1)), ("email", Value::Text("a@x".into()))]),
            row(&[("id", Value::Integer(2)), ("email", Value::Text(" ".into()))]),
        ]);

        let spec = TransformSpec::new("old_users", "users")
            .with_mapping(FieldMapping::copy("id", "id"))
            .with_mapping(FieldMapping::copy("email", "email"))
            .with_validation(ValidationRule::error(
                "email",
                ValuePredicate::NonEmpty,
                "email must not be blank",
            ))
            .with_validation(ValidationRule::warning(
                "id",
                ValuePredicate::MaxLength(1),
                "long id",
            ));

        let report = engine().run(&spec, &conn).await.unwrap();
        assert_eq!(report.rows_processed, 1);
        assert_eq!(report.rows_failed, 1);
        assert_eq!(report.errors[0].message, "email must not be blank");
    }

    #[tokio::test]
    async fn test_error_rate_below_threshold_does_not_abort() {
        // 3% failures across 10,000 rows, batch size 1,000.
        let mut rows = Vec::with_capacity(10_000);
        for i in 0..10_000i64 {
            let email = if i % 100 < 3 {
                Value::Null
            } else {
                Value::Text(format!("user{i}@example.com"))
            };
            rows.push(row(&[("id", Value::Integer(i)), ("email", email)]));
        }
        let conn = seeded_connection(rows);

        let spec = TransformSpec::new("old_users", "users")
            .with_mapping(FieldMapping::copy("id", "id"))
            .with_mapping(FieldMapping::copy("email", "email").required())
            .with_batch_size(1000);

        let report = engine().run(&spec, &conn).await.unwrap();
        assert_eq!(report.rows_processed, 9700);
        assert_eq!(report.rows_failed, 300);
    }

    #[tokio::test]
    async fn test_error_rate_above_threshold_aborts() {
        let mut rows = Vec::new();
        for i in 0..100i64 {
            rows.push(row(&[("id", Value::Integer(i)), ("email", Value::Null)]));
        }
        let conn = seeded_connection(rows);

        let spec = TransformSpec::new("old_users", "users")
            .with_mapping(FieldMapping::copy("id", "id"))
            .with_mapping(FieldMapping::copy("email", "email").required())
            .with_batch_size(10);

        assert!(matches!(
            engine().run(&spec, &conn).await,
            Err(TransformError::Aborted { .. })
        ));
    }

    #[tokio::test]
    async fn test_filter_restricts_source_rows() {
        let conn = seeded_connection(vec![
            row(&[("id", Value::Integer(1)), ("active", Value::Integer(1))]),
            row(&[("id", Value::Integer(2)), ("active", Value::Integer(0))]),
        ]);

        let spec = TransformSpec::new("old_users", "users")
            .with_mapping(FieldMapping::copy("id", "id"))
            .with_filter("active = 1");

        let report = engine().run(&spec, &conn).await.unwrap();
        assert_eq!(report.rows_processed, 1);
    }
}
