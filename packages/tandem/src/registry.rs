//! Job type registry.
//!
//! Maps type name strings to everything the engine needs to know about a
//! type: whether it may start a chain, how to validate payloads, which
//! continuations and blockers it accepts, its retry and lease policies,
//! and the processor that executes it.
//!
//! Handlers are plain async closures over a [`JobContext`]:
//!
//! ```ignore
//! let mut registry = JobTypeRegistry::new();
//! registry.register("send_welcome", JobTypeOptions::entry(), |ctx| async move {
//!     let email = ctx.input()["email"].as_str().unwrap_or_default().to_string();
//!     send_email(&email).await.map_err(JobFailure::unexpected)?;
//!     ctx.complete(serde_json::json!({"sent": true})).await?;
//!     Ok(())
//! })?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::{Error, JobFailure, Result};
use crate::job::{LeaseConfig, RetryConfig};
use crate::runtime::JobContext;

/// Payload validator: `Err(message)` rejects the value.
pub type Validator = Arc<dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync>;

/// Boxed processor stored in the registry.
pub type BoxedProcessor =
    Arc<dyn Fn(JobContext) -> BoxFuture<'static, std::result::Result<(), JobFailure>> + Send + Sync>;

// ============================================================================
// Per-type options
// ============================================================================

/// Static metadata for one job type.
#[derive(Clone, Default)]
pub struct JobTypeOptions {
    entry: bool,
    input_validator: Option<Validator>,
    output_validator: Option<Validator>,
    continue_targets: Option<Vec<String>>,
    blockers_required: bool,
    blocker_types: Option<Vec<String>>,
    retry: Option<RetryConfig>,
    lease: Option<LeaseConfig>,
}

impl JobTypeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// An entry type: a permitted target of `start_job_chain`.
    pub fn entry() -> Self {
        Self {
            entry: true,
            ..Self::default()
        }
    }

    pub fn with_input_validator(
        mut self,
        f: impl Fn(&Value) -> std::result::Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.input_validator = Some(Arc::new(f));
        self
    }

    pub fn with_output_validator(
        mut self,
        f: impl Fn(&Value) -> std::result::Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.output_validator = Some(Arc::new(f));
        self
    }

    /// Restrict which types this type may continue with. Undeclared means
    /// any registered type.
    pub fn with_continue_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.continue_targets = Some(targets.into_iter().map(Into::into).collect());
        self
    }

    /// Require at least one blocker chain at start.
    pub fn with_required_blockers(mut self) -> Self {
        self.blockers_required = true;
        self
    }

    /// Restrict the chain types accepted as blockers. Undeclared means
    /// any chain.
    pub fn with_blocker_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocker_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_lease(mut self, lease: LeaseConfig) -> Self {
        self.lease = Some(lease);
        self
    }
}

struct JobTypeEntry {
    options: JobTypeOptions,
    processor: Option<BoxedProcessor>,
}

// ============================================================================
// Registry
// ============================================================================

/// Registry of every job type known to a client or worker.
#[derive(Default)]
pub struct JobTypeRegistry {
    types: HashMap<String, JobTypeEntry>,
    default_retry: RetryConfig,
    default_lease: LeaseConfig,
}

impl JobTypeRegistry {
    pub fn new() -> Self {
        Self {
            types: HashMap::new(),
            default_retry: RetryConfig::default(),
            default_lease: LeaseConfig::default(),
        }
    }

    pub fn with_default_retry(mut self, retry: RetryConfig) -> Self {
        self.default_retry = retry;
        self
    }

    pub fn with_default_lease(mut self, lease: LeaseConfig) -> Result<Self> {
        Self::check_lease(&lease)?;
        self.default_lease = lease;
        Ok(self)
    }

    fn check_lease(lease: &LeaseConfig) -> Result<()> {
        if lease.renew_interval_ms >= lease.lease_ms {
            return Err(Error::InvalidConfig {
                message: format!(
                    "renew_interval_ms ({}) must be shorter than lease_ms ({})",
                    lease.renew_interval_ms, lease.lease_ms
                ),
            });
        }
        Ok(())
    }

    fn insert(
        &mut self,
        type_name: String,
        options: JobTypeOptions,
        processor: Option<BoxedProcessor>,
    ) -> Result<()> {
        if let Some(lease) = &options.lease {
            Self::check_lease(lease)?;
        }
        if self.types.contains_key(&type_name) {
            return Err(Error::InvalidConfig {
                message: format!("job type `{type_name}` registered twice"),
            });
        }
        self.types
            .insert(type_name, JobTypeEntry { options, processor });
        Ok(())
    }

    /// Register a type with its processor.
    pub fn register<F, Fut>(
        &mut self,
        type_name: impl Into<String>,
        options: JobTypeOptions,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), JobFailure>> + Send + 'static,
    {
        let boxed: BoxedProcessor = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.insert(type_name.into(), options, Some(boxed))
    }

    /// Declare a type without a processor. Useful for clients that start
    /// chains processed by workers elsewhere.
    pub fn declare(&mut self, type_name: impl Into<String>, options: JobTypeOptions) -> Result<()> {
        self.insert(type_name.into(), options, None)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    pub fn is_entry(&self, type_name: &str) -> bool {
        self.types
            .get(type_name)
            .map(|entry| entry.options.entry)
            .unwrap_or(false)
    }

    pub fn processor(&self, type_name: &str) -> Option<BoxedProcessor> {
        self.types
            .get(type_name)
            .and_then(|entry| entry.processor.clone())
    }

    /// Type names that have a processor, sorted for stable worker
    /// ownership sets.
    pub fn processable_type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .types
            .iter()
            .filter(|(_, entry)| entry.processor.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn retry_config(&self, type_name: &str) -> RetryConfig {
        self.types
            .get(type_name)
            .and_then(|entry| entry.options.retry)
            .unwrap_or(self.default_retry)
    }

    pub fn lease_config(&self, type_name: &str) -> LeaseConfig {
        self.types
            .get(type_name)
            .and_then(|entry| entry.options.lease)
            .unwrap_or(self.default_lease)
    }

    // ---- validation --------------------------------------------------------

    fn entry_for(&self, type_name: &str) -> Result<&JobTypeEntry> {
        self.types
            .get(type_name)
            .ok_or_else(|| Error::validation(type_name, "unknown job type"))
    }

    /// A `start_job_chain` target must be a registered entry type.
    pub fn validate_entry(&self, type_name: &str) -> Result<()> {
        let entry = self.entry_for(type_name)?;
        if !entry.options.entry {
            return Err(Error::validation(type_name, "not an entry type"));
        }
        Ok(())
    }

    pub fn validate_input(&self, type_name: &str, input: &Value) -> Result<()> {
        let entry = self.entry_for(type_name)?;
        if let Some(validator) = &entry.options.input_validator {
            validator(input).map_err(|message| {
                Error::validation(type_name, format!("invalid input: {message}"))
            })?;
        }
        Ok(())
    }

    pub fn validate_output(&self, type_name: &str, output: &Value) -> Result<()> {
        let entry = self.entry_for(type_name)?;
        if let Some(validator) = &entry.options.output_validator {
            validator(output).map_err(|message| {
                Error::validation(type_name, format!("invalid output: {message}"))
            })?;
        }
        Ok(())
    }

    /// Check a continuation against the declaring type's target list.
    pub fn validate_continuation(&self, from_type: &str, to_type: &str) -> Result<()> {
        let from = self.entry_for(from_type)?;
        if !self.contains(to_type) {
            return Err(Error::validation(
                to_type,
                format!("unknown continuation target of `{from_type}`"),
            ));
        }
        if let Some(targets) = &from.options.continue_targets {
            if !targets.iter().any(|t| t == to_type) {
                return Err(Error::validation(
                    from_type,
                    format!("`{to_type}` is not a declared continuation target"),
                ));
            }
        }
        Ok(())
    }

    /// Check the blocker chains attached to a job of `type_name`.
    pub fn validate_blockers(&self, type_name: &str, blocker_chain_types: &[&str]) -> Result<()> {
        let entry = self.entry_for(type_name)?;
        if entry.options.blockers_required && blocker_chain_types.is_empty() {
            return Err(Error::validation(type_name, "blockers required but none supplied"));
        }
        if let Some(allowed) = &entry.options.blocker_types {
            for blocker_type in blocker_chain_types {
                if !allowed.iter().any(|t| t == blocker_type) {
                    return Err(Error::validation(
                        type_name,
                        format!("`{blocker_type}` is not an accepted blocker chain type"),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(type_name: &str, options: JobTypeOptions) -> JobTypeRegistry {
        let mut registry = JobTypeRegistry::new();
        registry.declare(type_name, options).unwrap();
        registry
    }

    #[test]
    fn entry_validation_rejects_non_entry_types() {
        let registry = registry_with("step", JobTypeOptions::new());
        assert!(matches!(
            registry.validate_entry("step"),
            Err(Error::JobTypeValidation { .. })
        ));
        assert!(matches!(
            registry.validate_entry("missing"),
            Err(Error::JobTypeValidation { .. })
        ));

        let registry = registry_with("start", JobTypeOptions::entry());
        assert!(registry.validate_entry("start").is_ok());
    }

    #[test]
    fn input_validator_gates_payloads() {
        let options = JobTypeOptions::entry().with_input_validator(|v| {
            v.get("value")
                .and_then(Value::as_i64)
                .map(|_| ())
                .ok_or_else(|| "missing `value`".to_string())
        });
        let registry = registry_with("typed", options);

        assert!(registry
            .validate_input("typed", &serde_json::json!({"value": 1}))
            .is_ok());
        assert!(registry
            .validate_input("typed", &serde_json::json!({"other": 1}))
            .is_err());
    }

    #[test]
    fn continuation_targets_are_enforced_when_declared() {
        let mut registry = JobTypeRegistry::new();
        registry
            .declare(
                "first",
                JobTypeOptions::entry().with_continue_targets(["second"]),
            )
            .unwrap();
        registry.declare("second", JobTypeOptions::new()).unwrap();
        registry.declare("third", JobTypeOptions::new()).unwrap();

        assert!(registry.validate_continuation("first", "second").is_ok());
        assert!(registry.validate_continuation("first", "third").is_err());
        // Undeclared targets allow any registered type.
        assert!(registry.validate_continuation("second", "third").is_ok());
        assert!(registry.validate_continuation("second", "missing").is_err());
    }

    #[test]
    fn required_blockers_reject_empty_sets() {
        let registry = registry_with(
            "gated",
            JobTypeOptions::entry()
                .with_required_blockers()
                .with_blocker_types(["auth"]),
        );
        assert!(registry.validate_blockers("gated", &[]).is_err());
        assert!(registry.validate_blockers("gated", &["auth"]).is_ok());
        assert!(registry.validate_blockers("gated", &["other"]).is_err());
    }

    #[test]
    fn lease_with_renew_not_shorter_than_lease_is_rejected() {
        let mut registry = JobTypeRegistry::new();
        let result = registry.declare(
            "bad",
            JobTypeOptions::new().with_lease(LeaseConfig {
                lease_ms: 1_000,
                renew_interval_ms: 1_000,
            }),
        );
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = JobTypeRegistry::new();
        registry.declare("dup", JobTypeOptions::new()).unwrap();
        assert!(matches!(
            registry.declare("dup", JobTypeOptions::new()),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn per_type_configs_fall_back_to_defaults() {
        let custom_retry = RetryConfig {
            initial_delay_ms: 5,
            multiplier: 3.0,
            max_delay_ms: 50,
        };
        let mut registry = JobTypeRegistry::new();
        registry
            .declare("tuned", JobTypeOptions::new().with_retry(custom_retry))
            .unwrap();
        registry.declare("plain", JobTypeOptions::new()).unwrap();

        assert_eq!(registry.retry_config("tuned"), custom_retry);
        assert_eq!(registry.retry_config("plain"), RetryConfig::default());
        assert_eq!(registry.lease_config("plain"), LeaseConfig::default());
    }

    #[test]
    fn processable_types_are_sorted_and_exclude_declarations() {
        let mut registry = JobTypeRegistry::new();
        registry
            .register("zeta", JobTypeOptions::new(), |_ctx| async { Ok(()) })
            .unwrap();
        registry
            .register("alpha", JobTypeOptions::new(), |_ctx| async { Ok(()) })
            .unwrap();
        registry.declare("declared", JobTypeOptions::new()).unwrap();

        assert_eq!(registry.processable_type_names(), vec!["alpha", "zeta"]);
        assert!(registry.processor("declared").is_none());
        assert!(registry.processor("alpha").is_some());
    }
}
