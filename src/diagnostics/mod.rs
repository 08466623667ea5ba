//! Configuration self-test.
//!
//! A run executes an ordered list of checks. Each check yields at most one
//! [`TestResult`]; checks that do not apply to the current configuration yield
//! nothing. Later checks can use tokens acquired by earlier ones. A run never
//! fails: every error becomes a failed result with an explanation.

pub mod cache;
pub mod checks;

use std::sync::{Arc, Mutex};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::auth::TokenBroker;
use crate::config::Config;
use crate::context::{Capabilities, RequestContext};
use crate::error::BrokerError;
use crate::graph::GraphClient;

pub use cache::ResultCache;
pub use checks::Check;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Critical,
    Blocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Configuration,
    AccessToken,
    Permissions,
    Graph,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixOperation {
    Set,
    Add,
    Remove,
    Replace,
}

/// A configuration change that would resolve a failed check.
///
/// Fixes are suggestions; they are applied only through [`DiagnosticRunner::apply_fix`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub operation: FixOperation,
    /// Dotted configuration key, e.g. `graph.allow_all_endpoints`.
    pub option: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Value>,
}

impl Fix {
    pub fn set(option: impl Into<String>, value: Value) -> Self {
        Self {
            operation: FixOperation::Set,
            option: option.into(),
            value,
            previous: None,
        }
    }

    pub fn add(option: impl Into<String>, value: Value) -> Self {
        Self {
            operation: FixOperation::Add,
            ..Self::set(option, value)
        }
    }

    pub fn remove(option: impl Into<String>, value: Value) -> Self {
        Self {
            operation: FixOperation::Remove,
            ..Self::set(option, value)
        }
    }

    pub fn replace(option: impl Into<String>, previous: Value, value: Value) -> Self {
        Self {
            operation: FixOperation::Replace,
            previous: Some(previous),
            ..Self::set(option, value)
        }
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub title: String,
    pub category: Category,
    pub severity: Severity,
    pub passed: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub more_info: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<Fix>,
}

impl TestResult {
    pub fn new(title: impl Into<String>, category: Category, severity: Severity) -> Self {
        Self {
            title: title.into(),
            category,
            severity,
            passed: false,
            message: String::new(),
            more_info: None,
            data: Value::Null,
            fix: None,
        }
    }

    pub fn pass(mut self, message: impl Into<String>) -> Self {
        self.passed = true;
        self.message = message.into();
        self
    }

    pub fn fail(mut self, message: impl Into<String>) -> Self {
        self.passed = false;
        self.message = message.into();
        self
    }

    pub fn more_info(mut self, url: impl Into<String>) -> Self {
        self.more_info = Some(url.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn fix(mut self, fix: Fix) -> Self {
        self.fix = Some(fix);
        self
    }
}

/// Runs the self-test and caches its results.
pub struct DiagnosticRunner {
    config: Arc<Config>,
    broker: Arc<TokenBroker>,
    graph: Arc<GraphClient>,
    capabilities: Capabilities,
    cache: Mutex<ResultCache>,
}

impl DiagnosticRunner {
    pub fn new(
        config: Arc<Config>,
        broker: Arc<TokenBroker>,
        graph: Arc<GraphClient>,
        capabilities: Capabilities,
    ) -> Self {
        let ttl = Duration::minutes(config.diagnostics.cache_minutes.max(0));
        Self {
            config,
            broker,
            graph,
            capabilities,
            cache: Mutex::new(ResultCache::new(ttl)),
        }
    }

    /// Run every check, or return cached results unless `force` is set.
    pub async fn run(&self, ctx: &RequestContext, force: bool) -> Vec<TestResult> {
        let principal_id = ctx.principal.as_ref().map(|p| p.id.clone());

        if !force {
            let cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(results) = cache.get(principal_id.as_deref()) {
                info!("Returning cached self-test results");
                return results.clone();
            }
        }

        let env = checks::CheckEnv {
            config: &self.config,
            broker: &self.broker,
            graph: &self.graph,
            capabilities: &self.capabilities,
            ctx,
        };
        let mut state = checks::RunState::default();
        let mut results = Vec::new();
        for check in checks::plan(&self.config) {
            if let Some(result) = check.run(&env, &mut state).await {
                results.push(result);
            }
        }

        let failed = results.iter().filter(|r| !r.passed).count();
        info!(
            "Self-test finished: {} result(s), {} failed (correlation {})",
            results.len(),
            failed,
            ctx.correlation_id
        );

        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .set(principal_id.as_deref(), results.clone());
        results
    }

    /// Apply an administrator-approved fix and drop cached results.
    ///
    /// The caller owns `config` and decides when components are rebuilt with it.
    pub fn apply_fix(&self, config: &mut Config, fix: &Fix) -> Result<(), BrokerError> {
        config.apply_fix(fix)?;
        self.invalidate();
        info!("Applied fix {:?} to {}", fix.operation, fix.option);
        Ok(())
    }

    pub fn invalidate(&self) {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .invalidate();
    }
}
