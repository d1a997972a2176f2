//! Variable interpolation for pipeline configurations.
//!
//! Supports variables like:
//! - `${pipeline.name}` - Pipeline name
//! - `${run.id}` - Run ID
//! - `${stage.name}` / `${stage.index}` - Current stage
//! - `${action.name}` - Current action
//! - `${environment.name}` - Target environment name
//! - `${environment.account}`, `${environment.region}`, `${environment.network}`
//! - `${unit.name}` / `${unit.container}` - Deployable unit being deployed
//! - `${image}` - Image reference being deployed
//! - `${env.VAR_NAME}` - Environment variable
//! - `${timestamp}` - Unix timestamp
//! - `${date}` - ISO date (YYYY-MM-DD)
//! - `${datetime}` - ISO datetime
//!
//! Unknown variables are left untouched.

use conveyor_core::deployer::{DeployableUnit, EnvironmentDescriptor};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub pipeline: PipelineContext,
    pub run: RunContext,
    pub stage: StageContext,
    pub action: ActionContext,
    pub environment: EnvironmentContext,
    pub unit: UnitContext,
    /// Image reference of the deployment in progress.
    pub image: Option<String>,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Custom variables defined by user
    pub custom: HashMap<String, String>,
}

/// Pipeline context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    pub name: String,
}

/// Run context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub id: String,
}

/// Stage context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    pub name: String,
    pub index: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    pub name: String,
}

/// Target environment context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentContext {
    pub name: String,
    pub account: Option<String>,
    pub region: Option<String>,
    pub network: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UnitContext {
    pub name: String,
    pub container: String,
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}")
        .expect("variable pattern is valid")
});

impl VariableContext {
    /// Create a new empty variable context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate environment variables from the current process environment.
    pub fn populate_env(&mut self) {
        for (key, value) in std::env::vars() {
            self.env.insert(key, value);
        }
    }

    /// Add a custom variable.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.custom.insert(name.to_string(), value.into());
    }

    /// Point the context at a target environment. The descriptor's own
    /// variables shadow same-named `env` entries.
    pub fn set_environment(&mut self, environment: &EnvironmentDescriptor) {
        self.environment = EnvironmentContext {
            name: environment.name.clone(),
            account: environment.account.clone(),
            region: environment.region.clone(),
            network: environment.network.clone(),
        };
        self.env.extend(environment.variables.clone());
    }

    pub fn set_unit(&mut self, unit: &DeployableUnit) {
        self.unit = UnitContext {
            name: unit.name.clone(),
            container: unit.container.clone(),
        };
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["pipeline", "name"] => Some(self.pipeline.name.clone()),

            ["run", "id"] => Some(self.run.id.clone()),

            ["stage", "name"] => Some(self.stage.name.clone()),
            ["stage", "index"] => Some(self.stage.index.to_string()),

            ["action", "name"] => Some(self.action.name.clone()),

            ["environment", "name"] => Some(self.environment.name.clone()),
            ["environment", "account"] => self.environment.account.clone(),
            ["environment", "region"] => self.environment.region.clone(),
            ["environment", "network"] => self.environment.network.clone(),

            ["unit", "name"] => Some(self.unit.name.clone()),
            ["unit", "container"] => Some(self.unit.container.clone()),

            ["image"] => self.image.clone(),

            ["env", name] => self.env.get(*name).cloned(),

            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),
            ["datetime"] => Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),

            // Single-part names check custom variables
            [name] => self.custom.get(*name).cloned(),

            _ => None,
        }
    }

    /// Interpolate all variables in a string.
    /// Variables are specified as `${var_name}` or `${namespace.var_name}`.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Interpolate variables in a list of strings.
    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }

    /// Interpolate variables in a HashMap.
    pub fn interpolate_map(&self, map: &HashMap<String, String>) -> HashMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_pipeline(mut self, name: impl Into<String>) -> Self {
        self.ctx.pipeline.name = name.into();
        self
    }

    pub fn with_run(mut self, id: impl Into<String>) -> Self {
        self.ctx.run.id = id.into();
        self
    }

    pub fn with_stage(mut self, name: impl Into<String>, index: usize) -> Self {
        self.ctx.stage.name = name.into();
        self.ctx.stage.index = index;
        self
    }

    pub fn with_action(mut self, name: impl Into<String>) -> Self {
        self.ctx.action.name = name.into();
        self
    }

    pub fn with_environment(mut self, environment: &EnvironmentDescriptor) -> Self {
        self.ctx.set_environment(environment);
        self
    }

    pub fn with_unit(mut self, unit: &DeployableUnit) -> Self {
        self.ctx.set_unit(unit);
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.ctx.image = Some(image.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
