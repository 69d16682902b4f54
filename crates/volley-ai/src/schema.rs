//! Schema registry: declared argument shapes per tool

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{CallError, Error, Result};
use crate::types::{ExecutionDomain, ToolSpec};

/// A tool registered with a compiled argument validator
#[derive(Clone)]
pub struct RegisteredTool {
    pub spec: ToolSpec,
    pub domain: ExecutionDomain,
    validator: Arc<jsonschema::Validator>,
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("spec", &self.spec)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// Registry of tool shapes keyed by name.
///
/// Registration happens before a turn begins; afterwards the registry is
/// shared read-only (cloning is cheap, validators are reference counted).
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl SchemaRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Names must be unique and the schema must compile.
    pub fn register(&mut self, spec: ToolSpec, domain: ExecutionDomain) -> Result<()> {
        if self.index.contains_key(&spec.name) {
            return Err(Error::InvalidTool {
                name: spec.name,
                reason: "a tool with this name is already registered".into(),
            });
        }
        let validator = jsonschema::validator_for(&spec.parameters).map_err(|e| {
            Error::InvalidTool {
                name: spec.name.clone(),
                reason: format!("invalid parameter schema: {}", e),
            }
        })?;

        self.index.insert(spec.name.clone(), self.tools.len());
        self.tools.push(RegisteredTool {
            spec,
            domain,
            validator: Arc::new(validator),
        });
        Ok(())
    }

    /// Whether a tool with this name exists
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Look up a registered tool
    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    /// Execution domain of a tool
    pub fn domain(&self, name: &str) -> Option<ExecutionDomain> {
        self.get(name).map(|t| t.domain)
    }

    /// Tool specs in registration order
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec.clone()).collect()
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate already-parsed arguments against the tool's shape
    pub fn validate(
        &self,
        name: &str,
        arguments: &serde_json::Value,
    ) -> std::result::Result<(), CallError> {
        let tool = self.get(name).ok_or_else(|| CallError::UnknownTool {
            name: name.to_string(),
        })?;

        let errors: Vec<String> = tool
            .validator
            .iter_errors(arguments)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CallError::ArgumentValidation {
                message: format!("Tool argument validation failed:\n{}", errors.join("\n")),
            })
        }
    }

    /// Parse concatenated argument text and validate it.
    /// Empty text is treated as an empty object.
    pub fn parse_and_validate(
        &self,
        name: &str,
        raw: &str,
    ) -> std::result::Result<serde_json::Value, CallError> {
        let arguments = if raw.trim().is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(raw).map_err(|e| CallError::ArgumentValidation {
                message: format!("Tool arguments are not valid JSON: {}", e),
            })?
        };
        self.validate(name, &arguments)?;
        Ok(arguments)
    }
}
