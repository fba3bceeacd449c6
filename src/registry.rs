use std::collections::HashMap;

use crate::types::BedrockDialect;

/// Where a catalogued model is served from.
#[derive(Debug, Clone, PartialEq)]
pub enum Serving {
    /// Managed Bedrock model, always available.
    Bedrock {
        model_id: String,
        dialect: BedrockDialect,
    },
    /// Deployed on our own infrastructure. `model_path` is the name the
    /// server knows the model by (usually the Hugging Face repo).
    SelfHosted { model_path: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelCapability {
    pub supports_multimodal: bool,
    pub serving: Serving,
}

/// Read-only model metadata lookup.
pub trait ModelCatalog: Send + Sync {
    fn capability(&self, model_key: &str) -> Option<ModelCapability>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentStatus {
    Deployed { endpoint: String },
    InProgress,
    NotDeployed,
    Failed,
}

/// Read-only deployment status lookup. Called concurrently; implementations
/// must not need exclusive access.
pub trait DeploymentRegistry: Send + Sync {
    fn status(&self, model_key: &str) -> DeploymentStatus;
}

/// In-memory catalog.
#[derive(Debug, Default, Clone)]
pub struct StaticCatalog {
    models: HashMap<String, ModelCapability>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bedrock(
        mut self,
        key: impl Into<String>,
        model_id: impl Into<String>,
        dialect: BedrockDialect,
        supports_multimodal: bool,
    ) -> Self {
        self.models.insert(
            key.into(),
            ModelCapability {
                supports_multimodal,
                serving: Serving::Bedrock {
                    model_id: model_id.into(),
                    dialect,
                },
            },
        );
        self
    }

    pub fn self_hosted(
        mut self,
        key: impl Into<String>,
        model_path: impl Into<String>,
        supports_multimodal: bool,
    ) -> Self {
        self.models.insert(
            key.into(),
            ModelCapability {
                supports_multimodal,
                serving: Serving::SelfHosted {
                    model_path: model_path.into(),
                },
            },
        );
        self
    }
}

impl ModelCatalog for StaticCatalog {
    fn capability(&self, model_key: &str) -> Option<ModelCapability> {
        self.models.get(model_key).cloned()
    }
}

/// In-memory deployment table. Unknown keys are `NotDeployed`.
#[derive(Debug, Default, Clone)]
pub struct StaticDeployments {
    statuses: HashMap<String, DeploymentStatus>,
}

impl StaticDeployments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, key: impl Into<String>, status: DeploymentStatus) -> Self {
        self.statuses.insert(key.into(), status);
        self
    }

    pub fn deployed(self, key: impl Into<String>, endpoint: impl Into<String>) -> Self {
        self.with_status(
            key,
            DeploymentStatus::Deployed {
                endpoint: endpoint.into(),
            },
        )
    }
}

impl DeploymentRegistry for StaticDeployments {
    fn status(&self, model_key: &str) -> DeploymentStatus {
        self.statuses
            .get(model_key)
            .cloned()
            .unwrap_or(DeploymentStatus::NotDeployed)
    }
}
