use std::collections::HashSet;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::Backends;
use crate::events::StreamEvent;
use crate::registry::{
    DeploymentRegistry, DeploymentStatus, ModelCatalog, Serving, StaticCatalog, StaticDeployments,
};
use crate::types::{InferenceRequest, Target, TargetRef, TargetSpec};
use crate::worker::{TargetWorker, WorkerSettings};
use crate::FanOutConfig;

/// Outcome of resolving one caller target before any worker starts.
#[derive(Debug)]
pub enum Resolution {
    Spawn(Target),
    /// Answered without a worker (not deployed, unknown model).
    Settled(StreamEvent),
}

/// Fans one request out to many targets and merges their streams.
pub struct FanOut {
    backends: Backends,
    catalog: Arc<dyn ModelCatalog>,
    deployments: Arc<dyn DeploymentRegistry>,
    config: FanOutConfig,
}

impl FanOut {
    pub fn new(backends: Backends, config: FanOutConfig) -> Self {
        Self {
            backends,
            catalog: Arc::new(StaticCatalog::new()),
            deployments: Arc::new(StaticDeployments::new()),
            config,
        }
    }

    pub fn with_catalog(mut self, catalog: impl ModelCatalog + 'static) -> Self {
        self.catalog = Arc::new(catalog);
        self
    }

    pub fn with_deployments(mut self, deployments: impl DeploymentRegistry + 'static) -> Self {
        self.deployments = Arc::new(deployments);
        self
    }

    /// Resolve a caller-supplied target. Self-hosted models get their
    /// pre-flight deployment check here.
    pub fn resolve(&self, target: &TargetRef) -> Resolution {
        self.resolve_as(target, target.id().to_string())
    }

    fn resolve_as(&self, target: &TargetRef, id: String) -> Resolution {
        match target {
            TargetRef::Manual {
                api_url,
                model_name,
                ..
            } => Resolution::Spawn(Target {
                id,
                spec: TargetSpec::HttpCompatible {
                    base_url: api_url.clone(),
                    model_name: model_name.clone(),
                },
                supports_multimodal: true,
                registry_backed: false,
            }),
            TargetRef::SageMaker {
                endpoint_name,
                model_name,
                stream_supported,
                ..
            } => Resolution::Spawn(Target {
                id,
                spec: TargetSpec::SageMaker {
                    endpoint_name: endpoint_name.clone(),
                    model_name: model_name.clone(),
                    stream_supported: *stream_supported,
                },
                supports_multimodal: true,
                registry_backed: false,
            }),
            TargetRef::Model(key) => {
                let Some(capability) = self.catalog.capability(key) else {
                    return Resolution::Settled(StreamEvent::Error {
                        target_id: id,
                        message: format!("unknown model: {key}"),
                    });
                };
                match capability.serving {
                    Serving::Bedrock { model_id, dialect } => Resolution::Spawn(Target {
                        id,
                        spec: TargetSpec::Bedrock { model_id, dialect },
                        supports_multimodal: capability.supports_multimodal,
                        registry_backed: false,
                    }),
                    Serving::SelfHosted { model_path } => match self.deployments.status(key) {
                        DeploymentStatus::Deployed { endpoint } => Resolution::Spawn(Target {
                            id,
                            spec: TargetSpec::HttpCompatible {
                                base_url: endpoint,
                                model_name: model_path,
                            },
                            supports_multimodal: capability.supports_multimodal,
                            registry_backed: true,
                        }),
                        status => {
                            let message = match status {
                                DeploymentStatus::InProgress => {
                                    format!("Model {key} is still being deployed")
                                }
                                DeploymentStatus::Failed => format!("Model {key} deployment failed"),
                                _ => format!("Model {key} is not deployed"),
                            };
                            Resolution::Settled(StreamEvent::NotDeployed {
                                target_id: id,
                                message,
                            })
                        }
                    },
                }
            }
        }
    }

    pub fn run(&self, request: InferenceRequest) -> impl Stream<Item = StreamEvent> + Send + 'static {
        self.run_with_cancel(request, CancellationToken::new())
    }

    /// Lazily run the fan-out. Every target yields exactly one terminal
    /// event and the stream always ends with [`StreamEvent::AllDone`].
    /// Dropping the stream aborts any workers still running.
    pub fn run_with_cancel(
        &self,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let mut request = request;
        let invalid = request.check().err();
        if let Some(e) = &invalid {
            warn!(error = %e, "rejecting request");
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut settled = Vec::new();
        let mut spawnable = Vec::new();
        {
            let mut refs = HashSet::new();
            for target in &request.targets {
                if !refs.insert(target) {
                    debug!(target_id = target.id(), "duplicate target dropped");
                    continue;
                }
                let id = if seen.contains(target.id()) {
                    target.qualified_id()
                } else {
                    target.id().to_string()
                };
                if !seen.insert(id.clone()) {
                    debug!(target_id = %id, "target id already in use, dropped");
                    continue;
                }
                if let Some(e) = &invalid {
                    settled.push(StreamEvent::Error {
                        target_id: id,
                        message: e.to_string(),
                    });
                    continue;
                }
                match self.resolve_as(target, id) {
                    Resolution::Spawn(target) => spawnable.push(target),
                    Resolution::Settled(event) => settled.push(event),
                }
            }
        }

        let backends = self.backends.clone();
        let heartbeat = self.config.heartbeat_interval;
        let join_timeout = self.config.join_timeout;
        let settings = WorkerSettings {
            read_timeout: self.config.read_timeout,
            partial_delay: self.config.partial_delay,
            anthropic_version: self.config.anthropic_version.clone(),
        };

        async_stream::stream! {
            let total = seen.len();
            info!(
                targets = total,
                workers = spawnable.len(),
                images = request.images.len(),
                "fan-out started"
            );

            let (tx, mut rx) = mpsc::unbounded_channel();
            // Settled targets are reported before any worker starts.
            for event in settled {
                let _ = tx.send(event);
            }

            let request = Arc::new(request);
            let mut workers = JoinSet::new();
            for target in spawnable {
                let backend = backends.for_target(&target.spec);
                let worker = TargetWorker::new(target, backend, tx.clone(), settings.clone());
                workers.spawn(worker.run(request.clone()));
            }
            drop(tx);

            let mut completed: HashSet<String> = HashSet::new();
            let mut abandoned = None;
            while completed.len() < total {
                let step = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    received = tokio::time::timeout(heartbeat, rx.recv()) => Some(received),
                };

                match step {
                    None => {
                        info!(completed = completed.len(), total, "fan-out cancelled");
                        abandoned = Some("cancelled");
                        break;
                    }
                    Some(Err(_)) => {
                        yield StreamEvent::Heartbeat {
                            completed_count: completed.len(),
                            total_count: total,
                        };
                    }
                    Some(Ok(Some(event))) => {
                        if let Some(id) = event.terminal_target() {
                            if !completed.insert(id.to_string()) {
                                warn!(target_id = id, "second terminal event dropped");
                                continue;
                            }
                        }
                        yield event;
                    }
                    Some(Ok(None)) => {
                        // Every sender is gone: a worker died without reporting.
                        abandoned = Some("worker exited without reporting a result");
                        break;
                    }
                }
            }

            if let Some(reason) = abandoned {
                let missing: Vec<String> = seen
                    .iter()
                    .filter(|id| !completed.contains(*id))
                    .cloned()
                    .collect();
                for target_id in missing {
                    warn!(target_id = %target_id, reason, "target has no result");
                    completed.insert(target_id.clone());
                    yield StreamEvent::Error {
                        target_id,
                        message: reason.to_string(),
                    };
                }
            }

            let joined = tokio::time::timeout(join_timeout, async {
                while workers.join_next().await.is_some() {}
            })
            .await;
            if joined.is_err() {
                warn!(remaining = workers.len(), "workers did not finish in time, aborting");
                workers.abort_all();
            }

            info!(completed = completed.len(), total, "fan-out finished");
            yield StreamEvent::AllDone;
        }
    }
}
