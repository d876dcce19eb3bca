//! Flow and step registration.

use chrono::Utc;
use tracing::debug;

use crate::config::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT};
use crate::error::{EngineError, EngineResult};
use crate::model::{Flow, Step, StepType, validate_slug};

use super::Engine;

/// Per-step overrides accepted by [`Engine::add_step`]. `None` falls back to
/// the flow default at runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepOptions {
    pub max_attempts: Option<i32>,
    pub base_delay: Option<i32>,
    pub timeout: Option<i32>,
    pub start_delay: Option<i32>,
}

impl Engine {
    /// Create a flow definition. Idempotent: an existing flow is returned
    /// unchanged.
    pub fn create_flow(
        &self,
        flow_slug: &str,
        max_attempts: Option<i32>,
        base_delay: Option<i32>,
        timeout: Option<i32>,
    ) -> EngineResult<Flow> {
        checked_slug(flow_slug)?;
        let flow = Flow {
            flow_slug: flow_slug.to_string(),
            opt_max_attempts: max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            opt_base_delay: base_delay.unwrap_or(DEFAULT_BASE_DELAY),
            opt_timeout: timeout.unwrap_or(DEFAULT_TIMEOUT),
            created_at: Utc::now(),
        };
        let definition = self.store().insert_flow_if_absent(flow);
        debug!(flow_slug, "create_flow");
        Ok(definition.flow.clone())
    }

    /// Add a step to a flow. The step's dependencies must already exist, so
    /// edges always point backward in insertion order and the graph stays
    /// acyclic by construction. Re-adding an existing step returns it
    /// unchanged.
    pub fn add_step(
        &self,
        flow_slug: &str,
        step_slug: &str,
        dep_slugs: &[&str],
        options: StepOptions,
        step_type: StepType,
    ) -> EngineResult<Step> {
        checked_slug(step_slug)?;
        for dep_slug in dep_slugs {
            checked_slug(dep_slug)?;
        }
        if step_type == StepType::Map && dep_slugs.len() > 1 {
            return Err(EngineError::InvalidMapArity {
                step_slug: step_slug.to_string(),
            });
        }

        self.store().update_flow(flow_slug, |definition| {
            if let Some(existing) = definition.step(step_slug) {
                return Ok(existing.clone());
            }
            for dep_slug in dep_slugs {
                if *dep_slug == step_slug || definition.step(dep_slug).is_none() {
                    return Err(EngineError::UnknownDependency {
                        step_slug: step_slug.to_string(),
                        dep_slug: dep_slug.to_string(),
                    });
                }
            }
            let step = Step {
                flow_slug: flow_slug.to_string(),
                step_slug: step_slug.to_string(),
                step_type,
                step_index: definition.steps.len() as i32,
                deps_count: dep_slugs.len() as i32,
                opt_max_attempts: options.max_attempts,
                opt_base_delay: options.base_delay,
                opt_timeout: options.timeout,
                opt_start_delay: options.start_delay,
                created_at: Utc::now(),
            };
            let deps: Vec<String> = dep_slugs.iter().map(|s| s.to_string()).collect();
            definition.push_step(step.clone(), &deps);
            debug!(
                flow_slug,
                step_slug,
                step_type = step_type.as_str(),
                deps = deps.len(),
                "add_step"
            );
            Ok(step)
        })
    }
}

fn checked_slug(slug: &str) -> EngineResult<()> {
    validate_slug(slug).map_err(|reason| EngineError::InvalidSlug {
        slug: slug.to_string(),
        reason,
    })
}
