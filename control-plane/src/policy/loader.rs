//! Policy registry: resolves a configured reference to a live policy.

use std::sync::Arc;

use config::PolicyRef;
use thiserror::Error;

use crate::policy::all_caps::AllCapsPolicy;
use crate::policy::noop::NoopPolicy;
use crate::policy::tool_call_buffer::ToolCallBufferPolicy;
use crate::policy::tool_call_judge::{JudgeConfig, ToolCallJudgePolicy};
use crate::policy::Policy;
use crate::store::DebugLogStore;

#[derive(Debug, Error)]
pub enum PolicyLoadError {
    #[error("unknown policy: {0}")]
    Unknown(String),
    #[error("invalid policy options: {0}")]
    InvalidOptions(String),
}

/// Collaborators a policy may need at construction time.
pub struct PolicyServices {
    pub debug: Arc<dyn DebugLogStore>,
}

/// Resolves `noop`, `all_caps`, `tool_call_buffer`, or `tool_call_judge`.
pub fn load_policy(
    reference: &PolicyRef,
    services: &PolicyServices,
) -> Result<Arc<dyn Policy>, PolicyLoadError> {
    match reference.name.as_str() {
        "noop" => Ok(Arc::new(NoopPolicy)),
        "all_caps" => Ok(Arc::new(AllCapsPolicy)),
        "tool_call_buffer" => Ok(Arc::new(ToolCallBufferPolicy::new(services.debug.clone()))),
        "tool_call_judge" => {
            let config = JudgeConfig::from_options(&reference.options)
                .map_err(|e| PolicyLoadError::InvalidOptions(e.to_string()))?;
            Ok(Arc::new(ToolCallJudgePolicy::new(
                services.debug.clone(),
                config,
            )))
        }
        other => Err(PolicyLoadError::Unknown(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn services() -> PolicyServices {
        PolicyServices {
            debug: Arc::new(MemoryStore::new()),
        }
    }

    #[test]
    fn resolves_known_policies() {
        for name in ["noop", "all_caps", "tool_call_buffer", "tool_call_judge"] {
            let reference = PolicyRef::parse(name).unwrap();
            let policy = load_policy(&reference, &services()).unwrap();
            assert_eq!(policy.name(), name);
        }
    }

    #[test]
    fn unknown_policy_is_an_error() {
        let reference = PolicyRef::parse("does_not_exist").unwrap();
        assert!(matches!(
            load_policy(&reference, &services()),
            Err(PolicyLoadError::Unknown(_))
        ));
    }

    #[test]
    fn judge_options_flow_through() {
        let reference = PolicyRef::parse("tool_call_judge:{\"probability_threshold\": 2.0}").unwrap();
        assert!(matches!(
            load_policy(&reference, &services()),
            Err(PolicyLoadError::InvalidOptions(_))
        ));
    }
}
