//! Typed hook dispatch: one enum arm per hook operation.

use serde_json::Value;

use crate::policy::{Policy, PolicyError};

/// The hook surface mirrored from the gateway callback API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookName {
    PreCall,
    PostCallSuccess,
    PostCallFailure,
    Moderation,
    /// Aggregate streaming hook; the WebSocket path handles streams, so this
    /// dispatches to nothing.
    PostCallStreaming,
}

impl HookName {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "pre_call" => Some(Self::PreCall),
            "post_call_success" => Some(Self::PostCallSuccess),
            "post_call_failure" => Some(Self::PostCallFailure),
            "moderation" => Some(Self::Moderation),
            "post_call_streaming" => Some(Self::PostCallStreaming),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreCall => "pre_call",
            Self::PostCallSuccess => "post_call_success",
            Self::PostCallFailure => "post_call_failure",
            Self::Moderation => "moderation",
            Self::PostCallStreaming => "post_call_streaming",
        }
    }
}

/// Invokes the policy operation for `hook`. `Ok(None)` means no change.
pub async fn dispatch_hook(
    policy: &dyn Policy,
    hook: HookName,
    payload: &Value,
) -> Result<Option<Value>, PolicyError> {
    match hook {
        HookName::PreCall => policy.pre_call(payload).await,
        HookName::PostCallSuccess => policy.post_call_success(payload).await,
        HookName::PostCallFailure => policy.post_call_failure(payload).await,
        HookName::Moderation => policy.moderation(payload).await,
        HookName::PostCallStreaming => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips() {
        for name in [
            "pre_call",
            "post_call_success",
            "post_call_failure",
            "moderation",
            "post_call_streaming",
        ] {
            assert_eq!(HookName::parse(name).map(|h| h.as_str()), Some(name));
        }
        assert!(HookName::parse("nonsense").is_none());
    }
}
