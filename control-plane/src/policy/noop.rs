//! Identity policy: observes everything, changes nothing.

use crate::policy::Policy;

pub struct NoopPolicy;

impl Policy for NoopPolicy {
    fn name(&self) -> &'static str {
        "noop"
    }
}
