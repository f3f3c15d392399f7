use serde::Deserialize;

/// Engine limits and teardown behavior.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct GraphConfig {
    /// Times a single slot may be recomputed in one stabilization. A slot
    /// whose own computation keeps moving its inputs fails at this bound.
    pub step_limit: usize,
    /// Depth of the refresh stack. Recursion through dependencies that
    /// never bottoms out fails at this bound.
    pub depth_limit: usize,
    /// Trampoline hops allowed for a single dependency walk.
    pub hop_limit: usize,
    /// Hops through loop continuations allowed for a single dependency walk.
    /// These are counted apart from `hop_limit` so folds over long inputs
    /// are bounded by input length alone.
    pub loop_limit: usize,
    /// Tear down slots, state and scopes as soon as a subscription is dropped.
    /// When false, teardown waits for the next stabilization.
    pub sweep_on_release: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            step_limit: 10_000,
            depth_limit: 100_000,
            hop_limit: 100_000,
            loop_limit: u32::MAX as usize,
            sweep_on_release: true,
        }
    }
}

impl GraphConfig {
    #[cfg(feature = "json")]
    pub fn from_json(json: &str) -> Result<Self, crate::error::GraphError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(all(test, feature = "json"))]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = GraphConfig::from_json(r#"{"hop_limit": 10}"#).unwrap();
        assert_eq!(config.hop_limit, 10);
        assert_eq!(config.step_limit, GraphConfig::default().step_limit);
        assert_eq!(config.loop_limit, GraphConfig::default().loop_limit);
        assert!(config.sweep_on_release);
    }
}
