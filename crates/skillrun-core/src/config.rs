// Execution configuration - the four-level merge
//
// Highest priority wins: runtime override > skill metadata > platform
// defaults > built-in defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use skillrun_contracts::Visibility;

use crate::skill::SkillMetadata;

/// Built-in defaults, the lowest layer of the merge.
pub const DEFAULT_MAX_ITERATIONS: u32 = 15;
pub const DEFAULT_MAX_RETRIES_PER_TOOL: u32 = 3;
pub const DEFAULT_TIMEOUT_PER_ITERATION: Duration = Duration::from_millis(30_000);
pub const DEFAULT_TEMPERATURE: f32 = 0.0;
pub const DEFAULT_MODEL: &str = "default";

/// Resolved configuration for one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionConfig {
    pub max_iterations: u32,
    pub max_retries_per_tool: u32,
    pub timeout_per_iteration: Duration,
    pub temperature: f32,
    pub model: String,
    /// When true, the first SYNTHESIS ends the loop
    pub early_termination: bool,
    /// When false, a tool's final failure terminates the execution
    pub error_recovery: bool,
    /// Optional spend ceiling, enforced between iterations
    pub max_cost_usd: Option<f64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_retries_per_tool: DEFAULT_MAX_RETRIES_PER_TOOL,
            timeout_per_iteration: DEFAULT_TIMEOUT_PER_ITERATION,
            temperature: DEFAULT_TEMPERATURE,
            model: DEFAULT_MODEL.to_string(),
            early_termination: true,
            error_recovery: true,
            max_cost_usd: None,
        }
    }
}

/// Process-level platform configuration, loaded once and immutable during a
/// run. Field defaults mirror the built-ins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub default_max_iterations: Option<u32>,
    pub default_max_retries_per_tool: Option<u32>,
    pub default_timeout_per_iteration_ms: Option<u64>,
    pub default_model: Option<String>,
    pub enable_error_recovery: Option<bool>,
    /// Default visibility granted to subscribers per role name
    pub visibility_defaults: std::collections::HashMap<String, Visibility>,
    pub cost_limits_enabled: bool,
    pub max_cost_per_execution_usd: Option<f64>,
    pub rate_limits_enabled: bool,
    pub max_iterations_per_minute: Option<u32>,
}

/// Runtime override, the highest layer of the merge.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverride {
    pub max_iterations: Option<u32>,
    pub max_retries_per_tool: Option<u32>,
    pub timeout_per_iteration: Option<Duration>,
    pub temperature: Option<f32>,
    pub model: Option<String>,
    pub early_termination: Option<bool>,
    pub error_recovery: Option<bool>,
}

/// Resolve the effective configuration for one execution.
pub fn resolve_config(
    overrides: &ConfigOverride,
    skill: &SkillMetadata,
    platform: &PlatformConfig,
) -> ExecutionConfig {
    let max_iterations = overrides
        .max_iterations
        .or(skill.max_iterations)
        .or(platform.default_max_iterations)
        .unwrap_or(DEFAULT_MAX_ITERATIONS)
        .clamp(1, 100);

    let max_retries_per_tool = overrides
        .max_retries_per_tool
        .or(skill.max_retries_per_tool)
        .or(platform.default_max_retries_per_tool)
        .unwrap_or(DEFAULT_MAX_RETRIES_PER_TOOL)
        .clamp(1, 10);

    let timeout_per_iteration = overrides
        .timeout_per_iteration
        .or(skill.timeout_per_iteration)
        .or(platform
            .default_timeout_per_iteration_ms
            .map(Duration::from_millis))
        .unwrap_or(DEFAULT_TIMEOUT_PER_ITERATION);

    let temperature = overrides
        .temperature
        .or(skill.temperature)
        .unwrap_or(DEFAULT_TEMPERATURE)
        .clamp(0.0, 2.0);

    let model = overrides
        .model
        .clone()
        .or_else(|| skill.model.clone())
        .or_else(|| platform.default_model.clone())
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());

    let early_termination = overrides
        .early_termination
        .or(skill.early_termination)
        .unwrap_or(true);

    let error_recovery = overrides
        .error_recovery
        .or(platform.enable_error_recovery)
        .unwrap_or(true);

    let max_cost_usd = if platform.cost_limits_enabled {
        platform.max_cost_per_execution_usd
    } else {
        None
    };

    ExecutionConfig {
        max_iterations,
        max_retries_per_tool,
        timeout_per_iteration,
        temperature,
        model,
        early_termination,
        error_recovery,
        max_cost_usd,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skill::SkillMetadata;

    #[test]
    fn test_builtin_defaults() {
        let config = resolve_config(
            &ConfigOverride::default(),
            &SkillMetadata::new("s", "d"),
            &PlatformConfig::default(),
        );

        assert_eq!(config.max_iterations, 15);
        assert_eq!(config.max_retries_per_tool, 3);
        assert_eq!(config.timeout_per_iteration, Duration::from_millis(30_000));
        assert_eq!(config.temperature, 0.0);
        assert!(config.error_recovery);
        assert!(config.max_cost_usd.is_none());
    }

    #[test]
    fn test_merge_precedence() {
        let mut skill = SkillMetadata::new("s", "d");
        skill.max_iterations = Some(20);
        skill.temperature = Some(0.7);
        skill.model = Some("skill-model".to_string());

        let platform = PlatformConfig {
            default_max_iterations: Some(50),
            default_model: Some("platform-model".to_string()),
            ..Default::default()
        };

        let overrides = ConfigOverride {
            max_iterations: Some(5),
            ..Default::default()
        };

        let config = resolve_config(&overrides, &skill, &platform);

        // Runtime override beats skill and platform
        assert_eq!(config.max_iterations, 5);
        // Skill beats platform
        assert_eq!(config.model, "skill-model");
        assert_eq!(config.temperature, 0.7);
    }

    #[test]
    fn test_platform_layer_used_when_skill_silent() {
        let platform = PlatformConfig {
            default_max_iterations: Some(7),
            enable_error_recovery: Some(false),
            ..Default::default()
        };

        let config = resolve_config(
            &ConfigOverride::default(),
            &SkillMetadata::new("s", "d"),
            &platform,
        );

        assert_eq!(config.max_iterations, 7);
        assert!(!config.error_recovery);
    }

    #[test]
    fn test_cost_limit_requires_enable_flag() {
        let mut platform = PlatformConfig {
            max_cost_per_execution_usd: Some(1.5),
            ..Default::default()
        };

        let config = resolve_config(
            &ConfigOverride::default(),
            &SkillMetadata::new("s", "d"),
            &platform,
        );
        assert!(config.max_cost_usd.is_none());

        platform.cost_limits_enabled = true;
        let config = resolve_config(
            &ConfigOverride::default(),
            &SkillMetadata::new("s", "d"),
            &platform,
        );
        assert_eq!(config.max_cost_usd, Some(1.5));
    }

    #[test]
    fn test_out_of_range_values_clamped() {
        let overrides = ConfigOverride {
            max_iterations: Some(1000),
            temperature: Some(9.0),
            ..Default::default()
        };

        let config = resolve_config(
            &overrides,
            &SkillMetadata::new("s", "d"),
            &PlatformConfig::default(),
        );

        assert_eq!(config.max_iterations, 100);
        assert_eq!(config.temperature, 2.0);
    }
}
