use std::ops::RangeInclusive;

use playground_llm::{ProviderConfig, SamplingParams};
use snafu::{Snafu, ensure};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

pub const TEMPERATURE_RANGE: RangeInclusive<f64> = 0.0..=2.0;
pub const MAX_TOKENS_RANGE: RangeInclusive<u64> = 1..=32_768;
pub const TOP_P_RANGE: RangeInclusive<f64> = 0.0..=1.0;
pub const PENALTY_RANGE: RangeInclusive<f64> = -2.0..=2.0;

/// Everything one chat request needs, supplied wholesale per request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestConfig {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u64,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    pub system_prompt: String,
    pub base_url: String,
    pub api_token: Option<String>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        let sampling = SamplingParams::default();
        Self {
            model: String::new(),
            temperature: sampling.temperature,
            max_tokens: sampling.max_tokens,
            top_p: sampling.top_p,
            frequency_penalty: sampling.frequency_penalty,
            presence_penalty: sampling.presence_penalty,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            base_url: String::new(),
            api_token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ValidationError {
    #[snafu(display("please enter a model name"))]
    MissingModel,
    #[snafu(display("{field} must be between {min} and {max}, got {value}"))]
    OutOfRange {
        field: &'static str,
        value: String,
        min: String,
        max: String,
    },
}

impl RequestConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Checks the request before any provider is contacted.
    pub fn validate(&self) -> Result<(), ValidationError> {
        ensure!(!self.model.trim().is_empty(), MissingModelSnafu);

        check_range("temperature", self.temperature, &TEMPERATURE_RANGE)?;
        check_range("max_tokens", self.max_tokens, &MAX_TOKENS_RANGE)?;
        check_range("top_p", self.top_p, &TOP_P_RANGE)?;
        check_range("frequency_penalty", self.frequency_penalty, &PENALTY_RANGE)?;
        check_range("presence_penalty", self.presence_penalty, &PENALTY_RANGE)?;
        Ok(())
    }

    pub fn model_id(&self) -> &str {
        self.model.trim()
    }

    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
            frequency_penalty: self.frequency_penalty,
            presence_penalty: self.presence_penalty,
        }
    }

    pub fn provider_config(&self, provider_id: &str) -> ProviderConfig {
        ProviderConfig::new(provider_id, &self.base_url, self.api_token.clone())
    }
}

fn check_range<T>(
    field: &'static str,
    value: T,
    range: &RangeInclusive<T>,
) -> Result<(), ValidationError>
where
    T: PartialOrd + ToString,
{
    // `contains` is false for NaN, which is exactly what we want here.
    ensure!(
        range.contains(&value),
        OutOfRangeSnafu {
            field,
            value: value.to_string(),
            min: range.start().to_string(),
            max: range.end().to_string(),
        }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_model_is_rejected() {
        let config = RequestConfig::default().with_model("   ");
        assert_eq!(config.validate(), Err(ValidationError::MissingModel));
    }

    #[test]
    fn defaults_with_model_are_valid() {
        let config = RequestConfig::default().with_model(" llama3.1 ");
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.model_id(), "llama3.1");
        assert_eq!(config.sampling(), SamplingParams::default());
    }

    #[test]
    fn out_of_range_sampling_is_rejected() {
        let config = RequestConfig {
            temperature: 2.5,
            ..RequestConfig::default().with_model("m")
        };
        let error = config.validate().unwrap_err();
        assert_eq!(
            error.to_string(),
            "temperature must be between 0 and 2, got 2.5"
        );

        let config = RequestConfig {
            max_tokens: 0,
            ..RequestConfig::default().with_model("m")
        };
        assert!(matches!(
            config.validate(),
            Err(ValidationError::OutOfRange {
                field: "max_tokens",
                ..
            })
        ));

        let config = RequestConfig {
            top_p: f64::NAN,
            ..RequestConfig::default().with_model("m")
        };
        assert!(config.validate().is_err());
    }
}
