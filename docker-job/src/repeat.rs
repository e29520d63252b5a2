//! Decide whether to run the job again based on its logs.

use regex::Regex;

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub enum RepeatPredicate {
    /// Repeat until the logs match.
    Until(Regex),
    /// Repeat as long as the logs match.
    While(Regex),
}

impl RepeatPredicate {
    /// Build a predicate from the optional `--repeat-until` and
    /// `--repeat-while` patterns. Setting both is an error.
    pub fn from_patterns(
        until: Option<&str>,
        while_: Option<&str>,
    ) -> Result<Option<Self>, ConfigError> {
        match (until, while_) {
            (Some(_), Some(_)) => Err(ConfigError::ConflictingRepeat),
            (Some(pattern), None) => Ok(Some(RepeatPredicate::Until(Regex::new(pattern)?))),
            (None, Some(pattern)) => Ok(Some(RepeatPredicate::While(Regex::new(pattern)?))),
            (None, None) => Ok(None),
        }
    }

    pub fn should_repeat(&self, logs: &str) -> bool {
        match self {
            RepeatPredicate::Until(re) => !re.is_match(logs),
            RepeatPredicate::While(re) => re.is_match(logs),
        }
    }
}

/// `None` never repeats.
pub fn should_repeat(predicate: Option<&RepeatPredicate>, logs: &str) -> bool {
    predicate.is_some_and(|p| p.should_repeat(logs))
}
