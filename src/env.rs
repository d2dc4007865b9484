// Copyright © 2024 Pathway

use std::env;
use std::error;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("couldn't parse the value of {0:?} environment variable as UTF-8 string")]
    NotUtf8(String),

    #[error("couldn't parse the value of {0:?} environment variable: {1}")]
    ParsingFailed(String, #[source] Box<dyn error::Error + Send + Sync>),

    #[error("environment variable {0:?} must be positive")]
    NotPositive(String),
}

pub fn parse_env_var<T: FromStr>(name: &str) -> Result<Option<T>, Error>
where
    T::Err: error::Error + Send + Sync + 'static,
{
    let Some(value) = env::var_os(name) else {
        return Ok(None);
    };
    let value = value
        .into_string()
        .map_err(|_| Error::NotUtf8(name.to_string()))?;
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|err| Error::ParsingFailed(name.to_string(), Box::new(err)))
}

/// Reads a positive count, falling back to `default` when the variable is unset.
pub fn parse_env_count(name: &str, default: usize) -> Result<usize, Error> {
    match parse_env_var::<usize>(name)? {
        Some(0) => Err(Error::NotPositive(name.to_string())),
        Some(value) => Ok(value),
        None => Ok(default),
    }
}

/// Durations are given in milliseconds.
pub fn parse_env_millis(name: &str, default: Duration) -> Result<Duration, Error> {
    match parse_env_var::<u64>(name)? {
        Some(0) => Err(Error::NotPositive(name.to_string())),
        Some(millis) => Ok(Duration::from_millis(millis)),
        None => Ok(default),
    }
}
