// Copyright © 2024 Pathway

use std::env;
use std::time::Duration;

use assert_matches::assert_matches;

use splicer_engine::env::{parse_env_count, parse_env_millis, parse_env_var, Error};

// Every test uses its own variables, so they can run in parallel.

#[test]
fn test_unset_variable_gives_default() -> eyre::Result<()> {
    assert_eq!(parse_env_count("SPLICER_TEST_UNSET_COUNT", 7)?, 7);
    assert_eq!(
        parse_env_millis("SPLICER_TEST_UNSET_MILLIS", Duration::from_secs(1))?,
        Duration::from_secs(1)
    );
    assert_eq!(parse_env_var::<u32>("SPLICER_TEST_UNSET_VAR")?, None);
    Ok(())
}

#[test]
fn test_variable_is_parsed() -> eyre::Result<()> {
    env::set_var("SPLICER_TEST_COUNT", " 12 ");
    env::set_var("SPLICER_TEST_MILLIS", "250");
    assert_eq!(parse_env_count("SPLICER_TEST_COUNT", 1)?, 12);
    assert_eq!(
        parse_env_millis("SPLICER_TEST_MILLIS", Duration::ZERO)?,
        Duration::from_millis(250)
    );
    Ok(())
}

#[test]
fn test_bad_values_are_rejected() {
    env::set_var("SPLICER_TEST_ZERO", "0");
    env::set_var("SPLICER_TEST_GARBAGE", "many");
    assert_matches!(
        parse_env_count("SPLICER_TEST_ZERO", 1),
        Err(Error::NotPositive(_))
    );
    assert_matches!(
        parse_env_count("SPLICER_TEST_GARBAGE", 1),
        Err(Error::ParsingFailed(..))
    );
}
