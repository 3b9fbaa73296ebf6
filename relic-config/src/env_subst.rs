use anyhow::{format_err, Error};
use once_cell::sync::Lazy;
use regex::Regex;

// deliberately narrower than "anything but '}' or ':'": only POSIX
// variable names are substituted, anything else passes through verbatim
static ENV_VAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").unwrap());

/// Substitute `${VAR}` and `${VAR:-default}` references in a single
/// string. A missing variable without a default is an error.
pub fn substitute_env_str(value: &str) -> Result<String, Error> {
    let mut result = String::with_capacity(value.len());
    let mut last = 0;
    for captures in ENV_VAR_RE.captures_iter(value) {
        let whole = captures.get(0).unwrap();
        result.push_str(&value[last..whole.start()]);
        let name = &captures[1];
        match std::env::var(name) {
            Ok(env_value) => result.push_str(&env_value),
            Err(_) => match captures.get(2) {
                Some(default) => result.push_str(default.as_str()),
                None => {
                    return Err(format_err!(
                        "environment variable {} not set and no default provided",
                        name
                    ))
                }
            },
        }
        last = whole.end();
    }
    result.push_str(&value[last..]);
    Ok(result)
}

/// Recursively substitute environment references in every string of a
/// YAML document.
pub fn substitute_env(value: serde_yaml::Value) -> Result<serde_yaml::Value, Error> {
    use serde_yaml::Value;

    Ok(match value {
        Value::String(s) => Value::String(substitute_env_str(&s)?),
        Value::Sequence(seq) => Value::Sequence(
            seq.into_iter()
                .map(substitute_env)
                .collect::<Result<_, Error>>()?,
        ),
        Value::Mapping(map) => {
            let mut result = serde_yaml::Mapping::with_capacity(map.len());
            for (key, item) in map {
                result.insert(key, substitute_env(item)?);
            }
            Value::Mapping(result)
        }
        other => other,
    })
}
