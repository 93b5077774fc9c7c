//! Environment variable interpolation.
//!
//! Applied to the YAML config file and to the connection descriptor, so
//! credentials can stay out of files and shell history.
//!
//! - `$VAR` / `${VAR}`: value of VAR, error if unset
//! - `${VAR:-default}`: default when VAR is unset or empty
//! - `${VAR-default}`: default only when VAR is unset
//! - `$$`: a literal `$`

use regex::{Captures, Regex};
use std::env;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        (?P<escape>\$\$)
        | \$\{ (?P<braced>[A-Za-z_][A-Za-z0-9_]*) (?: (?P<op>:?-) (?P<default>[^}]*) )? \}
        | \$ (?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("placeholder pattern is valid")
});

/// Substitute environment variables in `input`.
///
/// All problems are collected so a config with several missing variables
/// reports them together.
pub fn interpolate(input: &str) -> Result<String, Vec<String>> {
    let mut errors = Vec::new();
    let text = PLACEHOLDER.replace_all(input, |caps: &Captures| resolve(caps, &mut errors));

    if errors.is_empty() {
        Ok(text.into_owned())
    } else {
        Err(errors)
    }
}

fn resolve(caps: &Captures, errors: &mut Vec<String>) -> String {
    if caps.name("escape").is_some() {
        return "$".to_string();
    }

    let original = &caps[0];
    let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
        return original.to_string();
    };
    let name = name.as_str();
    let default = caps.name("default").map(|m| m.as_str());
    let default_if_empty = caps.name("op").is_some_and(|m| m.as_str() == ":-");

    match env::var(name) {
        Ok(value) if value.contains(['\n', '\r']) => {
            errors.push(format!(
                "environment variable '{}' contains newlines, which is not allowed",
                name
            ));
            original.to_string()
        }
        Ok(value) if value.is_empty() && default_if_empty => default.unwrap_or("").to_string(),
        Ok(value) => value,
        Err(_) => match default {
            Some(default) => default.to_string(),
            None => {
                errors.push(format!("environment variable '{}' is not set", name));
                original.to_string()
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run `f` with the given variables set (or removed), restoring them after.
    fn with_env<R>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> R) -> R {
        let saved: Vec<_> = vars.iter().map(|(k, _)| (*k, env::var(k).ok())).collect();

        // SAFETY: every test uses variable names unique to that test.
        for (key, value) in vars {
            match value {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }

        let result = f();

        // SAFETY: restores the state captured above.
        for (key, value) in saved {
            match value {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }
        result
    }

    #[test]
    fn test_bare_and_braced() {
        with_env(&[("SQLEXTRACT_TEST_HOST", Some("db01"))], || {
            assert_eq!(
                interpolate("server=$SQLEXTRACT_TEST_HOST;x=${SQLEXTRACT_TEST_HOST}").unwrap(),
                "server=db01;x=db01"
            );
        });
    }

    #[test]
    fn test_missing_variables_are_all_reported() {
        with_env(
            &[("SQLEXTRACT_TEST_MISS1", None), ("SQLEXTRACT_TEST_MISS2", None)],
            || {
                let errors =
                    interpolate("uid=$SQLEXTRACT_TEST_MISS1;pwd=${SQLEXTRACT_TEST_MISS2}")
                        .unwrap_err();
                assert_eq!(errors.len(), 2);
                assert!(errors[0].contains("SQLEXTRACT_TEST_MISS1"));
                assert!(errors[1].contains("not set"));
            },
        );
    }

    #[test]
    fn test_defaults() {
        with_env(
            &[("SQLEXTRACT_TEST_UNSET", None), ("SQLEXTRACT_TEST_EMPTY", Some(""))],
            || {
                assert_eq!(interpolate("${SQLEXTRACT_TEST_UNSET:-5432}").unwrap(), "5432");
                assert_eq!(interpolate("${SQLEXTRACT_TEST_UNSET-5432}").unwrap(), "5432");
                assert_eq!(interpolate("${SQLEXTRACT_TEST_EMPTY:-a}").unwrap(), "a");
                assert_eq!(interpolate("[${SQLEXTRACT_TEST_EMPTY-a}]").unwrap(), "[]");
            },
        );
    }

    #[test]
    fn test_escape() {
        assert_eq!(interpolate("pwd=p$$ss").unwrap(), "pwd=p$ss");
    }

    #[test]
    fn test_newlines_rejected() {
        with_env(&[("SQLEXTRACT_TEST_NL", Some("a\r\nb"))], || {
            let errors = interpolate("$SQLEXTRACT_TEST_NL").unwrap_err();
            assert!(errors[0].contains("newlines"));
        });
    }
}
