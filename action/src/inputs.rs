//! Action inputs supplied by the workflow through `INPUT_*` variables

use crate::errors::ActionError;

/// Validated inputs for one run.
#[derive(Debug, Clone)]
pub struct ActionInputs {
    /// Server name or FQDN, e.g. `contoso.postgres.database.azure.com`
    pub server_name: String,
    /// Opaque libpq connection string handed to psql as-is
    pub connection_string: String,
    /// File, directory, or glob naming the scripts to run
    pub files_path: String,
    /// Extra psql arguments, already split
    pub args: Vec<String>,
}

impl ActionInputs {
    pub fn from_env() -> Result<Self, ActionError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the inputs through an arbitrary lookup, keyed by the full
    /// environment variable name.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ActionError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&input_var(name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |name: &str| {
            get(name).ok_or_else(|| {
                ActionError::configuration(format!("Input required and not supplied: {name}"))
            })
        };

        let server_name = required("server-name")?;
        let connection_string = normalize_connection_string(&required("connection-string")?);
        if connection_string.is_empty() {
            return Err(ActionError::configuration("connection-string is empty"));
        }
        let files_path = required("plsql-file")?;
        let args = match get("arguments") {
            Some(raw) => split_args(&raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            server_name,
            connection_string,
            files_path,
            args,
        })
    }

    /// ARM resource name: the first DNS label of the server name.
    pub fn server_resource_name(&self) -> String {
        self.server_name
            .split('.')
            .next()
            .unwrap_or(&self.server_name)
            .to_lowercase()
    }
}

fn input_var(name: &str) -> String {
    format!("INPUT_{}", name.replace(' ', "_").to_uppercase())
}

/// Strip a leading `psql` word and one pair of enclosing double quotes, the
/// form the Azure portal shows. The remainder is left untouched.
fn normalize_connection_string(raw: &str) -> String {
    let mut s = raw.trim();
    if let Some(rest) = s.strip_prefix("psql ") {
        s = rest.trim_start();
    }
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s = &s[1..s.len() - 1];
    }
    s.to_string()
}

/// Split an argument string with shell-style quoting: whitespace separates
/// words, single quotes are literal, double quotes allow `\"` and `\\`.
pub fn split_args(raw: &str) -> Result<Vec<String>, ActionError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(unterminated(raw)),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\')) => current.push(ch),
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err(unterminated(raw)),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(unterminated(raw)),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(ch) => current.push(ch),
                    None => return Err(unterminated(raw)),
                }
            }
            other => {
                in_word = true;
                current.push(other);
            }
        }
    }

    if in_word {
        words.push(current);
    }
    Ok(words)
}

fn unterminated(raw: &str) -> ActionError {
    ActionError::configuration(format!("Unterminated quote or escape in arguments: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_inputs_from_lookup() {
        let inputs = ActionInputs::from_lookup(lookup_from(&[
            ("INPUT_SERVER-NAME", "contoso.postgres.database.azure.com"),
            ("INPUT_CONNECTION-STRING", "host=contoso.postgres.database.azure.com dbname=app"),
            ("INPUT_PLSQL-FILE", "sql/*.sql"),
            ("INPUT_ARGUMENTS", "-v ON_ERROR_STOP=1"),
        ]))
        .unwrap();

        assert_eq!(inputs.server_resource_name(), "contoso");
        assert_eq!(inputs.files_path, "sql/*.sql");
        assert_eq!(inputs.args, vec!["-v", "ON_ERROR_STOP=1"]);
    }

    #[test]
    fn test_missing_required_input() {
        let err = ActionInputs::from_lookup(lookup_from(&[
            ("INPUT_SERVER-NAME", "contoso"),
            ("INPUT_PLSQL-FILE", "a.sql"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ActionError::Configuration(ref m) if m.contains("connection-string")));
    }

    #[test]
    fn test_blank_input_counts_as_missing() {
        let err = ActionInputs::from_lookup(lookup_from(&[
            ("INPUT_SERVER-NAME", "   "),
            ("INPUT_CONNECTION-STRING", "host=x"),
            ("INPUT_PLSQL-FILE", "a.sql"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ActionError::Configuration(ref m) if m.contains("server-name")));
    }

    #[test]
    fn test_portal_style_connection_string_is_normalized() {
        assert_eq!(
            normalize_connection_string(r#"psql "host=h port=5432 dbname=d""#),
            "host=h port=5432 dbname=d"
        );
        assert_eq!(
            normalize_connection_string("postgresql://u@h:5432/d"),
            "postgresql://u@h:5432/d"
        );
    }

    #[test]
    fn test_bare_quotes_are_not_a_connection_string() {
        let err = ActionInputs::from_lookup(lookup_from(&[
            ("INPUT_SERVER-NAME", "contoso"),
            ("INPUT_CONNECTION-STRING", "psql \"\""),
            ("INPUT_PLSQL-FILE", "a.sql"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ActionError::Configuration(_)));
    }

    #[test]
    fn test_split_args_quoting() {
        let args = split_args(r#"-v "name=hello world" --set='x y' a\ b"#).unwrap();
        assert_eq!(args, vec!["-v", "name=hello world", "--set=x y", "a b"]);
    }

    #[test]
    fn test_split_args_empty_quotes_make_a_word() {
        assert_eq!(split_args(r#"-c """#).unwrap(), vec!["-c", ""]);
        assert!(split_args("   ").unwrap().is_empty());
    }

    #[test]
    fn test_split_args_unterminated() {
        assert!(matches!(
            split_args("-c 'select 1"),
            Err(ActionError::Configuration(_))
        ));
    }

    #[test]
    fn test_split_args_trailing_backslash() {
        assert!(matches!(
            split_args(r"-v x=a\"),
            Err(ActionError::Configuration(_))
        ));
        assert_eq!(split_args(r"x=a\\").unwrap(), vec![r"x=a\"]);
    }
}
