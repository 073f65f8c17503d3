use std::path::PathBuf;

pub const ENV_WORKSPACE: &str = "MARKUSD_WORKSPACE";
pub const ENV_LOG_JSON: &str = "MARKUSD_LOG_JSON";

/// Process settings read from the environment at startup. Everything else is
/// stored per workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub workspace: Option<PathBuf>,
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let workspace = lookup(ENV_WORKSPACE)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        let log_json = lookup(ENV_LOG_JSON)
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Self {
            workspace,
            log_json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(Config::from_lookup(lookup(&[])), Config::default());
    }

    #[test]
    fn reads_workspace_and_json_flag() {
        let cfg = Config::from_lookup(lookup(&[
            (ENV_WORKSPACE, " /tmp/course "),
            (ENV_LOG_JSON, "TRUE"),
        ]));
        assert_eq!(cfg.workspace, Some(PathBuf::from("/tmp/course")));
        assert!(cfg.log_json);
    }

    #[test]
    fn blank_workspace_is_ignored() {
        let cfg = Config::from_lookup(lookup(&[(ENV_WORKSPACE, "  "), (ENV_LOG_JSON, "0")]));
        assert_eq!(cfg.workspace, None);
        assert!(!cfg.log_json);
    }
}
