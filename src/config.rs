use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 8765;

pub const PROJECT_PATH_ENV: &str = "VIBEFOUNDRY_PROJECT_PATH";

/// Resolved daemon settings. Flag beats environment beats default.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub open_browser: bool,
    pub project_path: Option<PathBuf>,
}

impl Config {
    pub fn resolve(port: Option<u16>, no_browser: bool, project_arg: Option<PathBuf>) -> Self {
        let project_path = project_arg.or_else(|| {
            std::env::var(PROJECT_PATH_ENV)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
        });
        Self {
            port: port.unwrap_or(DEFAULT_PORT),
            open_browser: !no_browser,
            project_path,
        }
    }

    pub fn local_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_beats_env_for_project_path() {
        std::env::set_var(PROJECT_PATH_ENV, "/tmp/from-env");
        let flagged = Config::resolve(Some(9000), true, Some(PathBuf::from("/tmp/flagged")));
        assert_eq!(flagged.port, 9000);
        assert!(!flagged.open_browser);
        assert_eq!(flagged.project_path, Some(PathBuf::from("/tmp/flagged")));

        let from_env = Config::resolve(None, false, None);
        assert_eq!(from_env.project_path, Some(PathBuf::from("/tmp/from-env")));
        std::env::remove_var(PROJECT_PATH_ENV);
    }

    #[test]
    fn defaults_apply_when_nothing_is_given() {
        let cfg = Config::resolve(None, false, None);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert!(cfg.open_browser);
        assert_eq!(cfg.local_url(), "http://127.0.0.1:8765");
    }
}
