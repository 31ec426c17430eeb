//! Filesystem locations for conversation logs.

use std::path::PathBuf;

/// Root directory for conversation logs.
///
/// `GPTME_LOGS_HOME` overrides; otherwise the platform data dir is used.
pub fn logs_home() -> PathBuf {
    if let Ok(dir) = std::env::var("GPTME_LOGS_HOME") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    directories::ProjectDirs::from("", "", "toolchat")
        .map(|dirs| dirs.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from(".toolchat/logs"))
}

/// Directory name for a new conversation: `YYYY-MM-DD-name`.
pub fn conversation_dir_name(name: &str) -> String {
    format!("{}-{}", chrono::Local::now().format("%Y-%m-%d"), name)
}

const ADJECTIVES: &[&str] = &[
    "bold", "calm", "deft", "eager", "fond", "glad", "keen", "neat", "warm", "wise",
];
const NOUNS: &[&str] = &[
    "falcon", "otter", "maple", "comet", "heron", "lynx", "cedar", "ember", "tide", "wren",
];

/// Two-word conversation name for `--name random`.
pub fn random_name() -> String {
    use rand::seq::SliceRandom;
    let mut rng = rand::thread_rng();
    format!(
        "{}-{}",
        ADJECTIVES.choose(&mut rng).unwrap(),
        NOUNS.choose(&mut rng).unwrap()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_name_has_date_prefix() {
        let name = conversation_dir_name("test-chat");
        assert!(name.ends_with("-test-chat"));
        // YYYY-MM-DD- prefix
        assert_eq!(name.as_bytes()[4], b'-');
        assert_eq!(name.as_bytes()[7], b'-');
    }

    #[test]
    fn test_random_name_shape() {
        let name = random_name();
        assert_eq!(name.split('-').count(), 2);
    }

    #[test]
    fn test_logs_home_env_override() {
        // Not parallel-safe with other env tests; uses a unique var scope.
        unsafe { std::env::set_var("GPTME_LOGS_HOME", "/tmp/toolchat-test-logs") };
        assert_eq!(logs_home(), PathBuf::from("/tmp/toolchat-test-logs"));
        unsafe { std::env::remove_var("GPTME_LOGS_HOME") };
    }
}
