use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;

/// Commands the underlying engine understands natively; used when no
/// whitelist file is configured or it cannot be read.
const DEFAULT_COMMANDS: &[&str] = &[
    "init", "compact", "models", "share", "undo", "redo", "exit",
];

#[derive(Default)]
struct CachedList {
    mtime: Option<SystemTime>,
    entries: Vec<String>,
}

/// Classifies messages whose leading slash-command should be handed to the
/// engine's own interpreter instead of being wrapped in a prompt. The
/// whitelist file is re-read when its mtime changes, so edits take effect
/// without a restart.
pub struct PassthroughList {
    file: Option<PathBuf>,
    cache: Mutex<CachedList>,
}

impl PassthroughList {
    pub fn new(file: Option<PathBuf>) -> Self {
        Self {
            file,
            cache: Mutex::new(CachedList::default()),
        }
    }

    fn load_entries(&self) -> Vec<String> {
        let Some(path) = self.file.as_ref() else {
            return DEFAULT_COMMANDS.iter().map(|&s| s.to_string()).collect();
        };

        let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if cache.mtime != mtime || cache.entries.is_empty() {
            let parsed: Vec<String> = std::fs::read_to_string(path)
                .map(|content| {
                    content
                        .lines()
                        .map(|line| line.trim().trim_start_matches('/').to_string())
                        .filter(|line| !line.is_empty() && !line.starts_with('#'))
                        .collect()
                })
                .unwrap_or_default();
            cache.mtime = mtime;
            cache.entries = parsed;
        }

        if cache.entries.is_empty() {
            DEFAULT_COMMANDS.iter().map(|&s| s.to_string()).collect()
        } else {
            cache.entries.clone()
        }
    }

    /// Case-sensitive match on the leading token, with any `@bot` suffix
    /// stripped first (group chats address commands as `/cmd@BotName`).
    pub fn is_passthrough(&self, message: &str) -> bool {
        let Some(token) = message.trim_start().split_whitespace().next() else {
            return false;
        };
        let Some(command) = token.strip_prefix('/') else {
            return false;
        };
        let command = command.split('@').next().unwrap_or(command);
        if command.is_empty() {
            return false;
        }
        self.load_entries().iter().any(|entry| entry == command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_apply_without_a_file() {
        let list = PassthroughList::new(None);
        assert!(list.is_passthrough("/compact"));
        assert!(list.is_passthrough("/models now please"));
        assert!(!list.is_passthrough("/made_up_command"));
        assert!(!list.is_passthrough("plain message"));
    }

    #[test]
    fn bot_suffix_is_stripped() {
        let list = PassthroughList::new(None);
        assert!(list.is_passthrough("/compact@MyAssistantBot"));
        assert!(list.is_passthrough("  /models@Bot args"));
    }

    #[test]
    fn matching_is_case_sensitive() {
        let list = PassthroughList::new(None);
        assert!(!list.is_passthrough("/Compact"));
        assert!(!list.is_passthrough("/MODELS"));
    }

    #[test]
    fn file_overrides_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("passthrough.txt");
        std::fs::write(&path, "# engine commands\n/deploy\nrollback\n\n").unwrap();

        let list = PassthroughList::new(Some(path));
        assert!(list.is_passthrough("/deploy"));
        assert!(list.is_passthrough("/rollback now"));
        assert!(!list.is_passthrough("/compact"));
    }

    #[test]
    fn unreadable_or_empty_file_falls_back_to_defaults() {
        let tmp = TempDir::new().unwrap();
        let missing = PassthroughList::new(Some(tmp.path().join("missing.txt")));
        assert!(missing.is_passthrough("/compact"));

        let empty_path = tmp.path().join("empty.txt");
        std::fs::write(&empty_path, "\n\n# only comments\n").unwrap();
        let empty = PassthroughList::new(Some(empty_path));
        assert!(empty.is_passthrough("/models"));
    }

    #[test]
    fn file_edits_are_picked_up() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("passthrough.txt");
        std::fs::write(&path, "first\n").unwrap();

        let list = PassthroughList::new(Some(path.clone()));
        assert!(list.is_passthrough("/first"));
        assert!(!list.is_passthrough("/second"));

        // Rewrite with a different mtime.
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(&path, "second\n").unwrap();
        let bumped = std::time::SystemTime::now();
        let file = std::fs::File::options().append(true).open(&path).unwrap();
        file.set_modified(bumped).unwrap();

        assert!(list.is_passthrough("/second"));
        assert!(!list.is_passthrough("/first"));
    }
}
