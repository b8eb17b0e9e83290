use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::parser::{parse_feed_bytes, ParseError, ParsedFeed, MAX_FEED_SIZE};

/// Runs a user-provided fetch script and parses its stdout as a feed.
///
/// Dropping the returned future must terminate the script.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    async fn run(&self, script_path: &str) -> Result<ParsedFeed, ParseError>;
}

/// [`ScriptExecutor`] spawning scripts from a single directory.
///
/// The interpreter is chosen from the file extension; files without a known
/// extension are executed directly. Children are killed when the refresh
/// attempt is dropped (timeout or shutdown).
#[derive(Debug, Clone)]
pub struct ProcessScriptExecutor {
    scripts_dir: PathBuf,
}

impl ProcessScriptExecutor {
    pub fn new(scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
        }
    }

    /// Resolve a script path, rejecting anything outside the scripts directory.
    fn resolve(&self, script_path: &str) -> Result<PathBuf, ParseError> {
        let relative = Path::new(script_path.trim());
        if relative.as_os_str().is_empty() {
            return Err(ParseError::Script("empty script path".to_string()));
        }
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(ParseError::Script(format!(
                "script path must stay inside the scripts directory: {script_path}"
            )));
        }

        let full = self.scripts_dir.join(relative);
        if !full.is_file() {
            return Err(ParseError::Script(format!(
                "script not found: {}",
                full.display()
            )));
        }
        Ok(full)
    }
}

fn interpreter_for(path: &Path) -> Option<&'static str> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("py") => Some("python3"),
        Some("sh") => Some("sh"),
        Some("js") => Some("node"),
        Some("rb") => Some("ruby"),
        Some("pl") => Some("perl"),
        _ => None,
    }
}

#[async_trait]
impl ScriptExecutor for ProcessScriptExecutor {
    async fn run(&self, script_path: &str) -> Result<ParsedFeed, ParseError> {
        let script = self.resolve(script_path)?;

        let mut command = match interpreter_for(&script) {
            Some(interpreter) => {
                let mut command = Command::new(interpreter);
                command.arg(&script);
                command
            }
            None => Command::new(&script),
        };
        command
            .current_dir(&self.scripts_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(script = %script.display(), "Running feed script");

        let output = command
            .output()
            .await
            .map_err(|e| ParseError::Script(format!("{}: {e}", script.display())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr: String = stderr.trim().chars().take(200).collect();
            return Err(ParseError::Script(format!("{}: {stderr}", output.status)));
        }
        if output.stdout.len() > MAX_FEED_SIZE {
            return Err(ParseError::ResponseTooLarge);
        }

        parse_feed_bytes(&output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let executor = ProcessScriptExecutor::new(std::env::temp_dir());
        for path in ["../etc/passwd", "/bin/sh", "a/../../b.sh", "  "] {
            let err = executor.run(path).await.unwrap_err();
            assert!(matches!(err, ParseError::Script(_)), "{path}: {err:?}");
        }
    }

    #[tokio::test]
    async fn test_missing_script() {
        let executor = ProcessScriptExecutor::new(std::env::temp_dir());
        let err = executor
            .run("refeed-definitely-missing-script.sh")
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::Script(msg) if msg.contains("not found")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_shell_script() {
        let dir = std::env::temp_dir().join(format!("refeed-scripts-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("feed.sh"),
            r#"cat <<'XML'
<?xml version="1.0"?>
<rss version="2.0"><channel><title>Scripted</title>
<item><title>One</title><link>https://example.com/1</link></item>
</channel></rss>
XML
"#,
        )
        .unwrap();
        std::fs::write(dir.join("fail.sh"), "echo broken >&2\nexit 3\n").unwrap();

        let executor = ProcessScriptExecutor::new(&dir);
        let feed = executor.run("feed.sh").await.unwrap();
        assert_eq!(feed.title, "Scripted");
        assert_eq!(feed.items.len(), 1);

        let err = executor.run("fail.sh").await.unwrap_err();
        assert!(matches!(err, ParseError::Script(msg) if msg.contains("broken")));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_interpreter_by_extension() {
        assert_eq!(interpreter_for(Path::new("x.py")), Some("python3"));
        assert_eq!(interpreter_for(Path::new("x.sh")), Some("sh"));
        assert_eq!(interpreter_for(Path::new("x")), None);
    }
}
