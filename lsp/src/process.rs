//! Server process handles.
//!
//! A [`ServerProcess`] is what a server definition hands back from `spawn`:
//! the byte streams the client speaks JSON-RPC over, plus the child process
//! when there is one. Streams are boxed so in-process servers (tests,
//! embedders) plug in the same way as real child processes.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;

use globset::{Glob, GlobSet, GlobSetBuilder};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

/// Environment variables never passed to language servers, matched
/// against the upper-cased variable name.
const SECRET_ENV_PATTERNS: &[&str] = &[
    "*_KEY",
    "*_TOKEN",
    "*_SECRET",
    "*_PASSWORD",
    "*_CREDENTIAL*",
    "*_API_*",
    "AWS_*",
    "ANTHROPIC_*",
    "OPENAI_*",
    "GEMINI_*",
    "GOOGLE_*",
    "AZURE_*",
    "GH_*",
    "GITHUB_*",
    "NPM_*",
];

static SECRET_ENV: LazyLock<GlobSet> = LazyLock::new(|| {
    let mut builder = GlobSetBuilder::new();
    for pattern in SECRET_ENV_PATTERNS {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => tracing::warn!("Bad env denylist pattern {pattern}: {e}"),
        }
    }
    builder.build().unwrap_or_else(|e| {
        tracing::warn!("Env denylist unusable: {e}");
        GlobSet::empty()
    })
});

fn is_secret_env(key: &str) -> bool {
    SECRET_ENV.is_match(key.to_uppercase())
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A running language server the client can talk to.
pub struct ServerProcess {
    pub(crate) reader: BoxedReader,
    pub(crate) writer: BoxedWriter,
    pub(crate) child: Option<Child>,
    pub(crate) initialization_options: Value,
}

impl ServerProcess {
    /// Spawn `program` in `root` with piped stdio.
    ///
    /// Secret-bearing variables are stripped from the inherited environment
    /// before `env` is applied.
    pub fn spawn(
        program: &Path,
        args: &[String],
        root: &Path,
        env: &BTreeMap<String, String>,
    ) -> io::Result<Self> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        for (key, _) in std::env::vars_os() {
            if let Some(key) = key.to_str()
                && is_secret_env(key)
            {
                cmd.env_remove(key);
            }
        }
        cmd.envs(env);

        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("no stdout from child"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("no stdin from child"))?;

        Ok(Self {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
            initialization_options: Value::Object(serde_json::Map::new()),
        })
    }

    /// Wrap an already-connected pair of streams.
    pub fn from_streams(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
            initialization_options: Value::Object(serde_json::Map::new()),
        }
    }

    /// Options sent in `initialize` and returned for `workspace/configuration`.
    pub fn with_initialization_options(mut self, options: Value) -> Self {
        self.initialization_options = options;
        self
    }

    /// OS process id, when backed by a child process.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_env_patterns() {
        assert!(is_secret_env("API_KEY"));
        assert!(is_secret_env("MY_SECRET_KEY"));
        assert!(!is_secret_env("KEYRING"));
        assert!(is_secret_env("AWS_ACCESS_KEY_ID"));
        assert!(!is_secret_env("MY_AWS"));
        assert!(is_secret_env("DB_CREDENTIAL_FILE"));
        assert!(!is_secret_env("CREDENTIAL"));
    }

    #[test]
    fn secret_env_detection_is_case_insensitive() {
        assert!(is_secret_env("github_token"));
        assert!(is_secret_env("npm_config_registry"));
        assert!(!is_secret_env("PATH"));
        assert!(!is_secret_env("GOPATH"));
    }

    #[tokio::test]
    async fn from_streams_has_no_child() {
        let (a, _b) = tokio::io::duplex(64);
        let (r, w) = tokio::io::split(a);
        let process = ServerProcess::from_streams(r, w)
            .with_initialization_options(serde_json::json!({"x": 1}));
        assert!(process.pid().is_none());
        assert_eq!(process.initialization_options["x"], 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_missing_program_fails() {
        let result = ServerProcess::spawn(
            Path::new("/nonexistent/definitely-not-a-server"),
            &[],
            Path::new("/"),
            &BTreeMap::new(),
        );
        assert!(result.is_err());
    }
}
