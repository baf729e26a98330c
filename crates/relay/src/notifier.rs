// Desktop notification sink
//
// The relay only needs `notify(title, body)`. The default implementation runs
// a freedesktop `notify-send` compatible utility; the first candidate that
// exists on PATH is used.

use std::io::ErrorKind;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::trace;

use crate::error::NotifyError;

/// Application name passed to the notification daemon
pub const DEFAULT_APP_NAME: &str = "ntfy-notify";

/// Utilities tried in order
pub const DEFAULT_PROGRAMS: &[&str] = &["sw-notify-send", "notify-send"];

/// Something that can show a title/body pair to the user
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, title: &str, body: &str) -> Result<(), NotifyError>;
}

#[async_trait]
impl<N: Notifier + ?Sized> Notifier for std::sync::Arc<N> {
    async fn notify(&self, title: &str, body: &str) -> Result<(), NotifyError> {
        (**self).notify(title, body).await
    }
}

/// Shells out to `notify-send` (or a compatible replacement)
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    programs: Vec<String>,
    app_name: String,
}

impl Default for CommandNotifier {
    fn default() -> Self {
        Self {
            programs: DEFAULT_PROGRAMS.iter().map(|p| p.to_string()).collect(),
            app_name: DEFAULT_APP_NAME.to_string(),
        }
    }
}

impl CommandNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the candidate programs
    pub fn with_programs<I, S>(mut self, programs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.programs = programs.into_iter().map(Into::into).collect();
        self
    }

    /// Set the application name shown by the notification daemon
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn notify(&self, title: &str, body: &str) -> Result<(), NotifyError> {
        for program in &self.programs {
            let status = Command::new(program)
                .arg(title)
                .arg(body)
                .arg("-a")
                .arg(&self.app_name)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;

            match status {
                Ok(status) if status.success() => return Ok(()),
                Ok(status) => {
                    return Err(NotifyError::Status {
                        program: program.clone(),
                        status: status.to_string(),
                    })
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    trace!(program = %program, "notification utility not found, trying next");
                    continue;
                }
                Err(source) => {
                    return Err(NotifyError::Spawn {
                        program: program.clone(),
                        source,
                    })
                }
            }
        }

        Err(NotifyError::NoBackend {
            tried: self.programs.join(", "),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_programs() {
        let notifier = CommandNotifier::new();
        assert_eq!(notifier.programs, vec!["sw-notify-send", "notify-send"]);
        assert_eq!(notifier.app_name, "ntfy-notify");
    }

    #[tokio::test]
    async fn test_no_backend_available() {
        let notifier = CommandNotifier::new().with_programs(["ntfy-relay-missing-binary-1"]);
        let err = notifier.notify("t", "b").await.unwrap_err();
        assert!(matches!(err, NotifyError::NoBackend { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_falls_back_to_next_program() {
        // `true` ignores its arguments and exits 0
        let notifier =
            CommandNotifier::new().with_programs(["ntfy-relay-missing-binary-2", "true"]);
        notifier.notify("title", "body").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_failure() {
        let notifier = CommandNotifier::new().with_programs(["false", "true"]);
        let err = notifier.notify("title", "body").await.unwrap_err();
        assert!(matches!(err, NotifyError::Status { ref program, .. } if program == "false"));
    }
}
