//! Pre-push hook invocation.
//!
//! The hook executable receives `(remote name, remote url)` as argv and
//! one line per ref update on stdin:
//! `<local-ref> SP <local-id> SP <remote-ref> SP <remote-old-id> LF`.
//! A non-zero exit aborts the push; stderr is surfaced to the caller.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::object::id::ObjectId;

use super::TransportError;

/// One line of hook input.
#[derive(Clone, Debug)]
pub struct HookUpdate {
    /// Local ref being pushed.
    pub local_ref: String,
    /// Local value.
    pub local_id: ObjectId,
    /// Destination ref on the remote.
    pub remote_ref: String,
    /// Value the remote currently holds (zero id for creation).
    pub remote_old_id: ObjectId,
}

/// The `pre-push` hook of one repository.
#[derive(Clone, Debug)]
pub struct PrePushHook {
    path: PathBuf,
}

impl PrePushHook {
    /// Hook at `<git-dir>/hooks/pre-push`.
    #[must_use]
    pub fn for_git_dir(git_dir: &Path) -> Self {
        Self {
            path: git_dir.join("hooks").join("pre-push"),
        }
    }

    /// True when an executable hook is installed.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.path.is_file()
    }

    /// Runs the hook; `Ok(())` permits the push.
    ///
    /// A missing hook permits everything. A non-zero exit rejects with
    /// the hook's stderr as the message.
    pub fn run(
        &self,
        remote_name: &str,
        remote_url: &str,
        updates: &[HookUpdate],
    ) -> Result<(), TransportError> {
        if !self.is_installed() {
            return Ok(());
        }

        let mut child = Command::new(&self.path)
            .arg(remote_name)
            .arg(remote_url)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        {
            let stdin = child.stdin.as_mut().expect("piped stdin");
            for update in updates {
                writeln!(
                    stdin,
                    "{} {} {} {}",
                    update.local_ref, update.local_id, update.remote_ref, update.remote_old_id
                )?;
            }
        }

        let output = child.wait_with_output()?;
        if output.status.success() {
            Ok(())
        } else {
            let message = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            Err(TransportError::Auth {
                message: if message.is_empty() {
                    format!("pre-push hook rejected ({})", output.status)
                } else {
                    message
                },
            })
        }
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn install_hook(git_dir: &Path, script: &str) {
        let hooks = git_dir.join("hooks");
        fs::create_dir_all(&hooks).unwrap();
        let path = hooks.join("pre-push");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn update() -> HookUpdate {
        HookUpdate {
            local_ref: "refs/heads/main".to_owned(),
            local_id: ObjectId::sha1([1; 20]),
            remote_ref: "refs/heads/main".to_owned(),
            remote_old_id: ObjectId::ZERO,
        }
    }

    #[test]
    fn missing_hook_permits() {
        let dir = TempDir::new().unwrap();
        let hook = PrePushHook::for_git_dir(dir.path());
        assert!(!hook.is_installed());
        hook.run("origin", "file:///r", &[update()]).unwrap();
    }

    #[test]
    fn zero_exit_permits() {
        let dir = TempDir::new().unwrap();
        install_hook(dir.path(), "#!/bin/sh\nexit 0\n");
        let hook = PrePushHook::for_git_dir(dir.path());
        hook.run("origin", "file:///r", &[update()]).unwrap();
    }

    #[test]
    fn nonzero_exit_rejects_with_stderr() {
        let dir = TempDir::new().unwrap();
        install_hook(dir.path(), "#!/bin/sh\necho 'push denied' >&2\nexit 1\n");
        let hook = PrePushHook::for_git_dir(dir.path());
        let err = hook.run("origin", "file:///r", &[update()]).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Auth { message } if message.contains("push denied")
        ));
    }

    #[test]
    fn hook_reads_update_lines() {
        let dir = TempDir::new().unwrap();
        // Rejects unless stdin carries exactly one line.
        install_hook(
            dir.path(),
            "#!/bin/sh\ntest \"$(wc -l < /dev/stdin)\" = 1 || exit 1\nexit 0\n",
        );
        let hook = PrePushHook::for_git_dir(dir.path());
        hook.run("origin", "file:///r", &[update()]).unwrap();
    }
}
