//! Completion callbacks fired once per successful session.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Command;
use std::time::SystemTime;

use tracing::{info, warn};

/// Summary handed to the completion callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRecord {
    // ---
    pub peer: SocketAddr,

    /// Directory the session's chunks were written to
    pub output_dir: PathBuf,

    /// Persisted chunk files in arrival order
    pub chunk_paths: Vec<PathBuf>,

    pub total_bytes: u64,
    pub finished_at: SystemTime,
}

/// Downstream consumer of completed transfers.
///
/// Runs on the blocking pool; the server ignores what it does.
pub trait CompletionHandler: Send + Sync + 'static {
    fn on_complete(&self, record: &CompletionRecord);
}

impl<F> CompletionHandler for F
where
    F: Fn(&CompletionRecord) + Send + Sync + 'static,
{
    fn on_complete(&self, record: &CompletionRecord) {
        // ---
        self(record)
    }
}

/// Logs each completed transfer.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCompletion;

impl CompletionHandler for LogCompletion {
    fn on_complete(&self, record: &CompletionRecord) {
        // ---
        info!(
            "Transfer from {} complete: {} chunks, {} bytes in {}",
            record.peer,
            record.chunk_paths.len(),
            record.total_bytes,
            record.output_dir.display()
        );
    }
}

/// Runs an external program with the output directory followed by the
/// chunk paths as arguments.
#[derive(Debug, Clone)]
pub struct CommandHook {
    program: PathBuf,
}

impl CommandHook {
    // ---
    pub fn new(program: impl Into<PathBuf>) -> Self {
        // ---
        Self {
            program: program.into(),
        }
    }
}

impl CompletionHandler for CommandHook {
    fn on_complete(&self, record: &CompletionRecord) {
        // ---
        LogCompletion.on_complete(record);

        let status = Command::new(&self.program)
            .arg(&record.output_dir)
            .args(&record.chunk_paths)
            .status();
        match status {
            Ok(s) if s.success() => info!("Completion hook {} succeeded", self.program.display()),
            Ok(s) => warn!("Completion hook {} exited with {}", self.program.display(), s),
            Err(e) => warn!("Completion hook {} failed to run: {}", self.program.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::{Arc, Mutex};

    fn record() -> CompletionRecord {
        // ---
        CompletionRecord {
            peer: "127.0.0.1:4000".parse().unwrap(),
            output_dir: PathBuf::from("out"),
            chunk_paths: vec![PathBuf::from("out/chunk_0000.wav")],
            total_bytes: 10,
            finished_at: SystemTime::now(),
        }
    }

    #[test]
    fn closures_are_handlers() {
        // ---
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = move |r: &CompletionRecord| sink.lock().unwrap().push(r.total_bytes);

        handler.on_complete(&record());
        assert_eq!(*seen.lock().unwrap(), vec![10]);
    }

    #[cfg(unix)]
    #[test]
    fn command_hook_receives_dir_then_paths() {
        // ---
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("args.txt");
        let script = tmp.path().join("hook.sh");
        std::fs::write(&script, format!("#!/bin/sh\necho \"$@\" > {}\n", log.display())).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        CommandHook::new(&script).on_complete(&record());

        let args = std::fs::read_to_string(&log).unwrap();
        assert_eq!(args.trim(), "out out/chunk_0000.wav");
    }
}
