//! Host session.
//!
//! A [`Session`] owns the editor text, the console log, and the receiving end
//! of the message channel. Starting a run never blocks: the sandbox reports
//! back through the channel and the session folds those messages into its
//! [`RunLog`] when [`drain`](Session::drain) or [`settle`](Session::settle)
//! is called.

use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::channel::{message_channel, ChannelRx, ChannelTx, LogEntry, RunId, RunLog, RunState};
use crate::config::RunnerConfig;
use crate::document::synthesize;
use crate::error::Result;
use crate::rewrite::ImportRewriter;
use crate::sandbox::{SandboxHost, SandboxOptions};
use crate::syntax::{NoSyntaxCheck, SyntaxChecker, V8SyntaxChecker};

/// Notice shown when `run` is given nothing but whitespace.
pub const NOTHING_TO_RUN: &str = "⚠️ Nothing to run!";

/// What [`Session::run`] did with its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStart {
    /// A sandbox was launched for this run.
    Started(RunId),
    /// The input was empty; no run was created.
    NothingToRun,
    /// The run was recorded as errored before a sandbox was launched.
    Rejected(RunId),
}

impl RunStart {
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            RunStart::Started(id) | RunStart::Rejected(id) => Some(*id),
            RunStart::NothingToRun => None,
        }
    }
}

pub struct Session {
    rewriter: ImportRewriter,
    checker: Box<dyn SyntaxChecker + Send>,
    host: SandboxHost,
    channel: ChannelTx,
    inbox: ChannelRx,
    log: RunLog,
    code: String,
    notice: Option<String>,
    sandboxes: Vec<JoinHandle<()>>,
}

impl Session {
    pub fn new(config: &RunnerConfig) -> Result<Self> {
        config.validate()?;

        let checker: Box<dyn SyntaxChecker + Send> = if config.check_syntax {
            Box::new(V8SyntaxChecker)
        } else {
            Box::new(NoSyntaxCheck)
        };
        let (channel, inbox) = message_channel(config.max_messages);

        Ok(Self {
            rewriter: ImportRewriter::new(config.resolvers.clone()),
            checker,
            host: SandboxHost::new(SandboxOptions::from(config)),
            channel,
            inbox,
            log: RunLog::new(),
            code: String::new(),
            notice: None,
            sandboxes: Vec::new(),
        })
    }

    /// Replaces the syntax checker.
    pub fn with_checker(mut self, checker: impl SyntaxChecker + Send + 'static) -> Self {
        self.checker = Box::new(checker);
        self
    }

    /// Starts a run of `source` and returns without waiting for it.
    ///
    /// A previous run still in flight is superseded, not stopped: its output
    /// keeps arriving but its completion no longer affects the run state.
    pub fn run(&mut self, source: &str) -> RunStart {
        if source.trim().is_empty() {
            info!("Nothing to run");
            self.notice = Some(NOTHING_TO_RUN.to_string());
            return RunStart::NothingToRun;
        }

        self.notice = None;
        self.sandboxes.retain(|handle| !handle.is_finished());

        let run_id = RunId::new();
        self.log.begin(run_id);

        let program = self.rewriter.rewrite(source);
        debug!(run_id = %run_id, imports = program.imports.len(), "Rewrote program");

        if let Err(description) = self.checker.check(&program) {
            warn!(run_id = %run_id, error = %description, "Program rejected");
            self.log.reject(run_id, description);
            return RunStart::Rejected(run_id);
        }

        let document = synthesize(&program.preamble, &program.body);
        match self.host.launch(document, self.channel.for_run(run_id)) {
            Ok(handle) => {
                info!(run_id = %run_id, in_flight = self.sandboxes.len() + 1, "Run started");
                self.sandboxes.push(handle);
                RunStart::Started(run_id)
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Sandbox launch failed");
                self.log.reject(run_id, e.to_string());
                RunStart::Rejected(run_id)
            }
        }
    }

    /// Runs the current editor text.
    pub fn run_code(&mut self) -> RunStart {
        let code = self.code.clone();
        self.run(&code)
    }

    /// Applies every message already queued. Returns how many were applied.
    pub fn drain(&mut self) -> usize {
        let mut applied = 0;
        while let Some(envelope) = self.inbox.try_recv() {
            self.log.apply(envelope);
            applied += 1;
        }
        applied
    }

    /// Waits until the current run is no longer running.
    pub async fn settle(&mut self) -> RunState {
        self.drain();
        while self.log.state() == RunState::Running {
            match self.inbox.recv().await {
                Some(envelope) => self.log.apply(envelope),
                None => break,
            }
        }
        self.log.state()
    }

    pub fn clear_console(&mut self) {
        self.log.clear();
    }

    pub fn clear_editor(&mut self) {
        self.code.clear();
    }

    pub fn set_code(&mut self, code: impl Into<String>) {
        self.code = code.into();
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn logs(&self) -> &[LogEntry] {
        self.log.entries()
    }

    pub fn notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    pub fn state(&self) -> RunState {
        self.log.state()
    }

    pub fn current_run(&self) -> Option<RunId> {
        self.log.current_run()
    }

    pub fn host(&self) -> &SandboxHost {
        &self.host
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LogKind;

    fn session() -> Session {
        Session::new(&RunnerConfig::default()).unwrap()
    }

    #[test]
    fn test_nothing_to_run() {
        let mut session = session();
        assert_eq!(session.run("   \n\t"), RunStart::NothingToRun);
        assert_eq!(session.notice(), Some(NOTHING_TO_RUN));
        assert_eq!(session.state(), RunState::Idle);
        assert!(session.logs().is_empty());
        assert!(session.current_run().is_none());
    }

    #[test]
    fn test_syntax_error_is_rejected() {
        let mut session = session();
        session.run("");
        let start = session.run("const x = ;");

        assert!(matches!(start, RunStart::Rejected(_)));
        assert_eq!(session.notice(), None);
        assert_eq!(session.state(), RunState::Errored);
        assert_eq!(session.logs().len(), 1);
        assert_eq!(session.logs()[0].kind, LogKind::Error);
        assert_eq!(session.drain(), 0);
    }

    #[test]
    fn test_run_returns_promptly_for_wrapper_escapes() {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let mut session = session();
            let start = session.run("}); for (;;) {} (async () => {");
            let _ = tx.send((start, session.state()));
        });

        let (start, state) = rx
            .recv_timeout(std::time::Duration::from_secs(10))
            .expect("run blocked the calling thread");
        assert!(matches!(start, RunStart::Rejected(_)));
        assert_eq!(state, RunState::Errored);
    }

    #[test]
    fn test_editor_actions() {
        let mut session = session();
        session.set_code("console.log(1)");
        assert_eq!(session.code(), "console.log(1)");
        session.clear_editor();
        assert_eq!(session.code(), "");
        assert_eq!(session.run_code(), RunStart::NothingToRun);
    }

    #[test]
    fn test_clear_console_keeps_state() {
        let mut session = session();
        session.run("const x = ;");
        session.clear_console();
        assert!(session.logs().is_empty());
        assert_eq!(session.state(), RunState::Errored);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = RunnerConfig {
            max_messages: 0,
            ..Default::default()
        };
        assert!(Session::new(&config).is_err());
    }

    struct RejectAll;

    impl SyntaxChecker for RejectAll {
        fn check(&self, _program: &crate::rewrite::RewriteResult) -> std::result::Result<(), String> {
            Err("rejected".to_string())
        }
    }

    #[test]
    fn test_with_checker() {
        let mut session = session().with_checker(RejectAll);
        assert!(matches!(session.run("console.log(1)"), RunStart::Rejected(_)));
        assert_eq!(session.logs(), &[LogEntry::error("rejected")]);
    }
}
