//! Sandbox host - runs a synthesized document in a fresh V8 isolate.
//!
//! Each run gets its own OS thread, single-threaded Tokio runtime, and
//! `JsRuntime`. Nothing is shared with the host except the run's
//! [`RunSender`]. The isolate provides only the globals from `bootstrap.js`
//! and can load modules only from allowed CDN origins.

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use deno_core::anyhow::{anyhow, Error};
use deno_core::{JsRuntime, ModuleSpecifier, PollEventLoopOptions, RuntimeOptions};
use thiserror::Error as ThisError;
use tracing::{debug, info, warn};

use crate::channel::{Message, RunSender};
use crate::config::RunnerConfig;
use crate::document::Document;
use crate::error::RunnerError;
use crate::loader::{CdnLoader, ModuleCache, OriginAllowlist, DOCUMENT_SPECIFIER};
use crate::ops::npm_runner_sandbox;

/// Removes host-facing globals deno_core installs. The ops `bootstrap.js`
/// needs are bound through `ext:core/ops` before this runs.
const LOCKDOWN_SCRIPT: &str = "delete globalThis.Deno;\ndelete globalThis.__bootstrap;";

/// Limits and permissions for sandboxes.
#[derive(Debug, Clone)]
pub struct SandboxOptions {
    /// Origins module imports may be fetched from.
    pub allowed_origins: Vec<String>,
    /// Maximum heap size in bytes (None = unlimited).
    pub max_heap_size: Option<usize>,
    /// Maximum time for a single run in milliseconds (None = unlimited).
    pub timeout_ms: Option<u64>,
    /// Fetched module sources, shared across runs.
    pub module_cache: ModuleCache,
}

impl From<&RunnerConfig> for SandboxOptions {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            allowed_origins: config.module_origins(),
            max_heap_size: config.max_heap_size,
            timeout_ms: config.timeout_ms,
            module_cache: ModuleCache::new(),
        }
    }
}

/// Why a sandbox stopped without a clean finish.
#[derive(Debug, ThisError)]
pub enum SandboxFailure {
    #[error("Execution timed out after {0}ms")]
    TimedOut(u64),

    #[error("Execution stopped: heap limit of {0}MB exceeded")]
    HeapExhausted(usize),

    #[error("{0}")]
    Script(String),

    #[error("Execution ended before completing (a pending promise never settled)")]
    Incomplete,

    #[error("Sandbox setup failed: {0}")]
    Setup(String),
}

/// Launches documents into isolated runtimes.
#[derive(Debug, Clone)]
pub struct SandboxHost {
    options: Arc<SandboxOptions>,
}

impl SandboxHost {
    pub fn new(options: SandboxOptions) -> Self {
        Self {
            options: Arc::new(options),
        }
    }

    pub fn options(&self) -> &SandboxOptions {
        &self.options
    }

    /// Module sources kept between runs.
    pub fn module_cache(&self) -> &ModuleCache {
        &self.options.module_cache
    }

    /// Starts `document` in a new isolate and returns without waiting.
    ///
    /// All outcomes arrive through `sender`. Exactly one `done` is delivered
    /// per launch, even if the document never gets to send its own.
    pub fn launch(&self, document: Document, sender: RunSender) -> Result<JoinHandle<()>, RunnerError> {
        let options = Arc::clone(&self.options);
        let run_id = sender.run_id();

        std::thread::Builder::new()
            .name(format!("npm-runner-sandbox-{}", run_id))
            .spawn(move || run_isolate(&options, document, sender))
            .map_err(RunnerError::Spawn)
    }
}

/// Sends a terminal error and `done` if the document could not.
///
/// Lives for the whole sandbox thread so a panic still completes the run.
struct CompletionGuard {
    sender: RunSender,
    failure: Option<String>,
}

impl CompletionGuard {
    fn new(sender: RunSender) -> Self {
        Self {
            sender,
            failure: None,
        }
    }

    fn record(&mut self, failure: &SandboxFailure) {
        if self.sender.is_completed() {
            // The document already finished; surface late failures anyway.
            warn!(run_id = %self.sender.run_id(), error = %failure, "Sandbox failed after completion");
            self.sender.send(Message::error_text(failure.to_string()));
        } else {
            self.failure = Some(failure.to_string());
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.sender.is_completed() {
            return;
        }
        let failure = self
            .failure
            .take()
            .unwrap_or_else(|| SandboxFailure::Incomplete.to_string());
        self.sender.send(Message::error_text(failure));
        self.sender.send(Message::Done);
    }
}

fn run_isolate(options: &SandboxOptions, document: Document, sender: RunSender) {
    let run_id = sender.run_id();
    let mut guard = CompletionGuard::new(sender.clone());

    let tokio_rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            guard.record(&SandboxFailure::Setup(format!("tokio runtime: {}", e)));
            return;
        }
    };

    debug!(run_id = %run_id, "Sandbox starting");
    let outcome = tokio_rt.block_on(execute(options, document, sender));

    match outcome {
        Ok(()) => info!(run_id = %run_id, "Sandbox finished"),
        Err(failure) => {
            info!(run_id = %run_id, error = %failure, "Sandbox stopped");
            guard.record(&failure);
        }
    }
}

async fn execute(
    options: &SandboxOptions,
    document: Document,
    sender: RunSender,
) -> Result<(), SandboxFailure> {
    let heap_exhausted = Arc::new(AtomicBool::new(false));
    let mut runtime = create_runtime(options, sender, Arc::clone(&heap_exhausted))
        .map_err(|e| SandboxFailure::Setup(e.to_string()))?;

    let watchdog = match options.timeout_ms {
        Some(ms) => Some(
            Watchdog::arm(runtime.v8_isolate().thread_safe_handle(), ms)
                .map_err(|e| SandboxFailure::Setup(format!("watchdog: {}", e)))?,
        ),
        None => None,
    };

    let result = evaluate(&mut runtime, document).await;

    let timed_out = watchdog.map(Watchdog::disarm).unwrap_or(false);

    match result {
        Ok(()) => Ok(()),
        Err(_) if timed_out => Err(SandboxFailure::TimedOut(options.timeout_ms.unwrap_or_default())),
        Err(_) if heap_exhausted.load(Ordering::Acquire) => Err(SandboxFailure::HeapExhausted(
            options.max_heap_size.unwrap_or_default() / (1024 * 1024),
        )),
        Err(e) => Err(SandboxFailure::Script(e.to_string())),
    }
}

/// Create an isolate wired to `sender`.
pub fn create_runtime(
    options: &SandboxOptions,
    sender: RunSender,
    heap_exhausted: Arc<AtomicBool>,
) -> Result<JsRuntime, Error> {
    let loader = CdnLoader::new(
        OriginAllowlist::new(options.allowed_origins.clone()),
        options.module_cache.clone(),
    )?;

    // Configure V8 heap limits if specified
    let create_params = options.max_heap_size.map(|max_bytes| {
        deno_core::v8::Isolate::create_params().heap_limits(0, max_bytes)
    });

    let mut runtime = JsRuntime::new(RuntimeOptions {
        module_loader: Some(Rc::new(loader)),
        extensions: vec![npm_runner_sandbox::init_ops_and_esm()],
        create_params,
        ..Default::default()
    });

    if options.max_heap_size.is_some() {
        let handle = runtime.v8_isolate().thread_safe_handle();
        let run_id = sender.run_id();
        runtime.add_near_heap_limit_callback(move |current, initial| {
            warn!(
                run_id = %run_id,
                current_mb = current / (1024 * 1024),
                initial_mb = initial / (1024 * 1024),
                "Sandbox near heap limit, terminating"
            );
            heap_exhausted.store(true, Ordering::Release);
            handle.terminate_execution();
            // Headroom so termination can unwind instead of aborting the process
            current + initial
        });
    }

    runtime.op_state().borrow_mut().put(sender);

    // Runs after deno_core has cached its callbacks from `Deno.core`
    runtime.execute_script("<sandbox-lockdown>", LOCKDOWN_SCRIPT)?;

    Ok(runtime)
}

async fn evaluate(runtime: &mut JsRuntime, document: Document) -> Result<(), Error> {
    let specifier = ModuleSpecifier::parse(DOCUMENT_SPECIFIER)
        .map_err(|e| anyhow!("Invalid document specifier: {}", e))?;

    let module_id = runtime
        .load_main_es_module_from_code(&specifier, document.into_script())
        .await?;
    let evaluation = runtime.mod_evaluate(module_id);

    // Run event loop to handle imports, timers and pending promises
    runtime
        .run_event_loop(PollEventLoopOptions::default())
        .await?;

    evaluation.await?;
    Ok(())
}

/// Terminates an isolate that outlives its time budget.
///
/// Runs on its own thread: a script stuck in a synchronous loop never yields
/// back to the sandbox's Tokio runtime.
struct Watchdog {
    cancel: mpsc::Sender<()>,
    fired: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl Watchdog {
    fn arm(handle: deno_core::v8::IsolateHandle, ms: u64) -> std::io::Result<Self> {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);

        let thread = std::thread::Builder::new()
            .name("npm-runner-watchdog".to_string())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) =
                    cancelled.recv_timeout(Duration::from_millis(ms))
                {
                    flag.store(true, Ordering::Release);
                    handle.terminate_execution();
                }
            })?;

        Ok(Self {
            cancel,
            fired,
            thread,
        })
    }

    /// Stops the watchdog and reports whether it fired.
    fn disarm(self) -> bool {
        let _ = self.cancel.send(());
        let _ = self.thread.join();
        self.fired.load(Ordering::Acquire)
    }
}
