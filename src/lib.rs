//! # npm-runner
//!
//! Run small JavaScript programs that `import` or `require` NPM packages,
//! without installing anything. Imports are rewritten into dynamic imports
//! from public ESM CDNs and the program runs in a fresh V8 isolate per run.
//!
//! ## Sandbox Guarantees
//!
//! - **No filesystem access**: `Deno` is removed after startup; there is no `process` or `fs`
//! - **Module loading only from CDNs**: `import()` is limited to https URLs on configured origins
//! - **One isolate per run**: Only fetched module sources are shared between runs
//! - **Bounded runs**: Wall-clock timeout, heap limit, and a per-run message budget
//! - **One way out**: `parent.postMessage` is the only channel to the host
//!
//! ## Usage
//!
//! ```rust,ignore
//! use npm_runner::{RunnerConfig, Session};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut session = Session::new(&RunnerConfig::default()).unwrap();
//!
//!     session.run("import emoji from 'contains-emoji';\nconsole.log(emoji('🦄'));");
//!     session.settle().await;
//!
//!     for entry in session.logs() {
//!         println!("[{}] {}", entry.kind, entry.text);
//!     }
//! }
//! ```

mod channel;
mod config;
mod document;
mod error;
mod loader;
mod ops;
mod readme;
mod resolver;
mod rewrite;
mod sandbox;
mod session;
mod syntax;

pub use channel::{
    format_arg, message_channel, ChannelRx, ChannelTx, Envelope, LogEntry, LogKind, Message,
    RunId, RunLog, RunSender, RunState,
};
pub use config::RunnerConfig;
pub use document::{synthesize, Document, CIRCULAR_SENTINEL};
pub use error::{Result, RunnerError};
pub use loader::{CdnLoader, ModuleCache, OriginAllowlist, DOCUMENT_SPECIFIER};
pub use readme::{
    default_code, extract_js_import_code, initial_code, NpmRegistry, DEFAULT_PACKAGE,
    MISSING_README,
};
pub use resolver::{default_endpoints, encode_package, CdnEndpoint, PACKAGE_PLACEHOLDER};
pub use rewrite::{rewrite, ImportRewriter, ImportSpecifier, RewriteResult};
pub use sandbox::{create_runtime, SandboxFailure, SandboxHost, SandboxOptions};
pub use session::{RunStart, Session, NOTHING_TO_RUN};
pub use syntax::{NoSyntaxCheck, SyntaxChecker, V8SyntaxChecker};
