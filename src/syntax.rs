//! Syntax checking before a sandbox is started.

use deno_core::futures::executor::block_on;
use deno_core::{JsRuntime, ModuleSpecifier, RuntimeOptions};

use crate::document::synthesize;
use crate::rewrite::RewriteResult;

/// Specifier the document is compiled under while checking.
const SYNTAX_CHECK_SPECIFIER: &str = "npm-runner://sandbox/syntax-check.js";

/// Rejects programs that cannot run, with a human-readable description.
pub trait SyntaxChecker {
    fn check(&self, program: &RewriteResult) -> Result<(), String>;
}

/// Accepts everything; syntax errors then surface from the sandbox itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSyntaxCheck;

impl SyntaxChecker for NoSyntaxCheck {
    fn check(&self, _program: &RewriteResult) -> Result<(), String> {
        Ok(())
    }
}

/// Compiles the document the sandbox would run, as a module, in a bare
/// isolate.
///
/// The module is loaded and instantiated but never evaluated, so no user
/// code runs on the calling thread. Module semantics match the sandbox:
/// strict mode, `import.meta`, no HTML comments. The isolate has the default
/// loader, which refuses to fetch anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct V8SyntaxChecker;

impl SyntaxChecker for V8SyntaxChecker {
    fn check(&self, program: &RewriteResult) -> Result<(), String> {
        let document = synthesize(&program.preamble, &program.body);
        let specifier = ModuleSpecifier::parse(SYNTAX_CHECK_SPECIFIER)
            .map_err(|e| format!("Invalid syntax check specifier: {}", e))?;

        let mut runtime = JsRuntime::new(RuntimeOptions::default());
        // Loading from code with the no-op loader completes without I/O
        block_on(runtime.load_side_es_module_from_code(&specifier, document.into_script()))
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::rewrite;

    #[test]
    fn test_accepts_valid_program() {
        let program = rewrite("import mod from 'left-pad';\nconsole.log(await Promise.resolve(mod));");
        assert!(V8SyntaxChecker.check(&program).is_ok());
    }

    #[test]
    fn test_does_not_execute() {
        let program = rewrite("throw new Error('boom')");
        assert!(V8SyntaxChecker.check(&program).is_ok());
    }

    #[test]
    fn test_wrapper_escape_is_not_executed() {
        // Valid once embedded in the document; the loop must never run here.
        let program = rewrite("} finally {} })(); for (;;) {} (async () => { try {");
        let started = std::time::Instant::now();
        assert!(V8SyntaxChecker.check(&program).is_ok());
        assert!(started.elapsed() < std::time::Duration::from_secs(10));

        let program = rewrite("}); for (;;) {} (async () => {");
        assert!(V8SyntaxChecker.check(&program).is_err());
    }

    #[test]
    fn test_module_semantics() {
        assert!(V8SyntaxChecker
            .check(&rewrite("console.log(import.meta.url);"))
            .is_ok());

        let err = V8SyntaxChecker
            .check(&rewrite("const o = {};\nwith (o) {}"))
            .unwrap_err();
        assert!(err.contains("SyntaxError"), "{err}");
        assert!(V8SyntaxChecker.check(&rewrite("const n = 010;")).is_err());
    }

    #[test]
    fn test_rejects_broken_program() {
        let program = rewrite("const x = ;");
        let err = V8SyntaxChecker.check(&program).unwrap_err();
        assert!(err.contains("SyntaxError"), "{err}");
    }

    #[test]
    fn test_reports_malformed_import_left_in_body() {
        let program = rewrite("import * as ns from 'pkg';");
        assert!(V8SyntaxChecker.check(&program).is_err());
    }

    #[test]
    fn test_no_check() {
        assert!(NoSyntaxCheck.check(&rewrite("const x = ;")).is_ok());
    }
}
