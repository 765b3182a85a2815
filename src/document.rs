//! Executable document synthesis.
//!
//! A document is one async module script that
//!
//! 1. keeps references to the original console functions,
//! 2. installs a circular-safe serializer,
//! 3. forwards every console call to the host through `parent.postMessage`,
//! 4. awaits the import preamble,
//! 5. runs the user body inside `try`,
//! 6. reports an escaping exception as an `error` message,
//! 7. sends exactly one `done` message from `finally`.
//!
//! In a browser the script runs inside an iframe whose `parent` is the host
//! page. Inside the isolate, `bootstrap.js` provides a `parent` object that
//! forwards to the message channel, so the same text works for both.

use std::sync::LazyLock;

use regex::Regex;

/// Sentinel written in place of an object that was already serialized.
pub const CIRCULAR_SENTINEL: &str = "[Circular]";

/// `</script` ends the element; `<!--` can switch the HTML parser into the
/// escaped script states where a later `</script>` no longer ends it.
static SCRIPT_BREAK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<(/script|!--)").expect("script break pattern compiles"));

const PROLOGUE: &str = r#"(async () => {
    const __npmRunnerConsole = {
        log: console.log,
        info: console.info,
        debug: console.debug,
        warn: console.warn,
        error: console.error,
    };

    const __npmRunnerPost = (message) => {
        try {
            parent.postMessage(message, '*');
        } catch (_err) {
            // Host went away; nothing left to report to.
        }
    };

    const __npmRunnerReplacer = () => {
        const seen = new WeakSet();

        return (_key, value) => {
            if (typeof value === 'object' && value !== null) {
                if (seen.has(value)) {
                    return '[Circular]';
                }

                seen.add(value);
            }

            return value;
        };
    };

    const __npmRunnerString = (value) => {
        try {
            return String(value);
        } catch (_err) {
            return Object.prototype.toString.call(value);
        }
    };

    const safeStringify = (value) => {
        try {
            return JSON.stringify(value, __npmRunnerReplacer(), 2) ?? __npmRunnerString(value);
        } catch (_err) {
            return __npmRunnerString(value);
        }
    };

    const __npmRunnerFormat = (arg) =>
        typeof arg === 'object' && arg !== null ? safeStringify(arg) : __npmRunnerString(arg ?? '');

    const __npmRunnerIntercept = (type, original) => (...args) => {
        __npmRunnerPost({ type, args: args.map(__npmRunnerFormat) });

        if (typeof original === 'function') {
            original.apply(console, args);
        }
    };

    console.log = __npmRunnerIntercept('log', __npmRunnerConsole.log);
    console.info = __npmRunnerIntercept('log', __npmRunnerConsole.info);
    console.debug = __npmRunnerIntercept('log', __npmRunnerConsole.debug);
    console.warn = __npmRunnerIntercept('error', __npmRunnerConsole.warn);
    console.error = __npmRunnerIntercept('error', __npmRunnerConsole.error);

    try {
        // --| Await all imports first
"#;

const BODY_MARKER: &str = r#"
        // --| Then run the user code
"#;

const EPILOGUE: &str = r#"
    } catch (e) {
        let text;

        try {
            text = e?.message || String(e);
        } catch (_err) {
            text = __npmRunnerString(e);
        }

        __npmRunnerPost({ type: 'error', args: [text] });
    } finally {
        __npmRunnerPost({ type: 'done' });
    }
})();
"#;

/// A self-contained script ready to be injected into a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    script: String,
}

impl Document {
    /// Module script text.
    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn into_script(self) -> String {
        self.script
    }

    /// Page suitable for an iframe `srcdoc`.
    ///
    /// `</script` is written as `<\/script` and `<!--` as `<\!--` so user text
    /// cannot end the script element early. Inside string literals the
    /// spellings are the same string to the JavaScript parser.
    pub fn to_html(&self) -> String {
        let script = SCRIPT_BREAK_RE.replace_all(&self.script, r"<\$1");
        format!(
            "<!DOCTYPE html>\n<html>\n<body>\n<script type=\"module\">\n{}</script>\n</body>\n</html>\n",
            script
        )
    }
}

/// Builds the executable document for a rewritten program.
pub fn synthesize(preamble: &str, body: &str) -> Document {
    let mut script =
        String::with_capacity(PROLOGUE.len() + preamble.len() + body.len() + EPILOGUE.len() + 64);
    script.push_str(PROLOGUE);
    script.push_str(preamble);
    script.push_str(BODY_MARKER);
    script.push_str(body);
    script.push_str(EPILOGUE);
    Document { script }
}
