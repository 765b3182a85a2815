//! Import rewriter.
//!
//! Turns static `import` / `require` statements into awaited dynamic imports
//! that walk an ordered list of CDN endpoints:
//!
//! ```text
//! import mod from 'left-pad';        let __npmRunnerModule0;
//! console.log(mod);           ==>    try { __npmRunnerModule0 = await import("https://cdn.skypack.dev/left-pad"); }
//!                                    catch (...) { ...next endpoint... }
//!                                    const mod = __npmRunnerModule0?.default ?? __npmRunnerModule0 ?? {};
//! ```
//!
//! Recognition is pattern based and works line by line. Statements it cannot
//! make sense of are left in the body untouched; the resulting syntax error
//! is reported when the run starts rather than here.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::ops::Range;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::resolver::{default_endpoints, CdnEndpoint};

static IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\bimport\s+(.*?)\s+from\s+['"](.*?)['"];?"#).expect("import pattern compiles")
});

static REQUIRE_DECL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(?:const|let|var)\s+(\{?.*?\}?)\s*=\s*require\(\s*['"](.*?)['"]\s*\);?"#)
        .expect("require declaration pattern compiles")
});

static INLINE_REQUIRE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\brequire\(\s*['"](.*?)['"]\s*\)"#).expect("inline require pattern compiles")
});

static ES_ALIAS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([\w$]+)\s+as\s+([\w$]+)$").expect("alias pattern compiles")
});

const MODULE_VAR_PREFIX: &str = "__npmRunnerModule";

/// One binding introduced by an import or require statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSpecifier {
    /// A single identifier, or a normalized `{ a, b: c }` list.
    pub binding: String,
    /// Whether `binding` is a brace-delimited list.
    pub is_destructured: bool,
    /// Package name as written in the source. Never empty.
    pub package_name: String,
}

/// Output of [`ImportRewriter::rewrite`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteResult {
    /// Import blocks, one per specifier, to be awaited before `body`.
    pub preamble: String,
    /// The source without its import statements.
    pub body: String,
    /// Specifiers in the order their blocks appear in `preamble`.
    pub imports: Vec<ImportSpecifier>,
}

/// A recognized statement: where it sits in the source and what it imports.
struct Statement {
    span: Range<usize>,
    specifiers: Vec<ImportSpecifier>,
}

/// Rewrites import syntax against an ordered list of CDN endpoints.
#[derive(Debug, Clone)]
pub struct ImportRewriter {
    endpoints: Vec<CdnEndpoint>,
}

impl Default for ImportRewriter {
    fn default() -> Self {
        Self::new(default_endpoints())
    }
}

impl ImportRewriter {
    /// `endpoints` are tried in order; an empty list makes every import bind `{}`.
    pub fn new(endpoints: Vec<CdnEndpoint>) -> Self {
        Self { endpoints }
    }

    pub fn endpoints(&self) -> &[CdnEndpoint] {
        &self.endpoints
    }

    pub fn rewrite(&self, source: &str) -> RewriteResult {
        if source.is_empty() {
            return RewriteResult::default();
        }

        let statements = collect_statements(source);

        let mut residual = String::with_capacity(source.len());
        let mut cursor = 0;
        for statement in &statements {
            residual.push_str(&source[cursor..statement.span.start]);
            cursor = statement.span.end;
        }
        residual.push_str(&source[cursor..]);

        let body = INLINE_REQUIRE_RE
            .replace_all(&residual, |caps: &Captures<'_>| {
                let package = &caps[1];
                if package.is_empty() {
                    caps[0].to_string()
                } else {
                    self.inline_import(package)
                }
            })
            .into_owned();

        let mut seen = HashSet::new();
        let imports: Vec<ImportSpecifier> = statements
            .into_iter()
            .flat_map(|statement| statement.specifiers)
            .filter(|spec| seen.insert((spec.binding.clone(), spec.package_name.clone())))
            .collect();

        let preamble = imports
            .iter()
            .enumerate()
            .map(|(index, spec)| self.import_block(index, spec))
            .collect::<Vec<_>>()
            .join("\n");

        RewriteResult {
            preamble,
            body,
            imports,
        }
    }

    /// Fallback block binding one specifier.
    fn import_block(&self, index: usize, spec: &ImportSpecifier) -> String {
        let module_var = format!("{MODULE_VAR_PREFIX}{index}");
        let package = js_string(&spec.package_name);

        let mut block = String::new();
        let _ = writeln!(block, "let {module_var};");

        let last = self.endpoints.len().saturating_sub(1);
        for (depth, endpoint) in self.endpoints.iter().enumerate() {
            let indent = "    ".repeat(depth);
            let err = format!("{MODULE_VAR_PREFIX}Err{index}_{depth}");
            let hint = if depth == last {
                "⚠️ Failed to load."
            } else {
                "⚠️ Might be expecting a Node runtime."
            };
            let _ = writeln!(block, "{indent}try {{");
            let _ = writeln!(
                block,
                "{indent}    {module_var} = await import({});",
                js_string(&endpoint.url_for(&spec.package_name))
            );
            let _ = writeln!(block, "{indent}}} catch ({err}) {{");
            let _ = writeln!(
                block,
                "{indent}    console.error('[Package Error]', {package}, {err}?.message ?? {err}, '{hint}');"
            );
        }

        let indent = "    ".repeat(self.endpoints.len());
        let _ = writeln!(block, "{indent}{module_var} = {{}};");
        for depth in (0..self.endpoints.len()).rev() {
            let _ = writeln!(block, "{}}}", "    ".repeat(depth));
        }

        let _ = writeln!(
            block,
            "const {} = {module_var}?.default ?? {module_var} ?? {{}};",
            spec.binding
        );
        block
    }

    /// Single-line awaited expression standing in for `require('<package>')`.
    fn inline_import(&self, package: &str) -> String {
        let mut expr = String::from("(await ");
        let mut urls = self.endpoints.iter().map(|e| e.url_for(package));
        match urls.next() {
            Some(first) => {
                let _ = write!(expr, "import({})", js_string(&first));
                for url in urls {
                    let _ = write!(expr, ".catch(() => import({}))", js_string(&url));
                }
            }
            None => expr.push_str("Promise.resolve({})"),
        }
        expr.push_str(".then((m) => m?.default ?? m))");
        expr
    }
}

/// Rewrites `source` against the default endpoints.
pub fn rewrite(source: &str) -> RewriteResult {
    ImportRewriter::default().rewrite(source)
}

/// Finds well-formed import/require declarations in source order.
fn collect_statements(source: &str) -> Vec<Statement> {
    let mut candidates: Vec<(Range<usize>, Vec<ImportSpecifier>)> = Vec::new();

    for caps in IMPORT_RE.captures_iter(source) {
        if let Some(found) = statement_from(&caps, true) {
            candidates.push(found);
        }
    }
    for caps in REQUIRE_DECL_RE.captures_iter(source) {
        if let Some(found) = statement_from(&caps, false) {
            candidates.push(found);
        }
    }

    candidates.sort_by_key(|(span, _)| span.start);

    let mut statements: Vec<Statement> = Vec::with_capacity(candidates.len());
    for (span, specifiers) in candidates {
        if statements.last().is_some_and(|prev| span.start < prev.span.end) {
            continue;
        }
        statements.push(Statement { span, specifiers });
    }
    statements
}

fn statement_from(
    caps: &Captures<'_>,
    es_module: bool,
) -> Option<(Range<usize>, Vec<ImportSpecifier>)> {
    let whole = caps.get(0)?;
    let package = caps.get(2)?.as_str().trim();
    if package.is_empty() {
        return None;
    }
    let bindings = parse_bindings(caps.get(1)?.as_str(), es_module)?;
    let specifiers = bindings
        .into_iter()
        .map(|(binding, is_destructured)| ImportSpecifier {
            binding,
            is_destructured,
            package_name: package.to_string(),
        })
        .collect();
    Some((whole.range(), specifiers))
}

/// Splits a raw specifier into `(binding, is_destructured)` pairs.
///
/// Returns `None` for anything malformed.
fn parse_bindings(raw: &str, es_module: bool) -> Option<Vec<(String, bool)>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if raw.starts_with('{') || raw.ends_with('}') {
        if let Some(list) = destructured_list(raw, es_module) {
            return Some(vec![(list, true)]);
        }
        // `Default, { named }` is only valid ES syntax.
        let (default, named) = raw.split_once(',')?;
        let default = default.trim();
        if !es_module || !is_identifier(default) {
            return None;
        }
        let list = destructured_list(named.trim(), es_module)?;
        return Some(vec![(default.to_string(), false), (list, true)]);
    }

    is_identifier(raw).then(|| vec![(raw.to_string(), false)])
}

/// Normalizes `{ a, b as c }` into `{ a, b: c }`.
fn destructured_list(raw: &str, es_module: bool) -> Option<String> {
    let inner = raw.strip_prefix('{')?.strip_suffix('}')?;
    if inner.contains(['{', '}']) {
        return None;
    }

    let mut members = Vec::new();
    for member in inner.split(',').map(str::trim).filter(|m| !m.is_empty()) {
        let member = match (es_module, ES_ALIAS_RE.captures(member)) {
            (true, Some(alias)) => format!("{}: {}", &alias[1], &alias[2]),
            _ => member.to_string(),
        };
        members.push(member);
    }

    if members.is_empty() {
        return None;
    }
    Some(format!("{{ {} }}", members.join(", ")))
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' || first == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

/// Double-quoted JavaScript string literal.
fn js_string(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| String::from("\"\""))
}
