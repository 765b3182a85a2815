//! Starter code from package READMEs.
//!
//! The registry is only consulted to pre-fill the program text; nothing in
//! the execution pipeline depends on it.

use std::sync::LazyLock;

use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::Result;
use crate::resolver::encode_package;

/// Package shown when none is given.
pub const DEFAULT_PACKAGE: &str = "contains-emoji";

/// README text used when the registry has none.
pub const MISSING_README: &str = "No README or package found.";

static CODE_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)```(?:js|javascript)\s*([\s\S]*?)```").expect("code block pattern compiles")
});

static HAS_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"import\s+.*\s+from\s+['"].*['"]"#).expect("import probe compiles")
});

static HAS_REQUIRE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"require\s*\(\s*['"].*['"]\s*\)"#).expect("require probe compiles")
});

/// Fenced `js`/`javascript` blocks that import something.
///
/// Blocks with an ES `import` come first, then blocks that only `require`.
/// Blocks with neither are skipped.
pub fn extract_js_import_code(markdown: &str) -> Vec<String> {
    let mut import_blocks = Vec::new();
    let mut require_blocks = Vec::new();

    for caps in CODE_BLOCK_RE.captures_iter(markdown) {
        let block = caps[1].trim();
        if HAS_IMPORT_RE.is_match(block) {
            import_blocks.push(block.to_string());
        } else if HAS_REQUIRE_RE.is_match(block) {
            require_blocks.push(block.to_string());
        }
    }

    import_blocks.extend(require_blocks);
    import_blocks
}

/// Program text to start from for `package`.
pub fn initial_code(package: &str, readme: Option<&str>) -> String {
    readme
        .and_then(|md| extract_js_import_code(md).into_iter().next())
        .unwrap_or_else(|| default_code(package))
}

/// `import mod from '<package>';\nconsole.log(mod);`
pub fn default_code(package: &str) -> String {
    format!("import mod from '{}';\nconsole.log(mod);", package)
}

#[derive(Debug, Deserialize)]
struct PackageDocument {
    #[serde(default)]
    readme: Option<String>,
}

/// Minimal NPM registry client.
#[derive(Debug, Clone)]
pub struct NpmRegistry {
    base: Url,
    client: Client,
}

impl NpmRegistry {
    pub fn new(base: &str) -> Result<Self> {
        let mut base = Url::parse(base)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .user_agent(concat!("npm-runner/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { base, client })
    }

    /// Document URL for `package`.
    pub fn package_url(&self, package: &str) -> Result<Url> {
        Ok(self.base.join(&encode_package(package))?)
    }

    /// README markdown, or [`MISSING_README`] if the package has none.
    pub async fn fetch_readme(&self, package: &str) -> Result<String> {
        let url = self.package_url(package)?;
        debug!(package, url = %url, "Fetching package document");

        let document: PackageDocument = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(document
            .readme
            .filter(|readme| !readme.is_empty())
            .unwrap_or_else(|| MISSING_README.to_string()))
    }

    /// Starter code for `package`, falling back to the default template
    /// when the registry cannot be reached.
    pub async fn seed_code(&self, package: &str) -> String {
        match self.fetch_readme(package).await {
            Ok(readme) => initial_code(package, Some(&readme)),
            Err(e) => {
                debug!(package, error = %e, "README unavailable, using default code");
                default_code(package)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_js_blocks() {
        let markdown = "# Title\n\nSome text here.\n\n```html\n<div>Hello</div>\n```\n";
        assert!(extract_js_import_code(markdown).is_empty());
    }

    #[test]
    fn test_extracts_import_block() {
        let markdown = "```js\nimport React from 'react';\nconsole.log(React);\n```";
        let blocks = extract_js_import_code(markdown);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].contains("import React from 'react'"));
    }

    #[test]
    fn test_import_blocks_come_first() {
        let markdown = "```js\nconst fs = require('fs');\n```\n\n```javascript\nimport path from 'path';\n```";
        let blocks = extract_js_import_code(markdown);
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].contains("import path from 'path'"));
        assert!(blocks[1].contains("require('fs')"));
    }

    #[test]
    fn test_require_only_blocks() {
        let markdown = "```js\nconst fs = require('fs');\n```\n\n```JavaScript\nconst path = require(\"path\");\n```";
        let blocks = extract_js_import_code(markdown);
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].contains("require('fs')"));
        assert!(blocks[1].contains("require(\"path\")"));
    }

    #[test]
    fn test_ignores_blocks_without_imports() {
        let markdown = "```js\nconsole.log('hi');\n```";
        assert!(extract_js_import_code(markdown).is_empty());
    }

    #[test]
    fn test_initial_code() {
        let readme = "Usage:\n\n```js\nimport containsEmoji from 'contains-emoji';\ncontainsEmoji('🦄');\n```";
        assert_eq!(
            initial_code("contains-emoji", Some(readme)),
            "import containsEmoji from 'contains-emoji';\ncontainsEmoji('🦄');"
        );
        assert_eq!(
            initial_code("left-pad", Some("no code here")),
            "import mod from 'left-pad';\nconsole.log(mod);"
        );
        assert_eq!(initial_code("left-pad", None), default_code("left-pad"));
    }

    #[test]
    fn test_package_url() {
        let registry = NpmRegistry::new("https://registry.npmjs.org").unwrap();
        assert_eq!(
            registry.package_url("@scope/pkg").unwrap().as_str(),
            "https://registry.npmjs.org/%40scope%2Fpkg"
        );

        let mirror = NpmRegistry::new("https://mirror.example/npm").unwrap();
        assert_eq!(
            mirror.package_url("left-pad").unwrap().as_str(),
            "https://mirror.example/npm/left-pad"
        );
    }
}
