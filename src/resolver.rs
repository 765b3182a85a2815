//! CDN endpoints used to resolve package names to importable module URLs.
//!
//! Endpoints are tried in order. Each one is a URL template containing the
//! `{package}` placeholder, which is replaced by the percent-encoded package
//! name.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use url::Url;

/// `encodeURIComponent` minus `'`.
const PACKAGE_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'!')
    .remove(b'*')
    .remove(b'(')
    .remove(b')');

/// Placeholder substituted with the encoded package name.
pub const PACKAGE_PLACEHOLDER: &str = "{package}";

/// One CDN a package can be imported from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdnEndpoint {
    /// Short name used in diagnostics.
    pub name: String,
    /// URL template, e.g. `https://esm.sh/{package}@latest?bundle=true`.
    pub template: String,
}

impl CdnEndpoint {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
        }
    }

    /// Module URL for `package` on this endpoint.
    pub fn url_for(&self, package: &str) -> String {
        self.template
            .replace(PACKAGE_PLACEHOLDER, &encode_package(package))
    }

    /// ASCII origin (`scheme://host[:port]`) of this endpoint.
    pub fn origin(&self) -> Result<String, url::ParseError> {
        let url = Url::parse(&self.url_for("probe"))?;
        Ok(url.origin().ascii_serialization())
    }

    /// Checks that the template is an https URL carrying the placeholder.
    pub fn validate(&self) -> Result<(), String> {
        if !self.template.contains(PACKAGE_PLACEHOLDER) {
            return Err(format!(
                "resolver '{}' template is missing the {} placeholder",
                self.name, PACKAGE_PLACEHOLDER
            ));
        }
        let url = Url::parse(&self.url_for("probe"))
            .map_err(|e| format!("resolver '{}' template is not a URL: {}", self.name, e))?;
        if url.scheme() != "https" {
            return Err(format!(
                "resolver '{}' must use https, got '{}'",
                self.name,
                url.scheme()
            ));
        }
        Ok(())
    }
}

/// Skypack first, esm.sh ("latest, bundled") second.
pub fn default_endpoints() -> Vec<CdnEndpoint> {
    vec![
        CdnEndpoint::new("skypack", "https://cdn.skypack.dev/{package}"),
        CdnEndpoint::new("esm.sh", "https://esm.sh/{package}@latest?bundle=true"),
    ]
}

/// Percent-encodes a package name for use as a single URL path segment.
///
/// Everything outside `A-Z a-z 0-9 - _ . ~ ! * ( )` is encoded, so the `@`
/// and `/` of scoped packages are encoded too, and so is `'`, which keeps the
/// result safe inside generated string literals.
pub fn encode_package(name: &str) -> String {
    utf8_percent_encode(name, PACKAGE_SEGMENT).to_string()
}
