//! Module loader that only fetches from allowed CDN origins.
//! Blocks the filesystem, plain http, data/blob URLs, and bare specifiers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use deno_core::{
    anyhow::{anyhow, Error},
    ModuleLoadResponse, ModuleLoader, ModuleSource, ModuleSourceCode, ModuleSpecifier,
    ModuleType, RequestedModuleType, ResolutionKind,
};
use reqwest::Client;
use tracing::debug;

/// Specifier the synthesized document is registered under.
pub const DOCUMENT_SPECIFIER: &str = "npm-runner://sandbox/document.js";

/// Redirect hops followed before giving up.
const MAX_REDIRECTS: usize = 10;

/// Module sources fetched so far, shared by every sandbox of a host.
///
/// Keyed by the requested URL; the value keeps the URL the source was
/// finally served from so relative imports keep resolving after redirects.
#[derive(Debug, Clone, Default)]
pub struct ModuleCache {
    entries: Arc<RwLock<HashMap<String, CachedModule>>>,
}

#[derive(Debug, Clone)]
struct CachedModule {
    served_from: String,
    code: String,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `code` as the source of `requested`, served from `served_from`.
    pub fn insert(&self, requested: &str, served_from: &str, code: impl Into<String>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                requested.to_string(),
                CachedModule {
                    served_from: served_from.to_string(),
                    code: code.into(),
                },
            );
        }
    }

    pub fn contains(&self, requested: &str) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(requested))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, requested: &str) -> Option<CachedModule> {
        self.entries.read().ok()?.get(requested).cloned()
    }
}

/// Builds a module source, recording a redirect when the URLs differ.
fn module_source(requested: &ModuleSpecifier, served_from: &ModuleSpecifier, code: String) -> ModuleSource {
    if served_from == requested {
        ModuleSource::new(
            ModuleType::JavaScript,
            ModuleSourceCode::String(code.into()),
            requested,
            None,
        )
    } else {
        ModuleSource::new_with_redirect(
            ModuleType::JavaScript,
            ModuleSourceCode::String(code.into()),
            requested,
            served_from,
            None,
        )
    }
}

/// Exact-origin allowlist for module URLs.
#[derive(Debug, Clone, Default)]
pub struct OriginAllowlist {
    /// Allowed origins (e.g., "https://esm.sh"): scheme + host + port.
    pub origins: Vec<String>,
}

impl OriginAllowlist {
    pub fn new(origins: Vec<String>) -> Self {
        Self { origins }
    }

    pub fn is_allowed(&self, url: &ModuleSpecifier) -> bool {
        if self.origins.is_empty() {
            return false;
        }
        let origin = url.origin().ascii_serialization();
        self.origins.iter().any(|allowed| origin == *allowed)
    }
}

/// A module loader that resolves `import()` calls to CDN URLs only.
///
/// Security guarantees:
/// - Only https URLs on an allowed origin are fetched
/// - Redirects are followed only within the same origin
/// - Relative imports inside CDN modules resolve against their referrer
/// - No filesystem access of any kind
pub struct CdnLoader {
    allowlist: OriginAllowlist,
    cache: ModuleCache,
    client: Client,
}

impl CdnLoader {
    pub fn new(allowlist: OriginAllowlist, cache: ModuleCache) -> Result<Self, Error> {
        let client = Client::builder()
            // Redirects are followed by hand so each hop can be checked
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("npm-runner/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            allowlist,
            cache,
            client,
        })
    }

    fn check_url(allowlist: &OriginAllowlist, url: &ModuleSpecifier) -> Result<(), Error> {
        if url.scheme() != "https" {
            return Err(anyhow!(
                "Only https module URLs are allowed, got: {}",
                url
            ));
        }
        if !allowlist.is_allowed(url) {
            return Err(anyhow!(
                "Import blocked: origin '{}' is not in the allowlist. Allowed: {:?}",
                url.origin().ascii_serialization(),
                allowlist.origins
            ));
        }
        Ok(())
    }
}

impl ModuleLoader for CdnLoader {
    fn resolve(
        &self,
        specifier: &str,
        referrer: &str,
        _kind: ResolutionKind,
    ) -> Result<ModuleSpecifier, Error> {
        if specifier == DOCUMENT_SPECIFIER {
            return ModuleSpecifier::parse(specifier)
                .map_err(|e| anyhow!("Invalid document specifier: {}", e));
        }

        let resolved = deno_core::resolve_import(specifier, referrer).map_err(|e| {
            anyhow!(
                "Cannot resolve '{}' from '{}': {}. Import packages by name with import/require statements.",
                specifier,
                referrer,
                e
            )
        })?;

        Self::check_url(&self.allowlist, &resolved)?;
        Ok(resolved)
    }

    fn load(
        &self,
        module_specifier: &ModuleSpecifier,
        _maybe_referrer: Option<&ModuleSpecifier>,
        _is_dyn_import: bool,
        _requested_module_type: RequestedModuleType,
    ) -> ModuleLoadResponse {
        let requested = module_specifier.clone();
        let allowlist = self.allowlist.clone();
        let client = self.client.clone();

        // Re-check even though resolve() already did
        if let Err(e) = Self::check_url(&allowlist, &requested) {
            return ModuleLoadResponse::Sync(Err(e));
        }

        if let Some(cached) = self.cache.get(requested.as_str()) {
            debug!(url = %requested, "Module served from cache");
            return ModuleLoadResponse::Sync(
                ModuleSpecifier::parse(&cached.served_from)
                    .map(|served_from| module_source(&requested, &served_from, cached.code))
                    .map_err(|e| anyhow!("Invalid cached module URL: {}", e)),
            );
        }
        let cache = self.cache.clone();

        ModuleLoadResponse::Async(Box::pin(async move {
            let mut url = requested.clone();

            for _ in 0..=MAX_REDIRECTS {
                debug!(url = %url, "Fetching module");
                let response = client
                    .get(url.clone())
                    .send()
                    .await
                    .map_err(|e| anyhow!("Failed to fetch '{}': {}", url, e))?;

                let status = response.status();

                if status.is_redirection() {
                    let location = response
                        .headers()
                        .get("location")
                        .ok_or_else(|| anyhow!("Redirect from '{}' without location", url))?
                        .to_str()
                        .map_err(|_| anyhow!("Invalid redirect location"))?;
                    let next = url
                        .join(location)
                        .map_err(|e| anyhow!("Invalid redirect URL: {}", e))?;

                    if next.origin() != url.origin() {
                        return Err(anyhow!(
                            "Import blocked: redirect to different origin '{}' (original: '{}')",
                            next.origin().ascii_serialization(),
                            url.origin().ascii_serialization()
                        ));
                    }
                    Self::check_url(&allowlist, &next)?;

                    url = next;
                    continue;
                }

                if !status.is_success() {
                    return Err(anyhow!(
                        "Failed to fetch '{}': HTTP {}",
                        url,
                        status.as_u16()
                    ));
                }

                let code = response
                    .text()
                    .await
                    .map_err(|e| anyhow!("Failed to read '{}': {}", url, e))?;

                cache.insert(requested.as_str(), url.as_str(), code.clone());
                return Ok(module_source(&requested, &url, code));
            }

            Err(anyhow!(
                "Too many redirects while fetching '{}'",
                requested
            ))
        }))
    }
}
