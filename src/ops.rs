//! Ops backing the sandbox globals installed by `bootstrap.js`.
//!
//! The isolate never touches host state directly: its only way out is
//! `op_channel_post`, which pushes onto the run's [`RunSender`].

use std::time::Duration;

use deno_core::anyhow::{anyhow, Error};
use deno_core::{op2, OpState};
use tracing::{debug, warn};

use crate::channel::{Message, RunSender};

// ============================================================================
// Message Channel
// ============================================================================

/// `parent.postMessage(message)` inside the isolate.
#[op2]
fn op_channel_post(state: &mut OpState, #[serde] message: serde_json::Value) {
    match state.try_borrow::<RunSender>() {
        Some(sender) => {
            sender.send(Message::from_value(&message));
        }
        None => warn!("Sandbox posted a message without an attached channel"),
    }
}

/// Mirrors the sandbox's own console into host tracing.
#[op2(fast)]
fn op_sandbox_trace(state: &mut OpState, #[string] level: &str, #[string] msg: &str) {
    let run_id = state
        .try_borrow::<RunSender>()
        .map(|sender| sender.run_id().to_string())
        .unwrap_or_default();
    debug!(run_id = %run_id, sandbox_log = true, console_level = level, "{}", msg);
}

// ============================================================================
// Timers
// ============================================================================

#[op2(async)]
async fn op_timer_sleep(ms: f64) {
    let ms = if ms.is_finite() && ms > 0.0 { ms as u64 } else { 0 };
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

// ============================================================================
// Crypto Ops
// ============================================================================

#[op2]
#[string]
fn op_crypto_random_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[op2(fast)]
fn op_crypto_get_random_values(#[buffer] buf: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(buf);
}

#[op2]
#[buffer]
fn op_crypto_subtle_digest(#[string] algorithm: &str, #[buffer] data: &[u8]) -> Result<Vec<u8>, Error> {
    use sha2::{Digest, Sha256, Sha384, Sha512};

    let result = match algorithm.to_uppercase().replace('-', "").as_str() {
        "SHA256" => Sha256::digest(data).to_vec(),
        "SHA384" => Sha384::digest(data).to_vec(),
        "SHA512" => Sha512::digest(data).to_vec(),
        _ => {
            return Err(anyhow!(
                "Unsupported algorithm: {}. Supported: SHA-256, SHA-384, SHA-512",
                algorithm
            ))
        }
    };

    Ok(result)
}

// ============================================================================
// Encoding Ops
// ============================================================================

#[op2]
#[string]
fn op_btoa(#[string] data: &str) -> Result<String, Error> {
    use base64::Engine;
    // btoa expects Latin-1, but we'll be lenient and accept UTF-8
    Ok(base64::engine::general_purpose::STANDARD.encode(data.as_bytes()))
}

#[op2]
#[string]
fn op_atob(#[string] data: &str) -> Result<String, Error> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| anyhow!("Invalid base64: {}", e))?;
    String::from_utf8(bytes).map_err(|e| anyhow!("Invalid UTF-8 in decoded data: {}", e))
}

deno_core::extension!(
    npm_runner_sandbox,
    ops = [
        op_channel_post,
        op_sandbox_trace,
        op_timer_sleep,
        op_crypto_random_uuid,
        op_crypto_get_random_values,
        op_crypto_subtle_digest,
        op_btoa,
        op_atob,
    ],
    esm_entry_point = "ext:npm_runner_sandbox/bootstrap.js",
    esm = ["ext:npm_runner_sandbox/bootstrap.js" = "src/bootstrap.js"],
);
