//! JSON-RPC method handlers
//!
//! Every handler receives the shared [`ServerState`] explicitly. Sealing,
//! opening and key-file access are blocking work and run on tokio's
//! blocking pool.
//!
//! A blocking task cannot be aborted, so a request that outlives its
//! timeout is cancelled cooperatively: the handler checks its
//! [`CancelFlag`] right before it writes a bundle, extracts files or
//! changes a key ring, and the response always reports what the handler
//! actually did.

use crate::config::Config;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sitebundle::packager::{encode, write_bundle};
use sitebundle::{
    BundleError, FileKeyStore, KeyStoreError, Packager, SiteIdentity, SiteTree, Verifier,
    FORMAT_VERSION,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const SERVER_ERROR: i32 = -32000;
pub const BUNDLE_ERROR: i32 = -32001;
pub const KEY_ERROR: i32 = -32002;

// --- Wire types ---
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Serialize, Debug)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Serialize, Debug)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub fn create_error_response(id: Value, code: i32, message: String) -> RpcResponse {
    error!("Responding with error: code={}, message={}", code, message);
    RpcResponse {
        jsonrpc: "2.0".to_string(),
        id,
        result: None,
        error: Some(RpcError {
            code,
            message,
            data: None,
        }),
    }
}

pub fn create_success_response(id: Value, result: Value) -> RpcResponse {
    RpcResponse {
        jsonrpc: "2.0".to_string(),
        id,
        result: Some(result),
        error: None,
    }
}

// --- Parameters ---
#[derive(Deserialize, Debug)]
struct SealParams {
    site_identity: String,
    /// Path to base64 contents
    files: Option<BTreeMap<String, String>>,
    source_dir: Option<PathBuf>,
    output: Option<PathBuf>,
    index: Option<String>,
}

/// A bundle given inline (base64) or by file path
#[derive(Deserialize, Debug)]
struct BundleSource {
    bundle: Option<String>,
    path: Option<PathBuf>,
}

#[derive(Deserialize, Debug)]
struct OpenParams {
    #[serde(flatten)]
    source: BundleSource,
    expect_identity: Option<String>,
    output_dir: Option<PathBuf>,
}

#[derive(Deserialize, Debug)]
struct KeyParams {
    site_identity: String,
}

#[derive(Debug, Error)]
enum MethodError {
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    Key(#[from] KeyStoreError),
    #[error("Request timed out before any change was committed")]
    TimedOut,
    #[error("{0}")]
    Internal(String),
}

impl MethodError {
    fn into_rpc_error(self) -> RpcError {
        let message = self.to_string();
        let (code, data) = match &self {
            MethodError::InvalidParams(_) => (INVALID_PARAMS, None),
            MethodError::Bundle(e) => (
                BUNDLE_ERROR,
                Some(json!({
                    "kind": bundle_error_kind(e),
                    "refetch": e.should_refetch(),
                    "suggestion": e.suggestion(),
                })),
            ),
            MethodError::Key(e) => (
                KEY_ERROR,
                Some(json!({
                    "kind": match e {
                        KeyStoreError::NotFound { .. } => "KeyNotFound",
                        KeyStoreError::Unavailable(_) => "KeyStoreUnavailable",
                        KeyStoreError::VersionExists { .. } => "KeyVersionExists",
                    }
                })),
            ),
            MethodError::TimedOut | MethodError::Internal(_) => (SERVER_ERROR, None),
        };
        RpcError {
            code,
            message,
            data,
        }
    }
}

fn bundle_error_kind(e: &BundleError) -> &'static str {
    match e {
        BundleError::MalformedBundle(_) => "MalformedBundle",
        BundleError::UnsupportedVersion { .. } => "UnsupportedVersion",
        BundleError::IdentityMismatch { .. } => "IdentityMismatch",
        BundleError::KeyNotFound { .. } => "KeyNotFound",
        BundleError::KeyStoreUnavailable(_) => "KeyStoreUnavailable",
        BundleError::TamperDetected(_) => "TamperDetected",
        BundleError::PackagingFailed(_) => "PackagingFailed",
    }
}

fn invalid(message: impl Into<String>) -> MethodError {
    MethodError::InvalidParams(message.into())
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, MethodError> {
    serde_json::from_value(params).map_err(|e| invalid(e.to_string()))
}

fn parse_identity(raw: &str) -> Result<SiteIdentity, MethodError> {
    SiteIdentity::new(raw).map_err(|e| invalid(format!("site_identity: {}", e)))
}

impl BundleSource {
    fn read(&self) -> Result<Vec<u8>, MethodError> {
        match (&self.bundle, &self.path) {
            (Some(encoded), None) => BASE64
                .decode(encoded)
                .map_err(|e| invalid(format!("bundle is not valid base64: {}", e))),
            (None, Some(path)) => std::fs::read(path).map_err(|e| {
                MethodError::Internal(format!("cannot read {}: {}", path.display(), e))
            }),
            _ => Err(invalid("exactly one of 'bundle' or 'path' is required")),
        }
    }
}

// --- State ---
pub struct ServerState {
    keys: FileKeyStore,
    workers: usize,
    request_timeout: Duration,
}

impl ServerState {
    pub fn new(config: &Config) -> Self {
        Self {
            keys: FileKeyStore::new(&config.keystore_dir),
            workers: config.workers,
            request_timeout: config.request_timeout,
        }
    }
}

/// Raised once a request has outlived its timeout
#[derive(Clone, Default, Debug)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Call right before committing anything outside the process
    fn check(&self) -> Result<(), MethodError> {
        if self.0.load(Ordering::SeqCst) {
            Err(MethodError::TimedOut)
        } else {
            Ok(())
        }
    }
}

type Handler = fn(&ServerState, Value, &CancelFlag) -> Result<Value, MethodError>;

fn blocking_handler(method: &str) -> Option<Handler> {
    let handler: Handler = match method {
        "bundle_seal" => bundle_seal,
        "bundle_open" => bundle_open,
        "bundle_inspect" => bundle_inspect,
        "key_generate" => key_generate,
        "key_rotate" => key_rotate,
        "key_list" => key_list,
        _ => return None,
    };
    Some(handler)
}

// --- Request processor ---
pub async fn process_request(state: Arc<ServerState>, req: RpcRequest) -> RpcResponse {
    debug!("Processing request: {:?}", req);

    if req.jsonrpc != "2.0" {
        return create_error_response(
            req.id,
            INVALID_REQUEST,
            "Invalid Request: jsonrpc must be \"2.0\"".to_string(),
        );
    }

    let RpcRequest {
        id, method, params, ..
    } = req;

    let result = match method.as_str() {
        "help" => Ok(help()),
        "status" => Ok(status(&state)),
        other => match blocking_handler(other) {
            Some(handler) => run_blocking(state, &method, handler, params).await,
            None => {
                return create_error_response(
                    id,
                    METHOD_NOT_FOUND,
                    format!("Method not found: {}", method),
                )
            }
        },
    };

    match result {
        Ok(value) => create_success_response(id, value),
        Err(e) => {
            let rpc_error = e.into_rpc_error();
            error!(
                "Method '{}' failed: code={}, message={}",
                method, rpc_error.code, rpc_error.message
            );
            RpcResponse {
                jsonrpc: "2.0".to_string(),
                id,
                result: None,
                error: Some(rpc_error),
            }
        }
    }
}

/// Run `handler` on the blocking pool under the request timeout
///
/// On timeout the handler is told to stop and is still awaited, so the
/// result returned is the one the handler produced.
async fn run_blocking(
    state: Arc<ServerState>,
    method: &str,
    handler: Handler,
    params: Value,
) -> Result<Value, MethodError> {
    let timeout = state.request_timeout;
    let cancel = CancelFlag::default();
    let worker_cancel = cancel.clone();
    let mut task = tokio::task::spawn_blocking(move || handler(&state, params, &worker_cancel));

    let joined = match tokio::time::timeout(timeout, &mut task).await {
        Ok(joined) => joined,
        Err(_) => {
            warn!(
                "Method '{}' exceeded {:?}; waiting for it to stop",
                method, timeout
            );
            cancel.cancel();
            task.await
        }
    };
    match joined {
        Ok(result) => result,
        Err(e) => Err(MethodError::Internal(format!("worker failed: {}", e))),
    }
}

fn help() -> Value {
    json!({
        "message": "Site bundle server: seal, open and inspect site bundles and manage site keys.",
        "commands": {
            "help": { "description": "Displays this help message." },
            "status": { "description": "Reports server version, format version and key store location." },
            "bundle_seal": {
                "description": "Seals a site under its active key.",
                "params": "site_identity, files {path: base64} | source_dir + output, index?"
            },
            "bundle_open": {
                "description": "Verifies and decrypts a bundle.",
                "params": "bundle (base64) | path, expect_identity?, output_dir?"
            },
            "bundle_inspect": {
                "description": "Reads bundle metadata without decrypting.",
                "params": "bundle (base64) | path"
            },
            "key_generate": { "description": "Creates a site key (or a new version).", "params": "site_identity" },
            "key_rotate": { "description": "Advances the active key of an existing site.", "params": "site_identity" },
            "key_list": { "description": "Lists key versions of a site.", "params": "site_identity" }
        }
    })
}

fn status(state: &ServerState) -> Value {
    json!({
        "status": "ready",
        "version": env!("CARGO_PKG_VERSION"),
        "formatVersion": FORMAT_VERSION,
        "keystore": state.keys.dir().display().to_string(),
        "keystoreAvailable": state.keys.dir().is_dir(),
        "workers": state.workers,
    })
}

fn bundle_seal(
    state: &ServerState,
    params: Value,
    cancel: &CancelFlag,
) -> Result<Value, MethodError> {
    let p: SealParams = parse_params(params)?;
    let identity = parse_identity(&p.site_identity)?;

    let mut packager = Packager::new(&state.keys).parallelism(state.workers);
    if let Some(index) = p.index {
        packager = packager.index(index);
    }

    match (p.files, p.source_dir, p.output) {
        (Some(files), None, None) => {
            let mut tree = SiteTree::new();
            for (path, encoded) in files {
                let data = BASE64
                    .decode(&encoded)
                    .map_err(|e| invalid(format!("file '{}' is not valid base64: {}", path, e)))?;
                tree.insert(&path, data).map_err(|e| invalid(e.to_string()))?;
            }
            let bundle = packager.seal(&tree, &identity)?;
            let bytes = encode(&bundle)?;
            let info = bundle.describe(&bytes);
            info!(site = %identity, content_id = %info.content_id, "Sealed bundle over RPC");
            Ok(json!({
                "info": info,
                "bundle": BASE64.encode(&bytes),
            }))
        }
        (None, Some(source_dir), Some(output)) => {
            let tree = SiteTree::from_dir(&source_dir)
                .map_err(|e| BundleError::PackagingFailed(e.to_string()))?;
            let bundle = packager.seal(&tree, &identity)?;
            let bytes = encode(&bundle)?;
            cancel.check()?;
            write_bundle(&bytes, &output)?;
            let info = bundle.describe(&bytes);
            Ok(json!({
                "info": info,
                "output": output.display().to_string(),
            }))
        }
        _ => Err(invalid(
            "provide either 'files', or 'source_dir' together with 'output'",
        )),
    }
}

fn bundle_open(
    state: &ServerState,
    params: Value,
    cancel: &CancelFlag,
) -> Result<Value, MethodError> {
    let p: OpenParams = parse_params(params)?;
    let bytes = p.source.read()?;

    let mut verifier = Verifier::new(&state.keys).parallelism(state.workers);
    if let Some(expected) = &p.expect_identity {
        verifier = verifier.expect_identity(parse_identity(expected)?);
    }
    let tree = verifier.open(&bytes)?;

    if let Some(dir) = &p.output_dir {
        cancel.check()?;
        tree.write_to_dir(dir).map_err(|e| {
            MethodError::Internal(format!("cannot extract to {}: {}", dir.display(), e))
        })?;
    }

    let files: Vec<Value> = tree
        .iter()
        .map(|file| {
            let mut entry = json!({
                "path": file.path,
                "size": file.contents.len(),
                "mimeType": file.mime_type,
                "hash": file.hash,
            });
            // Inline contents only when nothing was written to disk
            if p.output_dir.is_none() {
                entry["data"] = json!(BASE64.encode(&file.contents));
            }
            entry
        })
        .collect();

    Ok(json!({
        "index": tree.index_path(),
        "fileCount": tree.len(),
        "files": files,
    }))
}

fn bundle_inspect(
    _state: &ServerState,
    params: Value,
    _cancel: &CancelFlag,
) -> Result<Value, MethodError> {
    let source: BundleSource = parse_params(params)?;
    let info = Verifier::inspect(&source.read()?)?;
    serde_json::to_value(info).map_err(|e| MethodError::Internal(e.to_string()))
}

fn key_generate(
    state: &ServerState,
    params: Value,
    cancel: &CancelFlag,
) -> Result<Value, MethodError> {
    let p: KeyParams = parse_params(params)?;
    let identity = parse_identity(&p.site_identity)?;
    cancel.check()?;
    let version = state.keys.generate(&identity)?;
    Ok(json!({ "siteIdentity": identity, "version": version }))
}

fn key_rotate(
    state: &ServerState,
    params: Value,
    cancel: &CancelFlag,
) -> Result<Value, MethodError> {
    let p: KeyParams = parse_params(params)?;
    let identity = parse_identity(&p.site_identity)?;
    cancel.check()?;
    let version = state.keys.rotate(&identity)?;
    Ok(json!({ "siteIdentity": identity, "version": version }))
}

fn key_list(
    state: &ServerState,
    params: Value,
    _cancel: &CancelFlag,
) -> Result<Value, MethodError> {
    let p: KeyParams = parse_params(params)?;
    let identity = parse_identity(&p.site_identity)?;
    let (active, versions) = state.keys.versions(&identity)?;
    Ok(json!({
        "siteIdentity": identity,
        "active": active,
        "versions": versions,
    }))
}
