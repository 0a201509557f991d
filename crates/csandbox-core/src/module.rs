//! Toolchain image loading.
//!
//! This module provides [`ToolchainImage`], the compiled Wasmtime [`Module`]
//! of a C compiler + runtime packaged as WebAssembly.
//!
//! # Image Locations
//!
//! - **Local path**: binary `.wasm`, text `.wat`, or a precompiled `.cwasm`
//! - **URL**: `http(s)://` locations are fetched with `reqwest`
//!
//! Every failure on this path is reported as
//! [`SandboxError::ToolchainUnavailable`].

use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::time::Instant;

use tracing::{debug, info, instrument};
use url::Url;
use wasmtime::{Engine, ExternType, Module};

use csandbox_common::SandboxError;

/// Functions every toolchain image must export.
pub const REQUIRED_EXPORTS: &[&str] = &[
    "malloc",
    "free",
    "cc_new",
    "cc_delete",
    "cc_add_option",
    "cc_compile_string",
    "cc_relocate",
    "cc_get_symbol",
    "cc_call",
];

/// Linear memory export name.
pub const MEMORY_EXPORT: &str = "memory";

/// A compiled toolchain image.
///
/// # Thread Safety
///
/// `ToolchainImage` is cheap to clone and can be shared by every session; each
/// session instantiates it into its own store.
#[derive(Clone)]
pub struct ToolchainImage {
    module: Module,

    /// Hash of the original image bytes.
    content_hash: String,

    /// Where the image came from (path or URL).
    source: String,

    compiled_at: Instant,
}

impl ToolchainImage {
    /// Load an image from a path or URL.
    ///
    /// Compilation runs on the blocking pool; large images take a while.
    ///
    /// # Errors
    ///
    /// Returns `ToolchainUnavailable` if the image cannot be fetched, read,
    /// compiled, or does not export the toolchain ABI.
    #[instrument(skip(engine))]
    pub async fn load(engine: &Engine, location: &str) -> Result<Self, SandboxError> {
        if let Some(url) = parse_remote(location) {
            let bytes = fetch(&url).await?;
            return Self::compile_blocking(engine, bytes, location.to_string(), false).await;
        }

        let path = Path::new(location);
        if path.extension().is_some_and(|ext| ext == "cwasm") {
            return Self::from_precompiled(engine, path);
        }

        let bytes = tokio::fs::read(path).await.map_err(|e| {
            SandboxError::toolchain_unavailable(format!(
                "Failed to read toolchain image {}: {e}",
                path.display()
            ))
        })?;
        let is_text = path.extension().is_some_and(|ext| ext == "wat");

        Self::compile_blocking(engine, bytes, location.to_string(), is_text).await
    }

    async fn compile_blocking(
        engine: &Engine,
        bytes: Vec<u8>,
        source: String,
        is_text: bool,
    ) -> Result<Self, SandboxError> {
        let engine = engine.clone();
        tokio::task::spawn_blocking(move || {
            if is_text {
                let wat = String::from_utf8(bytes).map_err(|_| {
                    SandboxError::toolchain_unavailable("Toolchain text image is not UTF-8")
                })?;
                Self::from_wat(&engine, &wat, source)
            } else {
                Self::from_bytes(&engine, &bytes, source)
            }
        })
        .await
        .map_err(|e| SandboxError::toolchain_unavailable(format!("Image compile task failed: {e}")))?
    }

    /// Compile an image from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid module or the module
    /// lacks the toolchain ABI exports.
    #[instrument(skip(engine, bytes, source), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(
        engine: &Engine,
        bytes: &[u8],
        source: impl Into<String>,
    ) -> Result<Self, SandboxError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        let module = Module::new(engine, bytes).map_err(|e| {
            SandboxError::toolchain_unavailable(format!("Toolchain image compilation failed: {e}"))
        })?;

        Self::finish(module, compute_hash(bytes), source.into(), start)
    }

    /// Compile an image from WAT (WebAssembly Text Format).
    ///
    /// Used for small hand-written toolchains, mostly in tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the text does not parse or lacks the ABI exports.
    #[instrument(skip(engine, wat, source))]
    pub fn from_wat(
        engine: &Engine,
        wat: &str,
        source: impl Into<String>,
    ) -> Result<Self, SandboxError> {
        let start = Instant::now();

        let module = Module::new(engine, wat).map_err(|e| {
            SandboxError::toolchain_unavailable(format!("WAT compilation failed: {e}"))
        })?;

        Self::finish(module, compute_hash(wat.as_bytes()), source.into(), start)
    }

    /// Load a precompiled image from disk.
    ///
    /// # Safety
    ///
    /// Deserializes machine code. Only load artifacts produced by the same
    /// Wasmtime version with matching engine settings.
    #[allow(unsafe_code)]
    #[instrument(skip(engine, path))]
    pub fn from_precompiled(engine: &Engine, path: &Path) -> Result<Self, SandboxError> {
        let start = Instant::now();

        // SAFETY: precompiled images are produced by our own deployment step
        let module = unsafe { Module::deserialize_file(engine, path) }.map_err(|e| {
            SandboxError::toolchain_unavailable(format!(
                "Failed to load precompiled image from {}: {e}",
                path.display()
            ))
        })?;

        let content_hash = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        Self::finish(module, content_hash, path.display().to_string(), start)
    }

    fn finish(
        module: Module,
        content_hash: String,
        source: String,
        start: Instant,
    ) -> Result<Self, SandboxError> {
        Self::validate_abi(&module)?;

        info!(
            source = %source,
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "Toolchain image compiled"
        );

        Ok(Self {
            module,
            content_hash,
            source,
            compiled_at: Instant::now(),
        })
    }

    /// Get the compiled module.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Get the content hash of the original image bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Get the location the image was loaded from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Get when this image was compiled.
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// Validate WebAssembly header (magic number).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), SandboxError> {
        if bytes.len() < 8 {
            return Err(SandboxError::toolchain_unavailable(
                "Invalid toolchain image: file too small",
            ));
        }

        // Check magic number: \0asm
        if &bytes[0..4] != b"\0asm" {
            return Err(SandboxError::toolchain_unavailable(
                "Invalid toolchain image: bad magic number",
            ));
        }

        Ok(())
    }

    /// Check that the module exports memory and every ABI function.
    fn validate_abi(module: &Module) -> Result<(), SandboxError> {
        let mut has_memory = false;
        let mut functions = Vec::new();

        for export in module.exports() {
            match export.ty() {
                ExternType::Memory(_) if export.name() == MEMORY_EXPORT => has_memory = true,
                ExternType::Func(_) => functions.push(export.name()),
                _ => {}
            }
        }

        if !has_memory {
            return Err(SandboxError::toolchain_unavailable(
                "Malformed toolchain image: no exported memory",
            ));
        }

        let missing: Vec<&str> = REQUIRED_EXPORTS
            .iter()
            .copied()
            .filter(|name| !functions.contains(name))
            .collect();

        if !missing.is_empty() {
            return Err(SandboxError::toolchain_unavailable(format!(
                "Malformed toolchain image: missing exports {}",
                missing.join(", ")
            )));
        }

        Ok(())
    }
}

impl std::fmt::Debug for ToolchainImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolchainImage")
            .field("source", &self.source)
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

/// Interpret `location` as a remote image URL.
fn parse_remote(location: &str) -> Option<Url> {
    Url::parse(location)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https"))
}

async fn fetch(url: &Url) -> Result<Vec<u8>, SandboxError> {
    debug!(url = %url, "Fetching toolchain image");

    let response = reqwest::get(url.clone())
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| {
            SandboxError::toolchain_unavailable(format!("Failed to fetch toolchain image: {e}"))
        })?;

    let bytes = response.bytes().await.map_err(|e| {
        SandboxError::toolchain_unavailable(format!("Failed to download toolchain image: {e}"))
    })?;

    Ok(bytes.to_vec())
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
