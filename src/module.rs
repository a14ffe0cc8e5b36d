// File: src/module.rs
//
// Module loading for the Tmbdl VM. The VM treats the loader as opaque: the
// IMPORT opcode hands it a module key and pushes whatever exports map the
// loader returns. FileModuleLoader is the host implementation used by the
// CLI: it resolves keys against the importing module's directory, caches by
// canonical path, and runs each module's top-level chunk in a fresh VM.

use ahash::AHashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::builtins;
use crate::compiler::Compiler;
use crate::errors::{ErrorKind, SourceLocation, TmbdlError};
use crate::lexer::tokenize;
use crate::parser::Parser;
use crate::value::Value;
use crate::vm::Vm;

/// Canonical module key -> exports map
pub type ModuleCache = AHashMap<String, Value>;

/// The cache is shared between the importing VM and every nested module VM
/// so that cyclic imports terminate.
pub type SharedModuleCache = Arc<Mutex<ModuleCache>>;

pub fn new_module_cache() -> SharedModuleCache {
    Arc::new(Mutex::new(AHashMap::new()))
}

/// Host-supplied module loader. Must consult and update the cache to
/// terminate cycles; returns the exports map for the requested module.
pub trait ModuleLoader {
    fn load(
        self: Arc<Self>,
        key: &str,
        importer: Option<String>,
        cache: SharedModuleCache,
    ) -> Result<Value, TmbdlError>;
}

fn load_failure(message: String) -> TmbdlError {
    TmbdlError::new(ErrorKind::ModuleLoadFailure, message, SourceLocation::unknown())
}

/// Resolves `summon` keys against the filesystem
pub struct FileModuleLoader {
    root: PathBuf,
}

impl FileModuleLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a module key to a canonical absolute path. Relative keys are
    /// resolved against the importing module's directory when there is one,
    /// falling back to the loader's root. A missing extension defaults to
    /// `.tmbdl`.
    fn resolve(&self, key: &str, importer: Option<&str>) -> Result<PathBuf, TmbdlError> {
        let mut relative = PathBuf::from(key);
        if relative.extension().is_none() {
            relative.set_extension("tmbdl");
        }

        let base = importer
            .and_then(|path| Path::new(path).parent().map(Path::to_path_buf))
            .unwrap_or_else(|| self.root.clone());

        let candidate = if relative.is_absolute() { relative } else { base.join(relative) };
        candidate
            .canonicalize()
            .map_err(|_| load_failure(format!("Module not found: {}", key)))
    }
}

impl ModuleLoader for FileModuleLoader {
    fn load(
        self: Arc<Self>,
        key: &str,
        importer: Option<String>,
        cache: SharedModuleCache,
    ) -> Result<Value, TmbdlError> {
        let canonical = self.resolve(key, importer.as_deref())?;
        let cache_key = canonical.to_string_lossy().to_string();

        if let Some(exports) = cache.lock().unwrap().get(&cache_key) {
            return Ok(exports.clone());
        }

        // Seed the cache before running the module so that a cyclic import
        // sees this (possibly still empty) exports map instead of recursing.
        let exports = Value::empty_map();
        cache.lock().unwrap().insert(cache_key.clone(), exports.clone());

        let source = fs::read_to_string(&canonical)
            .map_err(|e| load_failure(format!("Failed to read module '{}': {}", key, e)))?;
        let tokens = tokenize(&source)
            .map_err(|e| load_failure(format!("Failed to load '{}': {}", key, e.message)))?;
        let ast = Parser::new(tokens)
            .parse()
            .map_err(|e| load_failure(format!("Failed to load '{}': {}", key, e.message)))?;
        let chunk = Compiler::new()
            .compile(&ast)
            .map_err(|e| load_failure(format!("Failed to load '{}': {}", key, e.message)))?;

        let mut vm = Vm::new();
        builtins::install(&mut vm);
        vm.set_module_loader(self.clone());
        vm.set_current_module(cache_key);
        vm.set_module_cache(cache);
        if let Value::Map(map) = &exports {
            vm.set_exports(map.clone());
        }
        vm.run(chunk)
            .map_err(|e| load_failure(format!("Error while running module '{}': {}", key, e.message)))?;

        Ok(exports)
    }
}
