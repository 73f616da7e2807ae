use dashmap::DashMap;
use keystone_core::KeystoneError;
use mlua::Lua;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// An immutable compiled script, shareable across interpreter instances.
#[derive(Debug)]
pub struct ScriptArtifact {
    pub name: String,
    pub source_path: PathBuf,
    pub bytecode: Vec<u8>,
}

/// Compile-once bytecode cache.
///
/// Holds a dedicated compile-only VM; the resulting bytecode is loaded into
/// every pooled interpreter. Source changes on disk after startup are not
/// observed.
pub struct ScriptCompiler {
    lua: Mutex<Lua>,
    cache: DashMap<String, Arc<ScriptArtifact>>,
}

impl ScriptCompiler {
    pub fn new() -> Self {
        Self {
            lua: Mutex::new(Lua::new()),
            cache: DashMap::new(),
        }
    }

    /// Compile `source` to bytecode and cache it under `name`. Repeated
    /// calls with a cached name return the existing artifact untouched.
    pub fn compile(
        &self,
        name: &str,
        source: &str,
        source_path: &Path,
    ) -> Result<Arc<ScriptArtifact>, KeystoneError> {
        if let Some(existing) = self.cache.get(name) {
            return Ok(Arc::clone(&existing));
        }

        let lua = self.lua.lock().expect("compiler VM lock poisoned");
        let func = lua
            .load(source)
            .set_name(format!("@{}", name))
            .into_function()
            .map_err(|e| KeystoneError::Compile {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        let bytecode = func.dump(true);
        drop(lua);

        let artifact = Arc::new(ScriptArtifact {
            name: name.to_string(),
            source_path: source_path.to_path_buf(),
            bytecode,
        });
        self.cache.insert(name.to_string(), Arc::clone(&artifact));
        debug!(script = name, "Compiled script");
        Ok(artifact)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<ScriptArtifact>> {
        self.cache.get(name).map(|a| Arc::clone(&a))
    }

    /// Compile every `*.lua` file in `dir` (file stem names the artifact),
    /// in lexicographic order so load order is deterministic.
    pub fn compile_dir(&self, dir: &Path) -> Result<Vec<Arc<ScriptArtifact>>, KeystoneError> {
        if !dir.is_dir() {
            return Err(KeystoneError::Config(format!(
                "scripts_dir '{}' is not a directory",
                dir.display()
            )));
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("lua"))
            .collect();
        paths.sort();

        let mut artifacts = Vec::with_capacity(paths.len());
        for path in paths {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let source = std::fs::read_to_string(&path)?;
            artifacts.push(self.compile(stem, &source, &path)?);
        }

        info!(count = artifacts.len(), dir = %dir.display(), "Compiled scripts");
        Ok(artifacts)
    }

    /// All cached artifacts, in name order.
    pub fn artifacts(&self) -> Vec<Arc<ScriptArtifact>> {
        let mut all: Vec<Arc<ScriptArtifact>> =
            self.cache.iter().map(|e| Arc::clone(e.value())).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

impl Default for ScriptCompiler {
    fn default() -> Self {
        Self::new()
    }
}
