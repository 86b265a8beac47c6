/// `scripting/sandbox.rs` — isolated script environments over a runtime
///
/// A `Sandbox` gives scripts a private global scope: a child table whose
/// `_G` points back at itself, populated with filtered copies of the
/// standard libraries its preset allows. `print` is replaced with a sink
/// writer and `dofile`/`loadfile`/`require` with variants that only accept
/// files under whitelisted directories and refuse precompiled chunks.
///
/// Several sandboxes may share one `LuaRuntime`; they are isolated by
/// their environments but serialize on the underlying interpreter. A
/// sandbox failure never brings the runtime down.
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mlua::{FromLua, Function, IntoLua, Lua, MultiValue, Table, Value};
use serde::{Deserialize, Serialize};

use super::runtime::LuaRuntime;
use super::stdlib::{rules_for, LibRule, Preset, StdLib};
use super::watchdog::GuardedScope;
use crate::utils::enum_set::EnumSet;
use crate::utils::fs as fs_utils;

const PRINT_PREFIX: &str = "[lua sandbox]:> ";

/// First bytes of a precompiled chunk. Bytecode bypasses the source parser
/// and is unsafe against hostile input, so file loading refuses it.
const LUA_SIGNATURE: [u8; 4] = [0x1b, b'L', b'u', b'a'];

// ── Print sink ───────────────────────────────────────────────────────────────

/// One line produced by the sandboxed `print`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintEntry {
    pub message: String,
    pub timestamp: i64,
}

pub type PrintSink = Arc<Mutex<Vec<PrintEntry>>>;

// ── Sandbox ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct SandboxOptions {
    /// Base directory for relative script paths. Empty/absent disables
    /// file loading entirely.
    pub scripts_root: Option<PathBuf>,
    /// Additional whitelisted directories; relative entries resolve
    /// against the root. The root itself is always whitelisted.
    pub allowed_roots: Vec<PathBuf>,
    /// Receives sandboxed `print` output. A fresh sink is created when
    /// absent.
    pub print_sink: Option<PrintSink>,
}

pub struct Sandbox<'rt> {
    runtime: &'rt LuaRuntime,
    preset: Preset,
    env: RefCell<Table>,
    scripts_root: PathBuf,
    // Shared with the loader closures living inside the interpreter.
    allowed_roots: Arc<Mutex<Vec<PathBuf>>>,
    loaded: Arc<Mutex<EnumSet<StdLib>>>,
    print_sink: PrintSink,
}

impl<'rt> Sandbox<'rt> {
    pub fn new(runtime: &'rt LuaRuntime, preset: Preset) -> mlua::Result<Self> {
        Self::with_options(runtime, preset, SandboxOptions::default())
    }

    pub fn with_root(
        runtime: &'rt LuaRuntime,
        preset: Preset,
        scripts_root: impl Into<PathBuf>,
    ) -> mlua::Result<Self> {
        Self::with_options(
            runtime,
            preset,
            SandboxOptions {
                scripts_root: Some(scripts_root.into()),
                ..SandboxOptions::default()
            },
        )
    }

    pub fn with_options(
        runtime: &'rt LuaRuntime,
        preset: Preset,
        options: SandboxOptions,
    ) -> mlua::Result<Self> {
        let (scripts_root, allowed_roots) =
            resolve_script_paths(options.scripts_root, options.allowed_roots);
        let sandbox = Self {
            runtime,
            preset,
            env: RefCell::new(runtime.lua().create_table()?),
            scripts_root,
            allowed_roots: Arc::new(Mutex::new(allowed_roots)),
            loaded: Arc::new(Mutex::new(EnumSet::new())),
            print_sink: options.print_sink.unwrap_or_default(),
        };
        sandbox.reset(false)?;
        Ok(sandbox)
    }

    pub fn preset(&self) -> Preset {
        self.preset
    }

    pub fn print_sink(&self) -> PrintSink {
        Arc::clone(&self.print_sink)
    }

    /// The environment table scripts run in.
    pub fn environment(&self) -> Table {
        self.env.borrow().clone()
    }

    /// Reads a variable from the sandbox environment.
    pub fn get<T: FromLua>(&self, key: impl IntoLua) -> mlua::Result<T> {
        self.env.borrow().get(key)
    }

    /// Writes a variable into the sandbox environment.
    pub fn set(&self, key: impl IntoLua, value: impl IntoLua) -> mlua::Result<()> {
        self.env.borrow().set(key, value)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Rebuilds the environment from scratch: previously loaded libraries
    /// are reloaded (the preset's defaults on the first pass), the safe
    /// `print` and file loaders are reinstalled. Values scripts stored in
    /// the old environment are gone afterwards.
    pub fn reset(&self, collect_garbage: bool) -> mlua::Result<()> {
        self.release_loaders();

        let lua = self.runtime.lua();
        let env = lua.create_table()?;
        env.set("_G", env.clone())?;
        *self.env.borrow_mut() = env;

        let to_load: Vec<StdLib> = {
            let loaded = self.loaded.lock().unwrap();
            if loaded.is_empty() {
                self.preset.default_libs().to_vec()
            } else {
                loaded.iter().collect()
            }
        };
        for lib in to_load {
            self.load_lib(lib);
        }

        self.install_safe_print()?;
        self.install_file_loaders()?;

        if collect_garbage {
            lua.gc_collect()?;
        }
        Ok(())
    }

    // ── Libraries ─────────────────────────────────────────────────────────

    /// Loads a library into the sandbox, filtered by its rule. Denied for
    /// every preset except `Custom`; a library without a rule is denied in
    /// any preset.
    pub fn require(&self, lib: StdLib) -> bool {
        if !self.preset.allows_manual_load() {
            return false;
        }
        self.load_lib(lib)
    }

    pub fn is_loaded(&self, lib: StdLib) -> bool {
        self.loaded.lock().unwrap().contains(lib)
    }

    fn load_lib(&self, lib: StdLib) -> bool {
        let Some(rule) = rules_for(lib) else {
            return false;
        };
        if let Err(err) = self.runtime.require(lib) {
            log::error!("sandbox: cannot load library '{}': {err}", lib.name());
            return false;
        }
        let lua = self.runtime.lua();
        let env = self.env.borrow().clone();
        if let Err(err) = install_filtered_lib(&lua, &env, lib, rule) {
            log::error!("sandbox: cannot expose library '{}': {err}", lib.name());
            return false;
        }
        self.loaded.lock().unwrap().insert(lib);
        true
    }

    // ── Execution ─────────────────────────────────────────────────────────

    /// Runs `source` inside the sandbox environment.
    pub fn run(&self, source: &str) -> mlua::Result<MultiValue> {
        let lua = self.runtime.lua();
        let result = lua
            .load(source)
            .set_name("=sandbox")
            .set_environment(self.env.borrow().clone())
            .eval::<MultiValue>();
        if let Err(err) = &result {
            self.runtime.note_script_error(err);
        }
        result
    }

    /// Runs a script file inside the sandbox environment, subject to the
    /// same path policy as the script-visible `dofile`.
    pub fn run_file(&self, file: impl AsRef<Path>) -> mlua::Result<MultiValue> {
        let lua = self.runtime.lua();
        let env = self.env.borrow().clone();
        let allowed = self.allowed_roots.lock().unwrap().clone();
        let result = run_script_file(&lua, &env, &self.scripts_root, &allowed, file.as_ref());
        if let Err(err) = &result {
            self.runtime.note_script_error(err);
        }
        result
    }

    // ── Path policy ───────────────────────────────────────────────────────

    /// Whitelists another directory for script loading. Relative paths
    /// resolve against the scripts root. A no-op without a root or with
    /// empty input.
    pub fn allow_script_path(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        if self.scripts_root.as_os_str().is_empty() || path.as_os_str().is_empty() {
            return;
        }
        let path = if path.is_relative() {
            self.scripts_root.join(path)
        } else {
            path.to_path_buf()
        };
        self.allowed_roots
            .lock()
            .unwrap()
            .push(fs_utils::absolute_normalized(&path));
    }

    pub fn allowed_roots(&self) -> Vec<PathBuf> {
        self.allowed_roots.lock().unwrap().clone()
    }

    // ── Timeout guard ─────────────────────────────────────────────────────

    pub fn guarded_scope(&self, limit: Duration) -> GuardedScope<'rt> {
        self.runtime.guarded_scope(limit)
    }

    // ── Internals ─────────────────────────────────────────────────────────

    fn install_safe_print(&self) -> mlua::Result<()> {
        // Native tostring lives in base.
        self.runtime.require(StdLib::Base)?;

        let lua = self.runtime.lua();
        let env = self.env.borrow().clone();
        let sink = Arc::clone(&self.print_sink);
        let print = lua.create_function(move |lua, args: MultiValue| {
            let tostring: Function = lua.globals().get("tostring")?;
            let mut parts = Vec::with_capacity(args.len());
            for value in args {
                parts.push(tostring.call::<String>(value)?);
            }
            let message = format!("{PRINT_PREFIX}{}", parts.join(" "));
            log::info!("{message}");
            sink.lock().unwrap().push(PrintEntry {
                message,
                timestamp: chrono::Utc::now().timestamp(),
            });
            Ok(())
        })?;
        env.set("print", print)
    }

    fn install_file_loaders(&self) -> mlua::Result<()> {
        let lua = self.runtime.lua();
        let env = self.env.borrow().clone();

        let dofile = {
            let env = env.clone();
            let scripts_root = self.scripts_root.clone();
            let allowed = Arc::clone(&self.allowed_roots);
            lua.create_function(move |lua, file: Value| {
                let Value::String(ref name) = file else {
                    return Ok(MultiValue::from_vec(vec![Value::Nil]));
                };
                let name = name.to_str()?.to_string();
                let allowed = allowed.lock().unwrap().clone();
                run_script_file(lua, &env, &scripts_root, &allowed, Path::new(&name))
            })?
        };
        env.set("dofile", dofile)?;

        let loadfile = {
            let env = env.clone();
            let scripts_root = self.scripts_root.clone();
            let allowed = Arc::clone(&self.allowed_roots);
            lua.create_function(move |lua, file: Value| {
                let Value::String(ref name) = file else {
                    return Ok(Value::Nil);
                };
                let name = name.to_str()?.to_string();
                let allowed = allowed.lock().unwrap().clone();
                let function =
                    load_script_function(lua, &env, &scripts_root, &allowed, Path::new(&name))?;
                Ok(Value::Function(function))
            })?
        };
        env.set("loadfile", loadfile)?;

        let require = {
            let env = env.clone();
            let scripts_root = self.scripts_root.clone();
            let allowed = Arc::clone(&self.allowed_roots);
            let preset = self.preset;
            let sandbox_loaded = Arc::clone(&self.loaded);
            let runtime_loaded = self.runtime.loaded_handle();
            lua.create_function(move |lua, name: Value| {
                let Value::String(ref name) = name else {
                    return Ok(MultiValue::from_vec(vec![Value::Nil]));
                };
                let name = name.to_str()?.to_string();

                // Library names resolve to the filtered sandbox copy; a
                // denied or unknown name falls through to file loading.
                if let Some(lib) = StdLib::from_name(&name) {
                    if sandbox_loaded.lock().unwrap().contains(lib) {
                        let value: Value = env.get(lib.lookup_name())?;
                        return Ok(MultiValue::from_vec(vec![value]));
                    }
                    if preset.allows_manual_load() {
                        if let Some(rule) = rules_for(lib) {
                            ensure_runtime_lib(lua, &runtime_loaded, lib)?;
                            install_filtered_lib(lua, &env, lib, rule)?;
                            sandbox_loaded.lock().unwrap().insert(lib);
                            let value: Value = env.get(lib.lookup_name())?;
                            return Ok(MultiValue::from_vec(vec![value]));
                        }
                    }
                }

                let allowed = allowed.lock().unwrap().clone();
                run_script_file(lua, &env, &scripts_root, &allowed, Path::new(&name))
            })?
        };
        env.set("require", require)
    }

    /// The loader closures pin the environment they were installed into;
    /// dropping them from the table breaks the cycle so the interpreter
    /// can collect the old environment.
    fn release_loaders(&self) {
        let env = self.env.borrow();
        for name in ["print", "dofile", "loadfile", "require"] {
            let _ = env.set(name, Value::Nil);
        }
    }
}

impl Drop for Sandbox<'_> {
    fn drop(&mut self) {
        self.release_loaders();
    }
}

// ── Library filtering ────────────────────────────────────────────────────────

/// Copies the filtered slice of `lib` from the interpreter globals into
/// the environment. Base merges straight into the environment; any other
/// library lands in a fresh table under its own name.
fn install_filtered_lib(lua: &Lua, env: &Table, lib: StdLib, rule: LibRule) -> mlua::Result<()> {
    let source: Table = if lib == StdLib::Base {
        lua.globals()
    } else {
        match lua.globals().get::<Option<Table>>(lib.name())? {
            Some(table) => table,
            None => return Ok(()),
        }
    };

    let target: Table = if lib == StdLib::Base {
        env.clone()
    } else {
        let table = lua.create_table()?;
        env.set(lib.name(), table.clone())?;
        table
    };

    match rule {
        LibRule::Allowed(names) => {
            for name in names {
                let value: Value = source.get(*name)?;
                if !matches!(value, Value::Nil) {
                    target.set(*name, value)?;
                }
            }
        }
        LibRule::AllExcept(denied) => {
            for pair in source.pairs::<Value, Value>() {
                let (key, value) = pair?;
                target.set(key, value)?;
            }
            for name in denied {
                target.set(*name, Value::Nil)?;
            }
        }
    }
    Ok(())
}

/// Opens `lib` into the interpreter globals on behalf of a script-side
/// `require`, keeping the runtime's bookkeeping in step.
fn ensure_runtime_lib(
    lua: &Lua,
    runtime_loaded: &Mutex<EnumSet<StdLib>>,
    lib: StdLib,
) -> mlua::Result<()> {
    if runtime_loaded.lock().unwrap().contains(lib) {
        return Ok(());
    }
    if !lib.is_available() {
        return Err(mlua::Error::RuntimeError(format!(
            "Lua library '{}' is not available in this build",
            lib.name()
        )));
    }
    if let Some(flags) = lib.to_mlua() {
        lua.load_std_libs(flags)?;
    }
    runtime_loaded.lock().unwrap().insert(lib);
    Ok(())
}

// ── File loading ─────────────────────────────────────────────────────────────

fn resolve_script_paths(
    scripts_root: Option<PathBuf>,
    allowed: Vec<PathBuf>,
) -> (PathBuf, Vec<PathBuf>) {
    let scripts_root = match scripts_root {
        Some(root) if !root.as_os_str().is_empty() => fs_utils::absolute_normalized(&root),
        _ => PathBuf::new(),
    };

    let mut roots = Vec::new();
    if !scripts_root.as_os_str().is_empty() {
        roots.push(scripts_root.clone());
        for path in allowed {
            if path.as_os_str().is_empty() {
                continue;
            }
            let path = if path.is_relative() {
                scripts_root.join(path)
            } else {
                path
            };
            roots.push(fs_utils::absolute_normalized(&path));
        }
    }
    (scripts_root, roots)
}

fn resolve_script_file(scripts_root: &Path, file: &Path) -> PathBuf {
    let candidate = if file.is_relative() && !scripts_root.as_os_str().is_empty() {
        scripts_root.join(file)
    } else {
        file.to_path_buf()
    };
    fs_utils::absolute_normalized(&candidate)
}

/// True when the file begins with the interpreter's precompiled-chunk
/// signature. Unreadable or short files read as plain source.
pub fn is_bytecode(file: &Path) -> bool {
    use std::io::Read;

    let Ok(mut reader) = std::fs::File::open(file) else {
        return false;
    };
    let mut header = [0u8; LUA_SIGNATURE.len()];
    match reader.read_exact(&mut header) {
        Ok(()) => header == LUA_SIGNATURE,
        Err(_) => false,
    }
}

/// Applies the path policy and reads the file. Every rejection is logged
/// at error level and surfaces as a script error with the diagnostic.
fn load_script_source(
    scripts_root: &Path,
    allowed: &[PathBuf],
    file: &Path,
) -> mlua::Result<(PathBuf, String)> {
    let path = resolve_script_file(scripts_root, file);

    if !path.is_file() {
        return Err(policy_violation(format!(
            "script file does not exist: \"{}\"",
            path.display()
        )));
    }
    if !fs_utils::starts_with_any(&path, allowed) {
        return Err(policy_violation(format!(
            "script path is outside of the allowed directories: \"{}\"",
            path.display()
        )));
    }
    if is_bytecode(&path) {
        return Err(policy_violation(format!(
            "precompiled Lua chunks are not allowed: \"{}\"",
            path.display()
        )));
    }

    let source = std::fs::read_to_string(&path).map_err(|err| {
        policy_violation(format!(
            "failed to read script file \"{}\": {err}",
            path.display()
        ))
    })?;
    Ok((path, source))
}

fn policy_violation(message: String) -> mlua::Error {
    log::error!("{message}");
    mlua::Error::RuntimeError(message)
}

fn run_script_file(
    lua: &Lua,
    env: &Table,
    scripts_root: &Path,
    allowed: &[PathBuf],
    file: &Path,
) -> mlua::Result<MultiValue> {
    let (path, source) = load_script_source(scripts_root, allowed, file)?;
    lua.load(source)
        .set_name(format!("@{}", path.display()))
        .set_environment(env.clone())
        .eval()
}

fn load_script_function(
    lua: &Lua,
    env: &Table,
    scripts_root: &Path,
    allowed: &[PathBuf],
    file: &Path,
) -> mlua::Result<Function> {
    let (path, source) = load_script_source(scripts_root, allowed, file)?;
    lua.load(source)
        .set_name(format!("@{}", path.display()))
        .set_environment(env.clone())
        .into_function()
}
