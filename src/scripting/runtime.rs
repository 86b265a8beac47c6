/// `scripting/runtime.rs` — owner of one interpreter instance
///
/// `LuaRuntime` bundles the interpreter with its memory accounting and its
/// timeout watchdog. Libraries are opened here, into the interpreter
/// globals; whether a sandbox exposes them is a separate decision made by
/// the sandbox's filter rules.
use std::cell::RefCell;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mlua::{Lua, LuaOptions, MultiValue, Table};

use super::memory::AllocState;
use super::stdlib::StdLib;
use super::watchdog::{GuardedScope, Watchdog};
use crate::utils::enum_set::EnumSet;

pub struct LuaRuntime {
    lua: RefCell<Lua>,
    alloc: RefCell<Option<AllocState>>,
    // Shared with sandbox-installed Lua callbacks, which must own their
    // captures.
    loaded: Arc<Mutex<EnumSet<StdLib>>>,
    watchdog: Watchdog,
}

impl LuaRuntime {
    /// A runtime on the system allocator, without a memory budget.
    pub fn new() -> mlua::Result<Self> {
        Self::build(None)
    }

    /// A runtime whose interpreter heap may not exceed `limit` bytes.
    /// Scripts observe allocation failures once the budget is exhausted.
    pub fn with_memory_limit(limit: usize) -> mlua::Result<Self> {
        Self::build(Some(limit))
    }

    fn build(limit: Option<usize>) -> mlua::Result<Self> {
        let lua = Self::fresh_state(limit)?;
        let alloc = limit.map(|limit| {
            let mut state = AllocState::with_limit(limit);
            state.used = lua.used_memory();
            state
        });
        let watchdog = Watchdog::new(&lua);
        Ok(Self {
            lua: RefCell::new(lua),
            alloc: RefCell::new(alloc),
            loaded: Arc::new(Mutex::new(EnumSet::new())),
            watchdog,
        })
    }

    fn fresh_state(limit: Option<usize>) -> mlua::Result<Lua> {
        // Bare state: only the base library, everything else goes through
        // `require`.
        let lua = Lua::new_with(mlua::StdLib::NONE, LuaOptions::default())?;
        if let Some(limit) = limit {
            lua.set_memory_limit(limit)?;
        }
        Ok(lua)
    }

    /// A handle to the interpreter. Cheap to clone; all handles address the
    /// same state.
    pub fn lua(&self) -> Lua {
        self.lua.borrow().clone()
    }

    pub fn globals(&self) -> Table {
        self.lua.borrow().globals()
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub(crate) fn loaded_handle(&self) -> Arc<Mutex<EnumSet<StdLib>>> {
        Arc::clone(&self.loaded)
    }

    // ── Libraries ─────────────────────────────────────────────────────────

    /// Opens `lib` into the interpreter globals and records it. Idempotent.
    /// Any library may be loaded at this level; filtering is sandbox
    /// business. Libraries this Lua build does not ship report an error.
    pub fn require(&self, lib: StdLib) -> mlua::Result<()> {
        if self.loaded.lock().unwrap().contains(lib) {
            return Ok(());
        }
        if !lib.is_available() {
            return Err(mlua::Error::RuntimeError(format!(
                "Lua library '{}' is not available in this build",
                lib.name()
            )));
        }
        self.open_lib(lib)?;
        self.loaded.lock().unwrap().insert(lib);
        Ok(())
    }

    pub fn is_loaded(&self, lib: StdLib) -> bool {
        self.loaded.lock().unwrap().contains(lib)
    }

    fn open_lib(&self, lib: StdLib) -> mlua::Result<()> {
        if let Some(flags) = lib.to_mlua() {
            self.lua.borrow().load_std_libs(flags)?;
        }
        // Base has no flag: the binding keeps it open in every state.
        Ok(())
    }

    // ── Execution ─────────────────────────────────────────────────────────

    /// Runs `source` directly in the interpreter globals, outside any
    /// sandbox.
    pub fn run(&self, source: &str) -> mlua::Result<MultiValue> {
        let lua = self.lua();
        let result = lua.load(source).set_name("=runtime").eval::<MultiValue>();
        if let Err(err) = &result {
            self.note_script_error(err);
        }
        result
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Rebuilds the interpreter in place: same memory limit, same set of
    /// loaded libraries, watchdog re-attached. Accounting is re-synced to
    /// the fresh state so it stays continuous. Sandboxes over this runtime
    /// must be reset afterwards.
    pub fn reset(&self) -> mlua::Result<()> {
        let limit = self.alloc.borrow().as_ref().map(|state| state.limit);
        let fresh = Self::fresh_state(limit)?;
        self.watchdog.attach(&fresh, true);
        *self.lua.borrow_mut() = fresh;

        let loaded: Vec<StdLib> = self.loaded.lock().unwrap().iter().collect();
        for lib in loaded {
            self.open_lib(lib)?;
        }

        if let Some(state) = self.alloc.borrow_mut().as_mut() {
            state.used = self.lua.borrow().used_memory();
        }
        Ok(())
    }

    // ── Memory accounting ─────────────────────────────────────────────────

    /// Replaces the byte budget. Only effective when the runtime was built
    /// with a memory limit.
    pub fn set_memory_limit(&self, limit: usize) -> bool {
        let mut alloc = self.alloc.borrow_mut();
        let Some(state) = alloc.as_mut() else {
            return false;
        };
        state.limit = limit;
        self.lua.borrow().set_memory_limit(limit).is_ok()
    }

    /// Snapshot of the accounting record, with `used` synced from the
    /// interpreter. `None` when the runtime runs unbounded.
    pub fn alloc_state(&self) -> Option<AllocState> {
        let mut alloc = self.alloc.borrow_mut();
        let state = alloc.as_mut()?;
        state.used = self.lua.borrow().used_memory();
        Some(state.clone())
    }

    pub fn reset_alloc_error_flags(&self) {
        if let Some(state) = self.alloc.borrow_mut().as_mut() {
            state.reset_error_flags();
        }
    }

    pub fn memory_used(&self) -> usize {
        self.lua.borrow().used_memory()
    }

    /// Folds a script failure into the accounting flags: running out of the
    /// budget shows up as `limit_reached` for host introspection.
    pub(crate) fn note_script_error(&self, err: &mlua::Error) {
        if is_memory_error(err) {
            if let Some(state) = self.alloc.borrow_mut().as_mut() {
                state.limit_reached = true;
            }
        }
    }

    // ── Timeout guard ─────────────────────────────────────────────────────

    /// Arms the owned watchdog for the lifetime of the returned scope.
    pub fn guarded_scope(&self, limit: Duration) -> GuardedScope<'_> {
        GuardedScope::new(&self.watchdog, limit)
    }
}

fn is_memory_error(err: &mlua::Error) -> bool {
    match err {
        mlua::Error::MemoryError(_) => true,
        mlua::Error::CallbackError { cause, .. } => is_memory_error(cause),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::memory::ONE_MIB;

    fn error_contains(err: &mlua::Error, needle: &str) -> bool {
        let mut current = Some(err);
        while let Some(e) = current {
            if e.to_string().contains(needle) {
                return true;
            }
            current = match e {
                mlua::Error::CallbackError { cause, .. } => Some(cause.as_ref()),
                _ => None,
            };
        }
        false
    }

    #[test]
    fn require_loads_a_library_into_the_globals() {
        let runtime = LuaRuntime::new().unwrap();

        let before: mlua::Value = runtime.globals().get("string").unwrap();
        assert!(matches!(before, mlua::Value::Nil));

        runtime.require(StdLib::String).unwrap();

        let after: mlua::Value = runtime.globals().get("string").unwrap();
        assert!(matches!(after, mlua::Value::Table(_)));
        assert!(runtime.is_loaded(StdLib::String));
    }

    #[test]
    fn require_is_idempotent() {
        let runtime = LuaRuntime::new().unwrap();
        runtime.require(StdLib::Table).unwrap();
        runtime.require(StdLib::Table).unwrap();
        assert!(runtime.is_loaded(StdLib::Table));
    }

    #[test]
    fn require_accepts_libraries_without_sandbox_rules() {
        let runtime = LuaRuntime::new().unwrap();
        runtime.require(StdLib::Io).unwrap();
        runtime.require(StdLib::Package).unwrap();

        let io: mlua::Value = runtime.globals().get("io").unwrap();
        assert!(matches!(io, mlua::Value::Table(_)));
        let package: mlua::Value = runtime.globals().get("package").unwrap();
        assert!(matches!(package, mlua::Value::Table(_)));
    }

    #[test]
    fn require_reports_libraries_this_build_lacks() {
        let runtime = LuaRuntime::new().unwrap();
        assert!(runtime.require(StdLib::Ffi).is_err());
        assert!(runtime.require(StdLib::Bit32).is_err());
        assert!(!runtime.is_loaded(StdLib::Ffi));
    }

    #[test]
    fn run_executes_in_the_globals() {
        let runtime = LuaRuntime::new().unwrap();
        runtime.globals().set("x", 321).unwrap();

        let result = runtime.run("return x * 2").unwrap();
        let value: i64 = result.into_iter().next().unwrap().as_i64().unwrap();
        assert_eq!(value, 642);
    }

    #[test]
    fn reset_replays_loaded_libraries() {
        let runtime = LuaRuntime::new().unwrap();
        runtime.require(StdLib::String).unwrap();
        runtime.globals().set("leftover", 1).unwrap();

        runtime.reset().unwrap();

        let leftover: mlua::Value = runtime.globals().get("leftover").unwrap();
        assert!(matches!(leftover, mlua::Value::Nil));

        let string_lib: mlua::Value = runtime.globals().get("string").unwrap();
        assert!(matches!(string_lib, mlua::Value::Table(_)));
        assert!(runtime.is_loaded(StdLib::String));
    }

    #[test]
    fn memory_limit_stops_a_runaway_script() {
        let runtime = LuaRuntime::with_memory_limit(ONE_MIB).unwrap();
        runtime.require(StdLib::Table).unwrap();

        let baseline = runtime.alloc_state().unwrap();
        assert!(!baseline.limit_reached);
        assert_eq!(baseline.limit, ONE_MIB);

        let result = runtime.run(
            "placeHolder = {}\nwhile true do table.insert(placeHolder, 0xFFFF) end",
        );
        assert!(result.is_err());

        let state = runtime.alloc_state().unwrap();
        assert!(state.limit_reached);

        runtime.reset().unwrap();
        let after_reset = runtime.alloc_state().unwrap();
        assert_eq!(after_reset.used, baseline.used);
        assert_eq!(after_reset.limit, ONE_MIB);
    }

    #[test]
    fn alloc_state_is_absent_without_a_limit() {
        let runtime = LuaRuntime::new().unwrap();
        assert!(runtime.alloc_state().is_none());
        assert!(!runtime.set_memory_limit(1024));
    }

    #[test]
    fn set_memory_limit_replaces_the_budget() {
        let runtime = LuaRuntime::with_memory_limit(ONE_MIB).unwrap();
        assert!(runtime.set_memory_limit(4 * ONE_MIB));
        assert_eq!(runtime.alloc_state().unwrap().limit, 4 * ONE_MIB);
    }

    #[test]
    fn reset_alloc_error_flags_clears_the_stickies() {
        let runtime = LuaRuntime::with_memory_limit(ONE_MIB).unwrap();
        runtime.require(StdLib::Table).unwrap();
        let _ = runtime.run("t = {}\nwhile true do table.insert(t, 1) end");
        assert!(runtime.alloc_state().unwrap().limit_reached);

        runtime.reset_alloc_error_flags();
        assert!(!runtime.alloc_state().unwrap().limit_reached);
    }

    #[test]
    fn guarded_scope_interrupts_a_runaway_script() {
        let runtime = LuaRuntime::new().unwrap();

        {
            let scope = runtime.guarded_scope(Duration::from_millis(5));
            assert!(scope.is_enabled());

            let err = runtime
                .run("while true do end")
                .expect_err("the watchdog must interrupt the loop");
            assert!(error_contains(&err, "Script timed out"), "got: {err}");
        }
        assert!(!runtime.watchdog().armed());
    }

    #[test]
    fn reset_reattaches_the_watchdog() {
        let runtime = LuaRuntime::new().unwrap();
        runtime.reset().unwrap();

        let scope = runtime.guarded_scope(Duration::from_millis(5));
        assert!(scope.is_enabled());
        let result = runtime.run("while true do end");
        assert!(result.is_err());
    }
}
