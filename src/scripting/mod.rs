/// `scripting/` — the Lua script sandbox core
///
/// A `LuaRuntime` owns one interpreter instance together with its memory
/// accounting and timeout watchdog. Any number of `Sandbox`es can sit on
/// top of one runtime; each gets an isolated environment that exposes only
/// a filtered slice of the standard libraries and replaces file loading
/// and `print` with safe variants. Script errors are caught and reported —
/// they never crash the engine.
pub mod memory;
pub mod registry;
pub mod runtime;
pub mod sandbox;
pub mod stdlib;
pub mod watchdog;

pub use memory::AllocState;
pub use runtime::LuaRuntime;
pub use sandbox::{PrintEntry, PrintSink, Sandbox, SandboxOptions};
pub use stdlib::{LibRule, Preset, StdLib};
pub use watchdog::{GuardedScope, HookContext, Watchdog};
