/// `scripting/watchdog.rs` — wall-clock containment for script runs
///
/// The watchdog installs an instruction-count debug hook on the
/// interpreter. Every `check_period` VM instructions the hook wakes up,
/// recovers its `HookContext` from the interpreter registry and aborts the
/// running script once the deadline has passed. Native functions called
/// from a script cannot be interrupted mid-call; the guard fires between
/// VM instructions only.
///
/// All watchdogs over one interpreter share a single registry slot, so a
/// second `arm` on the same state fails instead of silently clobbering the
/// first watchdog's deadline.
use std::cell::{Cell, RefCell};
use std::time::{Duration, Instant};

use mlua::{AnyUserData, HookTriggers, Lua, VmState};

use super::registry::RegistrySlot;

pub const DEFAULT_CHECK_PERIOD: u32 = 10_000;
pub const DEFAULT_TIME_LIMIT: Duration = Duration::from_millis(5);

/// Hook body: a plain function pointer. State travels through the registry
/// slot, never through captures.
pub type HookFn = fn(&Lua) -> mlua::Result<VmState>;

static HOOK_CONTEXT: RegistrySlot<HookContext> =
    RegistrySlot::new("peon.scripting.hook-context");

// ── Hook context ─────────────────────────────────────────────────────────────

/// Deadline and enable flag read by the debug hook on every tick.
#[derive(Debug, Clone)]
pub struct HookContext {
    deadline: Instant,
    enabled: bool,
}

impl HookContext {
    fn new() -> Self {
        Self {
            deadline: Instant::now(),
            enabled: false,
        }
    }

    pub fn start(&mut self, limit: Duration) {
        self.enabled = true;
        self.deadline = Instant::now() + limit;
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_timed_out(&self) -> bool {
        self.enabled && Instant::now() > self.deadline
    }
}

/// The stock hook: aborts the script once the shared context reports a
/// timeout. Raises a distinct error when the context cannot be recovered,
/// since a hook without context means the guard state got out of sync.
pub fn default_hook(lua: &Lua) -> mlua::Result<VmState> {
    let Some(context) = HOOK_CONTEXT.get(lua) else {
        return Err(mlua::Error::RuntimeError(
            "Unable to get hook context".to_string(),
        ));
    };
    let timed_out = context
        .borrow::<HookContext>()
        .map(|ctx| ctx.is_timed_out())
        .unwrap_or(false);
    if timed_out {
        return Err(mlua::Error::RuntimeError("Script timed out".to_string()));
    }
    Ok(VmState::Continue)
}

// ── Watchdog ─────────────────────────────────────────────────────────────────

/// Attach/arm state machine over one interpreter handle.
///
/// Invariant: while armed, the registry slot holds this watchdog's context
/// and the interpreter runs its hook with `(check_period, hook)`. Detaching
/// (or dropping) always disarms first.
pub struct Watchdog {
    lua: RefCell<Option<Lua>>,
    check_period: Cell<u32>,
    hook: Cell<HookFn>,
    armed: Cell<bool>,
    context: RefCell<Option<AnyUserData>>,
}

impl Watchdog {
    /// A watchdog attached to `lua`, with default period and hook.
    pub fn new(lua: &Lua) -> Self {
        let watchdog = Self::unattached();
        watchdog.attach(lua, false);
        watchdog
    }

    pub fn unattached() -> Self {
        Self {
            lua: RefCell::new(None),
            check_period: Cell::new(DEFAULT_CHECK_PERIOD),
            hook: Cell::new(default_hook),
            armed: Cell::new(false),
            context: RefCell::new(None),
        }
    }

    pub fn attached(&self) -> bool {
        self.lua.borrow().is_some()
    }

    pub fn armed(&self) -> bool {
        self.armed.get()
    }

    pub fn check_period(&self) -> u32 {
        self.check_period.get()
    }

    /// Points the watchdog at an interpreter. Refused while armed unless
    /// `force`, which detaches (and therefore disarms) first.
    pub fn attach(&self, lua: &Lua, force: bool) -> bool {
        if self.armed.get() {
            if !force {
                return false;
            }
            self.detach();
        }
        *self.lua.borrow_mut() = Some(lua.clone());
        true
    }

    /// Disarms if needed and drops the interpreter handle.
    pub fn detach(&self) {
        if self.armed.get() {
            self.disarm();
        }
        *self.lua.borrow_mut() = None;
    }

    /// Replaces the check period and hook function. Refused while armed and
    /// for a zero period.
    pub fn configure_hook(&self, check_period: u32, hook: HookFn) -> bool {
        if self.armed.get() || check_period == 0 {
            return false;
        }
        self.check_period.set(check_period);
        self.hook.set(hook);
        true
    }

    /// Publishes the context to the registry slot, installs the hook and
    /// starts the deadline. Fails when detached, already armed, or when the
    /// slot is occupied (another watchdog is armed on this interpreter).
    pub fn arm(&self, limit: Duration) -> bool {
        let lua_ref = self.lua.borrow();
        let Some(lua) = lua_ref.as_ref() else {
            return false;
        };
        if self.armed.get() || !HOOK_CONTEXT.is_empty(lua) {
            return false;
        }

        let mut context = HookContext::new();
        context.start(limit);
        let handle = match HOOK_CONTEXT.set(lua, context) {
            Ok(handle) => handle,
            Err(err) => {
                log::error!("watchdog: failed to publish hook context: {err}");
                return false;
            }
        };

        let hook = self.hook.get();
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(self.check_period.get()),
            move |lua, _| hook(lua),
        );

        *self.context.borrow_mut() = Some(handle);
        self.armed.set(true);
        true
    }

    /// Pushes the deadline out to `now + limit`. Armed only; the hook and
    /// the registry slot stay untouched.
    pub fn rearm(&self, limit: Duration) -> bool {
        if !self.armed.get() {
            return false;
        }
        let context = self.context.borrow();
        let Some(handle) = context.as_ref() else {
            return false;
        };
        match handle.borrow_mut::<HookContext>() {
            Ok(mut ctx) => {
                ctx.start(limit);
                true
            }
            Err(err) => {
                log::error!("watchdog: failed to access hook context: {err}");
                false
            }
        }
    }

    /// Disables the context; when armed, also removes the hook and vacates
    /// the registry slot. Safe to call in any state.
    pub fn disarm(&self) {
        if let Some(handle) = self.context.borrow_mut().take() {
            if let Ok(mut ctx) = handle.borrow_mut::<HookContext>() {
                ctx.reset();
            }
        }
        if !self.armed.get() {
            return;
        }
        if let Some(lua) = self.lua.borrow().as_ref() {
            lua.remove_hook();
            if let Err(err) = HOOK_CONTEXT.remove(lua) {
                log::warn!("watchdog: failed to clear hook context slot: {err}");
            }
        }
        self.armed.set(false);
    }

    /// Whether the current deadline has passed. False when not armed.
    pub fn timed_out(&self) -> bool {
        self.context
            .borrow()
            .as_ref()
            .and_then(|handle| handle.borrow::<HookContext>().ok().map(|ctx| ctx.is_timed_out()))
            .unwrap_or(false)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.detach();
    }
}

// ── Guarded scope ────────────────────────────────────────────────────────────

/// Scoped arm/disarm of a watchdog. Arms on construction; a failed arm
/// (for instance over an already-armed watchdog) leaves the scope disabled
/// and it becomes a no-op. Disarms on drop while enabled. Move-only.
pub struct GuardedScope<'a> {
    watchdog: Option<&'a Watchdog>,
}

impl<'a> GuardedScope<'a> {
    pub fn new(watchdog: &'a Watchdog, limit: Duration) -> Self {
        if watchdog.arm(limit) {
            Self {
                watchdog: Some(watchdog),
            }
        } else {
            Self { watchdog: None }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.watchdog.is_some()
    }

    /// Disarm then arm with a fresh budget; reports whether the new arm
    /// took. A disabled scope stays a no-op.
    pub fn rearm(&self, limit: Duration) -> bool {
        let Some(watchdog) = self.watchdog else {
            return false;
        };
        watchdog.disarm();
        watchdog.arm(limit)
    }

    pub fn timed_out(&self) -> bool {
        self.watchdog.map(Watchdog::timed_out).unwrap_or(false)
    }
}

impl Drop for GuardedScope<'_> {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.disarm();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn watchdog_arms_on_scope_start_and_times_out() {
        let lua = Lua::new();
        let watchdog = Watchdog::new(&lua);

        assert!(!watchdog.armed());

        {
            let _scope = GuardedScope::new(&watchdog, Duration::from_millis(5));
            assert!(watchdog.armed());

            let result = lua.load("while true do end").exec();
            let err = result.expect_err("runaway script must be interrupted");
            assert!(
                error_contains(&err, "Script timed out"),
                "unexpected error: {err}"
            );
            assert!(watchdog.timed_out());
        }

        assert!(!watchdog.armed());
        assert!(HOOK_CONTEXT.is_empty(&lua));
    }

    #[test]
    fn disarm_removes_hook_and_registry_slot() {
        let lua = Lua::new();
        let watchdog = Watchdog::new(&lua);

        assert!(watchdog.arm(Duration::from_millis(5)));
        watchdog.disarm();

        assert!(!watchdog.armed());
        assert!(!watchdog.timed_out());
        assert!(HOOK_CONTEXT.is_empty(&lua));

        // With the hook gone, a script longer than the old budget runs fine.
        // A leftover hook would abort it: its context slot is empty now.
        std::thread::sleep(Duration::from_millis(10));
        lua.load("local n = 0 for i = 1, 100000 do n = n + i end")
            .exec()
            .expect("script must run without a hook");
    }

    #[test]
    fn arm_requires_attachment() {
        let watchdog = Watchdog::unattached();
        assert!(!watchdog.attached());
        assert!(!watchdog.arm(Duration::from_millis(5)));
    }

    #[test]
    fn arm_while_armed_is_refused() {
        let lua = Lua::new();
        let watchdog = Watchdog::new(&lua);

        assert!(watchdog.arm(Duration::from_secs(1)));
        assert!(!watchdog.arm(Duration::from_secs(1)));
        watchdog.disarm();
    }

    #[test]
    fn two_watchdogs_on_one_interpreter_conflict() {
        let lua = Lua::new();
        let first = Watchdog::new(&lua);
        let second = Watchdog::new(&lua);

        assert!(first.arm(Duration::from_millis(5)));
        assert!(!second.arm(Duration::from_millis(5)));

        let err = lua
            .load("while true do end")
            .exec()
            .expect_err("first watchdog must fire");
        assert!(error_contains(&err, "Script timed out"));

        first.disarm();
        assert!(second.arm(Duration::from_millis(5)));
        second.disarm();
    }

    #[test]
    fn rearm_moves_the_deadline() {
        let lua = Lua::new();
        let watchdog = Watchdog::new(&lua);

        assert!(!watchdog.rearm(Duration::from_secs(10)), "rearm needs an armed watchdog");

        assert!(watchdog.arm(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(watchdog.timed_out());

        assert!(watchdog.rearm(Duration::from_secs(10)));
        assert!(!watchdog.timed_out());

        // The fresh budget comfortably covers a short script.
        lua.load("local n = 0 for i = 1, 100000 do n = n + 1 end")
            .exec()
            .expect("script must finish inside the new budget");

        watchdog.disarm();
    }

    #[test]
    fn configure_hook_is_refused_while_armed_or_with_zero_period() {
        let lua = Lua::new();
        let watchdog = Watchdog::new(&lua);

        assert!(!watchdog.configure_hook(0, default_hook));
        assert!(watchdog.configure_hook(500, default_hook));
        assert_eq!(watchdog.check_period(), 500);

        assert!(watchdog.arm(Duration::from_secs(1)));
        assert!(!watchdog.configure_hook(1000, default_hook));
        assert_eq!(watchdog.check_period(), 500);
        watchdog.disarm();
    }

    #[test]
    fn attach_is_refused_while_armed_unless_forced() {
        let lua1 = Lua::new();
        let lua2 = Lua::new();
        let watchdog = Watchdog::new(&lua1);

        assert!(watchdog.arm(Duration::from_secs(1)));
        assert!(!watchdog.attach(&lua2, false));

        assert!(watchdog.attach(&lua2, true));
        assert!(!watchdog.armed());
        assert!(HOOK_CONTEXT.is_empty(&lua1), "forced reattach must clean the old state");
    }

    #[test]
    fn watchdog_reattaches_to_a_new_interpreter() {
        let lua1 = Lua::new();
        let watchdog = Watchdog::new(&lua1);

        {
            let _scope = GuardedScope::new(&watchdog, Duration::from_millis(5));
            let result = lua1.load("while true do end").exec();
            assert!(result.is_err());
        }

        let lua2 = Lua::new();
        assert!(watchdog.attach(&lua2, false));

        {
            let _scope = GuardedScope::new(&watchdog, Duration::from_millis(5));
            let err = lua2
                .load("while true do end")
                .exec()
                .expect_err("watchdog must guard the new interpreter");
            assert!(error_contains(&err, "Script timed out"));
        }
        assert!(HOOK_CONTEXT.is_empty(&lua2));
    }

    #[test]
    fn scope_over_an_armed_watchdog_is_disabled() {
        let lua = Lua::new();
        let watchdog = Watchdog::new(&lua);

        assert!(watchdog.arm(Duration::from_secs(1)));
        {
            let scope = GuardedScope::new(&watchdog, Duration::from_millis(5));
            assert!(!scope.is_enabled());
            assert!(!scope.timed_out());
        }
        // The disabled scope must not have disarmed the outer owner.
        assert!(watchdog.armed());
        watchdog.disarm();
    }

    #[test]
    fn scope_rearm_reissues_the_arm() {
        let lua = Lua::new();
        let watchdog = Watchdog::new(&lua);

        let scope = GuardedScope::new(&watchdog, Duration::from_millis(1));
        assert!(scope.is_enabled());
        std::thread::sleep(Duration::from_millis(5));
        assert!(scope.timed_out());

        assert!(scope.rearm(Duration::from_secs(10)));
        assert!(!scope.timed_out());
        assert!(watchdog.armed());

        drop(scope);
        assert!(!watchdog.armed());
    }

    #[test]
    fn moved_scope_disarms_exactly_once() {
        let lua = Lua::new();
        let watchdog = Watchdog::new(&lua);

        let scope = GuardedScope::new(&watchdog, Duration::from_secs(1));
        assert!(watchdog.armed());

        let moved = scope;
        assert!(watchdog.armed());
        drop(moved);
        assert!(!watchdog.armed());

        // The slot is free again: a fresh arm works.
        assert!(watchdog.arm(Duration::from_secs(1)));
        watchdog.disarm();
    }

    #[test]
    fn hook_without_context_reports_the_missing_context() {
        let lua = Lua::new();
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(1),
            |lua, _| default_hook(lua),
        );

        let err = lua
            .load("return 1 + 1")
            .exec()
            .expect_err("hook with no published context must fail");
        assert!(
            error_contains(&err, "Unable to get hook context"),
            "unexpected error: {err}"
        );
        lua.remove_hook();
    }

    #[test]
    fn dropping_the_watchdog_detaches_and_cleans_up() {
        let lua = Lua::new();
        {
            let watchdog = Watchdog::new(&lua);
            assert!(watchdog.arm(Duration::from_secs(1)));
        }
        assert!(HOOK_CONTEXT.is_empty(&lua));
        lua.load("local x = 1 + 1").exec().expect("no hook may linger");
    }
}
