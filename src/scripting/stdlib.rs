/// `scripting/stdlib.rs` — standard library identifiers, filter rules, presets
///
/// `StdLib` enumerates every library the interpreter family knows about,
/// whether or not this build provides it. A library is only ever exposed to
/// a sandbox through its `LibRule`; libraries without a rule cannot enter a
/// sandbox at all.
use crate::utils::enum_set::CountedEnum;

/// Identifiers of the interpreter's standard libraries.
///
/// `Base` is special: its symbols live directly in the global environment
/// rather than in a named table, and the binding keeps it open in every
/// state, so there is nothing to load for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StdLib {
    Base,
    Bit32,
    Coroutine,
    Debug,
    Ffi,
    Io,
    Jit,
    Math,
    Os,
    Package,
    String,
    Table,
    Utf8,
}

impl StdLib {
    pub const ALL: [StdLib; 13] = [
        StdLib::Base,
        StdLib::Bit32,
        StdLib::Coroutine,
        StdLib::Debug,
        StdLib::Ffi,
        StdLib::Io,
        StdLib::Jit,
        StdLib::Math,
        StdLib::Os,
        StdLib::Package,
        StdLib::String,
        StdLib::Table,
        StdLib::Utf8,
    ];

    /// Canonical name, as scripts spell it in `require`.
    pub fn name(self) -> &'static str {
        match self {
            StdLib::Base => "base",
            StdLib::Bit32 => "bit32",
            StdLib::Coroutine => "coroutine",
            StdLib::Debug => "debug",
            StdLib::Ffi => "ffi",
            StdLib::Io => "io",
            StdLib::Jit => "jit",
            StdLib::Math => "math",
            StdLib::Os => "os",
            StdLib::Package => "package",
            StdLib::String => "string",
            StdLib::Table => "table",
            StdLib::Utf8 => "utf8",
        }
    }

    pub fn from_name(name: &str) -> Option<StdLib> {
        StdLib::ALL.into_iter().find(|lib| lib.name() == name)
    }

    /// Name under which the library's table is found in the globals.
    pub fn lookup_name(self) -> &'static str {
        match self {
            StdLib::Base => "_G",
            other => other.name(),
        }
    }

    /// The binding-level flag used to open this library, when the current
    /// Lua build provides it. `Base` needs no flag (always open).
    pub fn to_mlua(self) -> Option<mlua::StdLib> {
        match self {
            StdLib::Coroutine => Some(mlua::StdLib::COROUTINE),
            StdLib::Debug => Some(mlua::StdLib::DEBUG),
            StdLib::Io => Some(mlua::StdLib::IO),
            StdLib::Math => Some(mlua::StdLib::MATH),
            StdLib::Os => Some(mlua::StdLib::OS),
            StdLib::Package => Some(mlua::StdLib::PACKAGE),
            StdLib::String => Some(mlua::StdLib::STRING),
            StdLib::Table => Some(mlua::StdLib::TABLE),
            StdLib::Utf8 => Some(mlua::StdLib::UTF8),
            // bit32 is 5.2-only; ffi and jit exist under LuaJIT only.
            StdLib::Base | StdLib::Bit32 | StdLib::Ffi | StdLib::Jit => None,
        }
    }

    /// Whether this Lua build can physically provide the library.
    pub fn is_available(self) -> bool {
        matches!(self, StdLib::Base) || self.to_mlua().is_some()
    }
}

impl CountedEnum for StdLib {
    const COUNT: u32 = StdLib::ALL.len() as u32;

    fn ordinal(self) -> u32 {
        self as u32
    }

    fn from_ordinal(ordinal: u32) -> Option<Self> {
        StdLib::ALL.get(ordinal as usize).copied()
    }
}

// ── Filter rules ─────────────────────────────────────────────────────────────

/// How a library's symbols are filtered on their way into a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibRule {
    /// Only the named symbols are exposed.
    Allowed(&'static [&'static str]),
    /// Everything is exposed except the named symbols.
    AllExcept(&'static [&'static str]),
}

const BASE_ALLOWED: &[&str] = &[
    "assert", "error", "ipairs", "next", "pairs", "pcall", "select", "tonumber", "tostring",
    "type", "unpack", "_VERSION", "xpcall",
];
const MATH_DENIED: &[&str] = &["random", "randomseed"];
const OS_ALLOWED: &[&str] = &["clock", "difftime", "time"];
const STRING_DENIED: &[&str] = &["dump"];

/// The sandboxing rule for `lib`, or `None` when the library may never be
/// loaded into a sandbox (debug, io, package, ffi, jit, bit32, utf8).
pub fn rules_for(lib: StdLib) -> Option<LibRule> {
    match lib {
        StdLib::Base => Some(LibRule::Allowed(BASE_ALLOWED)),
        StdLib::Coroutine => Some(LibRule::AllExcept(&[])),
        StdLib::Math => Some(LibRule::AllExcept(MATH_DENIED)),
        StdLib::Os => Some(LibRule::Allowed(OS_ALLOWED)),
        StdLib::String => Some(LibRule::AllExcept(STRING_DENIED)),
        StdLib::Table => Some(LibRule::AllExcept(&[])),
        _ => None,
    }
}

// ── Presets ──────────────────────────────────────────────────────────────────

/// Which libraries a sandbox starts with. Every preset except `Custom` is
/// frozen: `Sandbox::require` is denied after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    /// Nothing at all.
    Core,
    /// base + table.
    Minimal,
    /// Every library that has a rule.
    Complete,
    /// Starts empty; the host (or the script, through `require`) picks.
    Custom,
}

impl Preset {
    pub fn default_libs(self) -> &'static [StdLib] {
        match self {
            Preset::Core | Preset::Custom => &[],
            Preset::Minimal => &[StdLib::Base, StdLib::Table],
            Preset::Complete => &[
                StdLib::Base,
                StdLib::Coroutine,
                StdLib::Math,
                StdLib::Os,
                StdLib::String,
                StdLib::Table,
            ],
        }
    }

    /// Frozen presets reject manual library loading.
    pub fn allows_manual_load(self) -> bool {
        matches!(self, Preset::Custom)
    }
}
