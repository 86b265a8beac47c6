/// `utils/` — small engine-wide helpers
///
/// Nothing in here knows about Lua or the sandbox; these are the building
/// blocks the scripting subsystem (and eventually the rest of the engine)
/// leans on.
pub mod enum_set;
pub mod fs;
