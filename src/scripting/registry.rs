/// `scripting/registry.rs` — typed slots in the interpreter registry
///
/// The interpreter keeps a registry table that host code can use to stash
/// values out of reach of any script. A `RegistrySlot` is one named,
/// type-checked entry in it, used to hand per-state context to callbacks
/// that only receive the interpreter handle.
///
/// The key is the slot constant itself, not any stored value, so every
/// user of the same slot on the same state contends for one entry. The
/// watchdog relies on exactly that to detect a second watchdog trying to
/// arm over the same interpreter.
use std::marker::PhantomData;

use mlua::{AnyUserData, Lua, Value};

pub struct RegistrySlot<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> RegistrySlot<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// Stores `value` in the slot, replacing any previous occupant.
    /// Returns the userdata handle for direct access.
    pub fn set(&self, lua: &Lua, value: T) -> mlua::Result<AnyUserData> {
        let data = lua.create_any_userdata(value)?;
        lua.set_named_registry_value(self.name, data.clone())?;
        Ok(data)
    }

    /// The current occupant, if the slot holds a value of type `T`.
    pub fn get(&self, lua: &Lua) -> Option<AnyUserData> {
        let value: Value = lua.named_registry_value(self.name).ok()?;
        match value {
            Value::UserData(data) if data.borrow::<T>().is_ok() => Some(data),
            _ => None,
        }
    }

    pub fn is_empty(&self, lua: &Lua) -> bool {
        self.get(lua).is_none()
    }

    pub fn remove(&self, lua: &Lua) -> mlua::Result<()> {
        lua.unset_named_registry_value(self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Marker(u32);
    struct Other(&'static str);

    static MARKER_SLOT: RegistrySlot<Marker> = RegistrySlot::new("peon.test.marker");
    static OTHER_SLOT: RegistrySlot<Other> = RegistrySlot::new("peon.test.other");

    #[test]
    fn empty_until_set() {
        let lua = Lua::new();
        assert!(MARKER_SLOT.is_empty(&lua));
        assert!(MARKER_SLOT.get(&lua).is_none());
    }

    #[test]
    fn set_then_get_round_trips() {
        let lua = Lua::new();
        MARKER_SLOT.set(&lua, Marker(7)).unwrap();

        let data = MARKER_SLOT.get(&lua).expect("slot should be occupied");
        assert_eq!(data.borrow::<Marker>().unwrap().0, 7);
        assert!(!MARKER_SLOT.is_empty(&lua));
    }

    #[test]
    fn remove_empties_the_slot() {
        let lua = Lua::new();
        MARKER_SLOT.set(&lua, Marker(1)).unwrap();
        MARKER_SLOT.remove(&lua).unwrap();
        assert!(MARKER_SLOT.is_empty(&lua));
    }

    #[test]
    fn set_replaces_the_occupant() {
        let lua = Lua::new();
        MARKER_SLOT.set(&lua, Marker(1)).unwrap();
        MARKER_SLOT.set(&lua, Marker(2)).unwrap();

        let data = MARKER_SLOT.get(&lua).unwrap();
        assert_eq!(data.borrow::<Marker>().unwrap().0, 2);
    }

    #[test]
    fn slots_with_different_names_do_not_collide() {
        let lua = Lua::new();
        MARKER_SLOT.set(&lua, Marker(3)).unwrap();
        OTHER_SLOT.set(&lua, Other("dabu")).unwrap();

        assert_eq!(MARKER_SLOT.get(&lua).unwrap().borrow::<Marker>().unwrap().0, 3);
        assert_eq!(OTHER_SLOT.get(&lua).unwrap().borrow::<Other>().unwrap().0, "dabu");

        MARKER_SLOT.remove(&lua).unwrap();
        assert!(MARKER_SLOT.is_empty(&lua));
        assert!(!OTHER_SLOT.is_empty(&lua));
    }

    #[test]
    fn slots_are_per_interpreter_instance() {
        let lua1 = Lua::new();
        let lua2 = Lua::new();
        MARKER_SLOT.set(&lua1, Marker(9)).unwrap();

        assert!(!MARKER_SLOT.is_empty(&lua1));
        assert!(MARKER_SLOT.is_empty(&lua2));
    }

    #[test]
    fn wrong_type_reads_as_empty() {
        let lua = Lua::new();
        // occupy the marker slot's name with a different userdata type
        let data = lua.create_any_userdata(Other("intruder")).unwrap();
        lua.set_named_registry_value("peon.test.marker", data).unwrap();

        assert!(MARKER_SLOT.get(&lua).is_none());
        assert!(MARKER_SLOT.is_empty(&lua));
    }
}
