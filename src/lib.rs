pub mod scripting;
pub mod utils;
