pub mod buffer;
pub mod capacity;
pub mod config;
pub mod constants;
pub mod drain;
pub mod error;
pub mod io;
pub mod scenario;
pub mod stimulus;
pub mod submit;
pub mod suite;
#[doc(hidden)]
pub mod test_utils;
pub mod tracker;
