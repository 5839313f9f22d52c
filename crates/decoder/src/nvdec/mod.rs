//! NVDEC hardware decoding through the CUVID API.
//!
//! - [`ffi`]: raw bindings, loaded at runtime via `libloading`.
//! - [`api`]: [`NvcuvidApi`], the production [`CuvidApi`](crate::backend::CuvidApi).

pub mod api;
pub mod ffi;

pub use api::NvcuvidApi;
pub use ffi::{NvcuvidLibrary, NvcuvidLoadError};
