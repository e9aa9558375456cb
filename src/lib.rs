// boardapi: serialized, rate-limited access to an image-board site's API.
//
// This is the library root. `queue` is the dispatch core, `api` the facade
// built on top of it.

pub mod api;
pub mod config;
pub mod error;
pub mod queue;

pub use api::Api;
pub use error::RequestError;
pub use queue::{Action, RequestId, RequestQueue, ResultHandle};
