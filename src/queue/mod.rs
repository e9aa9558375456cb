// Request queue: serialized, rate-limited dispatch of outbound calls.
//
// Every call is registered under a unique id, held in a FIFO, and run by a
// single pump task that waits a minimum delay between dispatches. Callers
// await the result handle for their own id and nothing else; a result nobody
// holds a handle to is freed once written.

pub mod pump;
pub mod request;
pub mod slot;

pub use pump::RequestQueue;
pub use request::{Action, RequestId};
pub use slot::ResultHandle;
