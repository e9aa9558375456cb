// Site API facade: request construction, token handling and transport.
//
// `client::Api` is the only thing the rest of an application should talk to.
// It builds requests, injects the anti-forgery token into form submissions,
// and funnels everything through a single `RequestQueue`.

pub mod client;
pub mod form;
pub mod token;
pub mod transport;

pub use client::Api;
pub use token::AuthenticityToken;
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport};
