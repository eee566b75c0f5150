//! Core types for the Portico server framework.
//!
//! This crate holds what a handler sees: the [`Request`], the [`Response`]
//! it builds, the [`Signal`] it returns and the [`Handler`] trait tying them
//! together. Routing lives in `portico-router`; running the handler chain
//! and talking HTTP lives in `portico-server`.
//!
//! # Example
//!
//! ```rust
//! use portico_core::{Request, Response, Signal};
//! use portico_router::UserData;
//!
//! fn greet(req: &Request, res: &mut Response, _: Option<&UserData>) -> Signal {
//!     let name = req.param("name").unwrap_or("world");
//!     res.set_string_body(format!("hello, {name}"));
//!     Signal::Complete
//! }
//! # let _ = greet;
//! ```

pub mod cookie;
pub mod error;
pub mod handler;
pub mod request;
pub mod response;

pub use cookie::{Cookies, SameSite, SetCookie};
pub use error::{CoreError, CoreResult};
pub use handler::{handler_fn, AsyncHandler, Handler, HandlerFuture, Signal};
pub use request::{Auth, BasicAuth, Request};
pub use response::{Body, BodyStream, Response, ResponseParts};

// Re-export the route user data type handlers receive.
pub use portico_router::UserData;
