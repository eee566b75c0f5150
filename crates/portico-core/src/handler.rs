//! Handler trait and chain signals.
//!
//! A handler is called with the request, the response under construction
//! and the user data of the route that matched. It returns a [`Signal`]
//! telling the dispatcher what to do next.

use std::future::Future;
use std::pin::Pin;

use portico_router::UserData;

use crate::request::Request;
use crate::response::Response;

/// A boxed future borrowing the request and response.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Signal> + Send + 'a>>;

/// What a handler asks the dispatcher to do after it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Run the next matched handler; render if this was the last.
    Continue,
    /// Same as `Continue`, but this call does not count as handling the
    /// request.
    Ignore,
    /// Stop and render the response as it is.
    Complete,
    /// Stop and render a 401.
    Unauthorized,
    /// Stop, discard the body and render a 500.
    Error,
}

impl Signal {
    /// Returns true if the chain stops after this signal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Unauthorized | Self::Error)
    }
}

/// A request handler.
///
/// Synchronous closures with the signature
/// `Fn(&Request, &mut Response, Option<&UserData>) -> Signal` implement
/// this trait directly. Async handlers can implement it by hand or be
/// wrapped with [`handler_fn`].
///
/// # Example
///
/// ```rust
/// use portico_core::{Handler, Request, Response, Signal};
///
/// let hello = |_: &Request, res: &mut Response, _: Option<&portico_router::UserData>| {
///     res.set_string_body("hello");
///     Signal::Complete
/// };
/// fn assert_handler(_: &impl Handler) {}
/// assert_handler(&hello);
/// ```
pub trait Handler: Send + Sync + 'static {
    /// Handles one step of the chain.
    fn call<'a>(
        &'a self,
        request: &'a Request,
        response: &'a mut Response,
        user_data: Option<&'a UserData>,
    ) -> HandlerFuture<'a>;
}

impl<F> Handler for F
where
    F: Fn(&Request, &mut Response, Option<&UserData>) -> Signal + Send + Sync + 'static,
{
    fn call<'a>(
        &'a self,
        request: &'a Request,
        response: &'a mut Response,
        user_data: Option<&'a UserData>,
    ) -> HandlerFuture<'a> {
        let signal = self(request, response, user_data);
        Box::pin(std::future::ready(signal))
    }
}

/// An async handler built from a closure returning a [`HandlerFuture`].
pub struct AsyncHandler<F> {
    func: F,
}

impl<F> std::fmt::Debug for AsyncHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncHandler").finish_non_exhaustive()
    }
}

/// Wraps an async closure as a [`Handler`].
///
/// ```rust
/// use portico_core::{handler_fn, Signal};
///
/// let handler = handler_fn(|req, res, _| {
///     Box::pin(async move {
///         res.set_string_body(req.path().to_string());
///         Signal::Complete
///     })
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F>(func: F) -> AsyncHandler<F>
where
    F: for<'a> Fn(&'a Request, &'a mut Response, Option<&'a UserData>) -> HandlerFuture<'a>
        + Send
        + Sync
        + 'static,
{
    AsyncHandler { func }
}

impl<F> Handler for AsyncHandler<F>
where
    F: for<'a> Fn(&'a Request, &'a mut Response, Option<&'a UserData>) -> HandlerFuture<'a>
        + Send
        + Sync
        + 'static,
{
    fn call<'a>(
        &'a self,
        request: &'a Request,
        response: &'a mut Response,
        user_data: Option<&'a UserData>,
    ) -> HandlerFuture<'a> {
        (self.func)(request, response, user_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, Uri};
    use std::sync::Arc;

    fn request() -> Request {
        Request::new(Method::GET, Uri::from_static("/items/3"))
    }

    #[test]
    fn test_sync_closure_is_a_handler() {
        let handler = |req: &Request, res: &mut Response, data: Option<&UserData>| {
            let suffix = data
                .and_then(|d| d.downcast_ref::<&'static str>())
                .copied()
                .unwrap_or("");
            res.set_string_body(format!("{}{suffix}", req.path()));
            Signal::Continue
        };

        let data: UserData = Arc::new("!");
        let req = request();
        let mut res = Response::new();
        let signal = tokio_test::block_on(handler.call(&req, &mut res, Some(&data)));

        assert_eq!(signal, Signal::Continue);
        assert_eq!(res.body().as_bytes().map(|b| &b[..]), Some(&b"/items/3!"[..]));
    }

    #[tokio::test]
    async fn test_async_handler() {
        let handler = handler_fn(|req, res, _| {
            Box::pin(async move {
                tokio::task::yield_now().await;
                res.set_shared_data(req.path().len());
                Signal::Complete
            })
        });

        let req = request();
        let mut res = Response::new();
        let boxed: Arc<dyn Handler> = Arc::new(handler);
        assert_eq!(boxed.call(&req, &mut res, None).await, Signal::Complete);
        assert_eq!(res.shared_data::<usize>(), Some(&8));
    }

    #[test]
    fn test_terminal_signals() {
        assert!(!Signal::Continue.is_terminal());
        assert!(!Signal::Ignore.is_terminal());
        assert!(Signal::Complete.is_terminal());
        assert!(Signal::Unauthorized.is_terminal());
        assert!(Signal::Error.is_terminal());
    }
}
