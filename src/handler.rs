use std::{borrow::Cow, future::Future};

use crate::{Emit, Event, Result, Subscribe};

/// Core trait implemented by user-defined event handlers.
///
/// A handler declares the event types it listens to and processes each
/// matching event, optionally emitting follow-up events that the
/// [`Spine`](crate::Spine) feeds back into its backend.
///
/// Ergonomics:
/// - `process` returns a future, so you can implement it as `async fn`.
///   A purely synchronous handler simply never awaits; its future resolves
///   on first poll. The dispatcher treats both styles the same way.
/// - No `#[async_trait]` is required.
/// - Return anything convertible into [`Emit`]: `()`, an [`Event`],
///   `Option<Event>` or `Vec<Event>`, via `.into()`.
///
/// Handlers are registered explicitly when the Spine is built; there is no
/// global registry.
///
/// # Examples
///
/// ```rust
/// use eventspine::{Emit, Event, Handler, Result, Subscribe};
/// use serde_json::json;
///
/// struct Greeter;
///
/// impl Handler for Greeter {
///     fn subscriptions(&self) -> Subscribe {
///         Subscribe::from("HELLO")
///     }
///
///     async fn process(&mut self, event: &Event) -> Result<Emit> {
///         let name = event.get("name").and_then(|v| v.as_str()).unwrap_or("stranger");
///         Ok(Event::new("GREETED", json!({ "msg": format!("Hello, {name}!") }))?.into())
///     }
/// }
///
/// assert_eq!(Greeter.name(), "Greeter");
/// ```
pub trait Handler: Send + 'static {
    /// Event types routed to this handler. Read once, at registration.
    fn subscriptions(&self) -> Subscribe;

    /// Display name used in logs, statistics and dead-letter reasons.
    ///
    /// Defaults to the implementing type's name without its module path.
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed(short_type_name::<Self>())
    }

    /// Handle a single event.
    ///
    /// Equivalent to:
    ///
    /// ```ignore
    /// async fn process(&mut self, event: &Event) -> Result<Emit>;
    /// ```
    ///
    /// Errors are handled by the Spine according to its
    /// [`HandlerFailureMode`](crate::HandlerFailureMode); they never crash
    /// the loop.
    fn process(&mut self, event: &Event) -> impl Future<Output = Result<Emit>> + Send;
}

/// Handler built from a synchronous closure. See [`handler_fn`].
pub struct FnHandler<F> {
    name: Cow<'static, str>,
    subscribe: Subscribe,
    f: F,
}

/// Build a synchronous handler from a closure.
///
/// ```rust
/// use eventspine::{handler_fn, Emit, Handler};
///
/// let audit = handler_fn("audit", ["ORDER_PLACED", "ORDER_FILLED"], |event| {
///     println!("audit: {event}");
///     Ok(Emit::none())
/// });
/// assert_eq!(audit.name(), "audit");
/// ```
pub fn handler_fn<F>(
    name: impl Into<Cow<'static, str>>,
    subscribe: impl Into<Subscribe>,
    f: F,
) -> FnHandler<F>
where
    F: FnMut(&Event) -> Result<Emit> + Send + 'static,
{
    FnHandler {
        name: name.into(),
        subscribe: subscribe.into(),
        f,
    }
}

impl<F> Handler for FnHandler<F>
where
    F: FnMut(&Event) -> Result<Emit> + Send + 'static,
{
    fn subscriptions(&self) -> Subscribe {
        self.subscribe.clone()
    }

    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    fn process(&mut self, event: &Event) -> impl Future<Output = Result<Emit>> + Send {
        std::future::ready((self.f)(event))
    }
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
