use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::{Emit, Error, Event, Handler, Result, Subscribe};

/// A registered handler together with its validated subscriptions.
pub(crate) struct Route {
    pub name: Arc<str>,
    pub subscribe: Subscribe,
    handler: Box<dyn ErasedHandler>,
}

impl Route {
    pub fn new<H: Handler>(handler: H) -> Result<Self> {
        let name: Arc<str> = Arc::from(handler.name().as_ref());
        let subscribe = handler.subscriptions();
        if subscribe.is_empty() {
            return Err(Error::registration(format!(
                "handler '{name}' must subscribe to at least one event type"
            )));
        }

        let mut event_types = Vec::with_capacity(subscribe.event_types().len());
        for t in subscribe.event_types() {
            let t = t.trim();
            if t.is_empty() {
                return Err(Error::registration(format!(
                    "handler '{name}' subscribes to a blank event type"
                )));
            }
            event_types.push(t.to_owned());
        }

        Ok(Route {
            name,
            subscribe: Subscribe::to(event_types),
            handler: Box::new(handler),
        })
    }

    pub fn accepts(&self, event: &Event) -> bool {
        self.subscribe.contains(event.event_type())
    }

    pub fn process<'a>(&'a mut self, event: &'a Event) -> BoxFuture<'a, Result<Emit>> {
        self.handler.process(event)
    }
}

/// Object-safe view of [`Handler`], so handlers of different types can
/// share one route table.
trait ErasedHandler: Send {
    fn process<'a>(&'a mut self, event: &'a Event) -> BoxFuture<'a, Result<Emit>>;
}

impl<H: Handler> ErasedHandler for H {
    fn process<'a>(&'a mut self, event: &'a Event) -> BoxFuture<'a, Result<Emit>> {
        Box::pin(Handler::process(self, event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler_fn;
    use serde_json::Value;

    #[test]
    fn test_rejects_empty_subscriptions() {
        let err = Route::new(handler_fn("idle", Subscribe::none(), |_| Ok(Emit::none())))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Registration(_)));
        assert!(err.to_string().contains("idle"));
    }

    #[test]
    fn test_rejects_blank_event_type() {
        let result = Route::new(handler_fn("blank", ["A", "  "], |_| Ok(Emit::none())));
        assert!(matches!(result, Err(Error::Registration(_))));
    }

    #[tokio::test]
    async fn test_trims_and_routes() {
        let mut route = Route::new(handler_fn("echo", [" PING "], |e| {
            Ok(Event::new("PONG", Value::Object(e.payload().clone()))?.into())
        }))
        .unwrap();
        let ping = Event::new("PING", Value::Null).unwrap();
        assert!(route.accepts(&ping));
        assert!(!route.accepts(&Event::new("PONG", Value::Null).unwrap()));

        let emitted = route.process(&ping).await.unwrap();
        assert_eq!(emitted.events()[0].event_type(), "PONG");
    }
}
