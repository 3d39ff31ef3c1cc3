use crate::Event;

/// Events produced by a single handler invocation.
///
/// A handler may emit nothing, one event, or many. All three shapes
/// normalize into an ordered list that the [`Spine`](crate::Spine)
/// enqueues in order:
///
/// ```rust
/// use eventspine::{Emit, Event};
/// use serde_json::Value;
///
/// let greeted = Event::new("GREETED", Value::Null).unwrap();
/// assert!(Emit::none().is_empty());
/// assert_eq!(Emit::from(greeted.clone()).len(), 1);
/// assert_eq!(Emit::from(Some(greeted)).len(), 1);
/// assert_eq!(Emit::from(None::<Event>).len(), 0);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Emit(Vec<Event>);

impl Emit {
    pub fn none() -> Self {
        Emit(Vec::new())
    }

    pub fn one(event: Event) -> Self {
        Emit(vec![event])
    }

    pub fn many(events: impl IntoIterator<Item = Event>) -> Self {
        Emit(events.into_iter().collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn events(&self) -> &[Event] {
        &self.0
    }
}

impl From<Event> for Emit {
    fn from(event: Event) -> Self {
        Emit::one(event)
    }
}

impl From<Option<Event>> for Emit {
    fn from(event: Option<Event>) -> Self {
        Emit(event.into_iter().collect())
    }
}

impl From<Vec<Event>> for Emit {
    fn from(events: Vec<Event>) -> Self {
        Emit(events)
    }
}

impl From<()> for Emit {
    fn from(_: ()) -> Self {
        Emit::none()
    }
}

impl FromIterator<Event> for Emit {
    fn from_iter<I: IntoIterator<Item = Event>>(iter: I) -> Self {
        Emit::many(iter)
    }
}

impl IntoIterator for Emit {
    type Item = Event;
    type IntoIter = std::vec::IntoIter<Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn event(t: &str) -> Event {
        Event::new(t, Value::Null).unwrap()
    }

    #[test]
    fn test_many_keeps_order() {
        let emit = Emit::many([event("A"), event("B"), event("C")]);
        let types: Vec<_> = emit.events().iter().map(|e| e.event_type().to_owned()).collect();
        assert_eq!(types, ["A", "B", "C"]);
    }

    #[test]
    fn test_unit_and_empty_vec_are_none() {
        assert_eq!(Emit::from(()), Emit::none());
        assert_eq!(Emit::from(Vec::new()), Emit::none());
    }

    #[test]
    fn test_collect() {
        let emit: Emit = (0..3).map(|i| event(&format!("E{i}"))).collect();
        assert_eq!(emit.into_iter().count(), 3);
    }
}
