/// The event types a [`Handler`](crate::Handler) listens to.
///
/// Order is kept for diagnostics only; matching is by membership.
///
/// ```rust
/// use eventspine::Subscribe;
///
/// let subs = Subscribe::to(["ORDER_PLACED", "ORDER_CANCELLED"]);
/// assert!(subs.contains("ORDER_PLACED"));
/// assert!(!subs.contains("ORDER_SHIPPED"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscribe(Vec<String>);

impl Subscribe {
    pub fn to<I, S>(event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Subscribe(event_types.into_iter().map(Into::into).collect())
    }

    /// Subscribe to nothing. Rejected at registration; exists for symmetry
    /// with handlers that compute their subscriptions.
    pub fn none() -> Self {
        Subscribe(Vec::new())
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.0.iter().any(|t| t == event_type)
    }

    pub fn event_types(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Subscribe {
    fn from(event_type: &str) -> Self {
        Subscribe(vec![event_type.to_owned()])
    }
}

impl<const N: usize> From<[&str; N]> for Subscribe {
    fn from(event_types: [&str; N]) -> Self {
        Subscribe::to(event_types)
    }
}

impl From<&[&str]> for Subscribe {
    fn from(event_types: &[&str]) -> Self {
        Subscribe::to(event_types.iter().copied())
    }
}

impl From<Vec<String>> for Subscribe {
    fn from(event_types: Vec<String>) -> Self {
        Subscribe(event_types)
    }
}
