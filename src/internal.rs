mod backoff;
mod route;

pub(crate) use backoff::exponential;
pub(crate) use route::Route;
