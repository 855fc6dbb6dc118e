/// Pool error.
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    /// The pool was torn down (connection loss or shutdown) while waiting
    /// for a resource.
    #[error("the channel pool is closed")]
    Closed,
    /// The manager failed to produce a usable resource.
    #[error("failed to create a pooled resource")]
    Resource(#[source] anyhow::Error),
}
