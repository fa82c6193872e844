use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// The boxed future type handed to [`Executor`]s.
pub type BoxSendFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// An executor of futures.
///
/// Connection and stream tasks are spawned through this seam so embedders
/// can supply their own runtime handle; by default tasks land on the
/// ambient tokio runtime.
pub trait Executor<Fut> {
    /// Place the future into the executor to be run.
    fn execute(&self, fut: Fut);
}

/// Either the default tokio spawner or a user-supplied executor.
#[derive(Clone)]
pub(crate) enum Exec {
    Default,
    Executor(Arc<dyn Executor<BoxSendFuture> + Send + Sync>),
}

impl Exec {
    pub(crate) fn execute<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match *self {
            Exec::Default => {
                tokio::task::spawn(fut);
            }
            Exec::Executor(ref exec) => {
                exec.execute(Box::pin(fut));
            }
        }
    }
}

impl fmt::Debug for Exec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exec").finish()
    }
}

impl<E, F> Executor<F> for Arc<E>
where
    E: Executor<F>,
{
    fn execute(&self, fut: F) {
        (**self).execute(fut)
    }
}
