//! Concurrency limit that sheds load instead of queueing.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use switchyard_core::{Invocation, ProcedureError, Reply};
use tokio::sync::Semaphore;
use tower::{Layer, Service};

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Holds one permit per running call. With no permit free the call fails
/// immediately with `ProcedureError::Overloaded`.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    semaphore: Arc<Semaphore>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
        }
    }

    /// Permits currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            semaphore: Arc::clone(&self.semaphore),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
}

impl<S> Service<Invocation> for LoadShedService<S>
where
    S: Service<Invocation, Response = Reply, Error = ProcedureError> + Send,
    S::Future: Send + 'static,
{
    type Response = Reply;
    type Error = ProcedureError;
    type Future = Pin<Box<dyn Future<Output = Result<Reply, ProcedureError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, inv: Invocation) -> Self::Future {
        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            tracing::debug!(operation = %inv.operation, "shedding call");
            return Box::pin(async { Err(ProcedureError::Overloaded) });
        };

        let fut = self.inner.call(inv);
        Box::pin(async move {
            let result = fut.await;
            drop(permit);
            result
        })
    }
}
