//! The outbound transport port.
//!
//! The pipeline never performs I/O itself. A [`Transport`] sends one attempt
//! and reports either a response or a classified [`TransportError`];
//! timeouts and honouring the descriptor's cancellation token are its job.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::descriptor::RequestDescriptor;
use crate::error::TransportError;

/// Performs a single call attempt.
#[async_trait]
pub trait Transport<P, R>: Send + Sync
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    /// Send the request described by `descriptor`.
    async fn call(&self, descriptor: &RequestDescriptor<P>) -> Result<R, TransportError>;
}

#[async_trait]
impl<P, R, T> Transport<P, R> for Arc<T>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
    T: Transport<P, R> + ?Sized,
{
    async fn call(&self, descriptor: &RequestDescriptor<P>) -> Result<R, TransportError> {
        (**self).call(descriptor).await
    }
}

/// Adapter turning an async closure into a [`Transport`].
///
/// The closure receives its own clone of the descriptor (the payload is
/// shared, not copied).
pub struct FnTransport<F> {
    call: F,
}

/// Wrap an async closure as a transport.
///
/// ```
/// use callgate_core::{transport_fn, RequestDescriptor, TransportError};
///
/// let transport = transport_fn(|descriptor: RequestDescriptor<String>| async move {
///     Ok::<_, TransportError>(format!("sent {}", descriptor.payload()))
/// });
/// # let _ = transport;
/// ```
pub fn transport_fn<F>(call: F) -> FnTransport<F> {
    FnTransport { call }
}

#[async_trait]
impl<P, R, F, Fut> Transport<P, R> for FnTransport<F>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
    F: Fn(RequestDescriptor<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, TransportError>> + Send + 'static,
{
    async fn call(&self, descriptor: &RequestDescriptor<P>) -> Result<R, TransportError> {
        (self.call)(descriptor.clone()).await
    }
}

impl<F> fmt::Debug for FnTransport<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTransport").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_transport_fn_receives_descriptor() {
        let transport = transport_fn(|descriptor: RequestDescriptor<u32>| async move {
            if *descriptor.payload() == 0 {
                Err(TransportError::validation("empty payload"))
            } else {
                Ok(descriptor.payload() * 2)
            }
        });

        assert_eq!(transport.call(&RequestDescriptor::new("/double", 21)).await, Ok(42));
        let err = transport.call(&RequestDescriptor::new("/double", 0)).await.unwrap_err();
        assert_eq!(err.message, "empty payload");
    }

    #[tokio::test]
    async fn test_arc_dyn_transport_delegates() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let transport: Arc<dyn Transport<(), u32>> =
            Arc::new(transport_fn(move |_: RequestDescriptor<()>| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok(n) }
            }));

        let descriptor = RequestDescriptor::new("/count", ());
        assert_eq!(transport.call(&descriptor).await, Ok(1));
        assert_eq!(transport.call(&descriptor).await, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
