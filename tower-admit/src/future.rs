use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use pin_project_lite::pin_project;
use tower::BoxError;

use crate::error::AdmitError;

pin_project! {
    /// Either the inner service's future, or an immediate rejection.
    #[project = ResponseProj]
    pub enum ResponseFuture<F> {
        Admitted {
            #[pin]
            inner: F,
        },
        Rejected {
            error: Option<AdmitError>,
        },
    }
}

impl<F> ResponseFuture<F> {
    pub(crate) fn admitted(inner: F) -> Self {
        Self::Admitted { inner }
    }

    pub(crate) fn rejected(error: AdmitError) -> Self {
        Self::Rejected { error: Some(error) }
    }
}

impl<F, T> Future for ResponseFuture<F>
where
    F: Future<Output = Result<T, BoxError>>,
{
    type Output = Result<T, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            ResponseProj::Admitted { inner } => inner.poll(cx),
            ResponseProj::Rejected { error } => {
                let error = error.take().expect("ResponseFuture polled after completion");
                Poll::Ready(Err(Box::new(error)))
            }
        }
    }
}
