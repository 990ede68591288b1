use super::{
    errors::{RunResult, WorkerError},
    model::RunReport,
};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll}
};
use tokio::{
    sync::oneshot,
    task,
};


/// Handle on a run spawned with [`BoundedWorkProcessor::start`](crate::BoundedWorkProcessor::start).
///
/// Awaiting the handle resolves to the first failure (or `Ok`) once every worker
/// loop has returned. Dropping it does not stop the run.
pub struct RunHandle<E> {
    driver: task::JoinHandle<()>,
    receiver: oneshot::Receiver<RunReport<E>>,
}

impl<E> RunHandle<E> {

    pub(crate) fn new
    (
        driver: task::JoinHandle<()>,
        receiver: oneshot::Receiver<RunReport<E>>,
    ) -> Self {
        Self {
            driver,
            receiver
        }
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.driver.is_finished()
    }

    /// Waits for the run and returns every failure instead of only the first.
    pub async fn report(self) -> Result<RunReport<E>, WorkerError<E>> {
        self.receiver.await.map_err(|_| WorkerError::ChannelClosed)
    }
}

impl<E> Future for RunHandle<E> {
    type Output = RunResult<E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(report)) => Poll::Ready(report.into_result()),
            Poll::Ready(Err(_)) => Poll::Ready(Err(WorkerError::ChannelClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}
