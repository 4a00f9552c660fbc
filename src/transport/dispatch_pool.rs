use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn, Instrument, Span};

use crate::protocol::message::Message;
use crate::transport::end_point::FrameHandler;

struct Job {
    message: Message,
    from: SocketAddr,
    span: Span,
}

/// A fixed number of workers taking inbound frames from a bounded queue and passing them to the
///  engine's [FrameHandler]. Slow handlers occupy a worker but never the receive loop, and the
///  queue bound limits the work accepted under load.
pub struct DispatchPool {
    sender: RwLock<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchPool {
    pub fn new(handler: Arc<dyn FrameHandler>, num_workers: usize, queue_size: usize) -> DispatchPool {
        let (sender, receiver) = mpsc::channel(queue_size);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..num_workers)
            .map(|worker_id| tokio::spawn(Self::worker_loop(worker_id, handler.clone(), receiver.clone())))
            .collect();

        DispatchPool {
            sender: RwLock::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    async fn worker_loop(worker_id: usize, handler: Arc<dyn FrameHandler>, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) {
        debug!("starting dispatch worker {}", worker_id);
        loop {
            let job = receiver.lock().await.recv().await;
            let Some(job) = job else {
                break;
            };

            let handler = handler.clone();
            let task = tokio::spawn(async move {
                handler.on_frame(job.message, job.from).await
            }.instrument(job.span));

            // the job runs as a task of its own so that a panicking handler does not take the worker down
            if let Err(e) = task.await {
                error!("dispatching a frame failed: {}", e);
            }
        }
        debug!("dispatch worker {} finished", worker_id);
    }

    /// Queues a frame for dispatch. Returns `false` if the frame was dropped because the queue is
    ///  full or the pool is shut down.
    pub async fn submit(&self, message: Message, from: SocketAddr, span: Span) -> bool {
        let sender = self.sender.read().await;
        let Some(sender) = sender.as_ref() else {
            debug!("dispatch pool is shut down - dropping frame from {:?}", from);
            return false;
        };

        match sender.try_send(Job { message, from, span }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("dispatch queue is full - dropping frame from {:?}", from);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("dispatch queue is closed - dropping frame from {:?}", from);
                false
            }
        }
    }

    /// Stops accepting frames and waits for the queued and in-flight ones to be dispatched
    pub async fn shutdown(&self) {
        self.sender.write().await.take();

        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                error!("dispatch worker terminated abnormally: {}", e);
            }
        }
    }
}
