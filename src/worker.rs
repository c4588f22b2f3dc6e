//! Background threads that consume messages.
//!
//! Classification ticks must never block on whoever consumes the resulting labels (typically a UI
//! thread), so labels are handed to a [`Worker`] that forwards them to the consumer.

use std::{
    io,
    panic::resume_unwind,
    thread::{self, JoinHandle},
};

use crossbeam::channel::{Sender, TrySendError};

/// A builder object that can be used to configure and spawn a [`Worker`].
#[derive(Clone)]
pub struct WorkerBuilder {
    name: Option<String>,
    capacity: usize,
}

impl WorkerBuilder {
    /// Sets the name of the [`Worker`] thread.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the channel capacity of the [`Worker`].
    ///
    /// By default, a capacity of 0 is used, which means that [`Worker::send`] will block until the
    /// worker has finished processing any preceding message, and [`Worker::try_send`] only succeeds
    /// while the worker is idle.
    pub fn capacity(self, capacity: usize) -> Self {
        Self { capacity, ..self }
    }

    /// Spawns a [`Worker`] thread that uses `handler` to process incoming messages.
    pub fn spawn<I, F>(self, mut handler: F) -> io::Result<Worker<I>>
    where
        I: Send + 'static,
        F: FnMut(I) + Send + 'static,
    {
        let (sender, recv) = crossbeam::channel::bounded(self.capacity);
        let mut builder = thread::Builder::new();
        if let Some(name) = self.name.clone() {
            builder = builder.name(name);
        }
        let name = self.name.unwrap_or_else(|| "<unnamed>".into());
        let handle = builder.spawn(move || {
            log::trace!("worker '{name}' starting");
            for message in recv {
                handler(message);
            }
            log::trace!("worker '{name}' exiting");
        })?;

        Ok(Worker {
            sender: Some(sender),
            handle: Some(handle),
        })
    }
}

/// A handle to a worker thread that processes messages of type `I`.
///
/// When dropped, the channel to the thread will be dropped and the thread will be joined. If the
/// thread has panicked, the panic will be forwarded to the thread dropping the `Worker`.
pub struct Worker<I: Send + 'static> {
    sender: Option<Sender<I>>,
    handle: Option<JoinHandle<()>>,
}

impl<I: Send + 'static> Drop for Worker<I> {
    fn drop(&mut self) {
        // Close the channel to signal the thread to exit.
        drop(self.sender.take());

        self.wait_for_exit();
    }
}

impl Worker<()> {
    /// Returns a builder that can be used to configure and spawn a [`Worker`].
    #[inline]
    pub fn builder() -> WorkerBuilder {
        WorkerBuilder {
            name: None,
            capacity: 0,
        }
    }
}

impl<I: Send + 'static> Worker<I> {
    fn wait_for_exit(&mut self) {
        // Wait for it to exit and propagate its panic if it panicked.
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(()) => {}
                Err(payload) => {
                    if !thread::panicking() {
                        resume_unwind(payload);
                    }
                }
            }
        }
    }

    /// Sends a message to the worker thread.
    ///
    /// This will block until the thread is available to accept the message.
    ///
    /// If the worker has panicked, this will propagate the panic to the calling thread.
    pub fn send(&mut self, msg: I) {
        let Some(sender) = &self.sender else { return };
        if sender.send(msg).is_err() {
            self.wait_for_exit();
        }
    }

    /// Sends a message to the worker thread if that can be done without blocking.
    ///
    /// If the channel is full, the message is handed back as `Err(msg)`.
    ///
    /// If the worker has panicked, this will propagate the panic to the calling thread.
    pub fn try_send(&mut self, msg: I) -> Result<(), I> {
        let Some(sender) = &self.sender else {
            return Err(msg);
        };
        match sender.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(msg)) => Err(msg),
            Err(TrySendError::Disconnected(msg)) => {
                self.wait_for_exit();
                Err(msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};

    use crossbeam::channel;

    use super::*;

    fn silent_panic(payload: String) {
        resume_unwind(Box::new(payload));
    }

    #[test]
    fn worker_propagates_panic_on_drop() {
        let mut worker = Worker::builder()
            .spawn(|_: ()| silent_panic("worker panic".into()))
            .unwrap();
        worker.send(());
        catch_unwind(AssertUnwindSafe(|| drop(worker))).unwrap_err();
    }

    #[test]
    fn worker_propagates_panic_on_send() {
        let mut worker = Worker::builder()
            .spawn(|_| silent_panic("worker panic".into()))
            .unwrap();
        worker.send(());
        catch_unwind(AssertUnwindSafe(|| worker.send(()))).unwrap_err();
        catch_unwind(AssertUnwindSafe(|| drop(worker))).unwrap();
    }

    #[test]
    fn try_send_hands_back_message_when_full() {
        let (block_tx, block_rx) = channel::bounded::<()>(0);
        let (done_tx, done_rx) = channel::unbounded();
        let mut worker = Worker::builder()
            .name("busy")
            .capacity(1)
            .spawn(move |msg: u32| {
                block_rx.recv().ok();
                done_tx.send(msg).unwrap();
            })
            .unwrap();

        // The first message occupies the thread, the second fills the channel.
        worker.send(1);
        while worker.try_send(2).is_err() {
            thread::yield_now();
        }
        assert_eq!(worker.try_send(3), Err(3));

        block_tx.send(()).unwrap();
        block_tx.send(()).unwrap();
        drop(worker);
        assert_eq!(done_rx.iter().collect::<Vec<_>>(), [1, 2]);
    }
}
