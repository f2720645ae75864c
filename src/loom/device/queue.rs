use std::{
    borrow::Cow,
    sync::{Arc, Mutex},
    thread::{JoinHandle, ThreadId},
    time::Duration,
};

use derive_more::{Deref, Display};
use itertools::Itertools;
use thiserror::Error;

use super::{Device, DeviceBuffer, DeviceKind, EventOptions, QueueEvent};
use crate::loom::{category, platform};

const THREAD_VIOLATION: &str = "queue has been captured and is being used by a thread other than its creator";

#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("queue error at [{}]: {message}", .id_path.iter().format("."))]
    Queue { id_path: Vec<usize>, message: String },
    #[error("queue timed out after {0:?}")]
    Timeout(Duration),
    #[error("queue {0} has stopped")]
    Disconnected(String),
    #[error("failed to spawn the worker of queue {0}: {1}")]
    Spawn(String, String),
}

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct QueueId(uid::Id<QueueId>);

type Work = Box<dyn FnOnce() -> Result<(), QueueError> + Send>;

/// An item of work in a queue's stream.
pub(crate) enum Job {
    /// User work. Skipped once the queue is in the error state.
    Work { name: Cow<'static, str>, f: Work },
    /// Signals an event. Always runs, so that waiters wake up.
    Signal(QueueEvent),
    /// Holds back the rest of the stream until the event occurs.
    Wait(QueueEvent),
    /// Stops the worker.
    Stop,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Job::Work { name, .. } => write!(f, "Work({name})"),
            Job::Signal(event) => write!(f, "Signal({})", event.id()),
            Job::Wait(event) => write!(f, "Wait({})", event.id()),
            Job::Stop => write!(f, "Stop"),
        }
    }
}

impl Job {
    fn run(self, device: &Device, queue: &QueueShared) -> Result<(), QueueError> {
        match self {
            Job::Work { name, f } => {
                if let Some(error) = queue.last_error() {
                    log::trace!(target: category::QUEUE_SYNC, "skip {name} on {}", queue.label());
                    return Err(error);
                }
                f().inspect_err(|error| device.report(queue, error.clone()))
            }
            Job::Signal(event) => {
                event.signal();
                Ok(())
            }
            Job::Wait(event) => {
                if let Some(error) = queue.last_error() {
                    return Err(error);
                }
                event
                    .wait()
                    .inspect_err(|error| device.report(queue, error.clone()))
            }
            Job::Stop => Ok(()),
        }
    }
}

/// State of a queue that may be touched from any thread.
#[derive(Debug)]
pub(crate) struct QueueShared {
    id: QueueId,
    label: String,
    error: Mutex<Option<QueueError>>,
}

impl QueueShared {
    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[inline]
    pub fn last_error(&self) -> Option<QueueError> {
        self.error.lock().expect("failed to lock").clone()
    }

    /// Keeps the first error until cleared.
    #[inline]
    pub fn set_error(&self, error: QueueError) {
        self.error
            .lock()
            .expect("failed to lock")
            .get_or_insert(error);
    }

    #[inline]
    pub fn clear_error(&self) {
        self.error.lock().expect("failed to lock").take();
    }
}

/// A thread-agnostic handle to a queue's stream, used to place fences on it.
#[derive(Debug, Clone)]
pub(crate) struct QueueHandle {
    shared: Arc<QueueShared>,
    sender: Option<flume::Sender<Job>>,
    timeout: Option<Duration>,
}

impl QueueHandle {
    #[inline]
    pub fn id(&self) -> QueueId {
        self.shared.id
    }

    /// Returns an event that is signaled once all work submitted so far has completed.
    pub fn fence(&self) -> QueueEvent {
        let event = QueueEvent::new(EventOptions::default(), self.timeout);
        let sent = match &self.sender {
            Some(sender) => sender.send(Job::Signal(event.clone())).is_ok(),
            None => false,
        };
        // synchronous and stopped queues have nothing in flight
        if !sent {
            event.signal();
        }
        event
    }
}

/// An ordered execution stream on a [`Device`].
///
/// All methods except error reporting and the plain getters must be called from the
/// thread that built the queue. Dropping the queue waits for its work to complete.
#[derive(Debug)]
pub struct Queue {
    shared: Arc<QueueShared>,
    device: Device,
    name: String,
    index: usize,
    creator: ThreadId,
    timeout: Option<Duration>,
    options: EventOptions,
    sender: Option<flume::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl Queue {
    #[inline]
    pub fn id(&self) -> QueueId {
        self.shared.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The `device_name` label used in diagnostics.
    #[inline]
    pub fn label(&self) -> &str {
        self.shared.label()
    }

    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns `true` if work runs inline on the calling thread.
    #[inline]
    pub fn is_synchronous(&self) -> bool {
        self.sender.is_none()
    }

    #[inline]
    pub fn default_event_options(&self) -> EventOptions {
        self.options
    }

    /// The error the queue is stuck on, if any. Callable from any thread.
    #[inline]
    pub fn last_error(&self) -> Option<QueueError> {
        self.shared.last_error()
    }

    /// Puts the queue into the error state. Callable from any thread.
    #[inline]
    pub fn report_error(&self, error: QueueError) {
        self.device.report(&self.shared, error);
    }

    /// Leaves the error state.
    #[inline]
    pub fn clear_error(&self) {
        self.shared.clear_error();
    }

    #[inline]
    pub(crate) fn handle(&self) -> QueueHandle {
        QueueHandle {
            shared: self.shared.clone(),
            sender: self.sender.clone(),
            timeout: self.timeout,
        }
    }

    #[inline]
    pub(crate) fn check_thread(&self) {
        if cfg!(any(debug_assertions, feature = "strict")) {
            assert_eq!(
                std::thread::current().id(),
                self.creator,
                "{THREAD_VIOLATION}: {}",
                self.label()
            );
        }
    }

    #[inline]
    pub(crate) fn check_error(&self) -> Result<(), QueueError> {
        match self.shared.last_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn fail(&self, error: QueueError) -> QueueError {
        self.device.report(&self.shared, error.clone());
        error
    }

    fn submit(&self, job: Job) -> Result<(), QueueError> {
        match &self.sender {
            Some(sender) => sender
                .send(job)
                .map_err(|_| self.fail(QueueError::Disconnected(self.label().to_owned()))),
            None => job.run(&self.device, &self.shared),
        }
    }

    /// Creates an event used to synchronize with this queue.
    pub fn create_event(&self, options: EventOptions) -> QueueEvent {
        self.check_thread();
        let event = QueueEvent::new(options, self.timeout);
        log::trace!(
            target: category::QUEUE_ALLOC,
            "create QueueEvent({}) on {}",
            event.id(),
            self.label()
        );
        event
    }

    /// Signals `event` once all work submitted before it has completed.
    pub fn record(&self, event: &QueueEvent) -> Result<QueueEvent, QueueError> {
        self.check_thread();
        self.check_error()?;
        log::trace!(
            target: category::QUEUE_SYNC,
            "record QueueEvent({}) on {}",
            event.id(),
            self.label()
        );
        self.submit(Job::Signal(event.clone()))?;
        Ok(event.clone())
    }

    /// Blocks the calling thread until `event` has occurred.
    pub fn wait(&self, event: &QueueEvent) -> Result<(), QueueError> {
        self.check_thread();
        self.check_error()?;
        if event.occurred() {
            return Ok(());
        }
        log::trace!(
            target: category::QUEUE_SYNC,
            "wait QueueEvent({}) on {}",
            event.id(),
            self.label()
        );
        event.wait().map_err(|error| self.fail(error))?;
        // work that completed before the event may have failed
        self.check_error()
    }

    /// Holds back work submitted after this call until `event` has occurred,
    /// without blocking the calling thread.
    pub fn enqueue_wait(&self, event: QueueEvent) -> Result<(), QueueError> {
        self.check_thread();
        self.check_error()?;
        if event.occurred() {
            return Ok(());
        }
        self.submit(Job::Wait(event))
    }

    /// Blocks the calling thread until all submitted work has completed.
    pub fn wait_until_complete(&self) -> Result<(), QueueError> {
        let event = self.record(&self.create_event(self.options))?;
        log::trace!(
            target: category::QUEUE_SYNC,
            "wait QueueEvent({}) for {} to complete",
            event.id(),
            self.label()
        );
        self.wait(&event)?;
        log::trace!(
            target: category::QUEUE_SYNC,
            "signaled QueueEvent({}) on {}",
            event.id(),
            self.label()
        );
        Ok(())
    }

    /// Submits work to the queue.
    ///
    /// On a synchronous queue the work runs before this returns and its error is returned.
    /// On an asynchronous queue an error puts the queue into the error state instead.
    pub fn enqueue<F>(&self, name: impl Into<Cow<'static, str>>, f: F) -> Result<(), QueueError>
    where
        F: FnOnce() -> Result<(), QueueError> + Send + 'static,
    {
        self.check_thread();
        self.check_error()?;
        let name = name.into();
        let f = Box::new(f);
        self.submit(Job::Work { name, f })
    }

    /// Copies `input` into `output`.
    ///
    /// # Panics
    /// Panics if `output` is read-only or the lengths differ.
    pub fn copy(&self, output: &DeviceBuffer, input: &DeviceBuffer) -> Result<(), QueueError> {
        assert!(!output.is_read_only(), "cannot mutate read only buffer {}", output.id());
        assert_eq!(output.len(), input.len(), "buffer sizes don't match");
        log::debug!(
            target: category::DATA_COPY,
            "copy DeviceBuffer({}) {} → DeviceBuffer({}) {} on {}",
            input.id(),
            input.space(),
            output.id(),
            output.space(),
            self.label()
        );
        let output = output.clone();
        let input = input.clone();
        self.enqueue("copy", move || {
            output.copy_from(&input);
            Ok(())
        })
    }

    /// Copies host bytes into `output`.
    ///
    /// # Panics
    /// Panics if `output` is read-only or the lengths differ.
    pub fn upload(
        &self,
        output: &DeviceBuffer,
        contents: impl Into<Arc<[u8]>>,
    ) -> Result<(), QueueError> {
        let contents: Arc<[u8]> = contents.into();
        assert!(!output.is_read_only(), "cannot mutate read only buffer {}", output.id());
        assert_eq!(output.len(), contents.len(), "buffer sizes don't match");
        let output = output.clone();
        self.enqueue("upload", move || {
            output.copy_from_slice(&contents);
            Ok(())
        })
    }

    /// Waits for the queue to complete, then copies `input` into host memory.
    ///
    /// # Panics
    /// Panics if the lengths differ.
    pub fn copy_to_host(&self, input: &DeviceBuffer, output: &mut [u8]) -> Result<(), QueueError> {
        assert_eq!(input.len(), output.len(), "buffer sizes don't match");
        self.wait_until_complete()?;
        input.copy_to_slice(output);
        Ok(())
    }

    /// Fills `buffer` with zeros.
    ///
    /// # Panics
    /// Panics if `buffer` is read-only.
    pub fn zero(&self, buffer: &DeviceBuffer) -> Result<(), QueueError> {
        assert!(!buffer.is_read_only(), "cannot mutate read only buffer {}", buffer.id());
        let buffer = buffer.clone();
        self.enqueue("zero", move || {
            buffer.zero();
            Ok(())
        })
    }

    /// Occupies the queue for `count * time_per_element`.
    #[inline]
    pub fn simulate_work(
        &self,
        count: usize,
        time_per_element: Duration,
    ) -> Result<(), QueueError> {
        self.delay(time_per_element.mul_f64(count as f64))
    }

    /// Occupies the queue for at least `interval`.
    pub fn delay(&self, interval: Duration) -> Result<(), QueueError> {
        self.enqueue("delay", move || {
            std::thread::sleep(interval);
            Ok(())
        })
    }

    /// Reports a synthetic error through the device.
    pub fn raise_test_error(&self) {
        self.check_thread();
        let id_path = vec![self.device.id().0, self.index];
        let message = "testError".into();
        self.report_error(QueueError::Queue { id_path, message });
    }

    /// Waits for the stream to drain, ignoring the error state.
    fn drain(&self) -> Result<(), QueueError> {
        let Some(sender) = &self.sender else {
            return Ok(());
        };
        let event = QueueEvent::new(EventOptions::default(), self.timeout);
        match sender.send(Job::Signal(event.clone())) {
            Ok(()) => event.wait(),
            Err(_) => Ok(()),
        }
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            self.check_thread();
        }
        log::debug!(
            target: category::QUEUE_ALLOC,
            "release DeviceQueue({}) {}",
            self.id(),
            self.label()
        );

        let drained = self.drain();
        if let Err(error) = &drained {
            log::warn!(
                target: category::QUEUE_ALLOC,
                "timeout DeviceQueue({}) {}: {error}",
                self.id(),
                self.label()
            );
        }
        if let Some(sender) = self.sender.take() {
            _ = sender.send(Job::Stop);
        }
        // a worker stuck on work past the timeout is left detached
        if let (Some(worker), Ok(())) = (self.worker.take(), drained) {
            _ = worker.join();
        }
    }
}

pub struct QueueBuilder {
    pub device: Device,
    pub name: String,
    pub timeout: Option<Duration>,
    pub synchronous: bool,
    pub options: EventOptions,
}

impl QueueBuilder {
    pub fn new(device: Device, name: String) -> Self {
        Self {
            device,
            name,
            timeout: None,
            synchronous: false,
            options: Default::default(),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Forces work to run inline even on an asynchronous device.
    pub fn synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    pub fn options(mut self, options: EventOptions) -> Self {
        self.options = options;
        self
    }

    /// Builds the queue, binding it to the calling thread.
    pub fn build(self) -> Result<Queue, QueueError> {
        let Self {
            device,
            name,
            timeout,
            synchronous,
            options,
        } = self;

        let id = QueueId::default();
        let label = format!("{}_{name}", device.name());
        let error = Mutex::new(None);
        let shared = Arc::new(QueueShared { id, label, error });
        let index = device.register(&shared);

        let (sender, worker) = match (device.kind(), synchronous) {
            (DeviceKind::CpuAsync, false) => {
                let (sender, receiver) = flume::unbounded();
                let label = shared.label().to_owned();
                let f = {
                    let device = device.clone();
                    let shared = shared.clone();
                    move || serve(device, shared, receiver)
                };
                let worker = platform::spawn_worker(label.clone(), f)
                    .map_err(|err| QueueError::Spawn(label, err.to_string()))?;
                (Some(sender), Some(worker))
            }
            _ => (None, None),
        };

        log::debug!(
            target: category::QUEUE_ALLOC,
            "create DeviceQueue({id}) {}",
            shared.label()
        );

        let creator = std::thread::current().id();
        Ok(Queue {
            shared,
            device,
            name,
            index,
            creator,
            timeout,
            options,
            sender,
            worker,
        })
    }
}

fn serve(device: Device, shared: Arc<QueueShared>, receiver: flume::Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        if matches!(job, Job::Stop) {
            break;
        }
        _ = job.run(&device, &shared);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        error::Error,
        sync::{Arc, Mutex},
        time::{Duration, Instant},
    };

    use itertools::Itertools;

    use super::{Queue, QueueError};
    use crate::loom::device::{
        DeviceBuffer, DeviceBuilder, DeviceKind, EventOptions, MemoryKind, MemorySpace,
    };

    fn async_queue() -> Queue {
        DeviceBuilder::new(1)
            .kind(DeviceKind::CpuAsync)
            .memory(MemoryKind::Discrete)
            .build()
            .queue("q0")
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build queue")
    }

    #[test]
    fn test_record_sync() -> Result<(), Box<dyn Error>> {
        let queue = DeviceBuilder::new(0).build().queue("q0").build()?;
        assert!(queue.is_synchronous());
        assert_eq!(queue.label(), "cpu:0_q0");

        let event = queue.create_event(EventOptions::timing());
        assert!(!event.occurred());
        let event = queue.record(&event)?;
        assert!(event.occurred());
        assert!(event.recorded_time().is_some());

        queue.wait(&event)?;
        queue.wait_until_complete()?;
        Ok(())
    }

    #[test]
    fn test_record_async() -> Result<(), Box<dyn Error>> {
        let queue = async_queue();
        assert!(!queue.is_synchronous());

        let start = Instant::now();
        queue.delay(Duration::from_millis(50))?;
        let event = queue.record(&queue.create_event(EventOptions::default()))?;
        queue.wait(&event)?;
        assert!(event.occurred());
        assert!(start.elapsed() >= Duration::from_millis(50));
        Ok(())
    }

    #[test]
    fn test_synchronous_override() -> Result<(), Box<dyn Error>> {
        let device = DeviceBuilder::new(1).kind(DeviceKind::CpuAsync).build();
        let queue = device.queue("q0").synchronous(true).build()?;
        assert!(queue.is_synchronous());

        let event = queue.record(&queue.create_event(EventOptions::default()))?;
        assert!(event.occurred());

        // work runs inline, so its effect is visible as soon as the call returns
        let buffer = DeviceBuffer::new(device.memory_space(), 4);
        queue.delay(Duration::from_millis(20))?;
        queue.upload(&buffer, vec![7u8; 4])?;
        assert_eq!(&buffer.read()[..], &[7; 4]);
        Ok(())
    }

    #[test]
    fn test_submission_order() -> Result<(), Box<dyn Error>> {
        let queue = async_queue();
        let output = Arc::new(Mutex::new(Vec::new()));
        for index in 0..16 {
            let output = output.clone();
            queue.enqueue("push", move || {
                // later items finish faster if run out of order
                std::thread::sleep(Duration::from_micros(16 - index));
                output.lock().expect("failed to lock").push(index);
                Ok(())
            })?;
        }
        queue.wait_until_complete()?;

        let output = output.lock().expect("failed to lock").clone();
        assert_eq!(output, (0..16).collect_vec());
        Ok(())
    }

    #[test]
    fn test_copy() -> Result<(), Box<dyn Error>> {
        let queue = async_queue();
        let space = queue.device().memory_space();

        let x = DeviceBuffer::from_bytes(MemorySpace::Host, &[1, 2, 3, 4]);
        let y = DeviceBuffer::new(space, 4);
        let z = DeviceBuffer::new(space, 4);
        queue.copy(&y, &x)?;
        queue.copy(&z, &y)?;
        queue.upload(&x, vec![5u8, 6, 7, 8])?;

        let mut output = [0u8; 4];
        queue.copy_to_host(&z, &mut output)?;
        assert_eq!(output, [1, 2, 3, 4]);
        assert_eq!(&x.read()[..], &[5, 6, 7, 8]);

        queue.zero(&z)?;
        queue.copy_to_host(&z, &mut output)?;
        assert_eq!(output, [0; 4]);
        Ok(())
    }

    #[test]
    fn test_cross_queue_wait() -> Result<(), Box<dyn Error>> {
        let device = DeviceBuilder::new(1).kind(DeviceKind::CpuAsync).build();
        let queue1 = device.queue("q1").build()?;
        let queue2 = device.queue("q2").build()?;

        let x = DeviceBuffer::from_bytes(MemorySpace::Host, &[0; 4]);
        let y = DeviceBuffer::new(MemorySpace::Host, 4);

        queue1.delay(Duration::from_millis(20))?;
        queue1.upload(&x, vec![9u8; 4])?;
        let event = queue1.record(&queue1.create_event(EventOptions::default()))?;

        // the copy on queue2 must observe the upload on queue1
        queue2.enqueue_wait(event)?;
        queue2.copy(&y, &x)?;
        queue2.wait_until_complete()?;
        assert_eq!(&y.read()[..], &[9; 4]);
        Ok(())
    }

    #[test]
    fn test_fail_fast() -> Result<(), Box<dyn Error>> {
        let queue = async_queue();
        let buffer = DeviceBuffer::new(MemorySpace::Host, 4);

        queue.enqueue("fail", || {
            Err(QueueError::Queue {
                id_path: vec![1, 0],
                message: "kernel failed".into(),
            })
        })?;
        // either rejected here or skipped by the worker
        {
            let buffer = buffer.clone();
            _ = queue.enqueue("write", move || {
                buffer.write().fill(1);
                Ok(())
            });
        }

        let event = queue.create_event(EventOptions::default());
        let error = queue.wait_until_complete().expect_err("queue must fail");
        assert_eq!(error.to_string(), "queue error at [1.0]: kernel failed");
        assert!(queue.record(&event).is_err());
        assert!(queue.zero(&buffer).is_err());
        assert!(buffer.read().iter().all(|&x| x == 0));

        queue.clear_error();
        queue.zero(&buffer)?;
        queue.wait_until_complete()?;
        Ok(())
    }

    #[test]
    fn test_sync_error() -> Result<(), Box<dyn Error>> {
        let queue = DeviceBuilder::new(0).build().queue("q0").build()?;
        queue.raise_test_error();
        match queue.last_error() {
            Some(QueueError::Queue { id_path, message }) => {
                assert_eq!(id_path, vec![0, queue.index()]);
                assert_eq!(message, "testError");
            }
            other => panic!("unexpected error state: {other:?}"),
        }
        assert!(queue.enqueue("noop", || Ok(())).is_err());
        assert!(queue.wait_until_complete().is_err());
        Ok(())
    }

    #[test]
    fn test_timeout() -> Result<(), Box<dyn Error>> {
        let queue = DeviceBuilder::new(1)
            .kind(DeviceKind::CpuAsync)
            .build()
            .queue("q0")
            .timeout(Duration::from_millis(10))
            .build()?;
        queue.simulate_work(10, Duration::from_millis(10))?;

        let error = queue.wait_until_complete().expect_err("queue must time out");
        assert!(matches!(error, QueueError::Timeout(_)));
        assert!(matches!(queue.last_error(), Some(QueueError::Timeout(_))));

        // dropping gives up on draining instead of hanging
        let start = Instant::now();
        drop(queue);
        assert!(start.elapsed() < Duration::from_millis(90));
        Ok(())
    }

    #[test]
    fn test_drop_drains() -> Result<(), Box<dyn Error>> {
        let buffer = DeviceBuffer::new(MemorySpace::Host, 4);
        {
            let queue = async_queue();
            queue.delay(Duration::from_millis(20))?;
            queue.upload(&buffer, vec![3u8; 4])?;
        }
        assert_eq!(&buffer.read()[..], &[3; 4]);
        Ok(())
    }

    #[test]
    #[cfg(any(debug_assertions, feature = "strict"))]
    fn test_thread_violation() -> Result<(), Box<dyn Error>> {
        let queue = async_queue();
        let event = queue.create_event(EventOptions::default());

        std::thread::scope(|scope| {
            let result = scope.spawn(|| queue.record(&event)).join();
            assert!(result.is_err(), "record from a foreign thread must panic");

            let result = scope
                .spawn(|| queue.create_event(EventOptions::default()))
                .join();
            assert!(result.is_err(), "create_event from a foreign thread must panic");

            let result = scope.spawn(|| queue.enqueue("noop", || Ok(()))).join();
            assert!(result.is_err(), "enqueue from a foreign thread must panic");

            // error reporting is allowed from anywhere
            let result = scope.spawn(|| queue.last_error()).join();
            assert!(result.is_ok());
        });

        queue.wait_until_complete()?;
        Ok(())
    }
}
