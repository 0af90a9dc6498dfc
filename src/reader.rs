//! Perf buffer consumption loop.
//!
//! The loop blocks in `epoll_wait` on two descriptors: the perf buffer's epoll
//! fd and an eventfd that the signal handler writes to. Either wakes it up, so
//! shutdown is immediate even when nfsd is idle.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

use log::warn;
use metrics::Recorder;

use crate::dispatch::MetricDispatcher;
use crate::record::{NfsEvent, RecordLayout};

const EPOLL_SOURCE: u64 = 0;
const EPOLL_SHUTDOWN: u64 = 1;

/// Level-triggered wakeup used to stop the read loop.
pub struct ShutdownSignal {
    eventfd: OwnedFd,
}

impl ShutdownSignal {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            eventfd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn signal(&self) {
        let val: u64 = 1;
        let _ = unsafe {
            libc::write(
                self.eventfd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                8,
            )
        };
    }

    pub fn fd(&self) -> RawFd {
        self.eventfd.as_raw_fd()
    }
}

fn create_epoll(source_fd: RawFd, shutdown_fd: RawFd) -> io::Result<OwnedFd> {
    let epoll_fd = {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe { OwnedFd::from_raw_fd(fd) }
    };

    for (fd, token) in [(source_fd, EPOLL_SOURCE), (shutdown_fd, EPOLL_SHUTDOWN)] {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token,
        };
        if unsafe { libc::epoll_ctl(epoll_fd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut ev) } < 0
        {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(epoll_fd)
}

/// Something that can be waited on and then drained of pending records.
pub trait EventSource {
    fn epoll_fd(&self) -> RawFd;
    /// Deliver everything currently buffered to the registered callbacks.
    fn consume(&self) -> anyhow::Result<()>;
}

impl EventSource for libbpf_rs::PerfBuffer<'_> {
    fn epoll_fd(&self) -> RawFd {
        libbpf_rs::PerfBuffer::epoll_fd(self)
    }

    fn consume(&self) -> anyhow::Result<()> {
        Ok(libbpf_rs::PerfBuffer::consume(self)?)
    }
}

/// Running totals for the shutdown summary.
#[derive(Debug, Default)]
pub struct ReaderStats {
    events: AtomicU64,
    decode_errors: AtomicU64,
    lost_samples: AtomicU64,
    read_errors: AtomicU64,
}

impl ReaderStats {
    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn lost_samples(&self) -> u64 {
        self.lost_samples.load(Ordering::Relaxed)
    }

    pub fn read_errors(&self) -> u64 {
        self.read_errors.load(Ordering::Relaxed)
    }
}

/// Receives perf samples and loss notifications and turns them into counter
/// updates. Nothing in here is fatal.
pub struct EventConsumer<R> {
    layout: RecordLayout,
    dispatcher: MetricDispatcher<R>,
    stats: ReaderStats,
}

impl<R: Recorder> EventConsumer<R> {
    pub fn new(layout: RecordLayout, dispatcher: MetricDispatcher<R>) -> Self {
        Self {
            layout,
            dispatcher,
            stats: ReaderStats::default(),
        }
    }

    pub fn stats(&self) -> &ReaderStats {
        &self.stats
    }

    pub fn handle_sample(&self, cpu: i32, data: &[u8]) {
        match NfsEvent::decode(self.layout, data) {
            Ok(event) => {
                self.stats.events.fetch_add(1, Ordering::Relaxed);
                self.dispatcher.dispatch(&event);
            }
            Err(e) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to decode NFS event from CPU {cpu}: {e}");
            }
        }
    }

    pub fn handle_lost(&self, cpu: i32, count: u64) {
        self.stats.lost_samples.fetch_add(count, Ordering::Relaxed);
        warn!("{}", lost_samples_message(cpu, count));
    }

    fn handle_read_error(&self, err: &anyhow::Error) {
        self.stats.read_errors.fetch_add(1, Ordering::Relaxed);
        warn!("Failed to read from perf buffer: {err:#}");
    }
}

fn lost_samples_message(cpu: i32, count: u64) -> String {
    format!("Lost {count} samples on CPU {cpu}")
}

/// Drain `source` into `consumer` until `shutdown` fires.
///
/// Read errors are logged and the loop keeps going; only a failure to wait on
/// the descriptors ends it early.
pub fn run<S, R>(
    source: &S,
    consumer: &EventConsumer<R>,
    shutdown: &ShutdownSignal,
) -> io::Result<()>
where
    S: EventSource + ?Sized,
    R: Recorder,
{
    let epoll_fd = create_epoll(source.epoll_fd(), shutdown.fd())?;
    let mut events = [libc::epoll_event { events: 0, u64: 0 }; 2];
    loop {
        let n = unsafe { libc::epoll_wait(epoll_fd.as_raw_fd(), events.as_mut_ptr(), 2, -1) };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }

        let mut should_exit = false;
        let mut readable = false;
        for event in events.iter().take(n as usize) {
            match event.u64 {
                EPOLL_SHUTDOWN => should_exit = true,
                _ => readable = true,
            }
        }

        // Drain whatever arrived alongside the shutdown wakeup before leaving.
        if readable {
            if let Err(e) = source.consume() {
                consumer.handle_read_error(&e);
            }
        }

        if should_exit {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{NFS3_READ_BYTES, NFS4_WRITE_BYTES};
    use crate::record::{encode, OP_READ, OP_WRITE};
    use crate::test_utils::{counter_value, has_series, prometheus_recorder};
    use metrics_exporter_prometheus::{PrometheusHandle, PrometheusRecorder};
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};
    use std::thread;

    enum Pending {
        Sample(Vec<u8>),
        Lost(u64),
        ReadError,
    }

    /// Hands queued records to the consumer, readable through an eventfd.
    struct QueueSource {
        ready: ShutdownSignal,
        queue: Mutex<VecDeque<Pending>>,
        consumer: Arc<EventConsumer<PrometheusRecorder>>,
    }

    impl QueueSource {
        fn push(&self, item: Pending) {
            self.queue.lock().unwrap().push_back(item);
            self.ready.signal();
        }
    }

    impl EventSource for QueueSource {
        fn epoll_fd(&self) -> RawFd {
            self.ready.fd()
        }

        fn consume(&self) -> anyhow::Result<()> {
            let mut val: u64 = 0;
            let _ = unsafe {
                libc::read(
                    self.ready.fd(),
                    &mut val as *mut u64 as *mut libc::c_void,
                    8,
                )
            };
            let mut result = Ok(());
            while let Some(item) = self.queue.lock().unwrap().pop_front() {
                match item {
                    Pending::Sample(data) => self.consumer.handle_sample(0, &data),
                    Pending::Lost(count) => self.consumer.handle_lost(0, count),
                    Pending::ReadError => result = Err(anyhow::anyhow!("perf buffer went away")),
                }
            }
            result
        }
    }

    fn consumer(layout: RecordLayout) -> (EventConsumer<PrometheusRecorder>, PrometheusHandle) {
        let (recorder, handle) = prometheus_recorder();
        (
            EventConsumer::new(layout, MetricDispatcher::new(recorder)),
            handle,
        )
    }

    fn write_event() -> NfsEvent {
        NfsEvent {
            op: OP_WRITE,
            size: 4096,
            client: Ipv4Addr::new(192, 168, 1, 10),
            version: Some(4),
            path: "/export/data/file1".to_string(),
        }
    }

    const WRITE_LABELS: [(&str, &str); 3] = [
        ("client", "192.168.1.10"),
        ("path", "/export/data/file1"),
        ("version", "4"),
    ];

    #[test]
    fn test_sample_is_dispatched() {
        let (consumer, handle) = consumer(RecordLayout::Versioned);
        consumer.handle_sample(0, &encode(&write_event(), RecordLayout::Versioned));

        assert_eq!(consumer.stats().events(), 1);
        assert_eq!(
            counter_value(&handle.render(), NFS4_WRITE_BYTES, &WRITE_LABELS),
            Some(4096)
        );
    }

    #[test]
    fn test_legacy_sample_is_dispatched() {
        let (consumer, handle) = consumer(RecordLayout::Legacy);
        let event = NfsEvent {
            version: None,
            ..write_event()
        };
        consumer.handle_sample(3, &encode(&event, RecordLayout::Legacy));

        assert_eq!(consumer.stats().decode_errors(), 0);
        assert_eq!(
            counter_value(&handle.render(), NFS4_WRITE_BYTES, &WRITE_LABELS),
            Some(4096)
        );
    }

    #[test]
    fn test_malformed_sample_is_skipped() {
        let (consumer, handle) = consumer(RecordLayout::Versioned);
        consumer.handle_sample(1, &[0u8; 12]);
        consumer.handle_sample(1, &encode(&write_event(), RecordLayout::Versioned));

        assert_eq!(consumer.stats().decode_errors(), 1);
        assert_eq!(consumer.stats().events(), 1);
        assert_eq!(
            counter_value(&handle.render(), NFS4_WRITE_BYTES, &WRITE_LABELS),
            Some(4096)
        );
    }

    #[test]
    fn test_lost_samples_do_not_touch_counters() {
        let (consumer, handle) = consumer(RecordLayout::Versioned);
        consumer.handle_lost(2, 17);

        assert_eq!(consumer.stats().lost_samples(), 17);
        assert_eq!(consumer.stats().events(), 0);
        assert!(!has_series(&handle.render(), "nfs"));
        assert!(lost_samples_message(2, 17).contains("17"));
    }

    #[test]
    fn test_shutdown_when_idle() {
        let (consumer, _handle) = consumer(RecordLayout::Versioned);
        let source = QueueSource {
            ready: ShutdownSignal::new().unwrap(),
            queue: Mutex::new(VecDeque::new()),
            consumer: Arc::new(consumer),
        };
        let shutdown = ShutdownSignal::new().unwrap();
        shutdown.signal();

        run(&source, &*source.consumer, &shutdown).unwrap();
        assert_eq!(source.consumer.stats().events(), 0);
    }

    #[test]
    fn test_pending_samples_drained_on_shutdown() {
        let (consumer, handle) = consumer(RecordLayout::Versioned);
        let source = QueueSource {
            ready: ShutdownSignal::new().unwrap(),
            queue: Mutex::new(VecDeque::new()),
            consumer: Arc::new(consumer),
        };
        source.push(Pending::Sample(encode(&write_event(), RecordLayout::Versioned)));
        let shutdown = ShutdownSignal::new().unwrap();
        shutdown.signal();

        // Both fds are ready for the first epoll_wait.
        run(&source, &*source.consumer, &shutdown).unwrap();

        assert_eq!(source.consumer.stats().events(), 1);
        assert_eq!(
            counter_value(&handle.render(), NFS4_WRITE_BYTES, &WRITE_LABELS),
            Some(4096)
        );
    }

    #[test]
    fn test_loop_survives_errors_until_shutdown() {
        let (consumer, handle) = consumer(RecordLayout::Versioned);
        let source = Arc::new(QueueSource {
            ready: ShutdownSignal::new().unwrap(),
            queue: Mutex::new(VecDeque::new()),
            consumer: Arc::new(consumer),
        });
        let shutdown = Arc::new(ShutdownSignal::new().unwrap());

        let reader = {
            let source = source.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || run(&*source, &*source.consumer, &*shutdown))
        };

        let read = NfsEvent {
            op: OP_READ,
            size: 512,
            client: Ipv4Addr::new(10, 0, 0, 5),
            version: Some(3),
            path: String::new(),
        };
        source.push(Pending::Sample(encode(&write_event(), RecordLayout::Versioned)));
        source.push(Pending::Lost(5));
        source.push(Pending::Sample(vec![1, 2, 3]));
        source.push(Pending::ReadError);
        source.push(Pending::Sample(encode(&read, RecordLayout::Versioned)));

        let stats = source.consumer.stats();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while stats.events() < 2 && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(10));
        }

        shutdown.signal();
        reader.join().unwrap().unwrap();

        assert_eq!(stats.events(), 2);
        assert_eq!(stats.lost_samples(), 5);
        assert_eq!(stats.decode_errors(), 1);
        assert_eq!(stats.read_errors(), 1);

        let rendered = handle.render();
        assert_eq!(
            counter_value(&rendered, NFS4_WRITE_BYTES, &WRITE_LABELS),
            Some(4096)
        );
        assert_eq!(
            counter_value(
                &rendered,
                NFS3_READ_BYTES,
                &[("client", "10.0.0.5"), ("version", "3")]
            ),
            Some(512)
        );
    }
}
