//! Mock implementations for testing
//!
//! Provides a recording [`BrokerPublisher`] and a fixed-output [`Monitor`] so the
//! relay, command dispatch and monitor service can be tested without a broker.

use crate::monitors::{Monitor, MonitorItem};
use crate::protocol::DiscoveryDescriptor;
use crate::transport::BrokerPublisher;
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub type PublishedMessage = (String, Vec<u8>);

/// `(state_topic, monitor_key, descriptor)` of one discovery announcement
pub type PublishedDiscovery = (String, String, DiscoveryDescriptor);

/// Mock broker publisher for testing
#[derive(Debug)]
pub struct MockPublisher {
    pub published_messages: Arc<Mutex<Vec<PublishedMessage>>>,
    pub published_discovery: Arc<Mutex<Vec<PublishedDiscovery>>>,
    announcements: AtomicUsize,
    connected: AtomicBool,
}

impl Default for MockPublisher {
    fn default() -> Self {
        Self {
            published_messages: Arc::new(Mutex::new(Vec::new())),
            published_discovery: Arc::new(Mutex::new(Vec::new())),
            announcements: AtomicUsize::new(0),
            connected: AtomicBool::new(true),
        }
    }
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A publisher that reports disconnected and records nothing
    pub fn disconnected() -> Self {
        let publisher = Self::default();
        publisher.set_connected(false);
        publisher
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub async fn get_published_messages(&self) -> Vec<PublishedMessage> {
        self.published_messages.lock().await.clone()
    }

    pub async fn get_published_discovery(&self) -> Vec<PublishedDiscovery> {
        self.published_discovery.lock().await.clone()
    }

    /// Poll until at least `count` messages were published or `timeout` elapses
    pub async fn wait_for_messages(&self, count: usize, timeout: Duration) -> Vec<PublishedMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let messages = self.get_published_messages().await;
            if messages.len() >= count || tokio::time::Instant::now() >= deadline {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Number of connected announcements sent so far
    pub fn announcement_count(&self) -> usize {
        self.announcements.load(Ordering::SeqCst)
    }

    /// Poll until at least `count` announcements were sent or `timeout` elapses
    pub async fn wait_for_announcements(&self, count: usize, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let sent = self.announcement_count();
            if sent >= count || tokio::time::Instant::now() >= deadline {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn clear_history(&self) {
        self.published_messages.lock().await.clear();
        self.published_discovery.lock().await.clear();
        self.announcements.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrokerPublisher for MockPublisher {
    async fn publish_bytes(&self, topic: &str, payload: Option<&[u8]>) {
        // Mirrors the real connection's no-op rules
        if !self.is_connected() || topic.trim().is_empty() {
            return;
        }

        let payload = payload.unwrap_or_default().to_vec();
        self.published_messages
            .lock()
            .await
            .push((topic.to_string(), payload));
    }

    async fn publish_discovery(
        &self,
        state_topic: &str,
        monitor_key: &str,
        descriptor: &DiscoveryDescriptor,
    ) {
        if !self.is_connected() {
            return;
        }

        self.published_discovery.lock().await.push((
            state_topic.to_string(),
            monitor_key.to_string(),
            descriptor.clone(),
        ));
    }

    async fn announce_connected(&self) {
        if self.is_connected() {
            self.announcements.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// In-memory log sink for asserting on emitted diagnostics
///
/// ```ignore
/// let logs = LogCapture::default();
/// let _guard = tracing::subscriber::set_default(logs.subscriber());
/// ```
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// A plain-text subscriber writing every event into this capture
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
        tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish()
    }

    pub fn contents(&self) -> String {
        let buffer = match self.buffer.lock() {
            Ok(buffer) => buffer,
            Err(poisoned) => poisoned.into_inner(),
        };
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buffer = match self.buffer.lock() {
            Ok(buffer) => buffer,
            Err(poisoned) => poisoned.into_inner(),
        };
        buffer.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Monitor returning a fixed set of items
#[derive(Debug, Clone)]
pub struct MockMonitor {
    pub key: String,
    pub items: Vec<MonitorItem>,
}

impl MockMonitor {
    pub fn new(key: impl Into<String>, items: Vec<MonitorItem>) -> Self {
        Self {
            key: key.into(),
            items,
        }
    }
}

#[async_trait]
impl Monitor for MockMonitor {
    fn config_key(&self) -> &str {
        &self.key
    }

    async fn items(&self) -> Vec<MonitorItem> {
        self.items.clone()
    }
}
