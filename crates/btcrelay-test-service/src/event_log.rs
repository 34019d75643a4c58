use btcrelay_synchronizer::{BoxError, ChainEvent, EventLog, LogEntry, LogTopic, RawEvent};
use parking_lot::RwLock;

struct IndexedEntry {
    topics: Vec<LogTopic>,
    entry: LogEntry,
}

/// Append-only event log shared by the mock contracts.
#[derive(Default)]
pub struct MockEventLog {
    entries: RwLock<Vec<IndexedEntry>>,
}

impl MockEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a transaction emitting `events` under `topics`, returns its id.
    pub fn push(&self, topics: Vec<LogTopic>, events: Vec<ChainEvent>, failed: bool) -> String {
        self.push_raw(topics, events.iter().map(ChainEvent::encode).collect(), failed)
    }

    pub fn push_raw(&self, topics: Vec<LogTopic>, events: Vec<RawEvent>, failed: bool) -> String {
        let mut entries = self.entries.write();
        let id = format!("tx-{:06}", entries.len() + 1);
        entries.push(IndexedEntry {
            topics,
            entry: LogEntry {
                id: id.clone(),
                failed,
                events,
            },
        });
        id
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait::async_trait]
impl EventLog for MockEventLog {
    async fn fetch_page(
        &self,
        topic: &LogTopic,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, BoxError> {
        let entries = self.entries.read();

        let end = match before {
            Some(id) => match entries.iter().position(|indexed| indexed.entry.id == id) {
                Some(index) => index,
                None => return Err(format!("Unknown log cursor {id}").into()),
            },
            None => entries.len(),
        };

        Ok(entries[..end]
            .iter()
            .rev()
            .filter(|indexed| indexed.topics.contains(topic))
            .take(limit)
            .map(|indexed| indexed.entry.clone())
            .collect())
    }
}
